//! The merge pass: one or two catalogues into a fresh archive.
//!
//! Both sources are walked name by name; conflicts go through the
//! overwriting policy with the first archive playing the in-place role.
//! Decremental mode inverts the purpose: the output describes what must be
//! restored to bring the first (newer) state back to the second (older)
//! one, with tombstones for entries the older state did not have.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use crate::archive::Archive;
use crate::catalogue::Catalogue;
use crate::compressor::CompressionAlgo;
use crate::entrepot::Entrepot;
use crate::entry::{
    Child, Detruit, Directory, Etoile, FileData, Inode, Item, Mirage, SaveStatus, TAG_EOD,
};
use crate::error::{Error, Result};
use crate::escape::Mark;
use crate::fs_io;
use crate::interaction::UserInteraction;
use crate::label::Label;
use crate::layer::Layer;
use crate::options::MergeOptions;
use crate::overwrite::{DataAction, EaAction};
use crate::statistics::Statistics;

use super::{WriteCtx, check_cancel};

pub fn execute(
    ui: &mut dyn UserInteraction,
    first: &mut Archive,
    mut second: Option<&mut Archive>,
    entrepot: Box<dyn Entrepot>,
    basename: &str,
    opts: &MergeOptions,
    stats: &mut Statistics,
) -> Result<Catalogue> {
    if opts.keep_compressed {
        let src_algos_match = first.header.compression == opts.output.compression
            && second
                .as_deref()
                .is_none_or(|a| a.header.compression == opts.output.compression);
        if !src_algos_match {
            return Err(Error::Range(
                "keep_compressed requires the same compression algorithm on every side".into(),
            ));
        }
    }
    if opts.decremental && second.is_none() {
        return Err(Error::Libcall(
            "decremental merging needs two archives".into(),
        ));
    }

    let cat1 = std::mem::replace(&mut first.catalogue, Catalogue::new(Label::cleared()));
    let cat2 = second
        .as_deref_mut()
        .map(|a| std::mem::replace(&mut a.catalogue, Catalogue::new(Label::cleared())));

    let ctx = WriteCtx::new(entrepot, basename, &opts.output, Label::random(), None)?;
    let mut pass = Merge {
        ui,
        opts,
        stats,
        ctx,
        first,
        second: second.as_deref_mut(),
        remap: HashMap::new(),
        now: now_timestamp(),
    };
    let outcome = pass
        .merge_dir(Some(cat1.root()), cat2.as_ref().map(|c| c.root()), Path::new(""))
        .and_then(|_| pass.ctx.finalize());
    let catalogue = pass.ctx.catalogue;

    first.catalogue = cat1;
    if let (Some(archive), Some(cat)) = (second, cat2) {
        archive.catalogue = cat;
    }
    outcome.map(|_| catalogue)
}

fn now_timestamp() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct Merge<'a> {
    ui: &'a mut dyn UserInteraction,
    opts: &'a MergeOptions,
    stats: &'a mut Statistics,
    ctx: WriteCtx,
    first: &'a mut Archive,
    second: Option<&'a mut Archive>,
    /// (source index, source etiquette) to the rebuilt shared inode.
    remap: HashMap<(u8, u64), Rc<RefCell<Etoile>>>,
    now: i64,
}

impl Merge<'_> {
    fn src(&mut self, idx: u8) -> Result<&mut Archive> {
        match idx {
            1 => Ok(&mut *self.first),
            2 => self.second.as_deref_mut().ok_or_else(Error::bug),
            _ => Err(Error::bug()),
        }
    }

    fn merge_dir(
        &mut self,
        dir1: Option<&Directory>,
        dir2: Option<&Directory>,
        rel: &Path,
    ) -> Result<()> {
        // first archive's order, then names only the second one has
        let mut names: Vec<&str> = Vec::new();
        if let Some(d) = dir1 {
            names.extend(d.children().iter().map(|c| c.name.as_str()));
        }
        if let Some(d) = dir2 {
            names.extend(
                d.children()
                    .iter()
                    .map(|c| c.name.as_str())
                    .filter(|n| dir1.is_none_or(|d1| d1.child_by_name(n).is_none())),
            );
        }

        for name in names {
            check_cancel(&self.opts.cancellation)?;
            let c1 = dir1.and_then(|d| d.child_by_name(name));
            let c2 = dir2.and_then(|d| d.child_by_name(name));
            let child_rel = rel.join(name);
            match self.merge_name(c1, c2, &child_rel) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.stats.errored += 1;
                    self.ui.message(&format!("{}: {e}", child_rel.display()));
                }
            }
        }
        Ok(())
    }

    fn merge_name(
        &mut self,
        c1: Option<&Child>,
        c2: Option<&Child>,
        rel: &Path,
    ) -> Result<()> {
        if self.opts.decremental {
            return self.merge_decremental(c1, c2, rel);
        }
        let (chosen, src_idx, forced_status, ea_action) = match (c1, c2) {
            (Some(c1), None) => (c1, 1u8, None, EaAction::Preserve),
            (None, Some(c2)) => (c2, 2u8, None, EaAction::Preserve),
            (Some(c1), Some(c2)) => {
                let (data, ea) = self.resolve(c1, c2)?;
                match data {
                    DataAction::Preserve => (c1, 1, None, ea),
                    DataAction::Overwrite => (c2, 2, None, ea),
                    DataAction::PreserveMarkAlreadySaved => {
                        (c1, 1, Some(SaveStatus::NotSaved), ea)
                    }
                    DataAction::OverwriteMarkAlreadySaved => {
                        (c2, 2, Some(SaveStatus::NotSaved), ea)
                    }
                    DataAction::Remove => return Ok(()),
                    DataAction::Undefined | DataAction::Ask => return Err(Error::bug()),
                }
            }
            (None, None) => return Err(Error::bug()),
        };

        match &chosen.item {
            Item::Dir(dir) => {
                if !self.opts.subtree.covers(rel) {
                    self.stats.ignored += 1;
                    return Ok(());
                }
                let sub1 = c1.and_then(|c| match &c.item {
                    Item::Dir(d) => Some(d),
                    _ => None,
                });
                let sub2 = c2.and_then(|c| match &c.item {
                    Item::Dir(d) => Some(d),
                    _ => None,
                });
                let merged = Directory::new(dir.attr.clone(), dir.status);
                let mut out = Child::new(chosen.name.clone(), Item::Dir(merged));
                self.ctx.begin_entry(&out)?;
                self.copy_blocks(&mut out, src_idx)?;
                self.ctx.add(out)?;
                self.stats.treated += 1;
                let outcome = self.merge_dir(sub1, sub2, rel);
                self.ctx.close_dir()?;
                self.ctx.mark(Mark::EntryHeader)?;
                self.ctx.stack.write_all(&[TAG_EOD])?;
                outcome
            }
            _ => {
                if !self.opts.selection.covers(rel) || !self.opts.subtree.covers(rel) {
                    self.stats.ignored += 1;
                    return Ok(());
                }
                self.copy_entry(chosen, src_idx, forced_status, ea_action)
            }
        }
    }

    fn merge_decremental(
        &mut self,
        c1: Option<&Child>,
        c2: Option<&Child>,
        rel: &Path,
    ) -> Result<()> {
        match (c1, c2) {
            // only in the newer state: must disappear to reach the older one
            (Some(c1), None) => {
                if !self.opts.subtree.covers(rel) {
                    self.stats.ignored += 1;
                    return Ok(());
                }
                let out = Child::new(
                    c1.name.clone(),
                    Item::Detruit(Detruit {
                        base: c1.item.base_tag(),
                        ctime: self.now,
                    }),
                );
                self.ctx.begin_entry(&out)?;
                self.ctx.add(out)?;
                self.stats.deleted += 1;
                Ok(())
            }
            // the older state has it: restore it from there
            (None, Some(c2)) => self.take_side(c2, c1, c2, 2, rel),
            (Some(c1), Some(c2)) => {
                let unchanged = same_data(c1, c2);
                if let (Item::Dir(_), Item::Dir(_)) = (&c1.item, &c2.item) {
                    return self.take_side(c2, Some(c1), c2, 2, rel);
                }
                if unchanged {
                    // identical on both sides, no data needed
                    self.stats.skipped += 1;
                    Ok(())
                } else {
                    self.take_side(c2, Some(c1), c2, 2, rel)
                }
            }
            (None, None) => Err(Error::bug()),
        }
    }

    /// Emits `chosen` (from source `src_idx`), recursing when it is a
    /// directory.
    fn take_side(
        &mut self,
        chosen: &Child,
        c1: Option<&Child>,
        c2: &Child,
        src_idx: u8,
        rel: &Path,
    ) -> Result<()> {
        match &chosen.item {
            Item::Dir(dir) => {
                if !self.opts.subtree.covers(rel) {
                    self.stats.ignored += 1;
                    return Ok(());
                }
                let sub1 = c1.and_then(|c| match &c.item {
                    Item::Dir(d) => Some(d),
                    _ => None,
                });
                let sub2 = match &c2.item {
                    Item::Dir(d) => Some(d),
                    _ => None,
                };
                let merged = Directory::new(dir.attr.clone(), dir.status);
                let mut out = Child::new(chosen.name.clone(), Item::Dir(merged));
                self.ctx.begin_entry(&out)?;
                self.copy_blocks(&mut out, src_idx)?;
                self.ctx.add(out)?;
                self.stats.treated += 1;
                let outcome = self.merge_dir(sub1, sub2, rel);
                self.ctx.close_dir()?;
                self.ctx.mark(Mark::EntryHeader)?;
                self.ctx.stack.write_all(&[TAG_EOD])?;
                outcome
            }
            _ => {
                if !self.opts.selection.covers(rel) || !self.opts.subtree.covers(rel) {
                    self.stats.ignored += 1;
                    return Ok(());
                }
                self.copy_entry(chosen, src_idx, None, EaAction::Preserve)
            }
        }
    }

    fn resolve(&mut self, in_place: &Child, to_add: &Child) -> Result<(DataAction, EaAction)> {
        let (mut data, mut ea) = self.opts.overwriting.evaluate(in_place, to_add);
        if data == DataAction::Undefined || ea == EaAction::Undefined {
            return Err(Error::Libcall(
                "the overwriting policy leaves an action undefined".into(),
            ));
        }
        if data == DataAction::Ask {
            data = if self
                .ui
                .pause(&format!("{}: take the second archive's data?", to_add.name))
            {
                DataAction::Overwrite
            } else {
                DataAction::Preserve
            };
        }
        if ea == EaAction::Ask {
            ea = if self
                .ui
                .pause(&format!("{}: take the second archive's EA?", to_add.name))
            {
                EaAction::Overwrite
            } else {
                EaAction::Preserve
            };
        }
        Ok((data, ea))
    }

    /// Copies one non-directory entry, its data and attribute blocks.
    fn copy_entry(
        &mut self,
        chosen: &Child,
        src_idx: u8,
        forced_status: Option<SaveStatus>,
        _ea_action: EaAction,
    ) -> Result<()> {
        let mut out = match &chosen.item {
            Item::Inode(inode) => {
                let mut inode = inode.clone();
                if let Some(status) = forced_status {
                    if inode.status == SaveStatus::Saved {
                        inode.status = status;
                    }
                }
                Child::new(chosen.name.clone(), Item::Inode(inode))
            }
            Item::Mirage(mirage) => {
                let source = mirage.star.borrow();
                let key = (src_idx, source.etiquette);
                if let Some(star) = self.remap.get(&key) {
                    // inode already copied: just reference it
                    let out =
                        Child::new(chosen.name.clone(), Item::Mirage(Mirage { star: star.clone() }));
                    self.ctx.begin_entry(&out)?;
                    self.ctx.add(out)?;
                    self.stats.hard_links += 1;
                    return Ok(());
                }
                let mut inode = source.inode.clone();
                if let Some(status) = forced_status {
                    if inode.status == SaveStatus::Saved {
                        inode.status = status;
                    }
                }
                drop(source);
                let etiquette = self.ctx.catalogue.assign_etiquette();
                let star = Rc::new(RefCell::new(Etoile {
                    etiquette,
                    inode,
                    links: mirage.star.borrow().links,
                }));
                self.remap.insert(key, star.clone());
                Child::new(chosen.name.clone(), Item::Mirage(Mirage { star }))
            }
            Item::Detruit(d) => {
                let out = Child::new(chosen.name.clone(), Item::Detruit(d.clone()));
                self.ctx.begin_entry(&out)?;
                self.ctx.add(out)?;
                self.stats.deleted += 1;
                return Ok(());
            }
            Item::Ignored | Item::IgnoredDir => {
                let out = Child::new(chosen.name.clone(), chosen.item.clone());
                self.ctx.begin_entry(&out)?;
                self.ctx.add(out)?;
                return Ok(());
            }
            Item::Dir(_) => return Err(Error::bug()),
        };

        self.ctx.begin_entry(&out)?;
        self.copy_data(&mut out, src_idx)?;
        self.copy_blocks(&mut out, src_idx)?;
        self.ctx.add(out)?;
        self.stats.treated += 1;
        Ok(())
    }

    /// Copies file data for the child when it carries some.
    fn copy_data(&mut self, out: &mut Child, src_idx: u8) -> Result<()> {
        let data: Option<FileData> = {
            let inode: Option<&Inode> = match &out.item {
                Item::Inode(i) => Some(i),
                Item::Mirage(m) => {
                    // shared inode: data copied under the first reference
                    let star = m.star.borrow();
                    let copy = star.inode.as_file().cloned();
                    drop(star);
                    return match copy {
                        Some(data)
                            if matches!(
                                m.star.borrow().inode.status,
                                SaveStatus::Saved | SaveStatus::Delta
                            ) =>
                        {
                            let new_data = self.transfer(&data, src_idx)?;
                            let mut star = m.star.borrow_mut();
                            if let Some(slot) = star.inode.as_file_mut() {
                                *slot = new_data;
                            }
                            Ok(())
                        }
                        _ => Ok(()),
                    };
                }
                _ => None,
            };
            match inode {
                Some(i) if matches!(i.status, SaveStatus::Saved | SaveStatus::Delta) => {
                    i.as_file().cloned()
                }
                _ => None,
            }
        };
        let Some(data) = data else {
            return Ok(());
        };
        let new_data = self.transfer(&data, src_idx)?;
        if let Item::Inode(inode) = &mut out.item {
            if let Some(slot) = inode.as_file_mut() {
                *slot = new_data;
            }
        }
        Ok(())
    }

    /// Moves one data region between the archives and returns the updated
    /// bookkeeping.
    fn transfer(&mut self, data: &FileData, src_idx: u8) -> Result<FileData> {
        let keep_raw = self.opts.keep_compressed
            && data.compression != CompressionAlgo::None
            && (!data.sparse || self.src(src_idx)?.header.tape_marks);

        self.ctx.mark(Mark::DataStart)?;
        let offset = self.ctx.position()?;

        // the source archive and the output stack are distinct fields, so
        // both sides of the copy can be borrowed at once
        let Self {
            ui,
            stats,
            ctx,
            first,
            second,
            ..
        } = self;
        let src: &mut Archive = match src_idx {
            1 => &mut **first,
            2 => second.as_deref_mut().ok_or_else(Error::bug)?,
            _ => return Err(Error::bug()),
        };

        let crc;
        if keep_raw {
            let dest = &mut ctx.stack;
            let size = data.size;
            let sparse = data.sparse;
            src.with_data_stream(data, false, |stream| {
                copy_frames(stream, dest, size, sparse)
            })?;
            crc = data.crc.clone();
        } else {
            let compress = ctx.compressing();
            if compress {
                ctx.resume_compression()?;
            }
            let dest = &mut ctx.stack;
            let size = data.size;
            let sparse = data.sparse;
            let computed = src.with_data_stream(data, true, |stream| {
                fs_io::copy_data(stream, dest, size, sparse)
            });
            if compress {
                ctx.suspend_compression()?;
            }
            let computed = computed?;
            if let Some(stored) = &data.crc {
                if stored.value() != computed.value() {
                    ui.message(
                        "source data failed its checksum while merging, copying as found",
                    );
                    stats.errored += 1;
                }
            }
            crc = Some(computed);
        }

        let end = self.ctx.position()?;
        self.ctx.mark(Mark::DataEnd)?;
        if let Some(crc) = &crc {
            crc.dump(&mut self.ctx.stack)?;
        }
        let compression = if keep_raw {
            data.compression
        } else if self.ctx.compressing() {
            self.ctx.header.compression
        } else {
            CompressionAlgo::None
        };
        let storage = if compression != CompressionAlgo::None || data.sparse {
            end - offset
        } else {
            0
        };
        self.stats.byte_read += data.size;
        self.stats.byte_written += if storage == 0 { data.size } else { storage };
        Ok(FileData {
            size: data.size,
            storage_size: storage,
            offset,
            crc,
            compression,
            dirty: data.dirty,
            sparse: data.sparse,
            has_delta_sig: false,
        })
    }

    /// Copies EA and FSA blocks attached to the chosen entry.
    fn copy_blocks(&mut self, out: &mut Child, src_idx: u8) -> Result<()> {
        let attr_snapshot = match &out.item {
            Item::Inode(i) => Some(i.attr.clone()),
            Item::Dir(d) => Some(d.attr.clone()),
            Item::Mirage(m) => Some(m.star.borrow().inode.attr.clone()),
            _ => None,
        };
        let Some(attr) = attr_snapshot else {
            return Ok(());
        };

        let mut new_ea = None;
        if attr.ea_status == crate::ea::EaStatus::Full {
            let set = {
                let src = self.src(src_idx)?;
                src.read_ea_block(&attr)?
            };
            let placed = self.ctx.save_ea(&set)?;
            self.stats.ea_treated += 1;
            new_ea = Some(placed);
        }
        let mut new_fsa = None;
        if attr.fsa_status == crate::fsa::FsaStatus::Full {
            let set = {
                let src = self.src(src_idx)?;
                src.read_fsa_block(&attr)?
            };
            let placed = self.ctx.save_fsa(&set)?;
            self.stats.fsa_treated += 1;
            new_fsa = Some(placed);
        }

        let update = |attr: &mut crate::entry::InodeAttr| {
            if let Some((offset, size, crc)) = new_ea {
                attr.ea_offset = offset;
                attr.ea_size = size;
                attr.ea_crc = Some(crc);
            }
            if let Some((offset, size, crc)) = new_fsa {
                attr.fsa_offset = offset;
                attr.fsa_size = size;
                attr.fsa_crc = Some(crc);
            }
        };
        match &mut out.item {
            Item::Inode(i) => update(&mut i.attr),
            Item::Dir(d) => update(&mut d.attr),
            Item::Mirage(m) => update(&mut m.star.borrow_mut().inode.attr),
            _ => {}
        }
        Ok(())
    }
}

/// True when two entries are the same kind with the same data date and size.
fn same_data(a: &Child, b: &Child) -> bool {
    if a.item.base_tag() != b.item.base_tag() {
        return false;
    }
    let probe = |c: &Child| -> Option<(i64, u64)> {
        match &c.item {
            Item::Inode(i) => Some((i.attr.mtime, i.as_file().map(|d| d.size).unwrap_or(0))),
            Item::Dir(d) => Some((d.attr.mtime, 0)),
            Item::Mirage(m) => {
                let star = m.star.borrow();
                Some((
                    star.inode.attr.mtime,
                    star.inode.as_file().map(|d| d.size).unwrap_or(0),
                ))
            }
            _ => None,
        }
    };
    match (probe(a), probe(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Copies length-prefixed compression frames without transcoding them.
/// For plain files the frames stop once `size` raw bytes are accounted
/// for; sparse streams rely on the data-end mark halting the source.
fn copy_frames(
    source: &mut dyn Layer,
    dest: &mut dyn Layer,
    size: u64,
    sparse: bool,
) -> Result<()> {
    let mut raw_total = 0u64;
    loop {
        if !sparse && raw_total >= size {
            break;
        }
        let mut header = [0u8; 8];
        let mut got = 0;
        while got < header.len() {
            let n = source.read(&mut header[got..])?;
            if n == 0 {
                if got == 0 && sparse {
                    // the data-end mark halted the stream
                    return Ok(());
                }
                return Err(Error::Data("truncated compression frame".into()));
            }
            got += n;
        }
        let raw_len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as u64;
        let comp_len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
        dest.write_all(&header)?;
        let mut payload = vec![0u8; comp_len];
        source.read_exact(&mut payload)?;
        dest.write_all(&payload)?;
        raw_total += raw_len;
    }
    Ok(())
}
