//! The backup pass: filesystem subtree to archive.

use std::cell::RefCell;
use std::fs::{self, File};
use std::path::Path;
use std::rc::Rc;

use crate::catalogue::{Catalogue, CompareCursor};
use crate::entrepot::Entrepot;
use crate::entry::{
    Child, Directory, Etoile, Inode, InodeAttr, InodePayload, Item, Mirage, SaveStatus, TAG_EOD,
};
use crate::error::{Error, Result};
use crate::escape::Mark;
use crate::fs_io::{self, FsEntry, HardLinkMap};
use crate::interaction::UserInteraction;
use crate::label::Label;
use crate::layer::Layer;
use crate::options::{CreateOptions, WhatToCheck};
use crate::overwrite::equal_with_hourshift;
use crate::statistics::Statistics;

use super::{WriteCtx, check_cancel};

const CACHEDIR_TAG: &str = "CACHEDIR.TAG";
const CACHEDIR_SIGNATURE: &[u8] = b"Signature: 8a477f597d28d172789f06886806bc55";

/// Runs a backup of `fs_root` into a new archive at `entrepot`/`basename`.
pub fn execute(
    ui: &mut dyn UserInteraction,
    fs_root: &Path,
    entrepot: Box<dyn Entrepot>,
    basename: &str,
    reference: Option<&Catalogue>,
    opts: &CreateOptions,
    stats: &mut Statistics,
) -> Result<Catalogue> {
    let root_entry = fs_io::read_entry(fs_root)?;
    if !root_entry.is_dir {
        return Err(Error::Range(format!(
            "{}: backup root is not a directory",
            fs_root.display()
        )));
    }
    let ctx = WriteCtx::new(entrepot, basename, &opts.output, Label::random(), None)?;

    let mut pass = Backup {
        ctx,
        ui,
        opts,
        reference,
        ref_cursor: CompareCursor::default(),
        stats,
        hard_links: HardLinkMap::new(),
        root_dev: root_entry.attr.dev,
        cancelled: false,
    };
    match pass.walk_dir(fs_root, Path::new("")) {
        Ok(()) => {}
        Err(Error::Cancelled { deferred: true }) => pass.cancelled = true,
        Err(e) => return Err(e),
    }

    if let (Some(reference), false) = (pass.reference, pass.cancelled) {
        let deleted = pass
            .ctx
            .catalogue
            .update_destroyed_with(reference, now_timestamp())?;
        pass.stats.deleted += deleted;
    }

    pass.ctx.finalize()?;
    if pass.cancelled {
        return Err(Error::Cancelled { deferred: true });
    }
    Ok(pass.ctx.catalogue)
}

fn now_timestamp() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Applies a mutation to the inode behind a child, shared or not.
fn with_inode_mut<T>(child: &mut Child, f: impl FnOnce(&mut Inode) -> T) -> Result<T> {
    match &mut child.item {
        Item::Inode(inode) => Ok(f(inode)),
        Item::Mirage(mirage) => Ok(f(&mut mirage.star.borrow_mut().inode)),
        _ => Err(Error::bug()),
    }
}

/// Applies a mutation to the attributes behind a child of any inode kind.
fn with_attr_mut<T>(child: &mut Child, f: impl FnOnce(&mut InodeAttr) -> T) -> Result<T> {
    match &mut child.item {
        Item::Inode(inode) => Ok(f(&mut inode.attr)),
        Item::Dir(dir) => Ok(f(&mut dir.attr)),
        Item::Mirage(mirage) => Ok(f(&mut mirage.star.borrow_mut().inode.attr)),
        _ => Err(Error::bug()),
    }
}

struct Backup<'a> {
    ctx: WriteCtx,
    ui: &'a mut dyn UserInteraction,
    opts: &'a CreateOptions,
    reference: Option<&'a Catalogue>,
    ref_cursor: CompareCursor,
    stats: &'a mut Statistics,
    hard_links: HardLinkMap,
    root_dev: u64,
    cancelled: bool,
}

impl Backup<'_> {
    fn walk_dir(&mut self, abs: &Path, rel: &Path) -> Result<()> {
        for name in fs_io::sorted_dir_entries(abs)? {
            check_cancel(&self.opts.cancellation)?;
            let child_abs = abs.join(&name);
            let child_rel = rel.join(&name);
            match self.process(&child_abs, &child_rel) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.stats.errored += 1;
                    self.ui
                        .message(&format!("cannot save {}: {e}", child_abs.display()));
                    let _ = self.ctx.mark(Mark::FailedBackup);
                }
            }
        }
        Ok(())
    }

    fn process(&mut self, abs: &Path, rel: &Path) -> Result<()> {
        let entry = fs_io::read_entry(abs)?;
        if entry.is_dir {
            self.process_dir(abs, rel, entry)
        } else {
            self.process_leaf(abs, rel, entry)
        }
    }

    /// True when the directory carries a cache tag and must be skipped.
    fn is_tagged_cache_dir(&self, abs: &Path) -> bool {
        if !self.opts.cache_directory_tagging {
            return false;
        }
        match fs::read(abs.join(CACHEDIR_TAG)) {
            Ok(bytes) => bytes.starts_with(CACHEDIR_SIGNATURE),
            Err(_) => false,
        }
    }

    fn skip_dir(&mut self, rel: &Path, entry: &FsEntry) -> Result<()> {
        self.stats.ignored += 1;
        if self.opts.empty_dir {
            let child = Child::new(entry.name.clone(), Item::IgnoredDir);
            self.ctx.begin_entry(&child)?;
            self.ctx.add(child)?;
        }
        log::debug!("skipping directory {}", rel.display());
        Ok(())
    }

    fn process_dir(&mut self, abs: &Path, rel: &Path, entry: FsEntry) -> Result<()> {
        if !self.opts.subtree.covers(rel)
            || self.is_tagged_cache_dir(abs)
            || (self.opts.same_fs && entry.attr.dev != self.root_dev)
            || (self.opts.honor_nodump && fs_io::has_nodump_flag(abs))
        {
            return self.skip_dir(rel, &entry);
        }

        let ref_child = match self.reference {
            Some(reference) => reference.compare(&mut self.ref_cursor, &entry.name, true)?,
            None => None,
        };
        let unchanged = ref_child.is_some_and(|r| self.matches_reference(&entry, r));
        let status = if unchanged {
            SaveStatus::NotSaved
        } else {
            SaveStatus::Saved
        };

        let mut attr = entry.attr.clone();
        self.capture_ea_fsa(abs, &mut attr, !unchanged);
        let mut child = Child::new(
            entry.name.clone(),
            Item::Dir(Directory::new(attr, status)),
        );
        self.ctx.begin_entry(&child)?;
        self.save_attached_blocks(&mut child)?;
        self.ctx.add(child)?;
        if unchanged {
            self.stats.skipped += 1;
        } else {
            self.stats.treated += 1;
        }

        let outcome = self.walk_dir(abs, rel);
        self.ctx.close_dir()?;
        self.ctx.mark(Mark::EntryHeader)?;
        self.ctx.stack.write_all(&[TAG_EOD])?;
        if let Some(reference) = self.reference {
            reference.compare_out(&mut self.ref_cursor);
        }
        outcome
    }

    fn process_leaf(&mut self, abs: &Path, rel: &Path, entry: FsEntry) -> Result<()> {
        if !self.opts.selection.covers(rel)
            || !self.opts.subtree.covers(rel)
            || (self.opts.same_fs && entry.attr.dev != self.root_dev)
            || (self.opts.honor_nodump && fs_io::has_nodump_flag(abs))
        {
            self.stats.ignored += 1;
            return Ok(());
        }
        if let Some(ea_name) = &self.opts.exclude_by_ea {
            if fs_io::read_ea(abs).is_ok_and(|set| set.get(ea_name).is_some()) {
                self.stats.ignored += 1;
                return Ok(());
            }
        }

        // hard link already seen: only a reference is recorded
        if entry.nlink > 1 {
            if let Some(&etiquette) = self.hard_links.get(&entry.id) {
                let star = self
                    .ctx
                    .catalogue
                    .etoile(etiquette)
                    .ok_or_else(Error::bug)?;
                let child = Child::new(entry.name.clone(), Item::Mirage(Mirage { star }));
                self.ctx.begin_entry(&child)?;
                self.ctx.add(child)?;
                self.stats.hard_links += 1;
                return Ok(());
            }
        }

        let ref_child = match self.reference {
            Some(reference) => reference.compare(&mut self.ref_cursor, &entry.name, false)?,
            None => None,
        };
        let mut unchanged = ref_child.is_some_and(|r| self.matches_reference(&entry, r));
        if unchanged {
            // metadata equal but a ctime step means EA or content were
            // touched behind our back: save again
            let ref_ctime = ref_child.and_then(|r| match &r.item {
                Item::Inode(i) => Some(i.attr.ctime),
                Item::Mirage(m) => Some(m.star.borrow().inode.attr.ctime),
                _ => None,
            });
            if ref_ctime.is_some_and(|c| entry.attr.ctime > c) {
                unchanged = false;
                self.stats.tooold += 1;
                self.ui.message(&format!(
                    "{}: metadata unchanged but ctime stepped, saving again",
                    abs.display()
                ));
            }
        }

        let status = if unchanged {
            SaveStatus::NotSaved
        } else {
            SaveStatus::Saved
        };
        let mut attr = entry.attr.clone();
        self.capture_ea_fsa(abs, &mut attr, !unchanged);
        let mut payload = entry.payload.ok_or_else(Error::bug)?;
        if let InodePayload::File(data) = &mut payload {
            // settle the storage decisions before the record goes out, so
            // the inline copy read back sequentially agrees with the data
            // that follows it
            if !unchanged {
                let compress = self.ctx.compressing()
                    && self.opts.compression_mask.covers(rel)
                    && data.size >= self.opts.min_compression_size;
                data.compression = if compress {
                    self.ctx.header.compression
                } else {
                    crate::compressor::CompressionAlgo::None
                };
                data.sparse = self.opts.sparse_min_size.is_some();
            }
        }
        let inode = Inode {
            attr,
            status,
            payload,
        };

        let hook = !unchanged
            && self.opts.file_hook.is_some()
            && self.opts.hook_mask.covers(rel);
        if hook {
            if let Some(hook) = &self.opts.file_hook {
                hook(abs, "start")?;
            }
        }

        // shared inodes go behind an etoile from their first link on
        let mut child = if entry.nlink > 1 {
            let etiquette = self.ctx.catalogue.assign_etiquette();
            let star = Rc::new(RefCell::new(Etoile {
                etiquette,
                inode,
                links: entry.nlink,
            }));
            self.hard_links.insert(entry.id, etiquette);
            Child::new(entry.name.clone(), Item::Mirage(Mirage { star }))
        } else {
            Child::new(entry.name.clone(), Item::Inode(inode))
        };

        self.ctx.begin_entry(&child)?;
        if !unchanged {
            let is_file =
                with_inode_mut(&mut child, |i| matches!(i.payload, InodePayload::File(_)))?;
            if is_file {
                self.save_file(abs, rel, &mut child)?;
            }
        }
        self.save_attached_blocks(&mut child)?;
        self.ctx.add(child)?;
        if unchanged {
            self.stats.skipped += 1;
        } else {
            self.stats.treated += 1;
        }

        if hook {
            if let Some(hook) = &self.opts.file_hook {
                hook(abs, "end")?;
            }
        }
        Ok(())
    }

    /// Streams file data, retrying when the file changes under us.
    fn save_file(&mut self, abs: &Path, rel: &Path, child: &mut Child) -> Result<()> {
        let expected = with_inode_mut(child, |i| i.as_file().map(|d| d.size))?
            .ok_or_else(Error::bug)?;
        let compress = self.ctx.compressing()
            && self.opts.compression_mask.covers(rel)
            && expected >= self.opts.min_compression_size;

        let mut attempts = 0u64;
        let mut bytes_spent = 0u64;
        loop {
            let mut source =
                File::open(abs).map_err(|e| Error::system(abs.display().to_string(), e))?;
            let (offset, storage, saved) = self.ctx.save_file_data(
                &mut source,
                expected,
                compress,
                self.opts.sparse_min_size,
            )?;
            drop(source);
            self.stats.byte_read += saved.size;
            self.stats.byte_written += if storage == 0 { saved.size } else { storage };

            let saved_size = saved.size;
            let header_compression = self.ctx.header.compression;
            with_inode_mut(child, |inode| -> Result<()> {
                let data = inode.as_file_mut().ok_or_else(Error::bug)?;
                data.size = saved.size;
                data.storage_size = storage;
                data.offset = offset;
                data.crc = Some(saved.crc.clone());
                data.sparse = saved.sparse;
                data.compression = if compress {
                    header_compression
                } else {
                    crate::compressor::CompressionAlgo::None
                };
                Ok(())
            })??;

            // did the file move under us?
            let now = fs_io::read_entry(abs)?;
            let recorded_mtime = with_inode_mut(child, |i| i.attr.mtime)?;
            let same = now.attr.mtime == recorded_mtime
                && matches!(&now.payload, Some(InodePayload::File(f)) if f.size == saved_size);
            if same {
                return Ok(());
            }
            self.ctx.mark(Mark::ChangedDuringRead)?;
            attempts += 1;
            bytes_spent += saved_size;
            let budget_blown =
                self.opts.retry_byte_budget != 0 && bytes_spent > self.opts.retry_byte_budget;
            if attempts > self.opts.retry_count || budget_blown {
                self.ui.message(&format!(
                    "{}: kept changing while being read, archived copy flagged dirty",
                    abs.display()
                ));
                with_inode_mut(child, |inode| -> Result<()> {
                    inode.as_file_mut().ok_or_else(Error::bug)?.dirty = true;
                    Ok(())
                })??;
                self.ctx.mark(Mark::Dirty)?;
                return Ok(());
            }
            log::info!("{}: changed while being read, saving again", abs.display());
            with_inode_mut(child, |inode| {
                inode.attr.mtime = now.attr.mtime;
                inode.attr.ctime = now.attr.ctime;
            })?;
        }
    }

    /// Reads EA and FSA from the filesystem into the attribute block.
    /// When `full` is false only the statuses are recorded.
    fn capture_ea_fsa(&mut self, abs: &Path, attr: &mut InodeAttr, full: bool) {
        match fs_io::read_ea(abs) {
            Ok(set) => {
                let mut kept = crate::ea::EaSet::new();
                for (name, value) in set.iter() {
                    if self.opts.ea_mask.covers(Path::new(name)) {
                        kept.add(name, value.to_vec());
                    }
                }
                if kept.is_empty() {
                    attr.ea_status = crate::ea::EaStatus::None;
                } else if full {
                    attr.ea_status = crate::ea::EaStatus::Full;
                    attr.ea = Some(kept);
                } else {
                    attr.ea_status = crate::ea::EaStatus::Partial;
                }
            }
            Err(e) => {
                log::warn!("{}: cannot read EA: {e}", abs.display());
            }
        }
        let fsa = fs_io::read_fsa(abs, self.opts.fsa_scope_ext);
        if !fsa.is_empty() {
            attr.fsa_families = fsa.families();
            if full {
                attr.fsa_status = crate::fsa::FsaStatus::Full;
                attr.fsa = Some(fsa);
            } else {
                attr.fsa_status = crate::fsa::FsaStatus::Partial;
            }
        }
    }

    /// Writes the EA and FSA blocks captured on the child, updating its
    /// offsets and checksums in place.
    fn save_attached_blocks(&mut self, child: &mut Child) -> Result<()> {
        let ea = with_attr_mut(child, |attr| attr.ea.take());
        if let Ok(Some(set)) = ea {
            let (offset, size, crc) = self.ctx.save_ea(&set)?;
            with_attr_mut(child, |attr| {
                attr.ea_offset = offset;
                attr.ea_size = size;
                attr.ea_crc = Some(crc);
                attr.ea = Some(set);
            })?;
            self.stats.ea_treated += 1;
        }
        let fsa = with_attr_mut(child, |attr| attr.fsa.take());
        if let Ok(Some(set)) = fsa {
            let (offset, size, crc) = self.ctx.save_fsa(&set)?;
            with_attr_mut(child, |attr| {
                attr.fsa_offset = offset;
                attr.fsa_size = size;
                attr.fsa_crc = Some(crc);
                attr.fsa = Some(set);
            })?;
            self.stats.fsa_treated += 1;
        }
        Ok(())
    }

    fn matches_reference(&self, fs: &FsEntry, reference: &Child) -> bool {
        let ref_base = reference.item.base_tag();
        let fs_base = match &fs.payload {
            None => crate::entry::BASE_DIR,
            Some(p) => p.base_tag(),
        };
        if ref_base != fs_base {
            return false;
        }
        if self.opts.what_to_check == WhatToCheck::InodeType {
            return true;
        }
        let (ref_mtime, ref_uid, ref_gid, ref_perm) = match &reference.item {
            Item::Inode(i) => (i.attr.mtime, i.attr.uid, i.attr.gid, i.attr.perm),
            Item::Dir(d) => (d.attr.mtime, d.attr.uid, d.attr.gid, d.attr.perm),
            Item::Mirage(m) => {
                let star = m.star.borrow();
                (
                    star.inode.attr.mtime,
                    star.inode.attr.uid,
                    star.inode.attr.gid,
                    star.inode.attr.perm,
                )
            }
            _ => return false,
        };
        if !equal_with_hourshift(fs.attr.mtime, ref_mtime, self.opts.hourshift) {
            return false;
        }
        match self.opts.what_to_check {
            WhatToCheck::MtimeOnly | WhatToCheck::InodeType => true,
            WhatToCheck::IgnoreOwner => fs.attr.perm == ref_perm,
            WhatToCheck::All => {
                fs.attr.perm == ref_perm && fs.attr.uid == ref_uid && fs.attr.gid == ref_gid
            }
        }
    }
}
