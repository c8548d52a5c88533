//! The repair pass: rebuild a readable archive from a damaged one.
//!
//! The source is read strictly sequentially through its tape marks,
//! ignoring whatever trailer or catalogue it may still have. Every entry
//! record found in the stream is replayed into a fresh archive, its data
//! re-read (and transcoded) between the data marks, and a correct
//! catalogue and trailer are written at the end.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::cache::Cache;
use crate::catalogue::Catalogue;
use crate::cipher::Cipher;
use crate::compressor::{CompressionAlgo, Compressor};
use crate::crc::Crc;
use crate::ea::EaSet;
use crate::entrepot::Entrepot;
use crate::entry::{Child, Etoile, Item, ParsedRecord, read_record};
use crate::error::{Error, Result};
use crate::escape::{Escape, Mark};
use crate::fs_io;
use crate::fsa::FsaSet;
use crate::header::ArchiveHeader;
use crate::interaction::UserInteraction;
use crate::label::Label;
use crate::layer::{Layer, Mode};
use crate::options::{ReadOptions, RepairOptions};
use crate::slicer::{SliceLayout, SliceName, Slicer, SlicerOptions};
use crate::stack::{Stack, labels};
use crate::statistics::Statistics;

use super::{WriteCtx, check_cancel};

pub fn execute(
    ui: &mut dyn UserInteraction,
    src_entrepot: Box<dyn Entrepot>,
    src_basename: &str,
    read_opts: &ReadOptions,
    dst_entrepot: Box<dyn Entrepot>,
    dst_basename: &str,
    opts: &RepairOptions,
    stats: &mut Statistics,
) -> Result<Catalogue> {
    // sequential source stack, no trailer involved
    let mut name = SliceName::new(src_basename);
    name.extension = read_opts.extension.clone();
    name.min_digits = read_opts.min_digits;
    let mut slicer_opts = SlicerOptions::new(name, SliceLayout::unsliced(), Label::cleared());
    slicer_opts.pause_command = read_opts.pause_command.clone();
    let mut slicer = Slicer::open(src_entrepot, slicer_opts)?;
    let header = ArchiveHeader::read(&mut slicer)?;
    if !header.tape_marks {
        return Err(Error::Data(
            "the archive carries no tape marks, sequential repair is not possible".into(),
        ));
    }
    let region_start = slicer.position()?;

    let mut src_stack = Stack::new();
    src_stack.push(Some(labels::SLICER), move |_| {
        Ok(Box::new(slicer) as Box<dyn Layer>)
    })?;
    if let Some(algo) = header.cipher {
        let passphrase = match &read_opts.passphrase {
            Some(p) => p.clone(),
            None => ui.get_secu_string("Archive passphrase: ", false)?,
        };
        let key = match &header.kdf {
            Some(kdf) => kdf.derive(&passphrase)?,
            None => passphrase.clone(),
        };
        let region_end = src_stack.skip_to_eof()?;
        let block = if header.crypto_block_size == 0 {
            crate::cipher::DEFAULT_BLOCK_SIZE
        } else {
            header.crypto_block_size as usize
        };
        src_stack.push(Some(labels::CIPHER), move |below| {
            let below = below.ok_or_else(Error::bug)?;
            Ok(Box::new(Cipher::open(
                below,
                algo,
                key,
                block,
                region_start,
                region_end,
            )?) as Box<dyn Layer>)
        })?;
    }
    src_stack.push(Some(labels::CACHE), |below| {
        let below = below.ok_or_else(Error::bug)?;
        Ok(Box::new(Cache::new(below)?) as Box<dyn Layer>)
    })?;
    src_stack.push(Some(labels::ESCAPE), |below| {
        let below = below.ok_or_else(Error::bug)?;
        Ok(Box::new(Escape::new(below, Mode::Read, true)) as Box<dyn Layer>)
    })?;
    let compression = header.compression;
    src_stack.push(Some(labels::COMPRESSOR), move |below| {
        let below = below.ok_or_else(Error::bug)?;
        Ok(Box::new(Compressor::new(below, Mode::Read, compression, 6)?) as Box<dyn Layer>)
    })?;

    let mut ctx = WriteCtx::new(
        dst_entrepot,
        dst_basename,
        &opts.output,
        Label::random(),
        None,
    )?;

    let mut pass = Repair {
        ui,
        opts,
        stats,
        src_compression: header.compression,
        stack: &mut src_stack,
        ctx: &mut ctx,
        etoiles: HashMap::new(),
        pending: None,
        depth: 0,
    };
    pass.run()?;
    ctx.finalize()?;
    Ok(ctx.catalogue)
}

struct Repair<'a> {
    ui: &'a mut dyn UserInteraction,
    opts: &'a RepairOptions,
    stats: &'a mut Statistics,
    src_compression: CompressionAlgo,
    /// The damaged archive's read stack.
    stack: &'a mut Stack,
    ctx: &'a mut WriteCtx,
    etoiles: HashMap<u64, Rc<RefCell<Etoile>>>,
    /// Entry announced by the last header mark, waiting for its data and
    /// attribute blocks.
    pending: Option<Child>,
    depth: u64,
}

impl Repair<'_> {
    fn escape(&mut self) -> Result<&mut Escape> {
        super::stack_escape(self.stack)
    }

    fn compressor(&mut self) -> Result<&mut Compressor> {
        super::stack_compressor(self.stack)
    }

    fn run(&mut self) -> Result<()> {
        loop {
            check_cancel(&self.opts.cancellation)?;
            let mark = self.escape()?.next_mark()?;
            match mark {
                None => break,
                Some(Mark::CatalogueStart) => break,
                Some(Mark::CatalogueDataName) => {
                    let _ = Label::read(&mut *self.stack);
                }
                Some(Mark::EntryHeader) => {
                    self.flush_pending()?;
                    match read_record(&mut *self.stack, &mut self.etoiles, true) {
                        Ok(ParsedRecord::Eod) => {
                            if self.depth > 0 {
                                self.ctx.close_dir()?;
                                self.ctx.mark(Mark::EntryHeader)?;
                                self.ctx
                                    .stack
                                    .write_all(&[crate::entry::TAG_EOD])?;
                                self.depth -= 1;
                            }
                        }
                        Ok(ParsedRecord::Child(child)) => {
                            if child.item.is_dir() {
                                self.ctx.begin_entry(&child)?;
                                self.ctx.add(child)?;
                                self.depth += 1;
                                self.stats.treated += 1;
                            } else {
                                let known_link = matches!(&child.item, Item::Mirage(m)
                                    if self.ctx.catalogue.etoile(m.etiquette()).is_some());
                                self.ctx.begin_entry(&child)?;
                                if known_link {
                                    self.stats.hard_links += 1;
                                    self.ctx.add(child)?;
                                } else {
                                    self.pending = Some(child);
                                }
                            }
                        }
                        Err(e) => {
                            self.stats.errored += 1;
                            self.ui.message(&format!(
                                "unreadable entry record, resuming at the next mark: {e}"
                            ));
                        }
                    }
                }
                Some(Mark::DataStart) => {
                    if let Err(e) = self.copy_data() {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        self.stats.errored += 1;
                        self.ui.message(&format!("data region lost: {e}"));
                    }
                }
                Some(Mark::EaStart) => {
                    if let Err(e) = self.copy_ea() {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        self.stats.errored += 1;
                        self.ui.message(&format!("EA block lost: {e}"));
                    }
                }
                Some(Mark::FsaStart) => {
                    if let Err(e) = self.copy_fsa() {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        self.stats.errored += 1;
                        self.ui.message(&format!("FSA block lost: {e}"));
                    }
                }
                Some(Mark::Dirty) => {
                    if let Some(child) = &mut self.pending {
                        let _ = crate::ops::update_file_data(child, |data| data.dirty = true);
                    }
                }
                Some(Mark::ChangedDuringRead) | Some(Mark::FailedBackup) => {
                    // a retried or aborted save; the following marks carry
                    // whatever remains usable
                }
                Some(Mark::DataEnd) | Some(Mark::EaEnd) | Some(Mark::FsaEnd) => {}
            }
        }
        self.flush_pending()?;
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        if let Some(child) = self.pending.take() {
            self.ctx.add(child)?;
            self.stats.treated += 1;
        }
        Ok(())
    }

    /// Copies the data region the source is positioned on into the output,
    /// updating the pending entry's bookkeeping.
    fn copy_data(&mut self) -> Result<()> {
        let Some(pending) = &self.pending else {
            // data without a preceding record: nothing to attach it to
            return Err(Error::Data("stray data region in the stream".into()));
        };
        let (compressed, sparse) = match &pending.item {
            Item::Inode(i) => match i.as_file() {
                Some(d) => (d.compression != CompressionAlgo::None, d.sparse),
                None => (false, false),
            },
            Item::Mirage(m) => match m.star.borrow().inode.as_file() {
                Some(d) => (d.compression != CompressionAlgo::None, d.sparse),
                None => (false, false),
            },
            _ => (false, false),
        };

        self.ctx.mark(Mark::DataStart)?;
        let offset = self.ctx.position()?;
        let dst_compress = self.ctx.compressing();
        if compressed {
            self.compressor()?.resume()?;
        }
        if dst_compress {
            self.ctx.resume_compression()?;
        }
        let copied = fs_io::copy_until_end(
            &mut *self.stack,
            &mut self.ctx.stack,
            sparse,
        );
        if compressed {
            self.compressor()?.suspend()?;
        }
        if dst_compress {
            self.ctx.suspend_compression()?;
        }
        let (size, crc) = copied?;

        // the data-end mark halted the source; consume it and pick up the
        // stored checksum that follows
        let halted = self.escape()?.read_mark();
        let stored_crc = match halted {
            Some(Mark::DataEnd) => Some(Crc::read(&mut *self.stack)?),
            _ => match self.escape()?.next_mark()? {
                Some(Mark::DataEnd) => Some(Crc::read(&mut *self.stack)?),
                _ => None,
            },
        };
        if let Some(stored) = &stored_crc {
            if stored.value() != crc.value() {
                self.ui
                    .message("data region does not match its recorded checksum, keeping it anyway");
            }
        }

        let end = self.ctx.position()?;
        self.ctx.mark(Mark::DataEnd)?;
        crc.dump(&mut self.ctx.stack)?;

        let storage = if dst_compress || sparse { end - offset } else { 0 };
        let compression = if dst_compress {
            self.ctx.header.compression
        } else {
            CompressionAlgo::None
        };
        self.stats.byte_read += size;
        self.stats.byte_written += if storage == 0 { size } else { storage };

        let pending = self.pending.as_mut().ok_or_else(Error::bug)?;
        crate::ops::update_file_data(pending, |data| {
            data.size = size;
            data.storage_size = storage;
            data.offset = offset;
            data.crc = Some(crc.clone());
            data.compression = compression;
            data.sparse = sparse;
        })
    }

    fn copy_ea(&mut self) -> Result<()> {
        if self.pending.is_none() {
            return Err(Error::Data("stray EA block in the stream".into()));
        }
        let compressed = self.src_compression != CompressionAlgo::None;
        if compressed {
            self.compressor()?.resume()?;
        }
        let set = EaSet::read(&mut *self.stack);
        if compressed {
            self.compressor()?.suspend()?;
        }
        let set = set?;
        // consume the end mark and the checksum record behind it
        if self.escape()?.next_mark()? == Some(Mark::EaEnd) {
            let _ = Crc::read(&mut *self.stack)?;
        }
        let (offset, size, crc) = self.ctx.save_ea(&set)?;
        self.stats.ea_treated += 1;
        let pending = self.pending.as_mut().ok_or_else(Error::bug)?;
        crate::ops::update_attr(pending, |attr| {
            attr.ea_status = crate::ea::EaStatus::Full;
            attr.ea_offset = offset;
            attr.ea_size = size;
            attr.ea_crc = Some(crc.clone());
        })
    }

    fn copy_fsa(&mut self) -> Result<()> {
        if self.pending.is_none() {
            return Err(Error::Data("stray FSA block in the stream".into()));
        }
        let compressed = self.src_compression != CompressionAlgo::None;
        if compressed {
            self.compressor()?.resume()?;
        }
        let set = FsaSet::read(&mut *self.stack);
        if compressed {
            self.compressor()?.suspend()?;
        }
        let set = set?;
        if self.escape()?.next_mark()? == Some(Mark::FsaEnd) {
            let _ = Crc::read(&mut *self.stack)?;
        }
        let (offset, size, crc) = self.ctx.save_fsa(&set)?;
        self.stats.fsa_treated += 1;
        let pending = self.pending.as_mut().ok_or_else(Error::bug)?;
        crate::ops::update_attr(pending, |attr| {
            attr.fsa_status = crate::fsa::FsaStatus::Full;
            attr.fsa_families = set.families();
            attr.fsa_offset = offset;
            attr.fsa_size = size;
            attr.fsa_crc = Some(crc.clone());
        })
    }
}

