//! Operation drivers.
//!
//! Each submodule implements one pass: backup walks the filesystem, the
//! others walk one or two catalogues. They share the write context below,
//! which owns the output layer stack and the catalogue being built.

pub mod backup;
pub mod diff;
pub mod isolate;
pub mod merge;
pub mod repair;
pub mod restore;
pub mod verify;

use std::collections::HashSet;
use std::fs::File;

use crate::cache::Cache;
use crate::catalogue::{AddCursor, Catalogue};
use crate::cipher::Cipher;
use crate::compressor::{CompressionAlgo, Compressor};
use crate::crc::{Crc, CrcTee};
use crate::ea::EaSet;
use crate::entrepot::Entrepot;
use crate::entry::Child;
use crate::error::{Error, Result};
use crate::escape::{Escape, Mark};
use crate::fs_io::{self, SavedData};
use crate::fsa::FsaSet;
use crate::header::ArchiveHeader;
use crate::infinint;
use crate::label::Label;
use crate::layer::{Layer, Mode};
use crate::options::{Cancellation, OutputOptions};
use crate::slicer::{SliceLayout, SliceName, Slicer, SlicerOptions};
use crate::stack::{Stack, labels};
use crate::terminator;

/// Mutates the file-data block behind a child, shared inode or not.
pub(crate) fn update_file_data(
    child: &mut Child,
    f: impl FnOnce(&mut crate::entry::FileData),
) -> Result<()> {
    match &mut child.item {
        crate::entry::Item::Inode(inode) => {
            if let Some(data) = inode.as_file_mut() {
                f(data);
            }
            Ok(())
        }
        crate::entry::Item::Mirage(mirage) => {
            if let Some(data) = mirage.star.borrow_mut().inode.as_file_mut() {
                f(data);
            }
            Ok(())
        }
        _ => Err(Error::bug()),
    }
}

/// Mutates the attributes behind a child of any inode kind.
pub(crate) fn update_attr(
    child: &mut Child,
    f: impl FnOnce(&mut crate::entry::InodeAttr),
) -> Result<()> {
    match &mut child.item {
        crate::entry::Item::Inode(inode) => {
            f(&mut inode.attr);
            Ok(())
        }
        crate::entry::Item::Dir(dir) => {
            f(&mut dir.attr);
            Ok(())
        }
        crate::entry::Item::Mirage(mirage) => {
            f(&mut mirage.star.borrow_mut().inode.attr);
            Ok(())
        }
        _ => Err(Error::bug()),
    }
}

/// Raises the cancellation error when the flag is set. Called at the top of
/// every per-entry iteration.
pub(crate) fn check_cancel(cancellation: &Cancellation) -> Result<()> {
    if cancellation.requested() {
        Err(Error::Cancelled {
            deferred: cancellation.deferred,
        })
    } else {
        Ok(())
    }
}

/// Finds the compression layer of an archive stack by its label.
pub(crate) fn stack_compressor(stack: &mut Stack) -> Result<&mut Compressor> {
    stack
        .get_by_label(labels::COMPRESSOR)?
        .as_compressor()
        .ok_or_else(Error::bug)
}

/// Finds the tape-mark layer of an archive stack by its label.
pub(crate) fn stack_escape(stack: &mut Stack) -> Result<&mut Escape> {
    stack
        .get_by_label(labels::ESCAPE)?
        .as_escape()
        .ok_or_else(Error::bug)
}

/// The write side of an archive: layer stack, header and catalogue under
/// construction. Used by backup, merge, isolate and repair.
pub(crate) struct WriteCtx {
    /// The labelled layer stack: slicer at the bottom, then cipher (when
    /// ciphered), cache, tape marks and the compressor on top.
    pub stack: Stack,
    pub header: ArchiveHeader,
    pub catalogue: Catalogue,
    pub cursor: AddCursor,
    /// Etoiles already written inline in the entry stream.
    inline_dumped: HashSet<u64>,
    finished: bool,
}

impl WriteCtx {
    /// Assembles the write stack and emits the slice and archive headers.
    ///
    /// `data_name` is the identity recorded in the archive header (isolation
    /// keeps the identity of the archive of reference); the slices always
    /// get their own fresh internal label.
    pub fn new(
        entrepot: Box<dyn Entrepot>,
        basename: &str,
        out: &OutputOptions,
        data_name: Label,
        ref_slicing: Option<SliceLayout>,
    ) -> Result<Self> {
        out.validate()?;

        let layout = match (out.first_slice_size, out.slice_size) {
            (_, None) => SliceLayout::unsliced(),
            (first, Some(other)) => SliceLayout::sliced(first.unwrap_or(other), other),
        };
        let mut name = SliceName::new(basename);
        name.extension = out.extension.clone();
        name.min_digits = out.min_digits;
        let mut slicer_opts = SlicerOptions::new(name, layout, Label::random());
        slicer_opts.hash = out.hash;
        slicer_opts.permission = out.slice_permission;
        slicer_opts.pause_command = out.pause_command.clone();
        let slicer = Slicer::create(entrepot, slicer_opts)?;

        let mut header = ArchiveHeader::new(out.compression, data_name);
        header.tape_marks = out.tape_marks;
        header.comment = out.comment.clone();
        header.ref_slicing = ref_slicing;
        let mut key = None;
        if let Some(algo) = out.cipher {
            let params = crate::cipher::KdfParams::generate(out.kdf_hash, out.iteration_count);
            let passphrase = out
                .passphrase
                .as_ref()
                .ok_or_else(|| Error::Libcall("cipher without passphrase".into()))?;
            key = Some(params.derive(passphrase)?);
            header.cipher = Some(algo);
            header.kdf = Some(params);
            header.crypto_block_size = out.crypto_block_size as u64;
        }

        let mut stack = Stack::new();
        stack.push(Some(labels::SLICER), move |_| {
            Ok(Box::new(slicer) as Box<dyn Layer>)
        })?;
        // the archive header stays cleartext, written through the bare
        // slicer before the cipher is mounted
        header.dump(&mut stack)?;
        if let (Some(algo), Some(key)) = (out.cipher, key) {
            let block = out.crypto_block_size;
            stack.push(Some(labels::CIPHER), move |below| {
                let below = below.ok_or_else(Error::bug)?;
                Ok(Box::new(Cipher::create(below, algo, key, block)?) as Box<dyn Layer>)
            })?;
        }
        stack.push(Some(labels::CACHE), |below| {
            let below = below.ok_or_else(Error::bug)?;
            Ok(Box::new(Cache::new(below)?) as Box<dyn Layer>)
        })?;
        let marks = out.tape_marks;
        stack.push(Some(labels::ESCAPE), move |below| {
            let below = below.ok_or_else(Error::bug)?;
            Ok(Box::new(Escape::new(below, Mode::Write, marks)) as Box<dyn Layer>)
        })?;
        let (algo, level) = (out.compression, out.compression_level);
        stack.push(Some(labels::COMPRESSOR), move |below| {
            let below = below.ok_or_else(Error::bug)?;
            Ok(Box::new(Compressor::new(below, Mode::Write, algo, level)?) as Box<dyn Layer>)
        })?;

        // identity mark right at the start of the entry stream
        stack_escape(&mut stack)?.add_mark(Mark::CatalogueDataName)?;
        data_name.dump(&mut stack)?;

        Ok(Self {
            stack,
            header,
            catalogue: Catalogue::new(data_name),
            cursor: AddCursor::default(),
            inline_dumped: HashSet::new(),
            finished: false,
        })
    }

    pub fn mark(&mut self, mark: Mark) -> Result<()> {
        stack_escape(&mut self.stack)?.add_mark(mark)
    }

    /// Current position in archive coordinates (below the compressor and
    /// the tape-mark layer).
    pub fn position(&mut self) -> Result<u64> {
        self.stack.position()
    }

    /// Whether this archive compresses anything at all.
    pub fn compressing(&self) -> bool {
        self.header.compression != CompressionAlgo::None
    }

    /// Starts compressing the bytes written from here on.
    pub fn resume_compression(&mut self) -> Result<()> {
        stack_compressor(&mut self.stack)?.resume()
    }

    /// Flushes the compression state and returns to pass-through.
    pub fn suspend_compression(&mut self) -> Result<()> {
        stack_compressor(&mut self.stack)?.suspend()
    }

    /// Emits the entry-header mark and the inline record that makes the
    /// archive readable sequentially.
    pub fn begin_entry(&mut self, child: &Child) -> Result<()> {
        self.mark(Mark::EntryHeader)?;
        child.dump(&mut self.stack, &mut self.inline_dumped)
    }

    /// Appends a child to the catalogue at the add cursor.
    pub fn add(&mut self, child: Child) -> Result<()> {
        let mut cursor = std::mem::take(&mut self.cursor);
        let outcome = self.catalogue.add(&mut cursor, child);
        self.cursor = cursor;
        outcome
    }

    /// Closes the directory currently open at the add cursor.
    pub fn close_dir(&mut self) -> Result<()> {
        let mut cursor = std::mem::take(&mut self.cursor);
        let outcome = self.catalogue.close_dir(&mut cursor);
        self.cursor = cursor;
        outcome
    }

    /// Streams a file's bytes into the archive.
    ///
    /// Returns (offset, storage bytes, saved data). Storage is 0 for data
    /// stored verbatim.
    pub fn save_file_data(
        &mut self,
        source: &mut File,
        expected_size: u64,
        compress: bool,
        sparse_threshold: Option<u64>,
    ) -> Result<(u64, u64, SavedData)> {
        self.mark(Mark::DataStart)?;
        let offset = self.position()?;
        if compress {
            self.resume_compression()?;
        }
        let saved = fs_io::save_data(source, &mut self.stack, expected_size, sparse_threshold);
        if compress {
            self.suspend_compression()?;
        }
        let saved = saved?;
        let end = self.position()?;
        self.mark(Mark::DataEnd)?;
        saved.crc.dump(&mut self.stack)?;
        let storage = if compress || saved.sparse {
            end - offset
        } else {
            0
        };
        Ok((offset, storage, saved))
    }

    /// Writes an EA block; returns (offset, logical size, checksum).
    pub fn save_ea(&mut self, set: &EaSet) -> Result<(u64, u64, Crc)> {
        self.mark(Mark::EaStart)?;
        let offset = self.position()?;
        let mut crc = Crc::for_size(set.byte_size());
        let compress = self.compressing();
        if compress {
            self.resume_compression()?;
        }
        {
            let mut tee = CrcTee::new(&mut self.stack, &mut crc);
            set.dump(&mut tee)?;
        }
        if compress {
            self.suspend_compression()?;
        }
        self.mark(Mark::EaEnd)?;
        crc.dump(&mut self.stack)?;
        Ok((offset, set.byte_size(), crc))
    }

    /// Writes an FSA block; returns (offset, logical size, checksum).
    pub fn save_fsa(&mut self, set: &FsaSet) -> Result<(u64, u64, Crc)> {
        self.mark(Mark::FsaStart)?;
        let offset = self.position()?;
        let mut crc = Crc::for_size(set.byte_size());
        let compress = self.compressing();
        if compress {
            self.resume_compression()?;
        }
        {
            let mut tee = CrcTee::new(&mut self.stack, &mut crc);
            set.dump(&mut tee)?;
        }
        if compress {
            self.suspend_compression()?;
        }
        self.mark(Mark::FsaEnd)?;
        crc.dump(&mut self.stack)?;
        Ok((offset, set.byte_size(), crc))
    }

    /// Writes the catalogue, the trailer and the terminator, then
    /// finalizes every layer. The trailer and terminator are written to
    /// the layer below the tape marks so the terminator stays at a fixed
    /// distance from the end of the stream.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::bug());
        }
        self.finished = true;

        self.mark(Mark::CatalogueStart)?;
        let cat_offset = self.position()?;
        self.resume_compression()?;
        self.catalogue.dump(&mut self.stack)?;
        self.suspend_compression()?;
        self.stack.sync_write()?;
        log::info!(
            "catalogue written at offset {cat_offset} ({} entries)",
            self.catalogue.stats().total()
        );

        {
            let header = self.header.clone();
            let below = self.stack.below_of(labels::ESCAPE)?;
            let trailer_pos = below.position()?;
            header.dump(below)?;
            infinint::dump_u64(below, cat_offset)?;
            terminator::write_terminator(below, trailer_pos)?;
        }

        // top-down finalization with error continuation
        self.stack.terminate()
    }
}
