//! The archive object: an opened archive's header, catalogue and read
//! stack, plus the entry points of every operation.

use std::fs::File;
use std::path::Path;

use crate::cache::Cache;
use crate::catalogue::{Catalogue, CatalogueStats};
use crate::cipher::Cipher;
use crate::compressor::{CompressionAlgo, Compressor};
use crate::crc::{Crc, CrcTee};
use crate::ea::EaSet;
use crate::entrepot::Entrepot;
use crate::entry::{FileData, InodeAttr};
use crate::error::{Error, Result};
use crate::escape::Escape;
use crate::fs_io;
use crate::fsa::FsaSet;
use crate::header::ArchiveHeader;
use crate::infinint;
use crate::interaction::UserInteraction;
use crate::label::Label;
use crate::layer::{Layer, Mode};
use crate::options::{
    CreateOptions, DiffOptions, IsolateOptions, MergeOptions, ReadOptions, RepairOptions,
    RestoreOptions, TestOptions,
};
use crate::ops;
use crate::slicer::{SliceLayout, SliceName, Slicer, SlicerOptions};
use crate::stack::{Stack, labels};
use crate::statistics::Statistics;
use crate::terminator;

/// Summary of an opened archive.
#[derive(Clone, Debug)]
pub struct ArchiveSummary {
    pub data_name: Label,
    pub edition: u8,
    pub compression: CompressionAlgo,
    pub ciphered: bool,
    pub tape_marks: bool,
    pub slice_layout: SliceLayout,
    pub comment: String,
    pub stats: CatalogueStats,
    /// Logical bytes of the archived plain files.
    pub total_size: u64,
    /// Bytes those files occupy in the archive.
    pub total_storage: u64,
}

/// An archive opened for reading, or the handle produced by a write
/// operation once reopened.
pub struct Archive {
    pub header: ArchiveHeader,
    pub catalogue: Catalogue,
    /// The labelled read stack: slicer at the bottom, then cipher (when
    /// ciphered), cache, tape marks and the compressor on top.
    stack: Stack,
    pub slice_layout: SliceLayout,
    pub lax: bool,
}

impl Archive {
    /// Opens an existing archive: reads the slice and archive headers,
    /// mounts the cipher when needed, locates the trailer and loads the
    /// catalogue.
    pub fn open(
        ui: &mut dyn UserInteraction,
        entrepot: Box<dyn Entrepot>,
        basename: &str,
        opts: &ReadOptions,
    ) -> Result<Self> {
        let mut name = SliceName::new(basename);
        name.extension = opts.extension.clone();
        name.min_digits = opts.min_digits;
        let mut slicer_opts =
            SlicerOptions::new(name, SliceLayout::unsliced(), Label::cleared());
        slicer_opts.pause_command = opts.pause_command.clone();
        let slicer = Slicer::open(entrepot, slicer_opts)?;
        let slice_layout = slicer.layout();

        let mut stack = Stack::new();
        stack.push(Some(labels::SLICER), move |_| {
            Ok(Box::new(slicer) as Box<dyn Layer>)
        })?;
        let header = ArchiveHeader::read(&mut stack)?;
        let region_start = stack.position()?;

        if let Some(algo) = header.cipher {
            let passphrase = match &opts.passphrase {
                Some(p) => p.clone(),
                None => ui.get_secu_string("Archive passphrase: ", false)?,
            };
            let key = match &header.kdf {
                Some(kdf) => kdf.derive(&passphrase)?,
                // scrambling uses the passphrase directly
                None => passphrase.clone(),
            };
            let region_end = stack.skip_to_eof()?;
            let block = if header.crypto_block_size == 0 {
                crate::cipher::DEFAULT_BLOCK_SIZE
            } else {
                header.crypto_block_size as usize
            };
            stack.push(Some(labels::CIPHER), move |below| {
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
        stack.push(Some(labels::CACHE), |below| {
            let below = below.ok_or_else(Error::bug)?;
            Ok(Box::new(Cache::new(below)?) as Box<dyn Layer>)
        })?;

        // trailer and terminator live at the very end of the stream; they
        // are read with the cache on top, before the framing layers mount
        let trailer_pos = terminator::locate_trailer(&mut stack)?;
        stack.skip(trailer_pos)?;
        let trailer = ArchiveHeader::read(&mut stack)?;
        if trailer.data_name != header.data_name {
            if opts.lax {
                log::warn!("archive trailer does not match the header, going on in lax mode");
            } else {
                return Err(Error::Data(
                    "archive trailer does not match the header".into(),
                ));
            }
        }
        let cat_offset = infinint::read_u64(&mut stack)?;

        let marks = header.tape_marks;
        stack.push(Some(labels::ESCAPE), move |below| {
            let below = below.ok_or_else(Error::bug)?;
            Ok(Box::new(Escape::new(below, Mode::Read, marks)) as Box<dyn Layer>)
        })?;
        let compression = header.compression;
        stack.push(Some(labels::COMPRESSOR), move |below| {
            let below = below.ok_or_else(Error::bug)?;
            Ok(Box::new(Compressor::new(below, Mode::Read, compression, 6)?) as Box<dyn Layer>)
        })?;

        stack.skip(cat_offset)?;
        ops::stack_compressor(&mut stack)?.resume()?;
        let catalogue = Catalogue::read_from(&mut stack, opts.lax)?;
        ops::stack_compressor(&mut stack)?.suspend()?;

        if catalogue.data_name != header.data_name {
            if opts.lax {
                log::warn!("catalogue identity does not match the archive header");
            } else {
                return Err(Error::Data(
                    "catalogue identity does not match the archive header".into(),
                ));
            }
        }
        log::info!(
            "archive {} opened, {} entries",
            header.data_name,
            catalogue.stats().total()
        );

        Ok(Self {
            header,
            catalogue,
            stack,
            slice_layout,
            lax: opts.lax,
        })
    }

    /// Creates a new archive from a filesystem subtree. With a reference
    /// catalogue this is a differential backup. Statistics accumulate in
    /// the given sink whatever the outcome.
    pub fn create(
        ui: &mut dyn UserInteraction,
        fs_root: &Path,
        entrepot: Box<dyn Entrepot>,
        basename: &str,
        reference: Option<&Catalogue>,
        opts: &CreateOptions,
        stats: &mut Statistics,
    ) -> Result<Catalogue> {
        ops::backup::execute(ui, fs_root, entrepot, basename, reference, opts, stats)
    }

    /// Restores the archive under `target`.
    pub fn restore(
        &mut self,
        ui: &mut dyn UserInteraction,
        target: &Path,
        opts: &RestoreOptions,
        stats: &mut Statistics,
    ) -> Result<()> {
        opts.validate()?;
        self.with_own_catalogue(|archive, catalogue| {
            ops::restore::execute(ui, archive, catalogue, target, opts, stats)
        })
    }

    /// Compares the archive against the live filesystem under `root`.
    pub fn diff(
        &mut self,
        ui: &mut dyn UserInteraction,
        root: &Path,
        opts: &DiffOptions,
        stats: &mut Statistics,
    ) -> Result<()> {
        self.with_own_catalogue(|archive, catalogue| {
            ops::diff::execute(ui, archive, catalogue, root, opts, stats)
        })
    }

    /// Verifies the archive's integrity.
    pub fn test(
        &mut self,
        ui: &mut dyn UserInteraction,
        opts: &TestOptions,
        stats: &mut Statistics,
    ) -> Result<()> {
        self.with_own_catalogue(|archive, catalogue| {
            ops::verify::execute(ui, archive, catalogue, opts, stats)
        })
    }

    /// Verifies this archive's data through a foreign catalogue, typically
    /// an isolated one.
    pub fn test_with_catalogue(
        &mut self,
        ui: &mut dyn UserInteraction,
        catalogue: &Catalogue,
        opts: &TestOptions,
        stats: &mut Statistics,
    ) -> Result<()> {
        if catalogue.data_name != self.header.data_name {
            return Err(Error::Range(
                "the given catalogue belongs to a different archive".into(),
            ));
        }
        ops::verify::execute(ui, self, catalogue, opts, stats)
    }

    /// Writes a catalogue-only copy of this archive.
    pub fn isolate(
        &self,
        ui: &mut dyn UserInteraction,
        entrepot: Box<dyn Entrepot>,
        basename: &str,
        opts: &IsolateOptions,
        stats: &mut Statistics,
    ) -> Result<()> {
        ops::isolate::execute(ui, self, entrepot, basename, opts, stats)
    }

    /// Merges one or two archives into a new one.
    pub fn merge(
        ui: &mut dyn UserInteraction,
        first: &mut Archive,
        second: Option<&mut Archive>,
        entrepot: Box<dyn Entrepot>,
        basename: &str,
        opts: &MergeOptions,
        stats: &mut Statistics,
    ) -> Result<Catalogue> {
        ops::merge::execute(ui, first, second, entrepot, basename, opts, stats)
    }

    /// Rebuilds a readable archive from one whose trailer or catalogue is
    /// damaged, using the tape marks.
    pub fn repair(
        ui: &mut dyn UserInteraction,
        src_entrepot: Box<dyn Entrepot>,
        src_basename: &str,
        read_opts: &ReadOptions,
        dst_entrepot: Box<dyn Entrepot>,
        dst_basename: &str,
        opts: &RepairOptions,
        stats: &mut Statistics,
    ) -> Result<Catalogue> {
        ops::repair::execute(
            ui,
            src_entrepot,
            src_basename,
            read_opts,
            dst_entrepot,
            dst_basename,
            opts,
            stats,
        )
    }

    pub fn summary(&self) -> ArchiveSummary {
        let (total_size, total_storage) = self.catalogue.root().recursive_sizes();
        ArchiveSummary {
            data_name: self.header.data_name,
            edition: self.header.edition,
            compression: self.header.compression,
            ciphered: self.header.is_ciphered(),
            tape_marks: self.header.tape_marks,
            slice_layout: self.slice_layout,
            comment: self.header.comment.clone(),
            stats: self.catalogue.stats().clone(),
            total_size,
            total_storage,
        }
    }

    /// Runs `f` with the archive's catalogue detached, so operations can
    /// walk it while reading data through the archive.
    fn with_own_catalogue<T>(
        &mut self,
        f: impl FnOnce(&mut Archive, &Catalogue) -> Result<T>,
    ) -> Result<T> {
        let catalogue = std::mem::replace(&mut self.catalogue, Catalogue::new(Label::cleared()));
        let outcome = f(self, &catalogue);
        self.catalogue = catalogue;
        outcome
    }

    /// The compression layer of the read stack, by its label.
    fn compressor(&mut self) -> Result<&mut Compressor> {
        ops::stack_compressor(&mut self.stack)
    }

    /// Reads (or verifies) one file's data. Returns the recomputed
    /// checksum.
    pub(crate) fn read_file_data(
        &mut self,
        data: &FileData,
        dest: Option<&mut File>,
    ) -> Result<Crc> {
        self.stack.skip(data.offset)?;
        let compressed = data.compression != CompressionAlgo::None;
        if compressed {
            self.compressor()?.resume()?;
        }
        let outcome = fs_io::load_data(&mut self.stack, dest, data.size, data.sparse);
        if compressed {
            self.compressor()?.suspend()?;
        } else {
            self.stack.flush_read()?;
        }
        outcome
    }

    /// Positions the read stack on an entry's data and hands the stream to
    /// `f`, optionally decompressing.
    pub(crate) fn with_data_stream<T>(
        &mut self,
        data: &FileData,
        decompress: bool,
        f: impl FnOnce(&mut dyn Layer) -> Result<T>,
    ) -> Result<T> {
        self.stack.skip(data.offset)?;
        let active = decompress && data.compression != CompressionAlgo::None;
        if active {
            self.compressor()?.resume()?;
        }
        let outcome = f(&mut self.stack);
        if active {
            self.compressor()?.suspend()?;
        } else {
            self.stack.flush_read()?;
        }
        outcome
    }

    /// Reads and verifies an EA block.
    pub(crate) fn read_ea_block(&mut self, attr: &InodeAttr) -> Result<EaSet> {
        self.stack.skip(attr.ea_offset)?;
        let compressed = self.header.compression != CompressionAlgo::None;
        if compressed {
            self.compressor()?.resume()?;
        }
        let mut crc = Crc::for_size(attr.ea_size);
        let outcome = {
            let mut tee = CrcTee::new(&mut self.stack, &mut crc);
            EaSet::read(&mut tee)
        };
        if compressed {
            self.compressor()?.suspend()?;
        } else {
            self.stack.flush_read()?;
        }
        let set = outcome?;
        if let Some(stored) = &attr.ea_crc {
            if stored.value() != crc.value() {
                return Err(Error::Data("EA block failed its checksum".into()));
            }
        }
        Ok(set)
    }

    /// Reads and verifies an FSA block.
    pub(crate) fn read_fsa_block(&mut self, attr: &InodeAttr) -> Result<FsaSet> {
        self.stack.skip(attr.fsa_offset)?;
        let compressed = self.header.compression != CompressionAlgo::None;
        if compressed {
            self.compressor()?.resume()?;
        }
        let mut crc = Crc::for_size(attr.fsa_size);
        let outcome = {
            let mut tee = CrcTee::new(&mut self.stack, &mut crc);
            FsaSet::read(&mut tee)
        };
        if compressed {
            self.compressor()?.suspend()?;
        } else {
            self.stack.flush_read()?;
        }
        let set = outcome?;
        if let Some(stored) = &attr.fsa_crc {
            if stored.value() != crc.value() {
                return Err(Error::Data("FSA block failed its checksum".into()));
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entrepot::LocalEntrepot;
    use crate::entry::{InodeAttr, Item};
    use crate::interaction::SilentInteraction;
    use crate::overwrite::{Criterion, DataAction, EaAction, Policy};
    use crate::secure::SecuString;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use std::path::PathBuf;

    struct Playground {
        root: PathBuf,
    }

    impl Playground {
        fn new() -> Self {
            let root =
                std::env::temp_dir().join(format!("coffre-arch-{}", uuid::Uuid::new_v4()));
            fs::create_dir_all(&root).unwrap();
            Self { root }
        }

        fn dir(&self, name: &str) -> PathBuf {
            let p = self.root.join(name);
            fs::create_dir_all(&p).unwrap();
            p
        }

        fn entrepot(&self, name: &str) -> Box<dyn Entrepot> {
            Box::new(LocalEntrepot::new(self.dir(name)))
        }
    }

    impl Drop for Playground {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    /// Pins an entry's times so differential comparisons are deterministic.
    fn set_times(path: &Path, mtime: i64) {
        let entry = fs_io::read_entry(path).unwrap();
        let attr = InodeAttr {
            atime: mtime,
            mtime,
            ..entry.attr
        };
        fs_io::write_metadata(path, &attr, false, false, true).unwrap();
    }

    /// The scenario-1 source tree: a.txt, sub/b.txt, link -> a.txt.
    fn basic_tree(src: &Path) {
        fs::write(src.join("a.txt"), b"hello").unwrap();
        fs::create_dir(src.join("sub")).unwrap();
        fs::write(src.join("sub/b.txt"), b"world").unwrap();
        std::os::unix::fs::symlink("a.txt", src.join("link")).unwrap();
        set_times(&src.join("a.txt"), 1_700_000_000);
        set_times(&src.join("sub/b.txt"), 1_700_000_000);
        set_times(&src.join("sub"), 1_700_000_000);
    }

    fn backup(
        play: &Playground,
        src: &Path,
        store: &str,
        reference: Option<&Catalogue>,
        opts: &CreateOptions,
    ) -> (Catalogue, Statistics) {
        let mut ui = SilentInteraction::new(true);
        let mut stats = Statistics::new();
        let catalogue = Archive::create(
            &mut ui,
            src,
            play.entrepot(store),
            "out",
            reference,
            opts,
            &mut stats,
        )
        .unwrap();
        (catalogue, stats)
    }

    fn reopen(play: &Playground, store: &str, read: &ReadOptions) -> Archive {
        let mut ui = SilentInteraction::new(true);
        Archive::open(&mut ui, play.entrepot(store), "out", read).unwrap()
    }

    #[test]
    fn backup_and_restore_basic_tree() {
        let play = Playground::new();
        let src = play.dir("src");
        basic_tree(&src);

        let (catalogue, stats) = backup(&play, &src, "store", None, &CreateOptions::default());
        assert_eq!(stats.treated, 4); // a.txt, sub, sub/b.txt, link
        assert_eq!(stats.errored, 0);
        assert!(play.root.join("store/out.1.dar").exists());
        assert_eq!(catalogue.stats().files, 2);
        assert_eq!(catalogue.stats().dirs, 1);
        assert_eq!(catalogue.stats().symlinks, 1);

        let mut archive = reopen(&play, "store", &ReadOptions::default());
        assert_eq!(archive.summary().stats.files, 2);

        let dst = play.dir("dst");
        let mut ui = SilentInteraction::new(true);
        let mut stats = Statistics::new();
        archive
            .restore(&mut ui, &dst, &RestoreOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(stats.errored, 0);
        assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dst.join("sub/b.txt")).unwrap(), b"world");
        assert_eq!(
            fs::read_link(dst.join("link")).unwrap(),
            PathBuf::from("a.txt")
        );
        assert_eq!(fs::metadata(dst.join("a.txt")).unwrap().len(), 5);
        assert_eq!(fs::metadata(dst.join("a.txt")).unwrap().mtime(), 1_700_000_000);

        // and the archive itself verifies clean
        let mut stats = Statistics::new();
        archive
            .test(&mut ui, &TestOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(stats.errored, 0);
        assert!(stats.treated > 0);
    }

    #[test]
    fn differential_backup_records_changes_and_deletions() {
        let play = Playground::new();
        let src = play.dir("src");
        basic_tree(&src);

        let (full_cat, _) = backup(&play, &src, "full", None, &CreateOptions::default());

        // mutate: newer a.txt, new c.txt, delete sub/b.txt
        fs::write(src.join("a.txt"), b"HELLO").unwrap();
        set_times(&src.join("a.txt"), 1_700_100_000);
        fs::write(src.join("c.txt"), b"new").unwrap();
        set_times(&src.join("c.txt"), 1_700_100_000);
        fs::remove_file(src.join("sub/b.txt")).unwrap();
        // the deletion touched sub's mtime; pin it back so only real
        // changes are re-saved
        set_times(&src.join("sub"), 1_700_000_000);

        let (diff_cat, stats) =
            backup(&play, &src, "diff", Some(&full_cat), &CreateOptions::default());
        // a.txt and c.txt saved; sub and link unchanged
        assert_eq!(stats.treated, 2);
        assert!(stats.skipped >= 2);
        assert_eq!(stats.deleted, 1);

        let ghost = diff_cat.lookup(Path::new("sub/b.txt")).unwrap();
        match &ghost.item {
            Item::Detruit(d) => assert_eq!(d.base, crate::entry::BASE_FILE),
            other => panic!("expected a tombstone, got {other:?}"),
        }

        // replay over a copy of the original state
        let dst = play.dir("dst");
        basic_tree(&dst);
        let mut archive = reopen(&play, "diff", &ReadOptions::default());
        let overwrite_newer = RestoreOptions {
            overwriting: Policy::Testing {
                cond: Criterion::DataMoreRecent { hourshift: 0 },
                if_true: Box::new(Policy::Constant(DataAction::Overwrite, EaAction::Preserve)),
                if_false: Box::new(Policy::Constant(DataAction::Preserve, EaAction::Preserve)),
            },
            ..Default::default()
        };
        let mut ui = SilentInteraction::new(true);
        let mut stats = Statistics::new();
        archive
            .restore(&mut ui, &dst, &overwrite_newer, &mut stats)
            .unwrap();
        assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"HELLO");
        assert_eq!(fs::read(dst.join("c.txt")).unwrap(), b"new");
        assert!(!dst.join("sub/b.txt").exists());
    }

    #[test]
    fn hard_links_share_one_inode_end_to_end() {
        let play = Playground::new();
        let src = play.dir("src");
        fs::write(src.join("file1"), b"shared").unwrap();
        fs::hard_link(src.join("file1"), src.join("file2")).unwrap();

        let (catalogue, stats) = backup(&play, &src, "store", None, &CreateOptions::default());
        assert_eq!(stats.treated, 1);
        assert_eq!(stats.hard_links, 1);
        assert_eq!(catalogue.stats().hard_linked, 2);

        let f1 = catalogue.lookup(Path::new("file1")).unwrap();
        let f2 = catalogue.lookup(Path::new("file2")).unwrap();
        let (Item::Mirage(m1), Item::Mirage(m2)) = (&f1.item, &f2.item) else {
            panic!("hard links must be mirages");
        };
        assert_eq!(m1.etiquette(), m2.etiquette());

        let dst = play.dir("dst");
        let mut archive = reopen(&play, "store", &ReadOptions::default());
        let mut ui = SilentInteraction::new(true);
        let mut stats = Statistics::new();
        archive
            .restore(&mut ui, &dst, &RestoreOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(stats.hard_links, 1);
        let meta1 = fs::metadata(dst.join("file1")).unwrap();
        let meta2 = fs::metadata(dst.join("file2")).unwrap();
        assert_eq!(meta1.nlink(), 2);
        assert_eq!(meta1.ino(), meta2.ino());
        assert_eq!(fs::read(dst.join("file2")).unwrap(), b"shared");
    }

    #[test]
    fn sliced_and_hashed_archive() {
        let play = Playground::new();
        let src = play.dir("src");
        // incompressible-ish payload spanning several slices
        let payload: Vec<u8> = (0..300_000u32)
            .map(|i| i.wrapping_mul(2_654_435_761) as u8)
            .collect();
        fs::write(src.join("big.bin"), &payload).unwrap();

        let opts = CreateOptions {
            output: crate::options::OutputOptions {
                slice_size: Some(100_000),
                hash: Some(crate::hasher::HashAlgo::Sha512),
                ..Default::default()
            },
            ..Default::default()
        };
        backup(&play, &src, "store", None, &opts);

        let store = play.root.join("store");
        let mut slices = 0;
        for n in 1..=16u32 {
            let slice = store.join(format!("out.{n}.dar"));
            if !slice.exists() {
                break;
            }
            slices += 1;
            let sidecar = store.join(format!("out.{n}.dar.sha512"));
            let line = fs::read_to_string(&sidecar).unwrap();
            let (digest, name) = line.trim_end().split_once("  ").unwrap();
            assert_eq!(name, format!("out.{n}.dar"));

            use sha2::{Digest, Sha512};
            let mut hasher = Sha512::new();
            hasher.update(fs::read(&slice).unwrap());
            let recomputed: String =
                hasher.finalize().iter().map(|b| format!("{b:02x}")).collect();
            assert_eq!(digest, recomputed, "slice {n} digest mismatch");
        }
        assert!(slices >= 3, "expected several slices, got {slices}");

        // the sliced archive reads back whole
        let mut archive = reopen(&play, "store", &ReadOptions::default());
        let dst = play.dir("dst");
        let mut ui = SilentInteraction::new(true);
        let mut stats = Statistics::new();
        archive
            .restore(&mut ui, &dst, &RestoreOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(fs::read(dst.join("big.bin")).unwrap(), payload);
    }

    #[test]
    fn encrypted_archive_round_trip() {
        let play = Playground::new();
        let src = play.dir("src");
        fs::write(src.join("data.bin"), b"secret").unwrap();

        let opts = CreateOptions {
            output: crate::options::OutputOptions {
                cipher: Some(crate::cipher::CipherAlgo::Aes256),
                passphrase: Some(SecuString::from_str("Pa$$w0rd")),
                iteration_count: 2_000,
                ..Default::default()
            },
            ..Default::default()
        };
        backup(&play, &src, "store", None, &opts);

        // the cleartext must not appear in the slice
        let raw = fs::read(play.root.join("store/out.1.dar")).unwrap();
        assert!(!raw.windows(6).any(|w| w == b"secret"));

        // unreadable without the passphrase
        let mut ui = SilentInteraction::new(true);
        let bad = ReadOptions {
            passphrase: Some(SecuString::from_str("nope")),
            ..Default::default()
        };
        assert!(Archive::open(&mut ui, play.entrepot("store"), "out", &bad).is_err());

        // readable with it
        let good = ReadOptions {
            passphrase: Some(SecuString::from_str("Pa$$w0rd")),
            ..Default::default()
        };
        let mut archive = reopen(&play, "store", &good);
        let dst = play.dir("dst");
        let mut stats = Statistics::new();
        archive
            .restore(&mut ui, &dst, &RestoreOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(fs::read(dst.join("data.bin")).unwrap(), b"secret");
    }

    #[test]
    fn compressed_archive_round_trip() {
        let play = Playground::new();
        let src = play.dir("src");
        let text = "all work and no play makes a dull archive ".repeat(10_000);
        fs::write(src.join("text.log"), &text).unwrap();

        let opts = CreateOptions {
            output: crate::options::OutputOptions {
                compression: crate::compressor::CompressionAlgo::Gzip,
                compression_level: 6,
                ..Default::default()
            },
            ..Default::default()
        };
        let (_, stats) = backup(&play, &src, "store", None, &opts);
        assert!(stats.byte_written < stats.byte_read / 2);

        let mut archive = reopen(&play, "store", &ReadOptions::default());
        let dst = play.dir("dst");
        let mut ui = SilentInteraction::new(true);
        let mut stats = Statistics::new();
        archive
            .restore(&mut ui, &dst, &RestoreOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(fs::read_to_string(dst.join("text.log")).unwrap(), text);
    }

    #[test]
    fn sparse_file_round_trip() {
        let play = Playground::new();
        let src = play.dir("src");
        let mut content = vec![0u8; 200_000];
        content[0] = b'S';
        content[199_999] = b'E';
        fs::write(src.join("holey"), &content).unwrap();

        let (_, stats) = backup(&play, &src, "store", None, &CreateOptions::default());
        // holes shrink the stored bytes drastically
        assert!(stats.byte_written < 10_000);

        let mut archive = reopen(&play, "store", &ReadOptions::default());
        let dst = play.dir("dst");
        let mut ui = SilentInteraction::new(true);
        let mut stats = Statistics::new();
        archive
            .restore(&mut ui, &dst, &RestoreOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(fs::read(dst.join("holey")).unwrap(), content);
    }

    #[test]
    fn single_bit_flip_is_reported_by_test() {
        let play = Playground::new();
        let src = play.dir("src");
        basic_tree(&src);
        let (catalogue, _) = backup(&play, &src, "store", None, &CreateOptions::default());

        // flip one bit inside a.txt's literal bytes
        let offset = match &catalogue.lookup(Path::new("a.txt")).unwrap().item {
            Item::Inode(inode) => inode.as_file().unwrap().offset,
            _ => panic!(),
        };
        let slice = play.root.join("store/out.1.dar");
        let mut raw = fs::read(&slice).unwrap();
        let physical =
            (crate::slicer::FIRST_SLICE_HEADER_LEN + offset) as usize + 5; // into "hello"
        raw[physical] ^= 0x01;
        fs::write(&slice, &raw).unwrap();

        let mut archive = reopen(&play, "store", &ReadOptions::default());
        let mut ui = SilentInteraction::new(true);
        let mut stats = Statistics::new();
        archive
            .test(&mut ui, &TestOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(stats.errored, 1);
    }

    #[test]
    fn isolated_catalogue_pairs_with_the_data_slices() {
        let play = Playground::new();
        let src = play.dir("src");
        basic_tree(&src);
        backup(&play, &src, "store", None, &CreateOptions::default());

        let archive = reopen(&play, "store", &ReadOptions::default());
        let mut ui = SilentInteraction::new(true);
        let mut stats = Statistics::new();
        archive
            .isolate(
                &mut ui,
                play.entrepot("cat"),
                "out",
                &IsolateOptions::default(),
                &mut stats,
            )
            .unwrap();
        assert!(stats.treated > 0);

        let isolated = reopen(&play, "cat", &ReadOptions::default());
        assert_eq!(isolated.header.data_name, archive.header.data_name);
        assert!(isolated.header.ref_slicing.is_some());

        // test the data archive through the isolated catalogue
        let mut data_archive = reopen(&play, "store", &ReadOptions::default());
        let mut stats = Statistics::new();
        data_archive
            .test_with_catalogue(
                &mut ui,
                &isolated.catalogue,
                &TestOptions::default(),
                &mut stats,
            )
            .unwrap();
        assert_eq!(stats.errored, 0);
        assert!(stats.treated > 0);
    }

    #[test]
    fn merging_with_nothing_preserves_the_catalogue() {
        let play = Playground::new();
        let src = play.dir("src");
        basic_tree(&src);
        backup(&play, &src, "store", None, &CreateOptions::default());

        let mut first = reopen(&play, "store", &ReadOptions::default());
        let mut ui = SilentInteraction::new(true);
        let mut stats = Statistics::new();
        let merged = Archive::merge(
            &mut ui,
            &mut first,
            None,
            play.entrepot("merged"),
            "out",
            &MergeOptions::default(),
            &mut stats,
        )
        .unwrap();
        assert_eq!(merged.stats().files, first.catalogue.stats().files);
        assert_eq!(merged.stats().dirs, first.catalogue.stats().dirs);
        assert_eq!(merged.stats().symlinks, first.catalogue.stats().symlinks);

        // the merged archive restores the same content
        let mut archive = reopen(&play, "merged", &ReadOptions::default());
        let dst = play.dir("dst");
        let mut stats = Statistics::new();
        archive
            .restore(&mut ui, &dst, &RestoreOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dst.join("sub/b.txt")).unwrap(), b"world");
    }

    #[test]
    fn merging_two_archives_resolves_conflicts() {
        let play = Playground::new();
        let src1 = play.dir("src1");
        fs::write(src1.join("common.txt"), b"older").unwrap();
        set_times(&src1.join("common.txt"), 1_700_000_000);
        fs::write(src1.join("only1.txt"), b"one").unwrap();
        let src2 = play.dir("src2");
        fs::write(src2.join("common.txt"), b"newer!").unwrap();
        set_times(&src2.join("common.txt"), 1_700_100_000);
        fs::write(src2.join("only2.txt"), b"two").unwrap();

        backup(&play, &src1, "store1", None, &CreateOptions::default());
        backup(&play, &src2, "store2", None, &CreateOptions::default());

        let mut first = reopen(&play, "store1", &ReadOptions::default());
        let mut second = reopen(&play, "store2", &ReadOptions::default());
        let opts = MergeOptions {
            overwriting: Policy::Testing {
                cond: Criterion::DataMoreRecent { hourshift: 0 },
                if_true: Box::new(Policy::Constant(DataAction::Overwrite, EaAction::Preserve)),
                if_false: Box::new(Policy::Constant(DataAction::Preserve, EaAction::Preserve)),
            },
            ..Default::default()
        };
        let mut ui = SilentInteraction::new(true);
        let mut stats = Statistics::new();
        Archive::merge(
            &mut ui,
            &mut first,
            Some(&mut second),
            play.entrepot("merged"),
            "out",
            &opts,
            &mut stats,
        )
        .unwrap();

        let mut archive = reopen(&play, "merged", &ReadOptions::default());
        let dst = play.dir("dst");
        let mut stats = Statistics::new();
        archive
            .restore(&mut ui, &dst, &RestoreOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(fs::read(dst.join("common.txt")).unwrap(), b"newer!");
        assert_eq!(fs::read(dst.join("only1.txt")).unwrap(), b"one");
        assert_eq!(fs::read(dst.join("only2.txt")).unwrap(), b"two");
    }

    #[test]
    fn repair_rebuilds_an_archive_with_a_broken_trailer() {
        let play = Playground::new();
        let src = play.dir("src");
        basic_tree(&src);
        backup(&play, &src, "store", None, &CreateOptions::default());

        // wreck the terminator magic, keeping the slice continuation flag
        // (the very last byte) intact
        let slice = play.root.join("store/out.1.dar");
        let mut raw = fs::read(&slice).unwrap();
        let len = raw.len();
        for b in &mut raw[len - 10..len - 1] {
            *b ^= 0xff;
        }
        fs::write(&slice, &raw).unwrap();

        let mut ui = SilentInteraction::new(true);
        assert!(
            Archive::open(
                &mut ui,
                play.entrepot("store"),
                "out",
                &ReadOptions::default()
            )
            .is_err()
        );

        let mut stats = Statistics::new();
        let rebuilt = Archive::repair(
            &mut ui,
            play.entrepot("store"),
            "out",
            &ReadOptions::default(),
            play.entrepot("fixed"),
            "out",
            &RepairOptions::default(),
            &mut stats,
        )
        .unwrap();
        assert!(rebuilt.lookup(Path::new("a.txt")).is_some());
        assert!(rebuilt.lookup(Path::new("sub/b.txt")).is_some());

        let mut archive = reopen(&play, "fixed", &ReadOptions::default());
        let dst = play.dir("dst");
        let mut stats = Statistics::new();
        archive
            .restore(&mut ui, &dst, &RestoreOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dst.join("sub/b.txt")).unwrap(), b"world");
        assert_eq!(
            fs::read_link(dst.join("link")).unwrap(),
            PathBuf::from("a.txt")
        );
    }

    #[test]
    fn diff_flags_a_modified_file() {
        let play = Playground::new();
        let src = play.dir("src");
        basic_tree(&src);
        backup(&play, &src, "store", None, &CreateOptions::default());

        let mut archive = reopen(&play, "store", &ReadOptions::default());
        let mut ui = SilentInteraction::new(true);
        let mut stats = Statistics::new();
        archive
            .diff(&mut ui, &src, &DiffOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(stats.errored, 0);

        // same size, same mtime, different bytes: the checksum catches it
        fs::write(src.join("a.txt"), b"hullo").unwrap();
        set_times(&src.join("a.txt"), 1_700_000_000);
        let mut stats = Statistics::new();
        archive
            .diff(&mut ui, &src, &DiffOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(stats.errored, 1);
    }

    #[test]
    fn selection_masks_narrow_an_operation() {
        let play = Playground::new();
        let src = play.dir("src");
        basic_tree(&src);
        fs::write(src.join("notes.log"), b"log line").unwrap();

        let opts = CreateOptions {
            selection: Box::new(crate::mask::GlobMask::new("*.txt").unwrap()),
            ..Default::default()
        };
        let (catalogue, stats) = backup(&play, &src, "store", None, &opts);
        assert!(catalogue.lookup(Path::new("a.txt")).is_some());
        assert!(catalogue.lookup(Path::new("notes.log")).is_none());
        // the symlink and the log file fall outside the selection
        assert_eq!(stats.ignored, 2);
    }
}
