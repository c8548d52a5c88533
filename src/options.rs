//! Per-operation option records.
//!
//! Options are plain structs with total construction: every field holds a
//! valid value from the start (`Default` gives the usual behavior), and the
//! operations validate cross-field constraints on entry.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::cipher::{CipherAlgo, KdfHash};
use crate::compressor::CompressionAlgo;
use crate::error::{Error, Result};
use crate::hasher::HashAlgo;
use crate::mask::{BoolMask, Mask};
use crate::overwrite::Policy;
use crate::secure::SecuString;

/// Cooperative cancellation flag checked at the top of filter loops.
pub type CancelFlag = Arc<AtomicBool>;

/// Which inode fields decide that an entry changed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WhatToCheck {
    /// Compare everything: type, ownership, permissions, dates.
    #[default]
    All,
    /// Ignore ownership differences.
    IgnoreOwner,
    /// Only compare mtime.
    MtimeOnly,
    /// Only compare the inode type.
    InodeType,
}

/// What restore does with files marked dirty at backup time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DirtyBehavior {
    /// Skip dirty files silently.
    Ignore,
    /// Ask through the interaction callback.
    #[default]
    Warn,
    /// Restore them like any other file.
    Restore,
}

fn all() -> Box<dyn Mask> {
    Box::new(BoolMask(true))
}

/// Cancellation handling shared by every operation.
pub struct Cancellation {
    pub flag: Option<CancelFlag>,
    /// Deferred: finalize the entry in flight, flush, write the trailer,
    /// then raise. Immediate: stop at the next checkpoint.
    pub deferred: bool,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self {
            flag: None,
            deferred: true,
        }
    }
}

impl Cancellation {
    pub fn requested(&self) -> bool {
        self.flag
            .as_ref()
            .is_some_and(|f| f.load(std::sync::atomic::Ordering::Relaxed))
    }
}

/// How the produced archive is shaped: applies to every operation that
/// writes one (create, merge, isolate, repair).
pub struct OutputOptions {
    pub compression: CompressionAlgo,
    pub compression_level: u8,
    pub cipher: Option<CipherAlgo>,
    pub passphrase: Option<SecuString>,
    pub kdf_hash: KdfHash,
    pub iteration_count: u32,
    /// Cleartext bytes per encrypted block.
    pub crypto_block_size: usize,
    /// Size of slices 2..n; `None` means a single slice.
    pub slice_size: Option<u64>,
    /// Distinct size for the first slice.
    pub first_slice_size: Option<u64>,
    pub slice_permission: u32,
    pub min_digits: usize,
    pub extension: String,
    pub hash: Option<HashAlgo>,
    /// Command run between slices (`%n %b %p %e` substituted).
    pub pause_command: Option<String>,
    /// Whether to interleave tape marks for sequential reading.
    pub tape_marks: bool,
    pub comment: String,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            compression: CompressionAlgo::None,
            compression_level: 6,
            cipher: None,
            passphrase: None,
            kdf_hash: KdfHash::Sha512,
            iteration_count: 200_000,
            crypto_block_size: crate::cipher::DEFAULT_BLOCK_SIZE,
            slice_size: None,
            first_slice_size: None,
            slice_permission: 0o644,
            min_digits: 1,
            extension: "dar".into(),
            hash: None,
            pause_command: None,
            tape_marks: true,
            comment: String::new(),
        }
    }
}

impl OutputOptions {
    pub fn validate(&self) -> Result<()> {
        if self.cipher.is_some() && self.passphrase.is_none() {
            return Err(Error::Libcall(
                "a cipher algorithm requires a passphrase".into(),
            ));
        }
        if self.cipher == Some(CipherAlgo::Scrambling) {
            return Err(Error::Range(
                "refusing to create an archive with the legacy scrambling cipher".into(),
            ));
        }
        if let (Some(first), Some(other)) = (self.first_slice_size, self.slice_size) {
            let min_first = crate::slicer::FIRST_SLICE_HEADER_LEN + 2;
            let min_other = crate::slicer::OTHER_SLICE_HEADER_LEN + 2;
            if first < min_first || other < min_other {
                return Err(Error::Range("slice size smaller than its header".into()));
            }
        }
        if self.slice_size.is_some_and(|s| s < crate::slicer::OTHER_SLICE_HEADER_LEN + 2) {
            return Err(Error::Range("slice size smaller than its header".into()));
        }
        if self.iteration_count == 0 {
            return Err(Error::Range("KDF iteration count must be positive".into()));
        }
        Ok(())
    }
}

/// Options of a backup.
pub struct CreateOptions {
    pub output: OutputOptions,
    /// File-name selection; never applied to directories.
    pub selection: Box<dyn Mask>,
    /// Full-path subtree filter.
    pub subtree: Box<dyn Mask>,
    /// Which EA names to save.
    pub ea_mask: Box<dyn Mask>,
    /// Which files to compress.
    pub compression_mask: Box<dyn Mask>,
    /// Files smaller than this are stored uncompressed.
    pub min_compression_size: u64,
    pub what_to_check: WhatToCheck,
    /// Tolerance applied to mtime comparison against the reference.
    pub hourshift: u64,
    /// Detect zero runs of at least this many bytes; `None` disables.
    pub sparse_min_size: Option<u64>,
    /// Do not cross filesystem boundaries.
    pub same_fs: bool,
    /// Honor the nodump inode flag.
    pub honor_nodump: bool,
    /// Skip directories tagged `CACHEDIR.TAG`.
    pub cache_directory_tagging: bool,
    /// Record skipped directories as empty placeholders.
    pub empty_dir: bool,
    /// Entries carrying this EA name are excluded.
    pub exclude_by_ea: Option<String>,
    /// Retry budget when a file changes while being read.
    pub retry_count: u64,
    /// Byte budget across retries; 0 means unlimited.
    pub retry_byte_budget: u64,
    /// Capture ext-family FSA.
    pub fsa_scope_ext: bool,
    /// Command run around each saved file: `(path, "start"|"end")`.
    pub file_hook: Option<Box<dyn Fn(&std::path::Path, &str) -> Result<()>>>,
    /// Paths the hook applies to.
    pub hook_mask: Box<dyn Mask>,
    pub cancellation: Cancellation,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            output: OutputOptions::default(),
            selection: all(),
            subtree: all(),
            ea_mask: all(),
            compression_mask: all(),
            min_compression_size: 100,
            what_to_check: WhatToCheck::default(),
            hourshift: 0,
            sparse_min_size: Some(15),
            same_fs: false,
            honor_nodump: false,
            cache_directory_tagging: false,
            empty_dir: false,
            exclude_by_ea: None,
            retry_count: 3,
            retry_byte_budget: 0,
            fsa_scope_ext: true,
            file_hook: None,
            hook_mask: all(),
            cancellation: Cancellation::default(),
        }
    }
}

/// Options of a restore.
pub struct RestoreOptions {
    pub selection: Box<dyn Mask>,
    pub subtree: Box<dyn Mask>,
    pub ea_mask: Box<dyn Mask>,
    pub overwriting: Policy,
    pub what_to_check: WhatToCheck,
    /// Restore everything into the target directory without re-creating
    /// the tree.
    pub flat: bool,
    /// Do not create directories that have no restorable content.
    pub empty_dir_excluded: bool,
    pub dirty: DirtyBehavior,
    /// Only replay deletions.
    pub only_deleted: bool,
    /// Do not replay deletions.
    pub ignore_deleted: bool,
    pub fsa_scope_ext: bool,
    pub cancellation: Cancellation,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            selection: all(),
            subtree: all(),
            ea_mask: all(),
            overwriting: Policy::default(),
            what_to_check: WhatToCheck::default(),
            flat: false,
            empty_dir_excluded: false,
            dirty: DirtyBehavior::default(),
            only_deleted: false,
            ignore_deleted: false,
            fsa_scope_ext: true,
            cancellation: Cancellation::default(),
        }
    }
}

impl RestoreOptions {
    pub fn validate(&self) -> Result<()> {
        if self.only_deleted && self.ignore_deleted {
            return Err(Error::Libcall(
                "only_deleted and ignore_deleted are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

/// Options of a comparison against the live filesystem.
pub struct DiffOptions {
    pub selection: Box<dyn Mask>,
    pub subtree: Box<dyn Mask>,
    pub ea_mask: Box<dyn Mask>,
    pub what_to_check: WhatToCheck,
    pub hourshift: u64,
    pub fsa_scope_ext: bool,
    pub cancellation: Cancellation,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            selection: all(),
            subtree: all(),
            ea_mask: all(),
            what_to_check: WhatToCheck::default(),
            hourshift: 0,
            fsa_scope_ext: true,
            cancellation: Cancellation::default(),
        }
    }
}

/// Options of an archive integrity test.
pub struct TestOptions {
    pub selection: Box<dyn Mask>,
    pub subtree: Box<dyn Mask>,
    /// Metadata-only: do not read entry data.
    pub empty: bool,
    pub cancellation: Cancellation,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            selection: all(),
            subtree: all(),
            empty: false,
            cancellation: Cancellation::default(),
        }
    }
}

/// Options of a merge of one or two archives.
pub struct MergeOptions {
    pub output: OutputOptions,
    pub selection: Box<dyn Mask>,
    pub subtree: Box<dyn Mask>,
    pub overwriting: Policy,
    /// Produce the decremental catalogue: what must be restored to go from
    /// the newer state back to the older one, with tombstones for entries
    /// only in the newer archive.
    pub decremental: bool,
    /// Copy compressed data without transcoding.
    pub keep_compressed: bool,
    pub cancellation: Cancellation,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            output: OutputOptions::default(),
            selection: all(),
            subtree: all(),
            overwriting: Policy::default(),
            decremental: false,
            keep_compressed: false,
            cancellation: Cancellation::default(),
        }
    }
}

/// Options of a catalogue isolation.
pub struct IsolateOptions {
    pub output: OutputOptions,
    /// Recompute per-file delta signatures into the isolated catalogue.
    pub delta_signature: bool,
    pub cancellation: Cancellation,
}

impl Default for IsolateOptions {
    fn default() -> Self {
        Self {
            output: OutputOptions::default(),
            delta_signature: false,
            cancellation: Cancellation::default(),
        }
    }
}

/// Options of an archive repair.
pub struct RepairOptions {
    pub output: OutputOptions,
    pub cancellation: Cancellation,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            output: OutputOptions::default(),
            cancellation: Cancellation::default(),
        }
    }
}

/// Options of opening an archive for reading.
pub struct ReadOptions {
    pub passphrase: Option<SecuString>,
    /// Best-effort reading of damaged archives.
    pub lax: bool,
    /// Read sequentially through tape marks instead of the catalogue.
    pub sequential: bool,
    pub min_digits: usize,
    pub extension: String,
    pub pause_command: Option<String>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            passphrase: None,
            lax: false,
            sequential: false,
            min_digits: 1,
            extension: "dar".into(),
            pause_command: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_validation() {
        let mut opts = OutputOptions::default();
        assert!(opts.validate().is_ok());
        opts.cipher = Some(CipherAlgo::Aes256);
        assert!(opts.validate().is_err());
        opts.passphrase = Some(SecuString::from_str("pw"));
        assert!(opts.validate().is_ok());
        opts.cipher = Some(CipherAlgo::Scrambling);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn restore_validation() {
        let mut opts = RestoreOptions::default();
        assert!(opts.validate().is_ok());
        opts.only_deleted = true;
        opts.ignore_deleted = true;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn tiny_slices_rejected() {
        let mut opts = OutputOptions {
            slice_size: Some(10),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
        opts.slice_size = Some(1_000_000);
        assert!(opts.validate().is_ok());
    }
}
