//! `coffre` is a disk-archive engine: it turns a filesystem subtree into a
//! self-describing, optionally sliced, compressed and encrypted archive,
//! and back. The crate provides the engine only; command-line front ends,
//! configuration loaders and listing formatters are expected to live on
//! top of the [`archive::Archive`] type and the option records in
//! [`options`].
//!
//! The moving parts:
//! - a stack of bidirectional byte-stream layers ([`layer`], [`stack`]):
//!   slice files at the bottom ([`slicer`], [`entrepot`]), block
//!   encryption ([`cipher`]), buffering ([`cache`]), tape-mark framing
//!   ([`escape`]) and per-entry compression ([`compressor`]);
//! - the catalogue ([`catalogue`], [`entry`]): the inventory of archived
//!   entries, with hard-link sharing, EA/FSA blocks and tombstones;
//! - the operation drivers ([`ops`], reachable through
//!   [`archive::Archive`]): backup, restore, diff, test, merge, isolate
//!   and repair, steered by masks ([`mask`]) and overwriting policies
//!   ([`overwrite`]).

pub mod archive;
pub mod cache;
pub mod catalogue;
pub mod cipher;
pub mod compressor;
pub mod crc;
pub mod ea;
pub mod entrepot;
pub mod entry;
pub mod error;
pub mod escape;
pub mod fs_io;
pub mod fsa;
pub mod hasher;
pub mod header;
pub mod infinint;
pub mod interaction;
pub mod label;
pub mod layer;
pub mod mask;
pub mod ops;
pub mod options;
pub mod overwrite;
pub mod secure;
pub mod slicer;
pub mod stack;
pub mod statistics;
pub mod terminator;

pub use archive::{Archive, ArchiveSummary};
pub use catalogue::Catalogue;
pub use entrepot::{Entrepot, LocalEntrepot};
pub use error::{Error, Result};
pub use interaction::{SilentInteraction, StdioInteraction, UserInteraction};
pub use label::Label;
pub use options::{
    CreateOptions, DiffOptions, IsolateOptions, MergeOptions, ReadOptions, RepairOptions,
    RestoreOptions, TestOptions,
};
pub use secure::SecuString;
pub use statistics::Statistics;
