//! LedgerFS Core - the persistence engine for a user-space, append-only
//! filesystem.
//!
//! All on-disk state lives in exactly two growing files inside a backing
//! directory: a data segment holding raw file content and a metadata log of
//! framed, checksummed records. Opening the engine replays the log to
//! rebuild the namespace in memory; every mutation afterwards appends to
//! the log, so the record sequence is the authoritative history. The crate
//! is intended to serve as the writable upper layer of an overlay
//! filesystem, with a FUSE adapter available behind the `fuse` feature.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod engine;
pub mod error;
pub mod handle;
pub mod inode;
pub mod record;
pub mod segment;

#[cfg(feature = "fuse")]
pub mod fuse;

pub use engine::{Engine, EngineOptions, FsStats, InodeInfo, TimeSpec, DATA_FILENAME, META_FILENAME};
pub use error::{Error, Result};
pub use handle::FileHandle;

#[cfg(feature = "fuse")]
pub use fuse::LedgerFs;

/// Default per-handle write buffer capacity (4 MiB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Minimum write buffer capacity and minimum flush granularity (4 KiB).
/// Option values below this are rejected.
pub const MIN_WRITE_BUFFER_SIZE: usize = 4 * 1024;
