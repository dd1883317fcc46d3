//! Error types for the LedgerFS engine.

use std::io;
use thiserror::Error;

/// Engine error type.
///
/// Every operation on the engine either commits (in-memory mutation plus a
/// log append) or fails with one of these variants, leaving in-memory state
/// at its pre-call value. The one documented exception is a directory rename
/// whose per-descendant records partially complete; the log reflects the
/// partial result faithfully.
#[derive(Debug, Error)]
pub enum Error {
    /// Path or extended attribute does not exist (`ENOENT`).
    #[error("not found")]
    NotFound,

    /// Namespace collision, `O_CREAT|O_EXCL` on an existing path, or an
    /// xattr create over an existing name (`EEXIST`).
    #[error("already exists")]
    AlreadyExists,

    /// Operation requires a non-directory but found a directory (`EISDIR`).
    #[error("is a directory")]
    IsDirectory,

    /// Operation requires a directory but found something else (`ENOTDIR`).
    #[error("not a directory")]
    NotADirectory,

    /// Directory removal or replacement of a non-empty directory
    /// (`ENOTEMPTY`).
    #[error("directory not empty")]
    NotEmpty,

    /// Caller-supplied buffer is smaller than the value (`ERANGE`).
    #[error("buffer too small")]
    Range,

    /// Extended attribute absent on get/remove, or replace of an absent
    /// name (`ENODATA`).
    #[error("no such attribute")]
    NoData,

    /// Hard links and non-zero rename flags are not supported
    /// (`EOPNOTSUPP`).
    #[error("operation not supported")]
    Unsupported,

    /// Malformed argument, bad option value, or wrong file kind for the
    /// operation (`EINVAL`).
    #[error("invalid argument")]
    InvalidArgument,

    /// `SEEK_DATA`/`SEEK_HOLE` found no matching region past the offset
    /// (`ENXIO`).
    #[error("no matching region past offset")]
    OffsetOutOfRange,

    /// Underlying host I/O failure; the host errno passes through when one
    /// is available, `EIO` otherwise.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// POSIX errno for this error, as re-exported to the filesystem adapter.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::AlreadyExists => libc::EEXIST,
            Error::IsDirectory => libc::EISDIR,
            Error::NotADirectory => libc::ENOTDIR,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::Range => libc::ERANGE,
            Error::NoData => libc::ENODATA,
            Error::Unsupported => libc::EOPNOTSUPP,
            Error::InvalidArgument => libc::EINVAL,
            Error::OffsetOutOfRange => libc::ENXIO,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Engine result type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::NotFound.errno(), libc::ENOENT);
        assert_eq!(Error::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(Error::Unsupported.errno(), libc::EOPNOTSUPP);
    }

    #[test]
    fn io_errno_passthrough() {
        let err = Error::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.errno(), libc::ENOSPC);

        let err = Error::Io(io::Error::new(io::ErrorKind::Other, "no errno"));
        assert_eq!(err.errno(), libc::EIO);
    }
}
