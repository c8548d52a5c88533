//! Error type shared by the whole engine.
//!
//! Errors are classified by kind because the filter loops treat them
//! differently: most per-entry failures are counted in the statistics and the
//! operation carries on, while a few kinds (internal inconsistency, user
//! abort, cancellation) stop it.

use std::panic::Location;
use std::{fmt, io};

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure kinds known to the engine.
#[derive(Debug)]
pub enum Error {
    /// Internal inconsistency. Always aborts the operation.
    Bug { file: &'static str, line: u32 },
    /// Invalid argument or malformed input, recoverable at the caller.
    Range(String),
    /// I/O failure on the underlying storage.
    Hardware { context: String, source: io::Error },
    /// Archive content failed an integrity check (CRC, missing marker).
    Data(String),
    /// Filesystem-level failure: not found, already exists, permission.
    System { context: String, source: io::Error },
    /// The requested algorithm or capability is not compiled in this build.
    Feature(&'static str),
    /// A user-provided command (between-slice hook) exited with an error.
    Script(String),
    /// The user answered "no" to a confirmation request.
    UserAbort(String),
    /// Cooperative cancellation was requested for this operation.
    Cancelled { deferred: bool },
    /// A value does not fit the 64-bit arithmetic of this build.
    Limit(String),
    /// The library was called in a way its contract forbids.
    Libcall(String),
}

impl Error {
    /// Builds a [`Error::Bug`] pointing at the caller.
    #[track_caller]
    pub fn bug() -> Self {
        let loc = Location::caller();
        Self::Bug {
            file: loc.file(),
            line: loc.line(),
        }
    }

    /// Wraps an I/O error with the path or action that triggered it.
    pub fn system(context: impl Into<String>, source: io::Error) -> Self {
        let context = context.into();
        match source.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::AlreadyExists
            | io::ErrorKind::PermissionDenied => Self::System { context, source },
            _ => Self::Hardware { context, source },
        }
    }

    /// Whether this error must abort the whole operation instead of being
    /// counted against the current entry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Bug { .. } | Self::UserAbort(_) | Self::Cancelled { .. } | Self::Libcall(_)
        )
    }

    /// Process exit code suggested for command-line wrappers.
    ///
    /// Callers that complete with per-entry failures only (a non-zero
    /// `errored` counter) conventionally exit with 5.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Range(_) | Self::Libcall(_) => 2,
            Self::Data(_) | Self::Feature(_) => 3,
            Self::Hardware { .. } | Self::System { .. } | Self::Script(_) => 4,
            Self::UserAbort(_) | Self::Cancelled { .. } => 6,
            Self::Bug { .. } | Self::Limit(_) => 11,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bug { file, line } => {
                write!(f, "internal error at {file}:{line}, please report")
            }
            Self::Range(msg) => write!(f, "{msg}"),
            Self::Hardware { context, source } => write!(f, "{context}: {source}"),
            Self::Data(msg) => write!(f, "archive data corruption: {msg}"),
            Self::System { context, source } => write!(f, "{context}: {source}"),
            Self::Feature(what) => write!(f, "{what}: feature not available in this build"),
            Self::Script(msg) => write!(f, "user command failed: {msg}"),
            Self::UserAbort(msg) => write!(f, "aborted on user request: {msg}"),
            Self::Cancelled { deferred: true } => write!(f, "operation cancelled (deferred)"),
            Self::Cancelled { deferred: false } => write!(f, "operation cancelled"),
            Self::Limit(msg) => write!(f, "value overflows 64 bit arithmetic: {msg}"),
            Self::Libcall(msg) => write!(f, "invalid use of the library: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Hardware { source, .. } | Self::System { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::system("i/o error", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_classification() {
        let e = Error::system("open", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(e, Error::System { .. }));
        let e = Error::system("read", io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(e, Error::Hardware { .. }));
    }

    #[test]
    fn fatality() {
        assert!(Error::bug().is_fatal());
        assert!(Error::Cancelled { deferred: true }.is_fatal());
        assert!(!Error::Data(String::new()).is_fatal());
        assert!(!Error::Feature("x").is_fatal());
    }
}
