//! Error types for link store operations.

use std::io;
use std::path::PathBuf;

/// Structural failures that abort a single invocation.
///
/// Benign conditions (no tmux server, unknown active client, stale entries)
/// are reported through outcome types instead and never show up here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot encode device path {path:?}: {reason}")]
    InvalidDevicePath { path: PathBuf, reason: &'static str },

    #[error("{} is owned by uid {found}, expected uid {expected}", path.display())]
    OwnershipMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("store is a symlink, refusing to use {}", path.display())]
    SymlinkedStore { path: PathBuf },

    #[error("timed out waiting for lock {} held by pid {holder}", path.display())]
    LockTimeout { path: PathBuf, holder: u32 },

    #[error("cannot quote {} in a hook command", path.display())]
    UnquotablePath { path: PathBuf },

    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            context,
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
