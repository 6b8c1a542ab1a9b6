//! Creation and validation of the store's private directories.

use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use tokio::fs;

use crate::error::{Error, Result};

/// Permission bits every store directory must carry
pub const DIRECTORY_MODE: u32 = 0o700;

/// Make sure `dir` exists, belongs to `uid` and has mode 0700.
///
/// A directory owned by somebody else is never adopted. A directory of ours
/// whose mode has drifted (umask, manual chmod) is corrected.
pub async fn ensure_dir(dir: &Path, uid: u32) -> Result<()> {
    match fs::DirBuilder::new().mode(DIRECTORY_MODE).create(dir).await {
        Ok(()) => {
            log::debug!("Created store directory {}", dir.display());
        }
        // Possibly created by a concurrent invocation; validated below
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(Error::io("failed to create directory", dir, e)),
    }

    let meta = fs::symlink_metadata(dir)
        .await
        .map_err(|e| Error::io("failed to stat", dir, e))?;

    if meta.file_type().is_symlink() {
        return Err(Error::SymlinkedStore {
            path: dir.to_path_buf(),
        });
    }
    if meta.uid() != uid {
        return Err(Error::OwnershipMismatch {
            path: dir.to_path_buf(),
            expected: uid,
            found: meta.uid(),
        });
    }
    if !meta.is_dir() {
        return Err(Error::io(
            "not a directory:",
            dir,
            io::Error::new(io::ErrorKind::AlreadyExists, "exists but is not a directory"),
        ));
    }

    let mode = meta.permissions().mode() & 0o7777;
    if mode != DIRECTORY_MODE {
        log::info!(
            "Correcting mode of {} from {:o} to {:o}",
            dir.display(),
            mode,
            DIRECTORY_MODE
        );
        fs::set_permissions(dir, std::fs::Permissions::from_mode(DIRECTORY_MODE))
            .await
            .map_err(|e| Error::io("failed to set permissions on", dir, e))?;
    }

    Ok(())
}
