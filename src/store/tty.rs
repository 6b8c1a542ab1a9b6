//! First-level map: terminal device -> authentication socket.

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::{list_names, owned_by, read_link_opt, replace_symlink};
use crate::codec::DeviceCodec;
use crate::error::Result;
use crate::lock::LockGuard;

/// View over the `ttys` directory
#[derive(Debug, Clone, Copy)]
pub struct TtyLinks<'a> {
    dir: &'a Path,
    codec: &'a DeviceCodec,
    uid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The device now links to the socket
    Published { link: PathBuf, socket: PathBuf },
    /// Nothing usable to publish; the store was left as is
    Suppressed(SuppressReason),
    /// Not attached to a terminal
    NoTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    NoSocket,
    /// A relative socket path would dangle once linked from the store
    NotAbsolute,
    SocketNotOwned,
}

/// One entry of the tty directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyLinkEntry {
    pub name: String,
    pub link: PathBuf,
    pub device: PathBuf,
    pub socket: Option<PathBuf>,
}

impl<'a> TtyLinks<'a> {
    pub(crate) fn new(dir: &'a Path, codec: &'a DeviceCodec, uid: u32) -> Self {
        Self { dir, codec, uid }
    }

    /// Path of the link for `device`. Does not touch the disk.
    pub fn path_for(&self, device: &Path) -> Result<PathBuf> {
        Ok(self.dir.join(self.codec.encode(device)?))
    }

    /// Point the link for `device` at `socket`.
    ///
    /// Runs unattended at shell startup, so an absent socket or one owned
    /// by somebody else is skipped instead of reported as an error.
    pub async fn publish(
        &self,
        guard: &LockGuard,
        device: &Path,
        socket: Option<&Path>,
    ) -> Result<PublishOutcome> {
        let link = self.path_for(device)?;

        let socket = match socket {
            Some(socket) if !socket.as_os_str().is_empty() => socket,
            _ => {
                log::debug!("No authentication socket to publish for {}", device.display());
                return Ok(PublishOutcome::Suppressed(SuppressReason::NoSocket));
            }
        };
        if !socket.is_absolute() {
            log::info!("Not publishing relative socket path {}", socket.display());
            return Ok(PublishOutcome::Suppressed(SuppressReason::NotAbsolute));
        }
        if !owned_by(socket, self.uid).await {
            log::info!(
                "Not publishing {}: missing or not owned by uid {}",
                socket.display(),
                self.uid
            );
            return Ok(PublishOutcome::Suppressed(SuppressReason::SocketNotOwned));
        }

        replace_symlink(guard, socket, &link).await?;
        log::info!("Linked {} -> {}", link.display(), socket.display());
        Ok(PublishOutcome::Published {
            link,
            socket: socket.to_path_buf(),
        })
    }

    pub async fn entries(&self) -> Result<Vec<TtyLinkEntry>> {
        let mut entries = Vec::new();
        for name in list_names(self.dir).await? {
            let link = self.dir.join(&name);
            entries.push(TtyLinkEntry {
                device: self.codec.decode(&name),
                socket: read_link_opt(&link).await?,
                link,
                name,
            });
        }
        Ok(entries)
    }

    pub fn dir(&self) -> &Path {
        self.dir
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn codec(&self) -> &DeviceCodec {
        self.codec
    }
}
