//! Second-level map: tmux server -> tty link.

use std::path::{Path, PathBuf};

use super::{list_names, read_link_opt, replace_symlink};
use crate::ambient::ServerId;
use crate::error::Result;
use crate::lock::LockGuard;

/// View over the `servers` directory
#[derive(Debug, Clone, Copy)]
pub struct ServerLinks<'a> {
    dir: &'a Path,
}

/// One entry of the servers directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLinkEntry {
    pub name: String,
    pub link: PathBuf,
    /// `None` when the name is not a pid
    pub server: Option<ServerId>,
    /// The tty link this server follows
    pub target: Option<PathBuf>,
}

impl<'a> ServerLinks<'a> {
    pub(crate) fn new(dir: &'a Path) -> Self {
        Self { dir }
    }

    /// Path of the link for `server`, `None` when there is no server to
    /// track. Callers must treat `None` as "leave SSH_AUTH_SOCK alone".
    pub fn path_for(&self, server: Option<ServerId>) -> Option<PathBuf> {
        server.map(|server| self.dir.join(server.to_string()))
    }

    /// Current target of the server link, without following it
    pub async fn read(&self, server: ServerId) -> Result<Option<PathBuf>> {
        read_link_opt(&self.dir.join(server.to_string())).await
    }

    /// Point `server` at the tty link `tty_link`
    pub async fn replace(&self, guard: &LockGuard, server: ServerId, tty_link: &Path) -> Result<PathBuf> {
        let link = self.dir.join(server.to_string());
        replace_symlink(guard, tty_link, &link).await?;
        log::info!("Linked server {} -> {}", server, tty_link.display());
        Ok(link)
    }

    pub async fn entries(&self) -> Result<Vec<ServerLinkEntry>> {
        let mut entries = Vec::new();
        for name in list_names(self.dir).await? {
            let link = self.dir.join(&name);
            entries.push(ServerLinkEntry {
                server: name.parse().ok().filter(|pid| *pid != 0).map(ServerId),
                target: read_link_opt(&link).await?,
                link,
                name,
            });
        }
        Ok(entries)
    }

    pub fn dir(&self) -> &Path {
        self.dir
    }
}
