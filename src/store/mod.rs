//! The on-disk link store.
//!
//! ```text
//! <root>/ttys/<encoded-device>  -> authentication socket
//! <root>/servers/<server-pid>   -> <root>/ttys/<encoded-device>
//! <root>/lock                   (only while held)
//! ```
//!
//! Server links point at tty links rather than at sockets, so redirecting a
//! server to another client only rewrites one symlink while every shell
//! inside that server keeps using the same exported path.

pub mod gc;
pub mod server;
pub mod tty;

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use crate::codec::DeviceCodec;
use crate::error::{Error, Result};
use crate::guard::ensure_dir;
use crate::lock::{LockGuard, StoreLock};
use crate::process::ProcessTable;

pub use gc::GcReport;
pub use server::ServerLinks;
pub use tty::{PublishOutcome, SuppressReason, TtyLinks};

pub const TTYS_DIR: &str = "ttys";
pub const SERVERS_DIR: &str = "servers";

/// Paths making up one store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
    ttys: PathBuf,
    servers: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            ttys: root.join(TTYS_DIR),
            servers: root.join(SERVERS_DIR),
            root,
        }
    }

    /// Default store root for `uid` inside the system temp directory
    pub fn default_root(uid: u32) -> PathBuf {
        std::env::temp_dir().join(format!("socklink-{uid}"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ttys_dir(&self) -> &Path {
        &self.ttys
    }

    pub fn servers_dir(&self) -> &Path {
        &self.servers
    }
}

/// A per-user link store
#[derive(Debug)]
pub struct Store<P> {
    layout: StoreLayout,
    codec: DeviceCodec,
    uid: u32,
    lock: StoreLock,
    processes: P,
}

impl<P: ProcessTable> Store<P> {
    pub fn new(layout: StoreLayout, codec: DeviceCodec, uid: u32, pid: u32, processes: P) -> Self {
        let lock = StoreLock::new(layout.root(), uid, pid);
        Self {
            layout,
            codec,
            uid,
            lock,
            processes,
        }
    }

    /// Override the lock retry budget
    pub fn with_lock_retry(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.lock = self.lock.with_retry(attempts, retry_delay);
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn codec(&self) -> &DeviceCodec {
        &self.codec
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn processes(&self) -> &P {
        &self.processes
    }

    pub fn tty_links(&self) -> TtyLinks<'_> {
        TtyLinks::new(self.layout.ttys_dir(), &self.codec, self.uid)
    }

    pub fn server_links(&self) -> ServerLinks<'_> {
        ServerLinks::new(self.layout.servers_dir())
    }

    /// Prepare the store and take its lock.
    ///
    /// The root has to exist before the lock file can be created in it; the
    /// subdirectories are checked once the lock is held.
    pub async fn lock(&self) -> Result<LockGuard> {
        ensure_dir(self.layout.root(), self.uid).await?;
        let guard = self.lock.acquire(&self.processes).await?;
        ensure_dir(self.layout.ttys_dir(), self.uid).await?;
        ensure_dir(self.layout.servers_dir(), self.uid).await?;
        Ok(guard)
    }

    /// Prune stale entries. Requires the store lock.
    pub async fn collect_garbage(&self, guard: &LockGuard) -> GcReport {
        let report = GcReport {
            tty_links: gc::collect_tty_links(self, guard).await,
            server_links: gc::collect_server_links(self, guard).await,
            lock_candidates: gc::sweep_lock_candidates(self, guard).await,
        };
        if report.total() > 0 {
            log::info!("Garbage collection removed {}", report);
        } else {
            log::debug!("Garbage collection found nothing to remove");
        }
        report
    }
}

/// True if `path` (following symlinks) exists and belongs to `uid`
pub(crate) async fn owned_by(path: &Path, uid: u32) -> bool {
    match fs::metadata(path).await {
        Ok(meta) => meta.uid() == uid,
        Err(_) => false,
    }
}

/// Read a symlink's target, `None` if there is no link
pub(crate) async fn read_link_opt(path: &Path) -> Result<Option<PathBuf>> {
    match fs::read_link(path).await {
        Ok(target) => Ok(Some(target)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        // Something that is not a symlink sits at this path
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(None),
        Err(e) => Err(Error::io("failed to read link", path, e)),
    }
}

/// Remove an entry, treating an already missing entry as success
pub(crate) async fn remove_entry(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io("failed to remove", path, e)),
    }
}

/// Replace whatever is at `link` with a symlink to `target`.
///
/// There is no portable atomic symlink replacement, so the link is briefly
/// absent between the removal and the creation. Callers hold the lock,
/// which keeps other writers out of that window.
pub(crate) async fn replace_symlink(_guard: &LockGuard, target: &Path, link: &Path) -> Result<()> {
    remove_entry(link).await?;
    fs::symlink(target, link)
        .await
        .map_err(|e| Error::io("failed to create link", link, e))
}

/// List the names in a store directory; a missing directory is empty
pub(crate) async fn list_names(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io("failed to list", dir, e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io("failed to list", dir, e))?
    {
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => {
                log::warn!("Ignoring non UTF-8 entry {:?} in {}", name, dir.display())
            }
        }
    }
    names.sort();
    Ok(names)
}
