//! Store-wide mutual exclusion between independent invocations.
//!
//! The lock is a file holding the holder's pid. It is published with a hard
//! link from a private temp file so that it never exists without its
//! content, and it is removed by [`LockGuard`] on every exit path,
//! including cancellation of the future holding it.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};
use crate::process::ProcessTable;

pub const LOCK_FILE_NAME: &str = "lock";
pub const LOCK_ATTEMPTS: u32 = 10;
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The lock of one store root
#[derive(Debug, Clone)]
pub struct StoreLock {
    path: PathBuf,
    uid: u32,
    pid: u32,
    attempts: u32,
    retry_delay: Duration,
}

/// Proof of holding the store lock; releases it when dropped
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

#[derive(Debug)]
struct Holder {
    pid: Option<u32>,
    ino: u64,
}

impl StoreLock {
    pub fn new(root: &Path, uid: u32, pid: u32) -> Self {
        Self {
            path: root.join(LOCK_FILE_NAME),
            uid,
            pid,
            attempts: LOCK_ATTEMPTS,
            retry_delay: LOCK_RETRY_DELAY,
        }
    }

    /// Override the retry budget
    pub fn with_retry(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, reclaiming it from stale holders.
    ///
    /// A holder is stale when its pid is gone, belongs to another uid, or
    /// cannot be read from the lock file. Stale locks are removed and
    /// acquisition is retried at once; those retries count against the same
    /// attempt budget. Fails with [`Error::LockTimeout`] when a live holder
    /// keeps the lock for the whole budget.
    pub async fn acquire(&self, processes: &impl ProcessTable) -> Result<LockGuard> {
        let mut last_holder = 0;

        for attempt in 1..=self.attempts {
            if self.try_create().await? {
                log::debug!("Acquired lock {} on attempt {}", self.path.display(), attempt);
                return Ok(LockGuard {
                    path: self.path.clone(),
                });
            }

            let holder = match self.inspect_holder().await? {
                Some(holder) => holder,
                // Released between our attempt and the inspection
                None => continue,
            };

            let live = match holder.pid {
                Some(pid) => processes.owner(pid).await == Some(self.uid),
                None => false,
            };
            if !live {
                log::info!(
                    "Removing stale lock {} (holder pid {:?})",
                    self.path.display(),
                    holder.pid
                );
                self.remove_if_unchanged(holder.ino).await?;
                continue;
            }

            last_holder = holder.pid.unwrap_or_default();
            log::debug!(
                "Lock {} held by pid {} (attempt {}/{})",
                self.path.display(),
                last_holder,
                attempt,
                self.attempts
            );
            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(Error::LockTimeout {
            path: self.path.clone(),
            holder: last_holder,
        })
    }

    /// Run `body` while holding the lock
    pub async fn with_lock<T, F>(&self, processes: &impl ProcessTable, body: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let _guard = self.acquire(processes).await?;
        body.await
    }

    /// Returns true if we created the lock, false if somebody holds it
    async fn try_create(&self) -> Result<bool> {
        let temp = self.path.with_file_name(format!(
            "{}.{}.{}",
            LOCK_FILE_NAME,
            self.pid,
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&temp, format!("{}\n", self.pid))
            .await
            .map_err(|e| Error::io("failed to write lock candidate", &temp, e))?;

        let linked = fs::hard_link(&temp, &self.path).await;
        if let Err(e) = fs::remove_file(&temp).await {
            log::warn!("Failed to remove {}: {}", temp.display(), e);
        }

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::io("failed to create lock", &self.path, e)),
        }
    }

    async fn inspect_holder(&self) -> Result<Option<Holder>> {
        let mut file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io("failed to open lock", &self.path, e)),
        };
        let ino = file
            .metadata()
            .await
            .map_err(|e| Error::io("failed to stat lock", &self.path, e))?
            .ino();
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .await
            .map_err(|e| Error::io("failed to read lock", &self.path, e))?;

        Ok(Some(Holder {
            pid: parse_holder(&String::from_utf8_lossy(&content)),
            ino,
        }))
    }

    /// Remove the lock only if it is still the file we judged stale.
    /// A holder that replaced it in the meantime keeps its lock.
    async fn remove_if_unchanged(&self, ino: u64) -> Result<()> {
        match fs::symlink_metadata(&self.path).await {
            Ok(meta) if meta.ino() == ino => match fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::io("failed to remove stale lock", &self.path, e)),
            },
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io("failed to stat lock", &self.path, e)),
        }
    }
}

/// Parse a lock candidate file name (`lock.<pid>.<n>`) into its pid
pub(crate) fn parse_temp_name(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(LOCK_FILE_NAME)?.strip_prefix('.')?;
    let (pid, counter) = rest.split_once('.')?;
    counter.parse::<u64>().ok()?;
    pid.parse().ok()
}

fn parse_holder(content: &str) -> Option<u32> {
    match content.trim().parse() {
        Ok(0) | Err(_) => None,
        Ok(pid) => Some(pid),
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        log::debug!("Releasing lock {}", self.path.display());
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to release lock {}: {}", self.path.display(), e);
            }
        }
    }
}
