//! Pruning of entries whose referents are gone or belong to someone else.
//!
//! Every pass takes a [`LockGuard`]: collecting without the lock could
//! delete a link that another invocation is in the middle of creating.
//! Removal failures are logged and skipped; reads stay correct without GC,
//! it only keeps the directories from growing forever.

use std::fmt;

use super::{list_names, owned_by, remove_entry, Store};
use crate::lock::{self, LockGuard};
use crate::process::ProcessTable;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub tty_links: usize,
    pub server_links: usize,
    pub lock_candidates: usize,
}

impl GcReport {
    pub fn total(&self) -> usize {
        self.tty_links + self.server_links + self.lock_candidates
    }
}

impl fmt::Display for GcReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tty link(s), {} server link(s), {} lock candidate(s)",
            self.tty_links, self.server_links, self.lock_candidates
        )
    }
}

/// Remove tty links whose device or socket is missing or not ours
pub async fn collect_tty_links<P: ProcessTable>(store: &Store<P>, _guard: &LockGuard) -> usize {
    let links = store.tty_links();
    let entries = match links.entries().await {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Skipping tty link collection: {}", e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries {
        let reason = if !owned_by(&entry.device, store.uid()).await {
            "device missing or not owned"
        } else if !owned_by(&entry.link, store.uid()).await {
            // Follows the link, so this covers both a vanished and a
            // reassigned socket
            "socket missing or not owned"
        } else {
            continue;
        };

        match remove_entry(&entry.link).await {
            Ok(()) => {
                log::debug!("Removed tty link {} ({})", entry.name, reason);
                removed += 1;
            }
            Err(e) => log::warn!("Failed to collect tty link {}: {}", entry.name, e),
        }
    }
    removed
}

/// Remove server links whose tmux server is gone or not ours
pub async fn collect_server_links<P: ProcessTable>(store: &Store<P>, _guard: &LockGuard) -> usize {
    let entries = match store.server_links().entries().await {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Skipping server link collection: {}", e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries {
        let live = match entry.server {
            Some(server) => store.processes().owner(server.0).await == Some(store.uid()),
            None => false,
        };
        if live {
            continue;
        }

        match remove_entry(&entry.link).await {
            Ok(()) => {
                log::debug!("Removed server link {}", entry.name);
                removed += 1;
            }
            Err(e) => log::warn!("Failed to collect server link {}: {}", entry.name, e),
        }
    }
    removed
}

/// Remove lock candidate files left behind by crashed invocations
pub async fn sweep_lock_candidates<P: ProcessTable>(store: &Store<P>, _guard: &LockGuard) -> usize {
    let root = store.layout().root();
    let names = match list_names(root).await {
        Ok(names) => names,
        Err(e) => {
            log::warn!("Skipping lock candidate sweep: {}", e);
            return 0;
        }
    };

    let mut removed = 0;
    for name in names {
        let Some(pid) = lock::parse_temp_name(&name) else {
            continue;
        };
        if store.processes().owner(pid).await == Some(store.uid()) {
            continue;
        }
        match remove_entry(&root.join(&name)).await {
            Ok(()) => removed += 1,
            Err(e) => log::warn!("Failed to remove lock candidate {}: {}", name, e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::ambient::ServerId;
    use std::path::Path;

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_collect_tty_links() {
        let t = test_store();
        let live_device = t.device("pts/1");
        let closed_device = t.device("pts/2");
        let orphan_device = t.device("pts/3");
        let live_socket = t.socket("live.sock");
        let orphan_socket = t.socket("orphan.sock");

        let guard = t.store.lock().await.unwrap();
        let links = t.store.tty_links();
        for (device, socket) in [
            (&live_device, &live_socket),
            (&closed_device, &live_socket),
            (&orphan_device, &orphan_socket),
        ] {
            links.publish(&guard, device, Some(socket)).await.unwrap();
        }

        // Terminal closed, agent socket gone
        std::fs::remove_file(&closed_device).unwrap();
        std::fs::remove_file(&orphan_socket).unwrap();

        let removed = collect_tty_links(&t.store, &guard).await;
        assert_eq!(removed, 2);

        let remaining = links.entries().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].device, live_device);
    }

    #[tokio::test]
    async fn test_collect_tty_links_foreign_device() {
        if uid() == 0 {
            // root owns /dev/null, so it would count as ours
            return;
        }
        let t = test_store();
        let socket = t.socket("agent.sock");

        let guard = t.store.lock().await.unwrap();
        // Decodes to /dev/null, which belongs to root
        std::os::unix::fs::symlink(&socket, t.store.layout().ttys_dir().join("dev+null")).unwrap();

        assert_eq!(collect_tty_links(&t.store, &guard).await, 1);
        assert!(names(t.store.layout().ttys_dir()).is_empty());
    }

    #[tokio::test]
    async fn test_collect_server_links() {
        let t = test_store();
        t.processes.insert(4242, uid());
        t.processes.insert(4343, uid() + 1);

        let guard = t.store.lock().await.unwrap();
        let servers_dir = t.store.layout().servers_dir();
        let target = t.store.layout().ttys_dir().join("dev+pts+1");
        for name in ["4242", "4343", "999999", "not-a-pid", "0"] {
            std::os::unix::fs::symlink(&target, servers_dir.join(name)).unwrap();
        }

        let removed = collect_server_links(&t.store, &guard).await;
        assert_eq!(removed, 4);
        assert_eq!(names(servers_dir), vec!["4242".to_string()]);

        // Server exits later
        t.processes.remove(4242);
        assert_eq!(collect_server_links(&t.store, &guard).await, 1);
        assert_eq!(
            t.store.server_links().read(ServerId(4242)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_sweep_lock_candidates() {
        let t = test_store();
        let guard = t.store.lock().await.unwrap();
        let root = t.store.layout().root();
        let ours = format!("lock.{}.5", std::process::id());
        std::fs::write(root.join("lock.999999.0"), "999999\n").unwrap();
        std::fs::write(root.join(&ours), "x\n").unwrap();

        assert_eq!(sweep_lock_candidates(&t.store, &guard).await, 1);
        assert!(!root.join("lock.999999.0").exists());
        assert!(root.join(&ours).exists());
        // The held lock itself is not a candidate
        assert!(guard.path().exists());
    }

    #[tokio::test]
    async fn test_collect_garbage_report() {
        let t = test_store();
        let guard = t.store.lock().await.unwrap();
        let target = t.store.layout().ttys_dir().join("dev+pts+1");
        std::os::unix::fs::symlink(&target, t.store.layout().servers_dir().join("999999")).unwrap();
        std::os::unix::fs::symlink(t.temp_dir.path().join("gone.sock"), &target).unwrap();

        let report = t.store.collect_garbage(&guard).await;
        assert_eq!(
            report,
            GcReport {
                tty_links: 1,
                server_links: 1,
                lock_candidates: 0
            }
        );
        assert_eq!(report.total(), 2);
    }
}
