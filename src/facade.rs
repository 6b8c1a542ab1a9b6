//! The operations invoked from shell and tmux hooks.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::ambient::Ambient;
use crate::error::Result;
use crate::process::ProcessTable;
use crate::store::{owned_by, PublishOutcome, Store};
use crate::tmux::ActiveClient;

/// Which terminal a server should follow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRequest {
    Explicit(PathBuf),
    /// Ask tmux for its active client
    Active,
}

impl DeviceRequest {
    /// `-` and the empty string (an unexpanded tmux format) mean "active"
    pub fn parse(arg: &str) -> Self {
        match arg {
            "" | "-" => DeviceRequest::Active,
            device => DeviceRequest::Explicit(PathBuf::from(device)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated { link: PathBuf, target: PathBuf },
    /// Already pointing at the requested tty; nothing was locked or written
    Unchanged { link: PathBuf },
    /// Not running under a tmux server
    ServerUnavailable,
    /// tmux could not name an active client
    ClientUnknown,
}

/// Read-only view of the store for inspection
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub root: PathBuf,
    pub tty_links: Vec<TtyLinkInfo>,
    pub server_links: Vec<ServerLinkInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TtyLinkInfo {
    pub device: PathBuf,
    pub socket: Option<PathBuf>,
    /// Device and socket both exist and are ours
    pub live: bool,
    pub modified: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerLinkInfo {
    pub name: String,
    pub pid: Option<u32>,
    pub device: Option<PathBuf>,
    pub socket: Option<PathBuf>,
    /// The server process exists and is ours
    pub live: bool,
    pub modified: Option<DateTime<Local>>,
}

pub struct Socklink<P, A> {
    store: Store<P>,
    active: A,
    ambient: Ambient,
}

impl<P: ProcessTable, A: ActiveClient> Socklink<P, A> {
    pub fn new(store: Store<P>, active: A, ambient: Ambient) -> Self {
        Self {
            store,
            active,
            ambient,
        }
    }

    pub fn store(&self) -> &Store<P> {
        &self.store
    }

    pub fn ambient(&self) -> &Ambient {
        &self.ambient
    }

    /// Publish this login's authentication socket under its terminal.
    ///
    /// Garbage collection runs in the same critical section, before the
    /// new link is written.
    pub async fn publish_tty_link(&self) -> Result<PublishOutcome> {
        let Some(device) = self.ambient.tty.as_deref() else {
            log::debug!("Not attached to a terminal, nothing to publish");
            return Ok(PublishOutcome::NoTerminal);
        };
        // Fail on a bad device before creating anything
        self.store.tty_links().path_for(device)?;

        let guard = self.store.lock().await?;
        self.store.collect_garbage(&guard).await;
        self.store
            .tty_links()
            .publish(&guard, device, self.ambient.auth_sock.as_deref())
            .await
    }

    /// Point the current server's link at the tty link of `request`.
    ///
    /// Fires on every client activity hook, so the common case of an
    /// unchanged target returns without locking or writing.
    pub async fn update_server_link(&self, request: DeviceRequest) -> Result<UpdateOutcome> {
        let Some(server) = self.ambient.server else {
            log::info!("Not running under a tmux server, leaving server links alone");
            return Ok(UpdateOutcome::ServerUnavailable);
        };

        let device = match request {
            DeviceRequest::Explicit(device) => device,
            DeviceRequest::Active => match self.active.active_client().await {
                Some(device) => device,
                None => {
                    log::info!("Active client unknown, leaving server {} alone", server);
                    return Ok(UpdateOutcome::ClientUnknown);
                }
            },
        };

        let target = self.store.tty_links().path_for(&device)?;
        let servers = self.store.server_links();
        if servers.read(server).await?.as_deref() == Some(target.as_path()) {
            log::debug!("Server {} already follows {}", server, device.display());
            let link = servers.dir().join(server.to_string());
            return Ok(UpdateOutcome::Unchanged { link });
        }

        let guard = self.store.lock().await?;
        self.store.collect_garbage(&guard).await;
        let link = servers.replace(&guard, server, &target).await?;
        Ok(UpdateOutcome::Updated { link, target })
    }

    /// Path to export as `SSH_AUTH_SOCK` inside the current server.
    ///
    /// The path is usable as a socket address as is; the OS follows the
    /// server link and then the tty link.
    pub fn read_server_link(&self) -> Option<PathBuf> {
        self.store.server_links().path_for(self.ambient.server)
    }

    /// Describe every link in the store
    pub async fn snapshot(&self) -> Result<StoreSnapshot> {
        let uid = self.store.uid();
        let ttys = self.store.tty_links();

        let mut tty_links = Vec::new();
        for entry in ttys.entries().await? {
            let live = owned_by(&entry.device, uid).await && owned_by(&entry.link, uid).await;
            tty_links.push(TtyLinkInfo {
                modified: modified(&entry.link).await,
                device: entry.device,
                socket: entry.socket,
                live,
            });
        }

        let mut server_links = Vec::new();
        for entry in self.store.server_links().entries().await? {
            let live = match entry.server {
                Some(server) => self.store.processes().owner(server.0).await == Some(uid),
                None => false,
            };
            let device = entry
                .target
                .as_deref()
                .and_then(Path::file_name)
                .and_then(|name| name.to_str())
                .map(|name| ttys.codec().decode(name));
            let socket = match &entry.target {
                Some(target) => tokio::fs::read_link(target).await.ok(),
                None => None,
            };
            server_links.push(ServerLinkInfo {
                modified: modified(&entry.link).await,
                name: entry.name,
                pid: entry.server.map(|s| s.0),
                device,
                socket,
                live,
            });
        }

        Ok(StoreSnapshot {
            root: self.store.layout().root().to_path_buf(),
            tty_links,
            server_links,
        })
    }
}

async fn modified(link: &Path) -> Option<DateTime<Local>> {
    let meta = tokio::fs::symlink_metadata(link).await.ok()?;
    meta.modified().ok().map(DateTime::<Local>::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambient::ServerId;
    use crate::codec::DeviceCodec;
    use crate::error::Error;
    use crate::process::fake::FakeProcessTable;
    use crate::store::{StoreLayout, SuppressReason};
    use crate::tmux::fake::FixedActiveClient;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const SERVER: ServerId = ServerId(7777);

    struct Fixture {
        temp_dir: TempDir,
        processes: FakeProcessTable,
        root: PathBuf,
    }

    fn uid() -> u32 {
        nix::unistd::getuid().as_raw()
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path().join("socklink");
            let processes =
                FakeProcessTable::with(&[(std::process::id(), uid()), (SERVER.0, uid())]);
            Self {
                temp_dir,
                processes,
                root,
            }
        }

        fn ambient(
            &self,
            tty: Option<&str>,
            auth_sock: Option<&Path>,
            server: Option<ServerId>,
        ) -> Ambient {
            Ambient {
                uid: uid(),
                pid: std::process::id(),
                tty: tty.map(PathBuf::from),
                auth_sock: auth_sock.map(Path::to_path_buf),
                server,
            }
        }

        fn socklink(
            &self,
            ambient: Ambient,
            active: Option<&str>,
        ) -> Socklink<FakeProcessTable, FixedActiveClient> {
            let store = Store::new(
                StoreLayout::new(&self.root),
                DeviceCodec::default(),
                ambient.uid,
                ambient.pid,
                self.processes.clone(),
            )
            .with_lock_retry(5, Duration::from_millis(20));
            Socklink::new(store, FixedActiveClient(active.map(PathBuf::from)), ambient)
        }

        fn socket(&self, name: &str) -> PathBuf {
            let path = self.temp_dir.path().join(name);
            std::fs::File::create(&path).unwrap();
            path
        }

        fn mode(&self, path: &Path) -> u32 {
            std::fs::metadata(path).unwrap().permissions().mode() & 0o777
        }
    }

    #[tokio::test]
    async fn test_publish_initializes_store() {
        let f = Fixture::new();
        let socket = f.socket("agent.sock");
        let socklink = f.socklink(f.ambient(Some("/dev/pts/3"), Some(&socket), None), None);

        let outcome = socklink.publish_tty_link().await.unwrap();
        let link = f.root.join("ttys").join("dev+pts+3");
        assert_eq!(
            outcome,
            PublishOutcome::Published {
                link: link.clone(),
                socket: socket.clone()
            }
        );

        for dir in [f.root.clone(), f.root.join("ttys"), f.root.join("servers")] {
            assert_eq!(f.mode(&dir), 0o700, "{}", dir.display());
        }
        assert_eq!(std::fs::read_link(&link).unwrap(), socket);
        assert!(!f.root.join("lock").exists());
    }

    #[tokio::test]
    async fn test_publish_without_terminal_is_noop() {
        let f = Fixture::new();
        let socket = f.socket("agent.sock");
        let socklink = f.socklink(f.ambient(None, Some(&socket), None), None);

        assert_eq!(
            socklink.publish_tty_link().await.unwrap(),
            PublishOutcome::NoTerminal
        );
        assert!(!f.root.exists());
    }

    #[tokio::test]
    async fn test_publish_without_socket_still_collects() {
        let f = Fixture::new();
        let socket = f.socket("agent.sock");
        f.socklink(f.ambient(Some("/dev/pts/3"), Some(&socket), None), None)
            .publish_tty_link()
            .await
            .unwrap();
        std::fs::remove_file(&socket).unwrap();

        let socklink = f.socklink(f.ambient(Some("/dev/pts/4"), None, None), None);
        assert_eq!(
            socklink.publish_tty_link().await.unwrap(),
            PublishOutcome::Suppressed(SuppressReason::NoSocket)
        );
        // The link to the vanished socket was collected on the way
        assert_eq!(std::fs::read_dir(f.root.join("ttys")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_publish_invalid_device() {
        let f = Fixture::new();
        let socket = f.socket("agent.sock");
        let socklink = f.socklink(f.ambient(Some("/dev/pts/3 4"), Some(&socket), None), None);

        let err = socklink.publish_tty_link().await.unwrap_err();
        assert!(matches!(err, Error::InvalidDevicePath { .. }), "{err}");
        assert!(!f.root.exists());
    }

    #[tokio::test]
    async fn test_update_explicit_device() {
        let f = Fixture::new();
        let socklink = f.socklink(f.ambient(None, None, Some(SERVER)), None);

        let outcome = socklink
            .update_server_link(DeviceRequest::Explicit("/dev/pts/3".into()))
            .await
            .unwrap();
        let link = f.root.join("servers").join("7777");
        let target = f.root.join("ttys").join("dev+pts+3");
        assert_eq!(
            outcome,
            UpdateOutcome::Updated {
                link: link.clone(),
                target: target.clone()
            }
        );
        assert_eq!(std::fs::read_link(&link).unwrap(), target);
        assert_eq!(socklink.read_server_link(), Some(link));
    }

    #[tokio::test]
    async fn test_update_follows_active_client() {
        let f = Fixture::new();
        let socklink = f.socklink(f.ambient(None, None, Some(SERVER)), Some("/dev/pts/9"));

        socklink.update_server_link(DeviceRequest::Active).await.unwrap();
        assert_eq!(
            std::fs::read_link(f.root.join("servers").join("7777")).unwrap(),
            f.root.join("ttys").join("dev+pts+9")
        );
    }

    #[tokio::test]
    async fn test_update_unknown_active_client_is_noop() {
        let f = Fixture::new();
        let socklink = f.socklink(f.ambient(None, None, Some(ServerId(12345))), None);

        assert_eq!(
            socklink
                .update_server_link(DeviceRequest::parse("-"))
                .await
                .unwrap(),
            UpdateOutcome::ClientUnknown
        );
        assert!(!f.root.exists());
    }

    #[tokio::test]
    async fn test_update_without_server_is_noop() {
        let f = Fixture::new();
        let socklink = f.socklink(f.ambient(None, None, None), Some("/dev/pts/1"));

        assert_eq!(
            socklink
                .update_server_link(DeviceRequest::Explicit("/dev/pts/1".into()))
                .await
                .unwrap(),
            UpdateOutcome::ServerUnavailable
        );
        assert_eq!(socklink.read_server_link(), None);
        assert!(!f.root.exists());
    }

    #[tokio::test]
    async fn test_update_fast_path_skips_lock() {
        let f = Fixture::new();
        let socklink = f.socklink(f.ambient(None, None, Some(SERVER)), None);
        let device = DeviceRequest::Explicit("/dev/pts/3".into());

        socklink.update_server_link(device.clone()).await.unwrap();

        // A live holder keeps the lock; only a write would need it
        f.processes.insert(4242, uid());
        std::fs::write(f.root.join("lock"), "4242\n").unwrap();

        assert!(matches!(
            socklink.update_server_link(device).await.unwrap(),
            UpdateOutcome::Unchanged { .. }
        ));

        let err = socklink
            .update_server_link(DeviceRequest::Explicit("/dev/pts/4".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { holder: 4242, .. }), "{err}");
        assert_eq!(
            std::fs::read_link(f.root.join("servers").join("7777")).unwrap(),
            f.root.join("ttys").join("dev+pts+3")
        );
    }

    #[tokio::test]
    async fn test_update_reclaims_foreign_lock() {
        let f = Fixture::new();
        let socklink = f.socklink(f.ambient(None, None, Some(SERVER)), None);
        socklink
            .update_server_link(DeviceRequest::Explicit("/dev/pts/1".into()))
            .await
            .unwrap();

        f.processes.insert(4343, uid() + 1);
        std::fs::write(f.root.join("lock"), "4343\n").unwrap();

        let outcome = socklink
            .update_server_link(DeviceRequest::Explicit("/dev/pts/2".into()))
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Updated { .. }));
        assert!(!f.root.join("lock").exists());
    }

    #[tokio::test]
    async fn test_server_link_resolves_to_active_socket() {
        let f = Fixture::new();
        let first = f.socket("first.sock");
        let second = f.socket("second.sock");
        let server = Some(SERVER);

        // Written under the lock directly; GC would drop links for devices
        // that do not exist on the test host
        let socklink = f.socklink(f.ambient(None, None, server), None);
        {
            let guard = socklink.store().lock().await.unwrap();
            let ttys = socklink.store().tty_links();
            for (device, socket) in [("/dev/pts/1", &first), ("/dev/pts/2", &second)] {
                ttys.publish(&guard, Path::new(device), Some(socket.as_path()))
                    .await
                    .unwrap();
            }
        }

        let link = socklink.read_server_link().unwrap();
        let resolve = |link: &Path| std::fs::canonicalize(link).unwrap();

        let guard = socklink.store().lock().await.unwrap();
        let servers = socklink.store().server_links();
        let ttys = socklink.store().tty_links();
        servers
            .replace(&guard, SERVER, &ttys.path_for(Path::new("/dev/pts/1")).unwrap())
            .await
            .unwrap();
        assert_eq!(resolve(&link), resolve(&first));

        servers
            .replace(&guard, SERVER, &ttys.path_for(Path::new("/dev/pts/2")).unwrap())
            .await
            .unwrap();
        // Same exported path, new socket
        assert_eq!(resolve(&link), resolve(&second));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_leave_one_target() {
        let f = Fixture::new();
        let socklink = Arc::new(f.socklink(f.ambient(None, None, Some(SERVER)), None));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let socklink = socklink.clone();
            tasks.spawn(async move {
                let device = PathBuf::from(format!("/dev/pts/{i}"));
                let result = socklink
                    .update_server_link(DeviceRequest::Explicit(device))
                    .await;
                (i, result)
            });
        }

        let mut updated = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (i, result) = joined.unwrap();
            match result {
                Ok(UpdateOutcome::Updated { .. }) | Ok(UpdateOutcome::Unchanged { .. }) => {
                    updated.push(i)
                }
                // Contention may exhaust the short test budget; that is a
                // clean failure, not corruption
                Err(Error::LockTimeout { .. }) => {}
                other => panic!("unexpected outcome for {i}: {other:?}"),
            }
        }

        assert!(!updated.is_empty());
        let target = std::fs::read_link(f.root.join("servers").join("7777")).unwrap();
        let expected: Vec<_> = updated
            .iter()
            .map(|i| f.root.join("ttys").join(format!("dev+pts+{i}")))
            .collect();
        assert!(expected.contains(&target), "{} not among {:?}", target.display(), expected);
        assert!(!f.root.join("lock").exists());

        let leftovers: Vec<_> = std::fs::read_dir(&f.root)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name.to_string_lossy().starts_with("lock"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn test_snapshot() {
        let f = Fixture::new();
        let socklink = f.socklink(f.ambient(None, None, Some(SERVER)), None);

        let empty = socklink.snapshot().await.unwrap();
        assert!(empty.tty_links.is_empty());
        assert!(empty.server_links.is_empty());

        socklink
            .update_server_link(DeviceRequest::Explicit("/dev/pts/3".into()))
            .await
            .unwrap();
        let snapshot = socklink.snapshot().await.unwrap();
        assert_eq!(snapshot.root, f.root);
        assert_eq!(snapshot.server_links.len(), 1);
        let server = &snapshot.server_links[0];
        assert_eq!(server.pid, Some(7777));
        assert_eq!(server.device.as_deref(), Some(Path::new("/dev/pts/3")));
        assert!(server.live);
        // No tty link was published for that device
        assert_eq!(server.socket, None);
    }

    #[test]
    fn test_device_request_parse() {
        assert_eq!(DeviceRequest::parse("-"), DeviceRequest::Active);
        assert_eq!(DeviceRequest::parse(""), DeviceRequest::Active);
        assert_eq!(
            DeviceRequest::parse("/dev/pts/1"),
            DeviceRequest::Explicit(PathBuf::from("/dev/pts/1"))
        );
    }
}
