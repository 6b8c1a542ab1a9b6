//! Process ownership queries.
//!
//! Both the lock manager (stale holder detection) and the garbage collector
//! (dead tmux servers) need to know which uid owns a process. Any answer
//! that cannot be parsed cleanly is treated as "no such process" rather
//! than an error: some `ps` variants silently drop unsupported columns.

use std::future::Future;

/// Lookup of the uid owning a process
pub trait ProcessTable {
    /// Return the owning uid of `pid`, or `None` if the process does not
    /// exist or its owner cannot be determined.
    fn owner(&self, pid: u32) -> impl Future<Output = Option<u32>> + Send;
}

/// Queries the running system
#[derive(Debug, Clone, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    async fn owner(&self, pid: u32) -> Option<u32> {
        if pid == 0 {
            return None;
        }
        let owner = lookup_owner(pid).await;
        log::trace!("Owner of pid {}: {:?}", pid, owner);
        owner
    }
}

#[cfg(target_os = "linux")]
async fn lookup_owner(pid: u32) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;

    match tokio::fs::metadata(format!("/proc/{pid}")).await {
        Ok(meta) => Some(meta.uid()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        // /proc may be missing or mounted with restrictions
        Err(_) => ps_owner(pid).await,
    }
}

#[cfg(not(target_os = "linux"))]
async fn lookup_owner(pid: u32) -> Option<u32> {
    ps_owner(pid).await
}

async fn ps_owner(pid: u32) -> Option<u32> {
    let output = tokio::process::Command::new("ps")
        .args(["-o", "uid=", "-p", &pid.to_string()])
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            parse_ps_uid(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(_) => None,
        Err(e) => {
            log::warn!("Failed to run ps for pid {}: {}", pid, e);
            None
        }
    }
}

/// Parse the output of `ps -o uid= -p <pid>`.
///
/// Exactly one numeric token is accepted; headers, extra columns or
/// usernames in place of uids all count as unknown.
pub fn parse_ps_uid(output: &str) -> Option<u32> {
    let mut tokens = output.split_whitespace();
    let uid = tokens.next()?.parse().ok()?;
    match tokens.next() {
        Some(_) => None,
        None => Some(uid),
    }
}
