//! Queries against the tmux server we are running under.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

/// Source of the currently active client's terminal device
pub trait ActiveClient {
    /// Device path of the active client, `None` when it cannot be told
    fn active_client(&self) -> impl Future<Output = Option<PathBuf>> + Send;
}

/// Talks to tmux through its command line client
#[derive(Debug, Clone)]
pub struct TmuxClient {
    binary: PathBuf,
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new("tmux")
    }
}

impl TmuxClient {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run tmux with `args` and return trimmed stdout on success
    async fn query(&self, args: &[&str]) -> Option<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (!text.is_empty()).then_some(text)
            }
            Ok(output) => {
                log::debug!("{} {:?} exited with {}", self.binary.display(), args, output.status);
                None
            }
            Err(e) => {
                log::warn!("Failed to run {}: {}", self.binary.display(), e);
                None
            }
        }
    }

    /// Output of `tmux -V`, e.g. `tmux 3.3a`
    pub async fn version(&self) -> Option<String> {
        self.query(&["-V"]).await
    }
}

impl ActiveClient for TmuxClient {
    async fn active_client(&self) -> Option<PathBuf> {
        let tty = self.query(&["display-message", "-p", "#{client_tty}"]).await;
        log::debug!("Active tmux client: {:?}", tty);
        tty.map(PathBuf::from)
    }
}

/// Whether a tmux build, given its `tmux -V` output, has the
/// `client-active` hook (tmux 3.3; OpenBSD base from 7.2).
pub fn has_client_active_hook(version: &str) -> bool {
    let version = version.trim();
    let version = version.strip_prefix("tmux ").unwrap_or(version);

    if let Some(release) = version.strip_prefix("openbsd-") {
        return parse_major_minor(release).is_some_and(|v| v >= (7, 2));
    }
    let version = version.strip_prefix("next-").unwrap_or(version);
    parse_major_minor(version).is_some_and(|v| v >= (3, 3))
}

/// Parse the leading `major.minor` of a version such as `3.3a`
fn parse_major_minor(version: &str) -> Option<(u32, u32)> {
    let (major, rest) = version.split_once('.')?;
    let minor: String = rest.chars().take_while(char::is_ascii_digit).collect();
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
pub(crate) mod fake {
    use std::path::PathBuf;

    use super::ActiveClient;

    /// Active client source with a fixed answer
    #[derive(Debug, Clone, Default)]
    pub struct FixedActiveClient(pub Option<PathBuf>);

    impl ActiveClient for FixedActiveClient {
        async fn active_client(&self) -> Option<PathBuf> {
            self.0.clone()
        }
    }
}
