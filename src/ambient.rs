//! Process-wide context captured once at invocation start.
//!
//! Every component receives these values explicitly instead of querying the
//! environment again halfway through an operation.

use std::env;
use std::ffi::OsStr;
use std::fmt;
use std::path::PathBuf;

/// Identity of a running tmux server: its process id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl ServerId {
    /// Parse the server pid out of a `$TMUX` value (`socket,pid,session`)
    pub fn from_tmux_env(value: &OsStr) -> Option<Self> {
        let value = value.to_str()?;
        let mut fields = value.rsplitn(3, ',');
        let _session = fields.next()?;
        let pid = fields.next()?;
        let _socket = fields.next()?;
        match pid.parse::<u32>() {
            Ok(0) | Err(_) => None,
            Ok(pid) => Some(ServerId(pid)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ambient {
    /// Real uid of the invoking user; the store is accounted to it
    pub uid: u32,
    /// Our own pid, written into the lock file
    pub pid: u32,
    /// Controlling terminal device, if stdin is a terminal
    pub tty: Option<PathBuf>,
    /// Value of `SSH_AUTH_SOCK`, empty values folded into `None`
    pub auth_sock: Option<PathBuf>,
    /// tmux server we are running under, from `$TMUX`
    pub server: Option<ServerId>,
}

impl Ambient {
    /// Capture the context of the current process
    pub fn capture() -> Self {
        let tty = nix::unistd::ttyname(std::io::stdin()).ok();
        let auth_sock = env::var_os("SSH_AUTH_SOCK")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let server = env::var_os("TMUX").and_then(|v| ServerId::from_tmux_env(&v));

        let ambient = Self {
            uid: nix::unistd::getuid().as_raw(),
            pid: std::process::id(),
            tty,
            auth_sock,
            server,
        };
        log::debug!("Captured invocation context: {:?}", ambient);
        ambient
    }

    pub fn with_tty(mut self, tty: Option<PathBuf>) -> Self {
        if tty.is_some() {
            self.tty = tty;
        }
        self
    }

    /// Override the server taken from `$TMUX`; tmux hooks pass `#{pid}`
    pub fn with_server(mut self, server: Option<ServerId>) -> Self {
        if let Some(server) = server.filter(|s| s.0 != 0) {
            self.server = Some(server);
        }
        self
    }
}
