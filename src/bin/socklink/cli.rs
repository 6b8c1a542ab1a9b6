use std::{
    env,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use clap_serde_derive::{
    clap::{self, Parser, Subcommand, ValueEnum},
    serde::{self, Deserialize, Serialize},
    ClapSerde,
};
use color_eyre::eyre::{Report, Result as EyreResult};
use expand_tilde::ExpandTilde;
use log::LevelFilter;
use socklink::StoreLayout;

const APP_VERSION: &str = env!("SOCKLINK_BUILD_VERSION");

fn default_config_path() -> PathBuf {
    let config_dir = env::var_os("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    let config_dir = config_dir.expand_tilde_owned().unwrap_or(config_dir);

    config_dir
        .join(env!("CARGO_PKG_NAME"))
        .join(concat!(env!("CARGO_PKG_NAME"), ".toml"))
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name).filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn default_store_dir() -> PathBuf {
    env_path("SOCKLINK_DIR")
        .unwrap_or_else(|| StoreLayout::default_root(nix::unistd::getuid().as_raw()))
}

#[derive(Parser)]
#[command(author, version = APP_VERSION, about)]
pub struct Args {
    /// Config file
    #[arg(short, long = "config", default_value_os_t = default_config_path())]
    pub config_path: PathBuf,

    /// Config from file or args
    #[command(flatten)]
    pub config: <Config as ClapSerde>::Opt,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Publish $SSH_AUTH_SOCK under the current terminal (run from login shells)
    SetTtyLink {
        /// Terminal device to publish for instead of the one on stdin
        #[arg(long)]
        tty: Option<PathBuf>,
    },

    /// Point the current tmux server at a client's terminal (run from tmux hooks)
    SetServerLink {
        /// tmux server pid, instead of the one in $TMUX
        #[arg(long)]
        server: Option<u32>,

        /// Client terminal device; `-` asks tmux for the active client
        #[arg(default_value = "-")]
        device: String,
    },

    /// Print the path to use as SSH_AUTH_SOCK inside the current tmux server
    ShowServerLink {
        /// tmux server pid, instead of the one in $TMUX
        #[arg(long)]
        server: Option<u32>,
    },

    /// List the links in the store
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Install hooks into ~/.bashrc, ~/.zshrc and ~/.tmux.conf
    Setup {
        /// Show what would be installed without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    #[command(hide = true)]
    GetDeviceFilename { device: PathBuf },

    #[command(hide = true)]
    GetFilenameDevice { name: String },

    #[command(hide = true)]
    GetPidUid { pid: u32 },

    /// Exit status tells whether the tmux version has the client-active hook
    #[command(hide = true)]
    HasClientActiveHook {
        /// `tmux -V` output; asks tmux when omitted
        version: Option<String>,
    },
}

#[derive(ClapSerde, Clone, Serialize)]
pub struct Config {
    /// Store directory [env: SOCKLINK_DIR]
    #[default(default_store_dir())]
    #[arg(long)]
    pub dir: PathBuf,

    /// Log level
    #[default(LogLevel::Warn)]
    #[arg(long, value_enum)]
    pub log_level: LogLevel,

    /// Append logs to this file instead of standard error [env: SOCKLINK_LOG]
    #[default(env_path("SOCKLINK_LOG"))]
    #[arg(long, num_args = 1)]
    pub log_file: Option<PathBuf>,

    /// tmux executable
    #[default(PathBuf::from("tmux"))]
    #[arg(long)]
    pub tmux: PathBuf,

    /// Config file path (not an arg; copied from struct Args)
    #[arg(skip)]
    #[serde(skip_deserializing, skip_serializing)]
    pub config_path: PathBuf,
}

fn read_file_config(config_path: &Path) -> EyreResult<Option<<Config as ClapSerde>::Opt>> {
    let Ok(mut f) = File::open(config_path) else {
        return Ok(None);
    };
    let mut config_text = String::new();
    f.read_to_string(&mut config_text)?;
    Ok(Some(toml::from_str::<<Config as ClapSerde>::Opt>(&config_text)?))
}

fn expand(path: PathBuf) -> PathBuf {
    path.clone().expand_tilde_owned().unwrap_or(path)
}

impl Config {
    /// Merge the config file with command line flags.
    ///
    /// Commands run from shell and tmux hooks, so a broken config file
    /// must not stop them: it is skipped and the error handed back for
    /// logging once the logger is up.
    pub fn load(
        config_path: PathBuf,
        mut config_opt: <Config as ClapSerde>::Opt,
    ) -> (Self, Option<Report>) {
        let (mut config, error) = match read_file_config(&config_path) {
            Ok(Some(file_config)) => (Config::from(file_config).merge(&mut config_opt), None),
            Ok(None) => (Config::from(&mut config_opt), None),
            Err(e) => (
                Config::from(&mut config_opt),
                Some(e.wrap_err(format!("ignoring config file {}", config_path.display()))),
            ),
        };

        config.config_path = config_path;
        config.dir = expand(config.dir);
        config.log_file = config.log_file.map(expand);
        config.tmux = expand(config.tmux);

        (config, error)
    }
}

#[derive(ValueEnum, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    #[value(hide = true)]
    Trace = 5,
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl Args {
    pub fn parse() -> Self {
        <Self as clap::Parser>::parse()
    }
}

impl Command {
    /// Commands whose output is consumed by shell startup files; they
    /// report failures on stderr but always exit 0
    pub fn always_succeeds(&self) -> bool {
        matches!(self, Command::ShowServerLink { .. })
    }
}
