use std::process::ExitCode;

use color_eyre::eyre::Result as EyreResult;
use flexi_logger::LoggerHandle;
use tokio::select;
use tokio::signal::{self, unix::SignalKind};

mod cli;
mod commands;
mod logging;

const BUILD_VERSION: &str = env!("SOCKLINK_BUILD_VERSION");
const GIT_DESCRIBE: &str = env!("SOCKLINK_GIT_DESCRIBE");

/// Conventional status for a process stopped by a signal it handled
const EXIT_INTERRUPTED: u8 = 130;

#[cfg(debug_assertions)]
fn install_eyre_hook() -> EyreResult<()> {
    color_eyre::config::HookBuilder::default()
        .display_env_section(true)
        .install()
}

#[cfg(not(debug_assertions))]
fn install_eyre_hook() -> EyreResult<()> {
    color_eyre::config::HookBuilder::default()
        .display_env_section(false)
        .install()
}

fn main() -> ExitCode {
    if let Err(e) = install_eyre_hook() {
        eprintln!("Failed to install error hook: {}", e);
        return ExitCode::FAILURE;
    }

    let args = cli::Args::parse();
    let always_succeeds = args.command.always_succeeds();

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            if always_succeeds {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// Log to the configured file, falling back to stderr when it cannot be
/// opened. Returns `None` only if no logger could be started at all.
fn start_logger(config: &cli::Config) -> Option<LoggerHandle> {
    let level = config.log_level.into();
    let Some(log_file) = config.log_file.as_deref() else {
        return logging::setup_logger(level, None)
            .inspect_err(|e| eprintln!("Failed to start logger: {}", e))
            .ok();
    };

    match logging::setup_logger(level, Some(log_file)) {
        Ok(handle) => Some(handle),
        Err(e) => {
            let handle = logging::setup_logger(level, None).ok();
            log::warn!("Cannot log to {}, using stderr: {}", log_file.display(), e);
            handle
        }
    }
}

// Every invocation is a short-lived hook; one thread is plenty
#[tokio::main(flavor = "current_thread")]
async fn run(args: cli::Args) -> EyreResult<ExitCode> {
    let (config, config_error) = cli::Config::load(args.config_path, args.config);

    // LoggerHandle must be held until program termination so file logging takes place
    let _logger = start_logger(&config);
    if let Some(e) = config_error {
        log::warn!("{:#}", e);
    }
    log::debug!(
        "Starting socklink version {}; commit {}; config {}",
        BUILD_VERSION,
        GIT_DESCRIBE,
        config.config_path.display()
    );

    let mut sigterm = signal::unix::signal(SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(SignalKind::hangup())?;

    // Dropping the command future on a signal releases the store lock
    let result = select! {
        res = commands::run_command(&args.command, &config) => res,
        _ = signal::ctrl_c() => { log::info!("Interrupted by SIGINT"); Ok(ExitCode::from(EXIT_INTERRUPTED)) },
        Some(_) = sigterm.recv() => { log::info!("Interrupted by SIGTERM"); Ok(ExitCode::from(EXIT_INTERRUPTED)) },
        Some(_) = sighup.recv() => { log::info!("Interrupted by SIGHUP"); Ok(ExitCode::from(EXIT_INTERRUPTED)) },
    };

    if let Err(e) = &result {
        log::error!("{:#}", e);
    }
    result
}
