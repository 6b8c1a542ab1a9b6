//! Command handlers. Each returns the process exit status; structural
//! failures come back as errors and exit 1 from `main`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use color_eyre::eyre::{eyre, Result as EyreResult};
use expand_tilde::ExpandTilde;
use socklink::facade::{ServerLinkInfo, TtyLinkInfo};
use socklink::install::{install_section, shell_hook, tmux_hook};
use socklink::tmux::has_client_active_hook;
use socklink::{
    Ambient, DeviceCodec, DeviceRequest, ProcessTable, PublishOutcome, ServerId, Socklink,
    Store, StoreLayout, StoreSnapshot, SystemProcessTable, TmuxClient, UpdateOutcome,
};

use crate::cli::{Command, Config};

/// Output format for CLI commands
pub enum OutputFormat {
    Human,
    Json,
}

type SystemSocklink = Socklink<SystemProcessTable, TmuxClient>;

fn open_socklink(config: &Config, ambient: Ambient) -> SystemSocklink {
    let store = Store::new(
        StoreLayout::new(&config.dir),
        DeviceCodec::default(),
        ambient.uid,
        ambient.pid,
        SystemProcessTable,
    );
    Socklink::new(store, TmuxClient::new(&config.tmux), ambient)
}

pub async fn run_command(command: &Command, config: &Config) -> EyreResult<ExitCode> {
    let ambient = Ambient::capture();
    match command {
        Command::SetTtyLink { tty } => {
            let ambient = ambient.with_tty(tty.clone());
            cmd_set_tty_link(&open_socklink(config, ambient)).await
        }
        Command::SetServerLink { server, device } => {
            let ambient = ambient.with_server(server.map(ServerId));
            cmd_set_server_link(&open_socklink(config, ambient), device).await
        }
        Command::ShowServerLink { server } => {
            let ambient = ambient.with_server(server.map(ServerId));
            Ok(cmd_show_server_link(&open_socklink(config, ambient)))
        }
        Command::List { json } => {
            let format = if *json {
                OutputFormat::Json
            } else {
                OutputFormat::Human
            };
            cmd_list(&open_socklink(config, ambient), format).await
        }
        Command::Setup { dry_run } => cmd_setup(config, *dry_run).await,
        Command::GetDeviceFilename { device } => {
            println!("{}", DeviceCodec::default().encode(device)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::GetFilenameDevice { name } => {
            println!("{}", DeviceCodec::default().decode(name).display());
            Ok(ExitCode::SUCCESS)
        }
        Command::GetPidUid { pid } => {
            // An unknown process prints an empty line
            match SystemProcessTable.owner(*pid).await {
                Some(uid) => println!("{}", uid),
                None => println!(),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::HasClientActiveHook { version } => {
            let version = match version {
                Some(version) => Some(version.clone()),
                None => TmuxClient::new(&config.tmux).version().await,
            };
            let supported = version.as_deref().is_some_and(has_client_active_hook);
            Ok(if supported {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

async fn cmd_set_tty_link(socklink: &SystemSocklink) -> EyreResult<ExitCode> {
    match socklink.publish_tty_link().await? {
        PublishOutcome::Published { link, socket } => {
            log::info!("Published {} -> {}", link.display(), socket.display())
        }
        PublishOutcome::Suppressed(reason) => log::info!("Nothing published: {:?}", reason),
        PublishOutcome::NoTerminal => log::info!("No terminal on stdin, nothing published"),
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_set_server_link(socklink: &SystemSocklink, device: &str) -> EyreResult<ExitCode> {
    match socklink
        .update_server_link(DeviceRequest::parse(device))
        .await?
    {
        UpdateOutcome::Updated { link, target } => {
            log::info!("Updated {} -> {}", link.display(), target.display())
        }
        UpdateOutcome::Unchanged { link } => log::debug!("{} unchanged", link.display()),
        UpdateOutcome::ServerUnavailable => log::info!("No tmux server, nothing updated"),
        UpdateOutcome::ClientUnknown => log::info!("No active tmux client, nothing updated"),
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_show_server_link(socklink: &SystemSocklink) -> ExitCode {
    if let Some(link) = socklink.read_server_link() {
        println!("{}", link.display());
    }
    ExitCode::SUCCESS
}

async fn cmd_list(socklink: &SystemSocklink, format: OutputFormat) -> EyreResult<ExitCode> {
    let snapshot = socklink.snapshot().await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        OutputFormat::Human => print_snapshot_human(&snapshot),
    }
    Ok(ExitCode::SUCCESS)
}

fn print_snapshot_human(snapshot: &StoreSnapshot) {
    println!("Store: {}", snapshot.root.display());
    println!();
    print_tty_links_human(&snapshot.tty_links);
    println!();
    print_server_links_human(&snapshot.server_links);
}

fn print_tty_links_human(links: &[TtyLinkInfo]) {
    if links.is_empty() {
        println!("No terminal links.");
        return;
    }

    println!("{:<20} {:<6} {:<20} {}", "TERMINAL", "LIVE", "MODIFIED", "SOCKET");
    for link in links {
        println!(
            "{:<20} {:<6} {:<20} {}",
            link.device.display(),
            yes_no(link.live),
            format_modified(link.modified),
            display_opt(link.socket.as_deref())
        );
    }
}

fn print_server_links_human(links: &[ServerLinkInfo]) {
    if links.is_empty() {
        println!("No server links.");
        return;
    }

    println!(
        "{:<10} {:<6} {:<20} {:<20} {}",
        "SERVER", "LIVE", "MODIFIED", "TERMINAL", "SOCKET"
    );
    for link in links {
        println!(
            "{:<10} {:<6} {:<20} {:<20} {}",
            link.name,
            yes_no(link.live),
            format_modified(link.modified),
            display_opt(link.device.as_deref()),
            display_opt(link.socket.as_deref())
        );
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn display_opt(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_modified(modified: Option<chrono::DateTime<chrono::Local>>) -> String {
    modified
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

async fn cmd_setup(config: &Config, dry_run: bool) -> EyreResult<ExitCode> {
    let exe = std::env::current_exe()?;
    let home = PathBuf::from("~").expand_tilde_owned()?;

    let version = TmuxClient::new(&config.tmux).version().await;
    let client_active = version.as_deref().is_some_and(has_client_active_hook);
    log::info!(
        "tmux version {}, client-active hook {}",
        version.as_deref().unwrap_or("unknown"),
        if client_active { "available" } else { "unavailable" }
    );

    let shell = shell_hook(&exe)?;
    let tmux = tmux_hook(&exe, client_active)?;
    let targets = [
        (home.join(".bashrc"), &shell),
        (home.join(".zshrc"), &shell),
        (home.join(".tmux.conf"), &tmux),
    ];

    let mut failed = false;
    for (path, body) in targets {
        match install_section(&path, body, dry_run).await {
            Ok(update) => {
                let status = match (update.changed, dry_run) {
                    (false, _) => "up to date",
                    (true, true) => "would update",
                    (true, false) => "updated",
                };
                println!("{}: {}", path.display(), status);
                if update.manual_config {
                    println!(
                        "  note: {} mentions socklink outside the installed section",
                        path.display()
                    );
                }
                if dry_run && update.changed {
                    for line in body.lines() {
                        println!("  | {}", line);
                    }
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                failed = true;
            }
        }
    }

    if failed {
        return Err(eyre!("setup did not complete"));
    }
    Ok(ExitCode::SUCCESS)
}
