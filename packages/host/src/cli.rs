//! `opengui` binary entry: argument parsing, logging init, and the stdio
//! pump that connects the panel protocol to the bridge.
//!
//! stdout carries panel updates as JSON lines; everything else goes to
//! stderr via logfmt.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use opengui_client::OpenCodeClient;
use opengui_error::{HostError, RecoveryAction};
use opengui_server_manager::{ServerEvent, ServerManager, ServerManagerConfig};

use crate::bridge::ChatBridge;
use crate::messages::{PanelRequest, PanelUpdate};

const UPDATE_CHANNEL_SIZE: usize = 64;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "opengui", version, about = "Panel host for a local opencode server")]
pub struct OpenGuiCli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Supervise the server and bridge the panel protocol over stdio.
    Run(RunArgs),
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Workspace directory the server runs in. Defaults to the current
    /// directory.
    #[arg(long, value_name = "DIR")]
    workspace: Option<PathBuf>,

    /// Explicit path to the opencode binary. Falls back to the
    /// OPENCODE_PATH environment variable, then to PATH.
    #[arg(long, value_name = "FILE")]
    opencode_path: Option<PathBuf>,

    /// Do not start the server automatically; the panel drives it.
    #[arg(long)]
    no_auto_start: bool,

    /// Directory for captured server output.
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn run() -> Result<(), CliError> {
    let cli = OpenGuiCli::parse();
    init_logging();

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => runtime.block_on(run_host(args)),
    }
}

async fn run_host(args: RunArgs) -> Result<(), CliError> {
    let workspace = match args.workspace {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let mut config = ServerManagerConfig::new(workspace);
    config.binary_path = args.opencode_path;
    if let Some(dir) = args.log_dir {
        config.log_dir = dir;
    }
    let manager = ServerManager::new(config);
    tracing::info!(
        port = manager.port(),
        logs = %manager.log_dir().display(),
        "host starting"
    );

    if !args.no_auto_start {
        manager.start().await?;
    }

    let client = OpenCodeClient::new(manager.base_url());
    let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CHANNEL_SIZE);

    let writer = tokio::spawn(write_updates(updates_rx));
    let notices = tokio::spawn(forward_server_events(
        manager.subscribe(),
        updates_tx.clone(),
    ));

    let mut bridge = ChatBridge::new(client, updates_tx.clone());
    drop(updates_tx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<PanelRequest>(line) {
                            Ok(request) => bridge.handle(request).await,
                            Err(err) => {
                                tracing::warn!(error = %err, "rejected malformed panel request");
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::info!("panel closed stdin, shutting down");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "stdin read failed, shutting down");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                break;
            }
        }
    }

    manager.stop().await?;
    notices.abort();
    drop(bridge);
    // Give the writer a moment to drain queued updates before exit.
    let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
    Ok(())
}

async fn write_updates(mut updates: mpsc::Receiver<PanelUpdate>) {
    let mut stdout = tokio::io::stdout();
    while let Some(update) = updates.recv().await {
        let mut line = match serde_json::to_string(&update) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode panel update");
                continue;
            }
        };
        line.push('\n');
        if stdout.write_all(line.as_bytes()).await.is_err() {
            tracing::warn!("stdout closed, dropping panel updates");
            return;
        }
        let _ = stdout.flush().await;
    }
}

async fn forward_server_events(
    mut events: broadcast::Receiver<ServerEvent>,
    updates: mpsc::Sender<PanelUpdate>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let update = PanelUpdate::ServerNotice {
                    actions: notice_actions(&event),
                    event,
                };
                if updates.send(update).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "server event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn notice_actions(event: &ServerEvent) -> Vec<RecoveryAction> {
    match event {
        ServerEvent::Crashed { .. } | ServerEvent::Unhealthy => {
            vec![RecoveryAction::Restart, RecoveryAction::ShowLogs]
        }
    }
}
