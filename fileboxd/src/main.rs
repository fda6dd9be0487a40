use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use filebox_core::{ApiResponse, CopyAction, strip_account_prefix};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use url::Url;

use fileboxd::config::ClientConfig;
use fileboxd::monitor::{DeviceEventKind, MonitorEvent};
use fileboxd::runtime::ClientRuntime;
use fileboxd::transfer::{
    Direction, QueueSnapshot, TransferEvent, TransferHandle, TransferRequest,
};

const DEFAULT_LOG_FILTER: &str = "fileboxd=info,filebox_core=info";

#[derive(Debug, Parser)]
#[command(name = "fileboxd", version, about = "Filebox transfer and device monitor client")]
struct Cli {
    /// Backend base URL (overrides FILEBOX_API_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<Url>,
    /// Push channel URL (overrides FILEBOX_PUSH_URL)
    #[arg(long, global = true)]
    push_url: Option<Url>,
    /// Bearer token (overrides FILEBOX_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Follow device insert/remove events until Ctrl-C
    Watch,
    /// Print the currently mounted devices
    Devices,
    /// Upload local files one after another
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Remote directory to upload into
        #[arg(long)]
        dir: String,
    },
    /// Download remote files one after another
    Download {
        #[arg(required = true)]
        relpaths: Vec<String>,
        /// Directory to save into (defaults to FILEBOX_DOWNLOAD_DIR)
        #[arg(long)]
        to: Option<PathBuf>,
    },
    /// List a remote directory
    Ls { dir: Option<String> },
    /// Copy remote files into another directory
    Cp {
        #[arg(required = true)]
        files: Vec<String>,
        #[arg(long)]
        to: String,
    },
    /// Move remote files into another directory
    Mv {
        #[arg(required = true)]
        files: Vec<String>,
        #[arg(long)]
        to: String,
    },
    /// Delete remote files
    Rm {
        #[arg(required = true)]
        files: Vec<String>,
        /// Re-root browser paths for the given account kind before deleting
        #[arg(long, value_enum)]
        account_relative: Option<Account>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Account {
    Admin,
    User,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    let mut config = ClientConfig::from_env()?;
    if let Some(base_url) = cli.base_url {
        config.connection.base_url = Some(base_url);
    }
    if let Some(push_url) = cli.push_url {
        config.connection.push_url = Some(push_url);
    }
    if let Some(token) = cli.token {
        config.connection.token = Some(token);
    }

    let mut runtime = ClientRuntime::bootstrap(config)?;
    let result = run(&mut runtime, cli.command).await;
    runtime.shutdown();
    result
}

async fn run(runtime: &mut ClientRuntime, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Watch => watch(runtime).await,
        Command::Devices => {
            let devices = runtime.client()?.list_usb_devices().await?;
            if devices.is_empty() {
                println!("no devices mounted");
            }
            for device in devices {
                println!("{}\t{}", device.device, device.display_label());
            }
            Ok(())
        }
        Command::Upload { files, dir } => {
            let requests = files
                .into_iter()
                .map(|file| TransferRequest::upload(file, dir.clone()))
                .collect();
            let handle = runtime.start_transfers(Direction::Upload);
            run_transfers(handle, requests).await
        }
        Command::Download { relpaths, to } => {
            let requests = relpaths
                .into_iter()
                .map(|relpath| match &to {
                    Some(dir) => {
                        let name = relpath.rsplit('/').next().unwrap_or(&relpath).to_string();
                        TransferRequest::download_to(relpath, dir.join(name))
                    }
                    None => TransferRequest::download(relpath),
                })
                .collect();
            let handle = runtime.start_transfers(Direction::Download);
            run_transfers(handle, requests).await
        }
        Command::Ls { dir } => {
            let response = runtime
                .client()?
                .list_files(dir.as_deref().unwrap_or_default())
                .await?;
            print_response(response)
        }
        Command::Cp { files, to } => {
            let response = runtime
                .client()?
                .copy_files(&files, &to, CopyAction::Copy)
                .await?;
            print_response(response)
        }
        Command::Mv { files, to } => {
            let response = runtime
                .client()?
                .copy_files(&files, &to, CopyAction::Move)
                .await?;
            print_response(response)
        }
        Command::Rm {
            files,
            account_relative,
        } => {
            let files = match account_relative {
                Some(account) => files
                    .iter()
                    .map(|file| strip_account_prefix(file, account == Account::Admin))
                    .collect(),
                None => files,
            };
            let response = runtime.client()?.delete_files(&files).await?;
            print_response(response)
        }
    }
}

fn print_response(response: ApiResponse) -> anyhow::Result<()> {
    if !response.success {
        anyhow::bail!(
            "request failed ({}): {}",
            response.status,
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
    match response.data {
        Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
        None => println!("ok"),
    }
    Ok(())
}

async fn watch(runtime: &mut ClientRuntime) -> anyhow::Result<()> {
    let monitor = runtime.start_monitor();
    let mut events = monitor.subscribe();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                monitor.disconnect().ok();
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(MonitorEvent::Status(status)) => {
                    println!("[{}] {}", status.state, status.message);
                }
                Ok(MonitorEvent::Device(device)) => match device.kind {
                    DeviceEventKind::Insert => println!("+ {}", device.label),
                    DeviceEventKind::Remove => println!("- {}", device.label),
                },
                Ok(MonitorEvent::Unrecognized(raw)) => println!("? {raw}"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "monitor events dropped");
                }
                Err(RecvError::Closed) => anyhow::bail!("connectivity monitor stopped"),
            }
        }
    }
}

/// Outcome bookkeeping for one batch of transfer requests.
#[derive(Debug)]
struct Batch {
    expected: usize,
    settled: usize,
    failures: usize,
    missed: bool,
}

impl Batch {
    fn new(expected: usize) -> Self {
        Self {
            expected,
            settled: 0,
            failures: 0,
            missed: false,
        }
    }

    fn is_done(&self) -> bool {
        self.settled >= self.expected
    }

    fn observe(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::Rejected { .. }
            | TransferEvent::Failed { .. }
            | TransferEvent::Cancelled { .. } => {
                self.settled += 1;
                self.failures += 1;
            }
            TransferEvent::Succeeded { .. } => self.settled += 1,
            _ => {}
        }
    }

    /// Catches up after dropped events. A queue that is idle with nothing
    /// pending has finished every request it accepted.
    fn resync(&mut self, snapshot: &QueueSnapshot) {
        self.missed = true;
        if !snapshot.busy && snapshot.pending() == 0 {
            self.settled = self.expected;
        }
    }
}

fn print_transfer_event(event: &TransferEvent) {
    match event {
        TransferEvent::Queued { task_id, name, .. } => println!("{task_id} queued {name}"),
        TransferEvent::Rejected { source, reason, .. } => println!("rejected {source}: {reason}"),
        TransferEvent::Started { task_id, name, .. } => println!("{task_id} started {name}"),
        TransferEvent::Progress {
            task_id, percent, ..
        } => println!("{task_id} {percent}%"),
        TransferEvent::Succeeded {
            task_id, message, ..
        } => println!("{task_id} {message}"),
        TransferEvent::Failed { task_id, error, .. } => println!("{task_id} failed: {error}"),
        TransferEvent::Cancelled { task_id, .. } => println!("{task_id} cancelled"),
        TransferEvent::Removed { .. }
        | TransferEvent::ProgressReset { .. }
        | TransferEvent::Idle { .. } => {}
    }
}

/// Feeds `requests` to the queue and reports events until every request has
/// either finished or been rejected.
async fn run_transfers(
    handle: TransferHandle,
    requests: Vec<TransferRequest>,
) -> anyhow::Result<()> {
    let mut events = handle.subscribe();
    let mut batch = Batch::new(requests.len());
    handle.enqueue(requests)?;

    while !batch.is_done() {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                handle.cancel_all()?;
                anyhow::bail!("{} interrupted", handle.direction());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_transfer_event(&event);
                    batch.observe(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "transfer events dropped");
                    batch.resync(&handle.snapshot().await?);
                }
                Err(RecvError::Closed) => anyhow::bail!("{} queue stopped", handle.direction()),
            }
        }
    }

    let direction = handle.direction();
    if batch.failures > 0 {
        anyhow::bail!(
            "{} of {} {direction}s did not complete",
            batch.failures,
            batch.expected
        );
    }
    if batch.missed {
        tracing::warn!(%direction, "some transfer outcomes were not observed");
    }
    Ok(())
}
