use std::path::PathBuf;

use anyhow::Context;
use canvas_sync::config::SyncConfig;
use canvas_sync::shutdown::install_interrupt_handler;
use canvas_sync::sync::{FileToSync, SyncReport, Syncer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "canvas_sync=info,canvas_core=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Sync,
    DryRun,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cli {
    mode: CliMode,
    config: Option<PathBuf>,
}

fn parse_cli<I>(args: I) -> anyhow::Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = Cli {
        mode: CliMode::Sync,
        config: None,
    };
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dry-run" => {
                if cli.mode != CliMode::Help {
                    cli.mode = CliMode::DryRun;
                }
            }
            "--help" | "-h" => cli.mode = CliMode::Help,
            "--config" => {
                let path = args.next().context("--config requires a path")?;
                cli.config = Some(PathBuf::from(path));
            }
            other => match other.strip_prefix("--config=") {
                Some(path) if !path.is_empty() => cli.config = Some(PathBuf::from(path)),
                _ => anyhow::bail!("unknown argument: {other}"),
            },
        }
    }
    Ok(cli)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = parse_cli(std::env::args())?;
    if cli.mode == CliMode::Help {
        println!("Usage: canvas-sync [--dry-run] [--config <path>]");
        println!("  --dry-run         List files that would be downloaded and exit");
        println!("  --config <path>   Read settings from <path> instead of ~/.canvassync.json");
        return Ok(());
    }
    init_tracing();

    let config = SyncConfig::load(cli.config.as_deref())?;
    let client = config.client().context("failed to create Canvas client")?;
    let syncer = Syncer::new(client, config.sync_options());
    tracing::info!(url = %config.url, directory = %config.directory.display(), "starting sync");

    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone());

    let outcome = match cli.mode {
        CliMode::DryRun => syncer.plan(&cancel).await.map(|plan| {
            print_plan(&plan);
            println!("{}", plan_summary(&plan, &config.url));
        }),
        _ => syncer
            .run(&cancel)
            .await
            .map(|report| println!("{}", summary_line(&report, &config.url))),
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(err) if err.is_cancelled() => {
            tracing::warn!("sync interrupted");
            Ok(())
        }
        Err(err) if err.is_auth() => Err(err).context(format!(
            "Canvas rejected the access token for {}; check `token` in the config",
            config.url
        )),
        Err(err) => Err(err.into()),
    }
}

fn print_plan(plan: &[FileToSync]) {
    for record in plan {
        println!("{}", record.path.display());
    }
}

fn summary_line(report: &SyncReport, url: &str) -> String {
    match report.files_synced {
        0 => format!("Up to date with {url}."),
        1 => format!(
            "Transferred 1 file ({}) from {url}.",
            format_bytes(report.bytes_transferred)
        ),
        n => format!(
            "Transferred {n} files ({}) from {url}.",
            format_bytes(report.bytes_transferred)
        ),
    }
}

fn plan_summary(plan: &[FileToSync], url: &str) -> String {
    let bytes: u64 = plan.iter().map(|record| record.file.size).sum();
    match plan.len() {
        0 => format!("Up to date with {url}."),
        1 => format!("Would transfer 1 file ({}) from {url}.", format_bytes(bytes)),
        n => format!("Would transfer {n} files ({}) from {url}.", format_bytes(bytes)),
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
