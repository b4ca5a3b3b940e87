use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use snapwatch_sync::{
    ingest_page_file, parse_end_time, report_markdown, ScanDriver, SourceMode, SourceRegistry,
    WatchConfig, WatchContext,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "snapwatch")]
#[command(about = "Watch scraped listings and report what appears or disappears")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[command(flatten)]
    scan: ScanArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan the selected sources repeatedly (default)
    Scan(ScanArgs),
    /// Reconcile a saved page instead of fetching the source
    Ingest {
        #[arg(long)]
        source: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// List the source registry
    Sources,
    /// Summarize stored views and recent audit events
    Report {
        #[arg(long = "source")]
        sources: Vec<String>,
        #[arg(long, default_value_t = 10)]
        events: usize,
    },
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Seconds between scan passes
    #[arg(long, default_value_t = 30)]
    interval: u64,
    /// `YYYY-MM-DD HH:MM:SS`, or `HH:MM` for the next occurrence of that time
    #[arg(long)]
    end_time: Option<String>,
    #[arg(long)]
    run_once: bool,
    #[arg(long = "source")]
    sources: Vec<String>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = WatchConfig::from_env();

    match cli.command.unwrap_or(Commands::Scan(cli.scan)) {
        Commands::Scan(args) => scan(config, args).await?,
        Commands::Ingest { source, file } => {
            let registry = SourceRegistry::load(&config.sources_path).await?;
            let source = registry
                .get(&source)
                .cloned()
                .with_context(|| format!("unknown source {source}"))?;
            let ctx = WatchContext::new(config)?;
            let summary = ingest_page_file(&ctx, &source, &file).await?;
            println!(
                "ingest complete: source={} outcome={:?} records={} added={} removed={} notified={}",
                summary.source_id,
                summary.outcome,
                summary.records,
                summary.added,
                summary.removed,
                summary.notifications.sent
            );
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(&config.sources_path).await?;
            for source in &registry.sources {
                let origin = match source.mode {
                    SourceMode::Live => source.url.clone().unwrap_or_default(),
                    SourceMode::File => source
                        .path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                };
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    source.source_id,
                    source.kind,
                    if source.enabled { "enabled" } else { "disabled" },
                    source.display_name,
                    origin
                );
            }
        }
        Commands::Report { sources, events } => {
            let registry = SourceRegistry::load(&config.sources_path).await?;
            let selected = if sources.is_empty() {
                registry.sources.clone()
            } else {
                registry.select(&sources)?
            };
            println!("{}", report_markdown(&config, &selected, events).await?);
        }
    }

    Ok(())
}

async fn scan(config: WatchConfig, args: ScanArgs) -> Result<()> {
    let end_time = args
        .end_time
        .as_deref()
        .map(|raw| parse_end_time(raw, &Local::now()))
        .transpose()?;
    if args.interval == 0 {
        bail!("--interval must be at least 1 second");
    }

    let registry = SourceRegistry::load(&config.sources_path).await?;
    let sources = registry.select(&args.sources)?;
    if sources.is_empty() {
        bail!("no enabled sources in {}", config.sources_path.display());
    }
    if let Some(end) = end_time {
        info!(end_time = %end.format("%Y-%m-%d %H:%M:%S"), "scan end time set");
    }

    let ctx = WatchContext::new(config)?;
    let driver = ScanDriver {
        interval: Duration::from_secs(args.interval),
        end_time,
        run_once: args.run_once,
    };
    let report = driver.run(&ctx, &sources).await;
    println!(
        "scan stopped: reason={:?} passes={} scans={} failed={}",
        report.stop_reason, report.iterations, report.scans, report.failed_scans
    );
    Ok(())
}
