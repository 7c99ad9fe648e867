use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use capturetap::{
    config::{self, Config},
    coordinator::CaptureCoordinator,
    logging, query,
    trace::{self, ReplayInterceptor},
};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "capturetap", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a JSON-lines lifecycle/stream event trace and print the captured entries.
    Replay {
        /// Path to the JSON-lines event trace.
        #[arg(long)]
        events: PathBuf,
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
        #[arg(long, value_enum, default_value_t = ReplayOutput::Entries)]
        output: ReplayOutput,
        /// Answer a JSON query such as `{"type":"getStats"}` after the replay instead.
        #[arg(long, conflicts_with = "output")]
        query: Option<String>,
    },
    /// Validate the config and print the effective settings.
    CheckConfig {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReplayOutput {
    /// Entries, newest first.
    Entries,
    Stats,
    /// Per-outcome event counts.
    Summary,
}

async fn run_replay(
    config: &Config,
    events_path: &Path,
    output: ReplayOutput,
    raw_query: Option<&str>,
) -> anyhow::Result<serde_json::Value> {
    let file = File::open(events_path)
        .with_context(|| format!("open event trace {}", events_path.display()))?;
    let events = trace::parse_trace(BufReader::new(file))
        .with_context(|| format!("read event trace {}", events_path.display()))?;

    let interceptor = Arc::new(ReplayInterceptor::default());
    let coordinator = CaptureCoordinator::with_static_policy(config, interceptor.clone())
        .context("build capture coordinator")?;
    let summary = trace::replay(&coordinator, events).await;
    tracing::info!(
        events = summary.events,
        tracked = summary.tracked,
        filtered = summary.filtered,
        forwarded_bytes = interceptor.forwarded_bytes(),
        "trace replayed"
    );

    let value = match (raw_query, output) {
        (Some(raw), _) => serde_json::to_value(query::dispatch_json(&coordinator, raw)),
        (None, ReplayOutput::Entries) => serde_json::to_value(coordinator.entries()),
        (None, ReplayOutput::Stats) => serde_json::to_value(coordinator.stats()),
        (None, ReplayOutput::Summary) => serde_json::to_value(summary),
    }
    .context("serialize replay output")?;
    Ok(value)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Replay {
            events,
            config,
            log_level,
            output,
            query,
        } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let value = run_replay(&config, &events, output, query.as_deref()).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&value).context("render replay output")?
            );
        }
        Command::CheckConfig { config } => {
            let source = config::resolve_config_source(config.as_deref())?;
            let config = Config::load_from(&source)?;
            eprintln!("config OK ({source})");
            print!(
                "{}",
                toml::to_string_pretty(&config).context("render effective config")?
            );
        }
    }
    Ok(())
}
