use anyhow::anyhow;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs the global subscriber. `cli_level_override` wins over `[logging].level`.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let filter = resolve_log_filter(config, cli_level_override)?;

    match resolve_log_format(config) {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .pretty()
            .try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;

    Ok(())
}

/// Accepts a bare level (`debug`) or per-target directives (`capturetap::coordinator=trace,info`).
fn resolve_log_filter(
    config: &Config,
    cli_level_override: Option<&str>,
) -> anyhow::Result<EnvFilter> {
    let raw_level = configured_level(config, cli_level_override);
    if raw_level.contains('=') {
        return EnvFilter::try_new(raw_level.trim())
            .map_err(|err| anyhow!("invalid log filter `{raw_level}`: {err}"));
    }
    let level = resolve_log_level(config, cli_level_override)?;
    Ok(EnvFilter::default().add_directive(level.into()))
}

fn configured_level<'a>(config: &'a Config, cli_level_override: Option<&'a str>) -> &'a str {
    cli_level_override
        .or_else(|| {
            config
                .logging
                .as_ref()
                .and_then(|logging| logging.level.as_deref())
        })
        .unwrap_or(DEFAULT_LOG_LEVEL)
}

fn resolve_log_level(
    config: &Config,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let raw_level = configured_level(config, cli_level_override);
    let normalized = raw_level.trim().to_ascii_lowercase();

    normalized.parse::<LevelFilter>().map_err(|_| {
        anyhow!(
            "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
        )
    })
}

fn resolve_log_format(config: &Config) -> LogFormat {
    config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json)
}
