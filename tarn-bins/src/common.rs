//! Common initialization: logging and the trading-session gate.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Map the CLI log level (`--log-level`) onto a tracing filter. `warning`
/// and `critical` are accepted for operator familiarity.
pub fn filter_for(level: &str, debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    match level {
        "warning" => "warn".to_string(),
        "critical" => "error".to_string(),
        other => other.to_string(),
    }
}

/// Initialize tracing. `json` switches to line-JSON output for container
/// log collectors.
pub fn init_logging(level: &str, debug: bool, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_for(level, debug)))?;

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(false))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init();
    }
    Ok(())
}
