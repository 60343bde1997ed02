//! Process-wide `tracing` subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Subscriber settings. `RUST_LOG` overrides `filter` when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub filter: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl TelemetryConfig {
    fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => Ok(EnvFilter::try_new(&self.filter)?),
        }
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if `config.filter` is not a valid directive list or a
/// global subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> anyhow::Result<()> {
    let filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Compact => registry.with(fmt::layer().compact().with_target(false)).try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init()?,
    }
    Ok(())
}
