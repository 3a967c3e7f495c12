// Logging setup for the worker binary
//
// Console output only: one `fmt` layer behind an `EnvFilter`.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when neither `RUST_LOG` nor `LOG_LEVEL` parse
pub const DEFAULT_LOG_FILTER: &str = "info";

// ============================================================================
// Telemetry Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log filter (e.g., "info", "sluice=debug")
    pub log_filter: Option<String>,
    /// Include the event target in each line
    pub with_target: bool,
    /// Colorize output
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "sluice-worker".to_string(),
            log_filter: None,
            with_target: true,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SLUICE_SERVICE_NAME`: Service name (default: "sluice-worker")
    /// - `RUST_LOG`: Full filter directive, used as-is
    /// - `LOG_LEVEL`: Level applied to the worker and engine crates
    /// - `NO_COLOR`: Disable ANSI colors when set
    pub fn from_env() -> Self {
        let log_filter = std::env::var("RUST_LOG").ok().or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .map(|level| format!("sluice_worker={level},sluice={level}"))
        });

        Self {
            service_name: std::env::var("SLUICE_SERVICE_NAME")
                .unwrap_or_else(|_| "sluice-worker".to_string()),
            log_filter,
            ansi: std::env::var_os("NO_COLOR").is_none(),
            ..Default::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Install the global subscriber
///
/// Fails if a global subscriber is already set.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_ansi(config.ansi)
        .with_filter(config.filter());

    tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(service = %config.service_name, "Logging initialized");
    Ok(())
}
