use crate::config::{LoggingMode, LoggingSettings};

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// default directive.
pub fn init(settings: &LoggingSettings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(
            settings.format.clone().unwrap_or_else(|| "info".to_string()),
        )
    });

    match settings.mode {
        LoggingMode::Friendly => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LoggingMode::Json => {
            tracing_subscriber::fmt()
                .json()
                .flatten_event(true)
                .with_env_filter(filter)
                .init();
        }
    }

    if !settings.fields.is_empty() {
        tracing::info!(fields = ?settings.fields, "logging configured with static fields");
    }
}
