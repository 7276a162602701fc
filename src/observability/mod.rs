// Observability infrastructure using tracing crate
// Structured logging for the control loop; JSON for machines, plain text for terminals

use crate::config::{LogFormat, LoggingConfig};
use anyhow::{Context, Result};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize the global subscriber
///
/// `RUST_LOG` wins over the configured level, e.g.
/// `RUST_LOG=home_medic=debug,home_medic::ingest=trace`.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to create tracing filter")?;

    let registry = tracing_subscriber::registry().with(filter_layer);

    match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .context("Failed to install tracing subscriber")?,
        LogFormat::Plain => registry
            .with(fmt::layer().with_target(true).compact())
            .try_init()
            .context("Failed to install tracing subscriber")?,
    }

    Ok(())
}

/// Span wrapping the handling of one entity's health issue
///
/// The remediation target is resolved inside the span, so it is keyed by entity.
#[inline]
pub fn healing_span(instance_id: &str, entity_id: &str) -> tracing::Span {
    tracing::info_span!(
        "heal",
        instance = instance_id,
        entity_id = entity_id,
        request_id = %uuid::Uuid::new_v4(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_healing_span_is_keyed_by_entity() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = healing_span("home", "light.kitchen");
            let fields = span.metadata().unwrap().fields();
            assert!(fields.field("entity_id").is_some());
            assert!(fields.field("target").is_none());
        });
    }
}
