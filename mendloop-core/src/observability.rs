//! Tracing setup and span helpers

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};
use uuid::Uuid;

use crate::config::LoggingConfig;

/// Initialize tracing. `RUST_LOG` takes precedence over the configured level.
///
/// Logs go to stderr. Safe to call more than once; later calls are ignored.
pub fn init_tracing(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "mendloop={level},mendloop_core={level},mendloop_sim={level}",
            level = config.level
        ))
    });

    let registry = Registry::default().with(env_filter);
    let result = if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Create a span for one control-loop event
#[inline]
pub fn event_span(control_loop: &str, request_id: Uuid) -> Span {
    tracing::info_span!(
        "control_loop",
        control_loop = %control_loop,
        request_id = %request_id,
    )
}

/// Create a span for one policy operation
#[inline]
pub fn operation_span(actor: &str, operation: &str, request_id: Uuid) -> Span {
    tracing::debug_span!(
        "operation",
        actor = %actor,
        operation = %operation,
        request_id = %request_id,
        attempt = tracing::field::Empty,
    )
}
