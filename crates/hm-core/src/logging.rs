//! Structured logging bootstrap.
//!
//! JSON output for production (`LOG_FORMAT=json`), human-readable text
//! otherwise; level filtering via `RUST_LOG` (default `info`). Hosts call
//! [`init_logging`] once at startup.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize logging for an embedding host.
///
/// Safe to call only once per process; a second call is a no-op because
/// the global subscriber is already set.
pub fn init_logging(_service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .flatten_event(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_ansi(true))
            .try_init()
    };
    // Already-initialized is fine: tests and embedded hosts may race here.
    let _ = result;
}

pub fn init_default_logging() {
    init_logging("heromessaging");
}
