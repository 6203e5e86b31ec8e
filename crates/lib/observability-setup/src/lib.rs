//! Observability setup for managing process-global observability state.

mod common;

use std::sync::Once;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub use self::common::*;

/// Install the global subscriber. Later calls are ignored with a warning on
/// stderr, so binaries and tests can both call this unconditionally.
pub fn init(options: ObservabilityOptions) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.filter_directive()));

    let result = if options.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing init failed: {err}");
    }
}

static INIT_TEST_TRACING: Once = Once::new();

/// Route logs through the test harness writer when `RUST_LOG` is set.
pub fn init_for_tests() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_applies_when_unset() {
        assert_eq!(ObservabilityOptions::default().filter_directive(), DEFAULT_FILTER);
        let options = ObservabilityOptions {
            json: true,
            default_filter: Some("jobmetrics=debug".to_string()),
        };
        assert_eq!(options.filter_directive(), "jobmetrics=debug");
    }
}
