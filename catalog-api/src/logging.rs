use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::Environment;

/// Install the global subscriber: colored human-readable output in development, JSON lines
/// everywhere else. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing(env: Environment) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_layer = {
        let base_layer = fmt::layer().with_target(true).with_level(true);

        if env == Environment::Development {
            base_layer.with_ansi(true).with_filter(filter()).boxed()
        } else {
            base_layer.json().with_filter(filter()).boxed()
        }
    };

    tracing_subscriber::registry().with(log_layer).init();
}
