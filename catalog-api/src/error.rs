use common_database::StoreError;
use lifecycle::LifecycleError;
use thiserror::Error;

/// Fatal conditions of the supervised process, each tied to the phase it happened in.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("store unavailable at startup: {0}")]
    Store(#[from] StoreError),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener failed while serving: {0}")]
    Serve(#[source] LifecycleError),

    #[error("shutdown did not complete cleanly: {0}")]
    Shutdown(#[source] LifecycleError),
}

/// Errors building the request pipeline from configuration.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid trusted origin {0:?}")]
    InvalidOrigin(String),

    #[error("invalid rate limiter configuration: {0}")]
    RateLimit(&'static str),

    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}
