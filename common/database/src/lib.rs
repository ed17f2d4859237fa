use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
    postgres::{PgConnectOptions, PgPool, PgPoolOptions},
    Connection,
};
use thiserror::Error;
use tracing::debug;

/// The liveness probe must answer within this deadline, measured from the start of the
/// probe rather than from pool creation.
pub const STORE_PING_DEADLINE: Duration = Duration::from_secs(5);

pub const POOL_STATS_INTERVAL: Duration = Duration::from_secs(10);

const METRIC_POOL_CONNECTIONS: &str = "store_pool_connections";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("store connection failed: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("store did not answer the liveness probe within {0:?}")]
    ProbeTimeout(Duration),
}

/// Pool settings, resolved from the service configuration before the store is opened.
#[derive(Clone)]
pub struct StoreConfig {
    pub dsn: String,
    /// Open connections = in-use + idle.
    pub max_open_connections: u32,
    pub max_idle_connections: u32,
    /// Zero means idle connections are never reaped.
    pub max_idle_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: u32,
    pub num_idle: usize,
}

/// The durable backing store as seen by the process lifecycle: something that can be
/// probed for liveness, and closed exactly once when nothing depends on it anymore.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), sqlx::Error>;

    async fn close(&self);

    fn stats(&self) -> Option<PoolStats> {
        None
    }
}

#[async_trait]
impl Store for PgPool {
    async fn ping(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.acquire().await?;
        conn.ping().await
    }

    async fn close(&self) {
        PgPool::close(self).await
    }

    fn stats(&self) -> Option<PoolStats> {
        Some(PoolStats {
            size: self.size(),
            num_idle: self.num_idle(),
        })
    }
}

/// Build the connection pool without connecting. Connections are established on first use,
/// which for a well-behaved startup is the liveness probe.
///
/// sqlx has no cap on the number of idle connections, so `max_idle_connections` is only
/// validated against `max_open_connections`; zero keeps no idle connections around at all.
pub fn open_pool(config: &StoreConfig) -> Result<PgPool, StoreError> {
    if config.max_open_connections == 0 {
        return Err(StoreError::InvalidConfig(
            "max open connections must be greater than 0".to_owned(),
        ));
    }
    if config.max_idle_connections > config.max_open_connections {
        return Err(StoreError::InvalidConfig(format!(
            "max idle connections ({}) cannot exceed max open connections ({})",
            config.max_idle_connections, config.max_open_connections
        )));
    }

    let idle_timeout = match (config.max_idle_connections, config.max_idle_time) {
        (0, _) => Some(Duration::ZERO),
        (_, idle) if idle.is_zero() => None,
        (_, idle) => Some(idle),
    };

    let options: PgConnectOptions = config.dsn.parse()?;

    debug!(
        max_open_connections = config.max_open_connections,
        max_idle_connections = config.max_idle_connections,
        idle_timeout_secs = idle_timeout.map(|d| d.as_secs_f64()),
        "configuring store pool"
    );

    Ok(PgPoolOptions::new()
        .max_connections(config.max_open_connections)
        .idle_timeout(idle_timeout)
        .test_before_acquire(true)
        .connect_lazy_with(options))
}

/// Ping the store, failing if it does not answer within `deadline`.
pub async fn probe<S>(store: &S, deadline: Duration) -> Result<(), StoreError>
where
    S: Store + ?Sized,
{
    match tokio::time::timeout(deadline, store.ping()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::ProbeTimeout(deadline)),
    }
}

pub fn emit_pool_stats(stats: PoolStats) {
    metrics::gauge!(METRIC_POOL_CONNECTIONS, "state" => "open").set(f64::from(stats.size));
    metrics::gauge!(METRIC_POOL_CONNECTIONS, "state" => "idle").set(stats.num_idle as f64);
}

/// Publish the pool statistics every `every`, for as long as the future is polled.
pub async fn report_pool_stats<S>(store: &S, every: Duration)
where
    S: Store + ?Sized,
{
    let mut ticks = tokio::time::interval(every);
    loop {
        ticks.tick().await;
        if let Some(stats) = store.stats() {
            emit_pool_stats(stats);
        }
    }
}
