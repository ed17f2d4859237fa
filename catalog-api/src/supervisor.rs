use std::future::ready;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use common_database::{
    emit_pool_stats, probe, report_pool_stats, Store, POOL_STATS_INTERVAL, STORE_PING_DEADLINE,
};
use lifecycle::{
    Acceptor, BackgroundTasks, ConnectionTimeouts, LivenessHandler, ReadinessHandler, RunningService,
    SignalListener, TerminationRequests, SHUTDOWN_DRAIN_DEADLINE,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ServiceConfig;
use crate::error::SupervisorError;

/// Drives the process from startup to exit: checks the store, serves until a termination
/// request has been fully handled, then closes the store.
pub struct Supervisor<S> {
    config: Arc<ServiceConfig>,
    store: S,
    app: Router,
    tasks: BackgroundTasks,
    drain_deadline: Duration,
    timeouts: ConnectionTimeouts,
    listener: Option<Box<dyn Acceptor>>,
}

impl<S: Store> Supervisor<S> {
    /// `tasks` must be the tracker the request pipeline registers its background work with.
    pub fn new(config: Arc<ServiceConfig>, store: S, app: Router, tasks: BackgroundTasks) -> Self {
        Self {
            config,
            store,
            app,
            tasks,
            drain_deadline: SHUTDOWN_DRAIN_DEADLINE,
            timeouts: ConnectionTimeouts::default(),
            listener: None,
        }
    }

    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ConnectionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Serve on an already bound listener instead of binding the configured address.
    pub fn with_listener(mut self, listener: impl Acceptor) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// `install_requests` is only called once the store has answered, so a process that
    /// fails its startup checks never traps signals or binds the port.
    pub async fn run<R, F>(self, install_requests: F) -> Result<(), SupervisorError>
    where
        R: TerminationRequests,
        F: FnOnce() -> io::Result<R>,
    {
        if let Err(e) = probe(&self.store, STORE_PING_DEADLINE).await {
            error!(phase = "startup", error = %e, "store liveness probe failed");
            return Err(SupervisorError::Store(e));
        }
        if let Some(stats) = self.store.stats() {
            info!(
                size = stats.size,
                idle = stats.num_idle,
                "database connection pool established"
            );
            emit_pool_stats(stats);
        }

        let requests = install_requests().map_err(|e| {
            error!(phase = "startup", error = %e, "failed to install signal handlers");
            SupervisorError::Signals(e)
        })?;

        let bind = self.config.bind();
        let bind_failed = |source: io::Error| {
            error!(phase = "startup", addr = %bind, error = %source, "failed to bind listener");
            SupervisorError::Bind {
                addr: bind.clone(),
                source,
            }
        };
        let listener: Box<dyn Acceptor> = match self.listener {
            Some(listener) => listener,
            None => Box::new(TcpListener::bind(&bind).await.map_err(bind_failed)?),
        };

        let shutdown = CancellationToken::new();
        let app = self.app.merge(probe_routes(shutdown.clone()));
        let service = Arc::new(
            RunningService::from_listener(listener, app, shutdown)
                .map_err(bind_failed)?
                .with_timeouts(self.timeouts),
        );

        let completion = SignalListener::new(requests, service.clone(), self.tasks.clone())
            .with_drain_deadline(self.drain_deadline)
            .with_background_drain_ceiling(self.config.background_drain_timeout.map(|d| d.0))
            .spawn();

        let addr = service.local_addr();
        info!(addr = %addr, env = %self.config.env, "starting server");

        // Pool statistics are published for as long as the listener serves.
        let served = tokio::select! {
            served = service.serve() => served,
            _ = report_pool_stats(&self.store, POOL_STATS_INTERVAL) => Ok(()),
        };
        if let Err(e) = served {
            error!(phase = "serve", addr = %addr, error = %e, "listener failed");
            return Err(SupervisorError::Serve(e));
        }

        let outcome = completion.wait().await;
        // Both drains are over, nothing can use the store anymore.
        self.store.close().await;

        match outcome {
            Ok(()) => {
                info!(addr = %addr, "stopped server");
                Ok(())
            }
            Err(e) => {
                error!(phase = "shutdown", addr = %addr, error = %e, "shutdown failed");
                Err(SupervisorError::Shutdown(e))
            }
        }
    }
}

fn probe_routes(shutdown: CancellationToken) -> Router {
    let readiness = ReadinessHandler::new(shutdown);
    let liveness = LivenessHandler::new();

    Router::new()
        .route(
            "/_readiness",
            get(move || {
                let readiness = readiness.clone();
                async move { readiness.check().await }
            }),
        )
        .route("/_liveness", get(move || ready(liveness.check())))
}
