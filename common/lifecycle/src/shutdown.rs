//! The signal listener: waits for a termination request and runs the shutdown sequence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::LifecycleError;
use crate::metrics;
use crate::server::RunningService;
use crate::signals::TerminationRequests;
use crate::tasks::BackgroundTasks;

/// How long in-flight requests get to finish once shutdown begins.
pub const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(20);

/// Result of the whole shutdown sequence, produced once and read once.
pub type ShutdownOutcome = Result<(), LifecycleError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Waiting,
    ShuttingDown,
    Done,
}

pub struct SignalListener<R> {
    requests: R,
    service: Arc<RunningService>,
    tasks: BackgroundTasks,
    drain_deadline: Duration,
    background_drain_ceiling: Option<Duration>,
    state: watch::Sender<ListenerState>,
}

impl<R: TerminationRequests> SignalListener<R> {
    pub fn new(requests: R, service: Arc<RunningService>, tasks: BackgroundTasks) -> Self {
        let (state, _) = watch::channel(ListenerState::Waiting);
        Self {
            requests,
            service,
            tasks,
            drain_deadline: SHUTDOWN_DRAIN_DEADLINE,
            background_drain_ceiling: None,
            state,
        }
    }

    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }

    /// Bound the background drain. Unset, shutdown waits for background work indefinitely.
    pub fn with_background_drain_ceiling(mut self, ceiling: Option<Duration>) -> Self {
        self.background_drain_ceiling = ceiling;
        self
    }

    /// Run the listener on its own task. The returned signal yields the outcome once the
    /// sequence has finished.
    pub fn spawn(self) -> CompletionSignal {
        let (tx, rx) = oneshot::channel();
        let state = self.state.subscribe();

        tokio::spawn(async move {
            let outcome = self.run().await;
            if tx.send(outcome).is_err() {
                debug!("completion signal dropped before the shutdown outcome was delivered");
            }
        });

        CompletionSignal { rx, state }
    }

    async fn run(mut self) -> ShutdownOutcome {
        let Some(signal) = self.requests.recv().await else {
            // No request can ever arrive, keep serving until the process is stopped otherwise.
            debug!("termination request source closed");
            return std::future::pending().await;
        };

        self.state.send_replace(ListenerState::ShuttingDown);
        metrics::emit_shutdown_initiated(&signal);
        info!(signal = %signal, "shutting down server");

        let drained = self.drain_connections().await;
        if let Err(e) = &drained {
            warn!(error = %e, "in-flight requests were not drained cleanly");
        }

        info!(addr = %self.service.local_addr(), "completing background tasks");
        let background = self.drain_background().await;

        // The connection drain error, if any, takes precedence.
        let outcome = drained.and(background);

        self.state.send_replace(ListenerState::Done);
        metrics::emit_shutdown_completed(outcome.is_ok());
        outcome
    }

    /// A second request while connections are draining terminates them immediately.
    async fn drain_connections(&mut self) -> ShutdownOutcome {
        let service = self.service.clone();
        let shutdown = service.shutdown(self.drain_deadline);
        tokio::pin!(shutdown);

        let mut requests_open = true;
        loop {
            tokio::select! {
                result = &mut shutdown => return result,
                request = self.requests.recv(), if requests_open => match request {
                    Some(signal) => {
                        warn!(
                            signal = %signal,
                            remaining = service.active_connections(),
                            "second termination request, terminating in-flight connections"
                        );
                        service.terminate();
                    }
                    None => requests_open = false,
                },
            }
        }
    }

    /// Requests arriving from here on are logged and ignored.
    async fn drain_background(&mut self) -> ShutdownOutcome {
        let tasks = self.tasks.clone();
        let ceiling = self.background_drain_ceiling;
        let started = tokio::time::Instant::now();

        let wait = async move {
            match ceiling {
                None => {
                    tasks.wait().await;
                    Ok(())
                }
                Some(ceiling) => tokio::time::timeout(ceiling, tasks.wait())
                    .await
                    .map_err(|_| LifecycleError::BackgroundDrainTimeout {
                        ceiling,
                        outstanding: tasks.outstanding(),
                    }),
            }
        };
        tokio::pin!(wait);

        let mut requests_open = true;
        let result = loop {
            tokio::select! {
                result = &mut wait => break result,
                request = self.requests.recv(), if requests_open => match request {
                    Some(signal) => info!(signal = %signal, "shutdown already in progress, ignoring termination request"),
                    None => requests_open = false,
                },
            }
        };

        let label = if result.is_ok() { "completed" } else { "timeout" };
        metrics::emit_drain_duration("background", label, started.elapsed().as_secs_f64());
        result
    }
}

/// Single-slot handoff of the [`ShutdownOutcome`] from the signal listener to its owner.
pub struct CompletionSignal {
    rx: oneshot::Receiver<ShutdownOutcome>,
    state: watch::Receiver<ListenerState>,
}

impl CompletionSignal {
    /// Blocks until the shutdown sequence is done. Consumes the signal, so the outcome can
    /// only be read once.
    pub async fn wait(self) -> ShutdownOutcome {
        self.rx
            .await
            .map_err(|_| LifecycleError::SignalListenerPanicked)?
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }
}
