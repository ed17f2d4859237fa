//! Lifecycle error types returned by the listener and the shutdown sequence.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`RunningService`](crate::RunningService) and delivered as the
/// [`ShutdownOutcome`](crate::ShutdownOutcome).
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The listener socket failed while accepting connections.
    #[error("listener failed to accept connections: {0}")]
    Accept(#[source] std::io::Error),

    /// `serve` was called on a service whose listener is already serving or was closed.
    #[error("listener is already serving or has been closed")]
    AlreadyServing,

    /// In-flight requests did not finish before the drain deadline and were terminated.
    #[error("in-flight requests did not drain within {deadline:?}, {remaining} connection(s) terminated")]
    DrainTimeout { deadline: Duration, remaining: usize },

    /// A second termination request cut the in-flight drain short.
    #[error("shutdown escalated by a second termination request, {remaining} connection(s) terminated")]
    Terminated { remaining: usize },

    /// Background work was still outstanding when the configured drain ceiling elapsed.
    #[error("background work did not drain within {ceiling:?}, {outstanding} task(s) outstanding")]
    BackgroundDrainTimeout {
        ceiling: Duration,
        outstanding: usize,
    },

    /// The signal listener task ended without delivering an outcome.
    #[error("signal listener task panicked")]
    SignalListenerPanicked,
}
