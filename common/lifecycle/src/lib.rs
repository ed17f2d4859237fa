//! Process lifecycle for HTTP services: background work accounting, termination request
//! sources, a listener with bounded connection drain, the signal listener that runs the
//! shutdown sequence, and K8s readiness/liveness probes.
//!
//! Ordering of a shutdown: new connections are refused before background work is drained,
//! and the outcome is handed over exactly once after both drains have finished.

mod error;
mod liveness;
mod metrics;
mod readiness;
mod server;
mod shutdown;
mod signals;
mod tasks;

pub use error::LifecycleError;
pub use liveness::{LivenessHandler, LivenessStatus};
pub use readiness::ReadinessHandler;
pub use server::{
    Acceptor, ConnectionTimeouts, RunningService, IDLE_TIMEOUT, READ_TIMEOUT, WRITE_TIMEOUT,
};
pub use shutdown::{
    CompletionSignal, ListenerState, ShutdownOutcome, SignalListener, SHUTDOWN_DRAIN_DEADLINE,
};
pub use signals::{OsSignals, TerminationRequests};
pub use tasks::{BackgroundTasks, TaskGuard};
