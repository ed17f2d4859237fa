//! Sources of operator-initiated termination requests.

use async_trait::async_trait;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

/// Yields termination requests by name. `None` means the source is exhausted and no further
/// request will ever arrive.
#[async_trait]
pub trait TerminationRequests: Send + 'static {
    async fn recv(&mut self) -> Option<String>;
}

/// SIGINT and SIGTERM. Handlers are installed eagerly so a signal delivered before the
/// listener starts waiting is not lost.
pub struct OsSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl OsSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }
}

#[async_trait]
impl TerminationRequests for OsSignals {
    async fn recv(&mut self) -> Option<String> {
        tokio::select! {
            Some(()) = self.interrupt.recv() => Some("SIGINT".to_string()),
            Some(()) = self.terminate.recv() => Some("SIGTERM".to_string()),
            else => None,
        }
    }
}

/// In-process requests, used by tests and by embedders that trigger shutdown themselves.
#[async_trait]
impl TerminationRequests for mpsc::Receiver<String> {
    async fn recv(&mut self) -> Option<String> {
        mpsc::Receiver::recv(self).await
    }
}
