#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catalog_api::config::ServiceConfig;
use catalog_api::notify::{Notification, Notifier, NotifyError};
use common_database::Store;
use envconfig::Envconfig;
use lifecycle::{Acceptor, BackgroundTasks};
use tokio::sync::Notify;

/// Build a config from defaults plus `overrides`. Metrics export is off unless asked for, the
/// prometheus recorder is process global.
pub fn test_config(overrides: &[(&str, &str)]) -> ServiceConfig {
    let mut env: HashMap<String, String> = HashMap::from([
        ("BIND_HOST".to_owned(), "127.0.0.1".to_owned()),
        ("EXPORT_PROMETHEUS".to_owned(), "false".to_owned()),
    ]);
    for (key, value) in overrides {
        env.insert((*key).to_owned(), (*value).to_owned());
    }
    ServiceConfig::init_from_hashmap(&env).expect("invalid test config")
}

/// Find a free port. The listener is dropped, so the port is only very likely to still be
/// free when the supervisor binds it.
pub fn reserve_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("failed to bind")
        .local_addr()
        .expect("no local addr")
        .port()
}

/// Poll `check` until it passes or the attempts run out.
pub async fn assert_or_retry<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition was never met");
}

/// A backing store that answers pings after `latency` and refuses to be closed while
/// background work is still outstanding.
pub struct MockStore {
    pub latency: Duration,
    pub reachable: bool,
    pub tasks: BackgroundTasks,
    pub closed: Arc<AtomicBool>,
}

impl MockStore {
    pub fn new(tasks: BackgroundTasks) -> Self {
        Self {
            latency: Duration::ZERO,
            reachable: true,
            tasks,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Store for MockStore {
    async fn ping(&self) -> Result<(), sqlx::Error> {
        tokio::time::sleep(self.latency).await;
        if self.reachable {
            Ok(())
        } else {
            Err(sqlx::Error::PoolTimedOut)
        }
    }

    async fn close(&self) {
        assert_eq!(
            self.tasks.outstanding(),
            0,
            "store closed while background work is outstanding"
        );
        assert!(
            !self.closed.swap(true, Ordering::SeqCst),
            "store closed twice"
        );
    }
}

/// Counts deliveries. With a gate, every send waits until the gate is opened.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: AtomicUsize,
    pub gate: Option<Arc<Notify>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A listener whose socket has gone bad: every accept fails for good.
pub struct BrokenListener;

#[async_trait]
impl Acceptor for BrokenListener {
    async fn accept(&self) -> io::Result<(tokio::net::TcpStream, SocketAddr)> {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket is not listening",
        ))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 9)))
    }
}
