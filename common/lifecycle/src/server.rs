//! The live listener: accept loop, per-connection timeouts and the bounded connection drain.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};

use crate::error::LifecycleError;
use crate::metrics;

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Bounds on how long a single connection may go without progress.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    /// Keep-alive connection with no request in flight.
    pub idle: Duration,
    /// Receiving a request head, counted from its first byte.
    pub read: Duration,
    /// Producing the response; exceeded requests get a 408.
    pub write: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            idle: IDLE_TIMEOUT,
            read: READ_TIMEOUT,
            write: WRITE_TIMEOUT,
        }
    }
}

/// Source of accepted connections for [`RunningService`].
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

#[async_trait]
impl<A: Acceptor + ?Sized> Acceptor for Box<A> {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        (**self).accept().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

/// A listener bound to an address together with the request pipeline it serves.
///
/// `serve` runs the accept loop until `shutdown` is called from another task. Shutdown stops
/// accepting immediately, closes the socket so new connections are refused, and waits for
/// in-flight requests up to a deadline before terminating whatever is left.
pub struct RunningService {
    listener: Mutex<Option<Box<dyn Acceptor>>>,
    local_addr: SocketAddr,
    app: Router,
    timeouts: ConnectionTimeouts,
    shutdown: CancellationToken,
    terminate: CancellationToken,
    connections: TaskTracker,
}

impl RunningService {
    /// `shutdown` is shared with anything that must observe the start of the drain, such as
    /// the readiness probe.
    pub fn from_listener(
        listener: impl Acceptor,
        app: Router,
        shutdown: CancellationToken,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(Box::new(listener))),
            local_addr,
            app,
            timeouts: ConnectionTimeouts::default(),
            shutdown,
            terminate: CancellationToken::new(),
            connections: TaskTracker::new(),
        })
    }

    pub fn with_timeouts(mut self, timeouts: ConnectionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    fn take_listener(&self) -> Option<Box<dyn Acceptor>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Runs the accept loop. Returns `Ok(())` once the listener was closed by `shutdown`; any
    /// other return is a failure of the listener itself.
    pub async fn serve(&self) -> Result<(), LifecycleError> {
        let Some(listener) = self.take_listener() else {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            return Err(LifecycleError::AlreadyServing);
        };

        let app = self
            .app
            .clone()
            .layer(TimeoutLayer::new(self.timeouts.write))
            .layer(CatchPanicLayer::custom(panic_response));

        let mut backoff = ACCEPT_BACKOFF_MIN;
        loop {
            let accepted = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, remote_addr) = match accepted {
                Ok(conn) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    conn
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "dropped connection during accept");
                    continue;
                }
                Err(e) if is_temporary(&e) => {
                    warn!(
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "accept failed, retrying"
                    );
                    tokio::select! {
                        biased;

                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
                Err(e) => {
                    self.connections.close();
                    return Err(LifecycleError::Accept(e));
                }
            };

            self.connections.spawn(serve_connection(
                stream,
                remote_addr,
                app.clone(),
                self.timeouts,
                self.shutdown.clone(),
                self.terminate.clone(),
            ));
        }

        drop(listener);
        self.connections.close();
        debug!(addr = %self.local_addr, "listener closed");
        Ok(())
    }

    /// Stops accepting and drains connections.
    ///
    /// Connections still serving a request when `deadline` elapses are terminated and
    /// [`LifecycleError::DrainTimeout`] is returned. A call to [`terminate`](Self::terminate)
    /// while waiting does the same immediately and yields [`LifecycleError::Terminated`].
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), LifecycleError> {
        self.shutdown.cancel();
        if let Some(listener) = self.take_listener() {
            // Shutdown before serve ever ran, nothing else will close the socket.
            drop(listener);
            self.connections.close();
        }

        let started = Instant::now();
        tokio::select! {
            biased;

            _ = self.connections.wait() => {
                metrics::emit_drain_duration("connections", "completed", started.elapsed().as_secs_f64());
                Ok(())
            }
            _ = self.terminate.cancelled() => {
                let remaining = self.connections.len();
                self.connections.wait().await;
                metrics::emit_drain_duration("connections", "terminated", started.elapsed().as_secs_f64());
                Err(LifecycleError::Terminated { remaining })
            }
            _ = tokio::time::sleep(deadline) => {
                let remaining = self.connections.len();
                warn!(
                    deadline_secs = deadline.as_secs_f64(),
                    remaining,
                    "in-flight requests did not drain before the deadline, terminating"
                );
                self.terminate.cancel();
                self.connections.wait().await;
                metrics::emit_drain_duration("connections", "timeout", started.elapsed().as_secs_f64());
                Err(LifecycleError::DrainTimeout { deadline, remaining })
            }
        }
    }

    /// Drops every open connection without waiting for its response.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Failures that leave the listener itself intact, such as running out of descriptors or
/// buffers. Accepting again can succeed once connections have been released.
fn is_temporary(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    ) || matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic payload"
    };
    error!(panic = details, "request handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONNECTION, "close")],
        Json(json!({
            "error": "the server encountered a problem and could not process your request"
        })),
    )
        .into_response()
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    app: Router,
    timeouts: ConnectionTimeouts,
    shutdown: CancellationToken,
    terminate: CancellationToken,
) {
    let activity = Arc::new(ConnectionActivity::default());

    let service = {
        let activity = activity.clone();
        hyper::service::service_fn(move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(ConnectInfo(remote_addr));
            let busy = activity.begin();
            let app = app.clone();
            async move {
                let response = app.oneshot(req.map(Body::new)).await;
                drop(busy);
                response
            }
        })
    };

    let io = ActivityIo {
        stream,
        activity: activity.clone(),
    };
    let conn = http1::Builder::new().serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut closing = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(remote_addr = %remote_addr, error = %e, "connection closed with error");
                }
                break;
            }
            _ = terminate.cancelled() => {
                metrics::emit_connection_terminated();
                info!(remote_addr = %remote_addr, "terminated connection");
                break;
            }
            _ = activity.head_overdue(timeouts.read) => {
                debug!(remote_addr = %remote_addr, "request head not received in time");
                break;
            }
            _ = shutdown.cancelled(), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = activity.idle_for(timeouts.idle), if !closing => {
                debug!(remote_addr = %remote_addr, "closing idle connection");
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Requests in flight on one connection, and when the head of the next one started to
/// arrive. Tells an idle keep-alive connection apart from one slowly sending a request or
/// slowly producing a response.
#[derive(Default)]
struct ConnectionActivity {
    in_flight: AtomicUsize,
    head_started: Mutex<Option<Instant>>,
    changed: Notify,
}

impl ConnectionActivity {
    fn begin(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        *self.head_slot() = None;
        self.changed.notify_waiters();
        InFlight {
            activity: self.clone(),
        }
    }

    /// Bytes arrived on the connection. With no request in flight they belong to the head
    /// of the next request, which starts its read deadline.
    fn received(&self) {
        if self.in_flight.load(Ordering::Acquire) > 0 {
            return;
        }
        let mut started = self.head_slot();
        if started.is_none() {
            *started = Some(Instant::now());
            drop(started);
            self.changed.notify_waiters();
        }
    }

    fn head_slot(&self) -> MutexGuard<'_, Option<Instant>> {
        self.head_started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves after `idle` has passed with no request in flight or arriving.
    async fn idle_for(&self, idle: Duration) {
        loop {
            let changed = self.changed.notified();
            let busy = self.in_flight.load(Ordering::Acquire) > 0 || self.head_slot().is_some();
            if busy {
                changed.await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(idle) => return,
                _ = changed => {}
            }
        }
    }

    /// Resolves once a request head has been arriving for longer than `read`.
    async fn head_overdue(&self, read: Duration) {
        loop {
            let changed = self.changed.notified();
            let started = *self.head_slot();
            match started {
                Some(started) => tokio::select! {
                    _ = tokio::time::sleep_until(started + read) => return,
                    _ = changed => {}
                },
                None => changed.await,
            }
        }
    }
}

struct InFlight {
    activity: Arc<ConnectionActivity>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.activity.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.activity.changed.notify_waiters();
    }
}

/// The accepted stream, reporting every read to the connection's activity.
struct ActivityIo {
    stream: TcpStream,
    activity: Arc<ConnectionActivity>,
}

impl AsyncRead for ActivityIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.stream).poll_read(cx, buf);
        if matches!(polled, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            self.activity.received();
        }
        polled
    }
}

impl AsyncWrite for ActivityIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
