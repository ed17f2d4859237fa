use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use catalog_api::error::SupervisorError;
use catalog_api::router::{router, AppState};
use catalog_api::supervisor::Supervisor;
use common_database::StoreError;
use lifecycle::{BackgroundTasks, LifecycleError};
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

pub mod common;
use common::*;

struct Running {
    base: String,
    signals: mpsc::Sender<String>,
    supervisor: JoinHandle<Result<(), SupervisorError>>,
    closed: Arc<AtomicBool>,
    tasks: BackgroundTasks,
}

async fn start(
    notifier: Arc<RecordingNotifier>,
    extra: Router,
    drain_deadline: Duration,
) -> Running {
    let port = reserve_port();
    let config = Arc::new(test_config(&[("BIND_PORT", &port.to_string())]));
    let tasks = BackgroundTasks::new();
    let store = MockStore::new(tasks.clone());
    let closed = store.closed.clone();

    let app = router(AppState {
        config: config.clone(),
        tasks: tasks.clone(),
        notifier,
    })
    .expect("failed to build router")
    .merge(extra);

    let (tx, rx) = mpsc::channel(4);
    let supervisor = tokio::spawn(
        Supervisor::new(config, store, app, tasks.clone())
            .with_drain_deadline(drain_deadline)
            .run(move || Ok(rx)),
    );

    let base = format!("http://127.0.0.1:{port}");
    let healthcheck = format!("{base}/v1/healthcheck");
    assert_or_retry(|| {
        let url = healthcheck.clone();
        async move { matches!(reqwest::get(url).await, Ok(r) if r.status() == StatusCode::OK) }
    })
    .await;

    Running {
        base,
        signals: tx,
        supervisor,
        closed,
        tasks,
    }
}

async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn termination_request_leads_to_clean_exit() {
    let running = start(
        Arc::new(RecordingNotifier::default()),
        Router::new(),
        Duration::from_secs(20),
    )
    .await;

    let readiness = reqwest::get(format!("{}/_readiness", running.base))
        .await
        .expect("readiness request failed");
    assert_eq!(readiness.status(), StatusCode::OK);

    running
        .signals
        .send("SIGTERM".to_string())
        .await
        .expect("signal listener gone");

    within(running.supervisor)
        .await
        .expect("supervisor panicked")
        .expect("clean shutdown should exit successfully");
    assert!(running.closed.load(Ordering::SeqCst));
    assert!(reqwest::get(format!("{}/v1/healthcheck", running.base))
        .await
        .is_err());
}

#[tokio::test]
async fn stuck_request_makes_the_exit_unclean() {
    let entered = Arc::new(Notify::new());
    let held = {
        let entered = entered.clone();
        Router::new().route(
            "/held",
            get(move || {
                let entered = entered.clone();
                async move {
                    entered.notify_one();
                    std::future::pending::<()>().await;
                }
            }),
        )
    };
    let running = start(
        Arc::new(RecordingNotifier::default()),
        held,
        Duration::from_millis(200),
    )
    .await;

    let url = format!("{}/held", running.base);
    let stuck = tokio::spawn(async move { reqwest::get(url).await });
    within(entered.notified()).await;

    running
        .signals
        .send("SIGINT".to_string())
        .await
        .expect("signal listener gone");

    let result = within(running.supervisor).await.expect("supervisor panicked");
    assert!(matches!(
        result,
        Err(SupervisorError::Shutdown(LifecycleError::DrainTimeout { .. }))
    ));
    // Background drain and store close still happened.
    assert!(running.closed.load(Ordering::SeqCst));
    assert!(within(stuck).await.expect("client panicked").is_err());
}

#[tokio::test]
async fn store_is_closed_only_after_background_work_drains() {
    let gate = Arc::new(Notify::new());
    let notifier = Arc::new(RecordingNotifier {
        gate: Some(gate.clone()),
        ..RecordingNotifier::default()
    });
    let running = start(notifier.clone(), Router::new(), Duration::from_secs(20)).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/notifications", running.base))
        .json(&json!({
            "recipient": "alice@example.com",
            "subject": "Welcome",
            "body": "Thanks for signing up"
        }))
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(running.tasks.outstanding(), 1);

    running
        .signals
        .send("SIGTERM".to_string())
        .await
        .expect("signal listener gone");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!running.supervisor.is_finished());
    assert!(!running.closed.load(Ordering::SeqCst));

    gate.notify_one();
    within(running.supervisor)
        .await
        .expect("supervisor panicked")
        .expect("clean shutdown should exit successfully");
    assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
    assert!(running.closed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn slow_store_never_starts_the_listener() {
    let tasks = BackgroundTasks::new();
    let mut store = MockStore::new(tasks.clone());
    store.latency = Duration::from_secs(6);
    let closed = store.closed.clone();
    let installed = Arc::new(AtomicBool::new(false));

    let result = {
        let installed = installed.clone();
        Supervisor::new(Arc::new(test_config(&[])), store, Router::new(), tasks)
            .run(move || {
                installed.store(true, Ordering::SeqCst);
                Ok(mpsc::channel::<String>(1).1)
            })
            .await
    };

    assert!(matches!(
        result,
        Err(SupervisorError::Store(StoreError::ProbeTimeout(_)))
    ));
    assert!(!installed.load(Ordering::SeqCst));
    assert!(!closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unreachable_store_is_fatal() {
    let tasks = BackgroundTasks::new();
    let mut store = MockStore::new(tasks.clone());
    store.reachable = false;

    let result = Supervisor::new(Arc::new(test_config(&[])), store, Router::new(), tasks)
        .run(|| Ok(mpsc::channel::<String>(1).1))
        .await;

    assert!(matches!(
        result,
        Err(SupervisorError::Store(StoreError::Connection(_)))
    ));
}

#[tokio::test]
async fn listener_failure_is_fatal_without_waiting_for_shutdown() {
    let tasks = BackgroundTasks::new();
    let store = MockStore::new(tasks.clone());
    let closed = store.closed.clone();
    // Held open so no termination request can ever arrive.
    let (_signals, rx) = mpsc::channel::<String>(1);

    let result = within(
        Supervisor::new(Arc::new(test_config(&[])), store, Router::new(), tasks)
            .with_listener(BrokenListener)
            .run(move || Ok(rx)),
    )
    .await;

    assert!(matches!(
        result,
        Err(SupervisorError::Serve(LifecycleError::Accept(_)))
    ));
    assert!(!closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn port_in_use_is_fatal() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let port = taken.local_addr().expect("no local addr").port();
    let tasks = BackgroundTasks::new();

    let result = Supervisor::new(
        Arc::new(test_config(&[("BIND_PORT", &port.to_string())])),
        MockStore::new(tasks.clone()),
        Router::new(),
        tasks,
    )
    .run(|| Ok(mpsc::channel::<String>(1).1))
    .await;

    assert!(matches!(result, Err(SupervisorError::Bind { .. })));
}
