use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use axum::{Router, routing::get};
use tokio::{net::TcpStream, sync::Notify};
use tokio_util::task::TaskTracker;

async fn listener() -> (tokio::net::TcpListener, SocketAddr) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn wait_until_refused(addr: SocketAddr) {
    for _ in 0..200 {
        if TcpStream::connect(addr).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("listener at {} still accepting after shutdown", addr);
}

#[tokio::test]
async fn test_listener_closes_before_runs_drain() {
    let (listener, addr) = listener().await;
    let app = Router::new().route("/", get(|| async { "ok" }));

    let tracker = TaskTracker::new();
    let release = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));
    tracker.spawn({
        let release = release.clone();
        let finished = finished.clone();
        async move {
            release.notified().await;
            finished.store(true, Ordering::SeqCst);
        }
    });

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(crate::serve(
        listener,
        app,
        async {
            stop_rx.await.ok();
        },
        tracker,
        Duration::from_secs(5),
    ));

    assert!(TcpStream::connect(addr).await.is_ok());
    stop_tx.send(()).unwrap();

    // The run is still blocked, yet new connections are already refused.
    wait_until_refused(addr).await;
    assert!(!finished.load(Ordering::SeqCst));
    assert!(!server.is_finished());

    release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_drain_is_bounded() {
    let (listener, _) = listener().await;
    let tracker = TaskTracker::new();
    tracker.spawn(std::future::pending::<()>());

    tokio::time::timeout(
        Duration::from_secs(5),
        crate::serve(
            listener,
            Router::new(),
            async {},
            tracker,
            Duration::from_millis(50),
        ),
    )
    .await
    .unwrap()
    .unwrap();
}
