//! End-to-end tests of the delivery loop and shutdown drain, using an
//! in-memory delivery stream in place of the broker.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use tokio_util::sync::CancellationToken;

use dispatch::{
    delivery, ConsumptionHandle, DrainGate, MailError, Mailer, ShutdownCoordinator,
    ShutdownError, Teardown,
};

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<String>>,
}

impl RecordingMailer {
    fn recipients(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, _subject: &str, _body: &str) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(to.to_string());
        if to.starts_with("reject") {
            return Err(MailError::Transport("550 mailbox unavailable".into()));
        }
        Ok(())
    }
}

/// Stands in for the connection manager: same gate, cancel and close order.
struct FakeBroker {
    gate: DrainGate,
    cancel: CancellationToken,
    closes: AtomicUsize,
}

impl FakeBroker {
    fn new() -> Self {
        Self {
            gate: DrainGate::new(),
            cancel: CancellationToken::new(),
            closes: AtomicUsize::new(0),
        }
    }

    async fn consume(
        &self,
    ) -> (
        mpsc::UnboundedSender<Result<Vec<u8>, lapin::Error>>,
        ConsumptionHandle,
    ) {
        let (tx, rx) = mpsc::unbounded();
        let drained = self.gate.arm().await;
        let handle = ConsumptionHandle::new(rx.boxed(), self.cancel.child_token(), drained);
        (tx, handle)
    }
}

#[async_trait]
impl Teardown for FakeBroker {
    async fn shutdown(&self) -> Result<(), ShutdownError> {
        if !self.gate.begin() {
            return Ok(());
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        self.gate.wait_drained().await
    }
}

fn request(to: &str) -> Result<Vec<u8>, lapin::Error> {
    Ok(format!(r#"{{"to":"{to}","subject":"Hi","body":"Hello"}}"#).into_bytes())
}

#[tokio::test]
async fn test_loop_processes_until_stream_ends() {
    let broker = FakeBroker::new();
    let mailer = Arc::new(RecordingMailer::default());
    let (tx, handle) = broker.consume().await;

    let worker = delivery::spawn(handle, Arc::clone(&mailer));

    tx.unbounded_send(request("a@x.com")).unwrap();
    tx.unbounded_send(Ok(br#"{"to":"a@x.com","subject":"Hi""#.to_vec())).unwrap();
    tx.unbounded_send(request("reject@x.com")).unwrap();
    tx.unbounded_send(request("b@x.com")).unwrap();
    drop(tx);

    broker.gate.wait_drained().await.unwrap();
    let stats = worker.await.unwrap();

    assert_eq!(stats.received, 4);
    assert_eq!(stats.sent, 2);
    assert_eq!(stats.decode_failed, 1);
    assert_eq!(stats.send_failed, 1);
    assert_eq!(mailer.recipients(), vec!["a@x.com", "reject@x.com", "b@x.com"]);
}

#[tokio::test]
async fn test_no_sends_after_shutdown_returns() {
    let broker = Arc::new(FakeBroker::new());
    let mailer = Arc::new(RecordingMailer::default());
    let (tx, handle) = broker.consume().await;

    let worker = delivery::spawn(handle, Arc::clone(&mailer));

    broker.shutdown().await.unwrap();
    worker.await.unwrap();

    // The loop dropped its receiver, so nothing more can be delivered.
    assert!(tx.unbounded_send(request("late@x.com")).is_err());
    assert!(mailer.recipients().is_empty());
}

#[tokio::test]
async fn test_concurrent_shutdown_runs_one_teardown() {
    let broker = Arc::new(FakeBroker::new());
    let mailer = Arc::new(RecordingMailer::default());
    let (_tx, handle) = broker.consume().await;
    let _worker = delivery::spawn(handle, mailer);

    let first = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.shutdown().await }
    });
    let second = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.shutdown().await }
    });

    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    assert_eq!(broker.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_coordinator_drains_loop_on_stop_request() {
    let broker = Arc::new(FakeBroker::new());
    let mailer = Arc::new(RecordingMailer::default());
    let (tx, handle) = broker.consume().await;
    let worker = delivery::spawn(handle, Arc::clone(&mailer));

    let coordinator =
        ShutdownCoordinator::install_with(Arc::clone(&broker), std::future::pending());

    tx.unbounded_send(request("a@x.com")).unwrap();
    while mailer.recipients().is_empty() {
        tokio::task::yield_now().await;
    }

    coordinator.request_stop();
    coordinator.wait().await.unwrap();

    assert!(worker.await.is_ok());
    assert_eq!(broker.closes.load(Ordering::SeqCst), 1);
    assert_eq!(mailer.recipients(), vec!["a@x.com"]);
}

#[tokio::test]
async fn test_broker_closing_consumer_is_reported_and_stops() {
    let broker = Arc::new(FakeBroker::new());
    let mailer = Arc::new(RecordingMailer::default());
    let (tx, handle) = broker.consume().await;
    let worker = delivery::spawn(handle, Arc::clone(&mailer));

    let coordinator =
        ShutdownCoordinator::install_with(Arc::clone(&broker), std::future::pending());
    let supervisor = delivery::supervise(worker, coordinator.stopper());

    tx.unbounded_send(request("a@x.com")).unwrap();
    drop(tx);

    coordinator.wait().await.unwrap();

    assert!(supervisor.await.unwrap());
    assert_eq!(broker.closes.load(Ordering::SeqCst), 1);
    assert_eq!(mailer.recipients(), vec!["a@x.com"]);
}

#[tokio::test]
async fn test_requested_stop_is_not_reported() {
    let broker = Arc::new(FakeBroker::new());
    let mailer = Arc::new(RecordingMailer::default());
    let (_tx, handle) = broker.consume().await;
    let worker = delivery::spawn(handle, mailer);

    let coordinator =
        ShutdownCoordinator::install_with(Arc::clone(&broker), std::future::pending());
    let supervisor = delivery::supervise(worker, coordinator.stopper());

    coordinator.request_stop();
    coordinator.wait().await.unwrap();

    assert!(!supervisor.await.unwrap());
    assert_eq!(broker.closes.load(Ordering::SeqCst), 1);
}
