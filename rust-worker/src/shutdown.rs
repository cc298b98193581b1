//! Graceful shutdown coordination.
//!
//! The coordinator waits for SIGINT/SIGTERM (or an explicit stop request),
//! then runs the teardown of its target exactly once. The [`DrainGate`] makes
//! a teardown idempotent and lets it wait for the delivery loop to finish.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::{
    signal,
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::ShutdownError;

/// Something that can be torn down once the worker is told to stop.
#[async_trait]
pub trait Teardown: Send + Sync {
    async fn shutdown(&self) -> Result<(), ShutdownError>;
}

/// Once-only shutdown latch paired with a completion channel from the
/// delivery loop.
#[derive(Debug, Default)]
pub struct DrainGate {
    started: AtomicBool,
    drained: Mutex<Option<oneshot::Receiver<()>>>,
}

/// Handed to the delivery loop; completing it unblocks [`DrainGate::wait_drained`].
///
/// Dropping it without calling [`DrainSignal::complete`] makes the wait fail
/// with [`ShutdownError::LoopAborted`].
#[derive(Debug)]
pub struct DrainSignal {
    tx: oneshot::Sender<()>,
}

impl DrainSignal {
    pub fn complete(self) {
        // The receiver is gone only if nobody is waiting, which is fine.
        let _ = self.tx.send(());
    }
}

impl DrainGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the completion channel for a new delivery loop.
    pub async fn arm(&self) -> DrainSignal {
        let (tx, rx) = oneshot::channel();
        *self.drained.lock().await = Some(rx);
        DrainSignal { tx }
    }

    /// Returns `true` for the first caller only.
    pub fn begin(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    /// Wait for the armed delivery loop to signal completion.
    ///
    /// Returns immediately when no loop was ever armed.
    pub async fn wait_drained(&self) -> Result<(), ShutdownError> {
        let drained = self.drained.lock().await.take();

        match drained {
            Some(rx) => rx.await.map_err(|_| ShutdownError::LoopAborted),
            None => Ok(()),
        }
    }
}

/// Background listener that triggers teardown on signal or stop request.
pub struct ShutdownCoordinator {
    stop: CancellationToken,
    task: JoinHandle<Result<(), ShutdownError>>,
}

impl ShutdownCoordinator {
    /// Register for SIGINT/SIGTERM and tear `target` down when one arrives.
    pub fn install<T>(target: Arc<T>) -> Self
    where
        T: Teardown + ?Sized + 'static,
    {
        Self::install_with(target, termination_signal())
    }

    /// Like [`ShutdownCoordinator::install`] with a custom trigger future.
    pub fn install_with<T, F>(target: Arc<T>, trigger: F) -> Self
    where
        T: Teardown + ?Sized + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let requested = stop.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = trigger => {}
                _ = requested.cancelled() => info!("shutdown_requested"),
            }

            info!("worker_stopping");
            target.shutdown().await
        });

        Self { stop, task }
    }

    /// Token that requests a stop when cancelled. Cheap to clone into tasks.
    pub fn stopper(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Wait until the teardown has run and return its outcome.
    pub async fn wait(self) -> Result<(), ShutdownError> {
        self.task.await?
    }
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "sigint_handler_install_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_install_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
