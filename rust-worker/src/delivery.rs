//! Delivery loop.
//!
//! Pulls payloads off the consumption handle one at a time, decodes each into
//! an [`EmailRequest`] and hands it to the [`Mailer`]. Decode and send
//! failures are logged and the loop moves on; nothing is retried.

use std::{fmt::Display, sync::Arc};

use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::mail::Mailer;
use crate::queue::{ConsumptionHandle, EmailRequest};

/// Per-message result of [`dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    DecodeFailed,
    SendFailed,
}

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub received: u64,
    pub sent: u64,
    pub decode_failed: u64,
    pub send_failed: u64,
    pub delivery_errors: u64,
    /// The broker closed the stream without a stop request.
    pub stream_ended: bool,
}

impl LoopStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::DecodeFailed => self.decode_failed += 1,
            Outcome::SendFailed => self.send_failed += 1,
        }
    }
}

/// Run the delivery loop for `handle` as a background task.
///
/// The task signals the handle's drain channel when it exits, which is what
/// unblocks the connection manager's shutdown.
pub fn spawn<M>(handle: ConsumptionHandle, mailer: Arc<M>) -> JoinHandle<LoopStats>
where
    M: Mailer + ?Sized + 'static,
{
    tokio::spawn(async move {
        let (deliveries, cancel, drained) = handle.into_parts();

        info!("delivery_loop_started");
        let stats = run(deliveries, mailer.as_ref(), &cancel).await;

        info!(
            received = stats.received,
            sent = stats.sent,
            decode_failed = stats.decode_failed,
            send_failed = stats.send_failed,
            delivery_errors = stats.delivery_errors,
            stream_ended = stats.stream_ended,
            "delivery_loop_exited"
        );

        drained.complete();
        stats
    })
}

/// Watch the delivery task and request a stop once it exits.
///
/// Resolves to `true` when the loop ended without being asked to, either
/// because the broker closed the consumer or because the task panicked.
pub fn supervise(worker: JoinHandle<LoopStats>, stop: CancellationToken) -> JoinHandle<bool> {
    tokio::spawn(async move {
        let unexpected = match worker.await {
            Ok(stats) => stats.stream_ended,
            Err(e) => {
                error!(error = %e, "delivery_loop_panicked");
                true
            }
        };

        if unexpected {
            warn!("delivery_loop_ended_without_shutdown");
        }

        stop.cancel();
        unexpected
    })
}

/// Consume `deliveries` until the stream ends or `cancel` fires.
///
/// Sends are awaited inline, so dispatch order matches arrival order and a
/// hung send holds up the whole loop.
pub async fn run<S, E, M>(deliveries: S, mailer: &M, cancel: &CancellationToken) -> LoopStats
where
    S: Stream<Item = Result<Vec<u8>, E>>,
    E: Display,
    M: Mailer + ?Sized,
{
    futures::pin_mut!(deliveries);
    let mut stats = LoopStats::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("delivery_loop_cancelled");
                break;
            }
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(payload)) => {
                stats.received += 1;
                let outcome = dispatch(&payload, mailer).await;
                stats.record(outcome);
            }
            Some(Err(e)) => {
                stats.delivery_errors += 1;
                error!(error = %e, "rabbitmq_delivery_error");
            }
            None => {
                // Shutdown cancels first, so reaching here means the broker
                // dropped the consumer.
                warn!("rabbitmq_consumer_closed");
                stats.stream_ended = true;
                break;
            }
        }
    }

    stats
}

/// Decode one payload and send it.
pub async fn dispatch<M>(payload: &[u8], mailer: &M) -> Outcome
where
    M: Mailer + ?Sized,
{
    let request = match EmailRequest::decode(payload) {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, payload_length = payload.len(), "email_request_decode_failed");
            return Outcome::DecodeFailed;
        }
    };

    match mailer.send(&request.to, &request.subject, &request.body).await {
        Ok(()) => {
            info!(to = %request.to, "email_sent");
            Outcome::Sent
        }
        Err(e) => {
            error!(to = %request.to, error = %e, "email_send_failed");
            Outcome::SendFailed
        }
    }
}
