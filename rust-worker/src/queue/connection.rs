//! RabbitMQ connection manager.
//!
//! Owns the connection and channel, declares the exchange/queue/binding
//! topology, hands out the consumption handle and tears everything down on
//! shutdown.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::{ConnectError, ShutdownError};
use crate::shutdown::{DrainGate, DrainSignal, Teardown};

const NORMAL_SHUTDOWN: u16 = 200;

/// Lifecycle of the broker connection.
///
/// Moves forward only. `ShuttingDown` can be entered from any state that is
/// not already shutting down or closed, and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    TopologyReady,
    Consuming,
    ShuttingDown,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Closed, _) | (ShuttingDown, ShuttingDown) => false,
            (_, ShuttingDown) => true,
            (Disconnected, Connected)
            | (Connected, TopologyReady)
            | (TopologyReady, Consuming)
            | (ShuttingDown, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::TopologyReady => "topology_ready",
            ConnectionState::Consuming => "consuming",
            ConnectionState::ShuttingDown => "shutting_down",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Map a configured exchange type to the lapin kind.
pub fn exchange_kind(exchange_type: &str) -> ExchangeKind {
    match exchange_type.to_ascii_lowercase().as_str() {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        _ => ExchangeKind::Custom(exchange_type.to_string()),
    }
}

/// Read-only view of the consumer handed to the delivery loop.
///
/// Deliveries are auto-acknowledged by the broker on receipt, so a message
/// that is received but never sent is lost (at-most-once).
pub struct ConsumptionHandle {
    deliveries: BoxStream<'static, Result<Vec<u8>, lapin::Error>>,
    cancel: CancellationToken,
    drained: DrainSignal,
}

impl ConsumptionHandle {
    pub fn new(
        deliveries: BoxStream<'static, Result<Vec<u8>, lapin::Error>>,
        cancel: CancellationToken,
        drained: DrainSignal,
    ) -> Self {
        Self {
            deliveries,
            cancel,
            drained,
        }
    }

    /// Split into the payload stream, the stop token and the completion signal.
    pub fn into_parts(
        self,
    ) -> (
        BoxStream<'static, Result<Vec<u8>, lapin::Error>>,
        CancellationToken,
        DrainSignal,
    ) {
        (self.deliveries, self.cancel, self.drained)
    }
}

/// Broker calls made while tearing a connection down.
#[async_trait]
trait BrokerLink: Send + Sync {
    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), lapin::Error>;
    async fn close_channel(&self, reason: &str) -> Result<(), lapin::Error>;
    async fn close_connection(&self, reason: &str) -> Result<(), lapin::Error>;
}

struct LapinLink {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerLink for LapinLink {
    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), lapin::Error> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
    }

    async fn close_channel(&self, reason: &str) -> Result<(), lapin::Error> {
        self.channel.close(NORMAL_SHUTDOWN, reason).await
    }

    async fn close_connection(&self, reason: &str) -> Result<(), lapin::Error> {
        self.connection.close(NORMAL_SHUTDOWN, reason).await
    }
}

/// Lifecycle state and the teardown sequence for one broker link.
struct Session<L> {
    link: L,
    state: Mutex<ConnectionState>,
    consumer_tag: Mutex<Option<String>>,
    cancel: CancellationToken,
    gate: DrainGate,
}

impl<L: BrokerLink> Session<L> {
    fn new(link: L) -> Self {
        Self {
            link,
            state: Mutex::new(ConnectionState::Connected),
            consumer_tag: Mutex::new(None),
            cancel: CancellationToken::new(),
            gate: DrainGate::new(),
        }
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn transition(&self, next: ConnectionState) {
        let mut current = lock(&self.state);
        if current.can_transition_to(next) {
            debug!(from = %*current, to = %next, "rabbitmq_state_changed");
            *current = next;
        }
    }

    /// Record the active consumer and hand out the loop's stop token and
    /// drain signal.
    async fn consuming(&self, consumer_tag: &str) -> (CancellationToken, DrainSignal) {
        *lock(&self.consumer_tag) = Some(consumer_tag.to_string());
        self.transition(ConnectionState::Consuming);

        let drained = self.gate.arm().await;
        (self.cancel.child_token(), drained)
    }

    async fn shutdown(&self) -> Result<(), ShutdownError> {
        if !self.gate.begin() {
            debug!("rabbitmq_shutdown_already_in_progress");
            return Ok(());
        }

        self.transition(ConnectionState::ShuttingDown);
        info!("rabbitmq_shutdown_started");

        // Stop the loop before the broker closes its stream, so a closed
        // stream always means the broker dropped us.
        self.cancel.cancel();

        let consumer_tag = lock(&self.consumer_tag).take();
        if let Some(tag) = consumer_tag {
            if let Err(e) = self.link.cancel_consumer(&tag).await {
                error!(consumer_tag = %tag, error = %e, "rabbitmq_consumer_cancel_failed");
            }
        }

        if let Err(e) = self.link.close_channel("Normal shutdown").await {
            error!(error = %e, "rabbitmq_channel_close_error");
        }

        if let Err(e) = self.link.close_connection("Normal shutdown").await {
            error!(error = %e, "rabbitmq_connection_close_error");
        }

        info!("rabbitmq_shutdown_ok");

        self.gate.wait_drained().await?;
        self.transition(ConnectionState::Closed);

        info!("rabbitmq_closed");
        Ok(())
    }

    /// Close handles after a failed topology declaration.
    async fn abort(&self) {
        self.gate.begin();
        self.transition(ConnectionState::ShuttingDown);

        if let Err(e) = self.link.close_channel("Topology setup failed").await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }
        if let Err(e) = self.link.close_connection("Topology setup failed").await {
            error!(error = %e, "rabbitmq_connection_close_error");
        }

        self.transition(ConnectionState::Closed);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of the broker connection and channel.
pub struct ConnectionManager {
    config: BrokerConfig,
    channel: Channel,
    session: Session<LapinLink>,
}

impl ConnectionManager {
    /// Connect to the broker and declare the exchange, queue and binding.
    ///
    /// On failure, any connection opened here is closed before returning.
    pub async fn connect(config: BrokerConfig) -> Result<Self, ConnectError> {
        info!(
            url_length = config.url.len(),
            connection_name = %config.consumer_tag,
            "rabbitmq_connecting"
        );

        let properties = ConnectionProperties::default()
            .with_connection_name(config.consumer_tag.clone().into());

        let connection = Connection::connect(&config.url, properties)
            .await
            .map_err(ConnectError::Dial)?;

        info!("rabbitmq_connected");

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let closed = connection.close(NORMAL_SHUTDOWN, "Channel open failed").await;
                if let Err(close_err) = closed {
                    error!(error = %close_err, "rabbitmq_connection_close_error");
                }
                return Err(ConnectError::Channel(e));
            }
        };

        info!("rabbitmq_channel_created");

        let manager = Self {
            config,
            channel: channel.clone(),
            session: Session::new(LapinLink {
                connection,
                channel,
            }),
        };

        if let Err(e) = manager.declare_topology().await {
            error!(error = %e, "rabbitmq_topology_failed");
            manager.session.abort().await;
            return Err(e);
        }

        Ok(manager)
    }

    /// Declare exchange, then queue, then binding. Stops at the first failure.
    async fn declare_topology(&self) -> Result<(), ConnectError> {
        let config = &self.config;

        self.channel
            .exchange_declare(
                &config.exchange,
                exchange_kind(&config.exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| ConnectError::ExchangeDeclare {
                exchange: config.exchange.clone(),
                source,
            })?;

        info!(
            exchange = %config.exchange,
            exchange_type = %config.exchange_type,
            "rabbitmq_exchange_declared"
        );

        let queue = self
            .channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| ConnectError::QueueDeclare {
                queue: config.queue.clone(),
                source,
            })?;

        let queue_name = queue.name().as_str();
        info!(
            queue = queue_name,
            messages = queue.message_count(),
            "rabbitmq_queue_declared"
        );

        self.channel
            .queue_bind(
                queue_name,
                &config.exchange,
                &config.binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| ConnectError::QueueBind {
                queue: queue_name.to_string(),
                exchange: config.exchange.clone(),
                key: config.binding_key.clone(),
                source,
            })?;

        info!(
            queue = queue_name,
            exchange = %config.exchange,
            binding_key = %config.binding_key,
            "rabbitmq_queue_bound"
        );

        self.session.transition(ConnectionState::TopologyReady);
        Ok(())
    }

    /// Register as an auto-ack consumer on `queue`.
    pub async fn start_consuming(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<ConsumptionHandle, ConnectError> {
        let current = self.state();
        if current != ConnectionState::TopologyReady {
            return Err(ConnectError::InvalidState(current));
        }

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| ConnectError::Consume {
                queue: queue.to_string(),
                source,
            })?;

        let (cancel, drained) = self.session.consuming(consumer_tag).await;

        info!(queue = queue, consumer_tag = consumer_tag, "rabbitmq_consumer_started");

        let deliveries = consumer
            .map(|delivery| {
                delivery.map(|delivery| {
                    debug!(delivery_tag = delivery.delivery_tag, "rabbitmq_delivery_received");
                    delivery.data
                })
            })
            .boxed();

        Ok(ConsumptionHandle::new(deliveries, cancel, drained))
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Stop the delivery loop, cancel the consumer, close channel and
    /// connection, then wait for the loop to drain.
    ///
    /// Idempotent: calls after the first return `Ok(())` immediately without
    /// touching the broker. Individual cancel/close failures are logged and
    /// the remaining steps still run.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.session.shutdown().await
    }
}

#[async_trait]
impl Teardown for ConnectionManager {
    async fn shutdown(&self) -> Result<(), ShutdownError> {
        ConnectionManager::shutdown(self).await
    }
}
