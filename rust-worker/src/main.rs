//! Mail Dispatch Worker - consumes email requests from RabbitMQ and sends
//! them over SMTP until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dispatch::{delivery, Config, ConnectionManager, Mailer, ShutdownCoordinator, SmtpMailer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    let config = Config::from_env().context("Config error")?;
    info!(
        exchange = %config.rabbitmq.exchange,
        exchange_type = %config.rabbitmq.exchange_type,
        queue = %config.rabbitmq.queue,
        binding_key = %config.rabbitmq.binding_key,
        smtp_host = %config.smtp.host,
        smtp_port = config.smtp.port,
        "config_loaded"
    );

    let mailer: Arc<dyn Mailer> =
        Arc::new(SmtpMailer::new(&config.smtp).context("Failed to build SMTP transport")?);

    let manager = ConnectionManager::connect(config.rabbitmq.clone())
        .await
        .context("Error starting RabbitMQ consumer")?;
    let manager = Arc::new(manager);

    let consumption = manager
        .start_consuming(&config.rabbitmq.queue, &config.rabbitmq.consumer_tag)
        .await
        .context("queue Consume error")?;

    let coordinator = ShutdownCoordinator::install(Arc::clone(&manager));
    let worker = delivery::spawn(consumption, mailer);

    // If the broker ends the stream on its own, tear down the same way a
    // signal would, then report it as a failure.
    let supervisor = delivery::supervise(worker, coordinator.stopper());

    info!("worker_ready");

    if let Err(e) = coordinator.wait().await {
        error!(error = %e, "shutdown_failed");
        return Err(e).context("Shutdown failed");
    }

    let ended_unexpectedly = supervisor.await.context("Delivery supervisor failed")?;
    if ended_unexpectedly {
        error!(state = %manager.state(), "worker_stopped_unexpectedly");
        anyhow::bail!("delivery loop ended without a shutdown request");
    }

    info!("worker_shutdown_complete");
    Ok(())
}
