//! Error types for each stage of the worker.
//!
//! Startup errors (`ConfigError`, `ConnectError`) are fatal and bubble up to
//! `main`. Per-message errors (`DecodeError`, `MailError`) never leave the
//! delivery loop.

use std::path::PathBuf;

use thiserror::Error;

use crate::queue::ConnectionState;

/// Boxed error used where the underlying transport error type is opaque.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure to load the YAML configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode YAML from config file {}: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        source: serde_yaml_ng::Error,
    },
}

/// Failure while connecting to the broker or declaring topology.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("dial: {0}")]
    Dial(#[source] lapin::Error),

    #[error("channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("exchange declare {exchange}: {source}")]
    ExchangeDeclare {
        exchange: String,
        source: lapin::Error,
    },

    #[error("queue declare {queue}: {source}")]
    QueueDeclare { queue: String, source: lapin::Error },

    #[error("queue bind {queue} to {exchange} with key {key:?}: {source}")]
    QueueBind {
        queue: String,
        exchange: String,
        key: String,
        source: lapin::Error,
    },

    #[error("queue consume {queue}: {source}")]
    Consume { queue: String, source: lapin::Error },

    #[error("cannot start consuming while connection is {0}")]
    InvalidState(ConnectionState),
}

/// A broker payload that cannot become an `EmailRequest`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("error decoding JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("email request has an empty recipient")]
    MissingRecipient,
}

/// Failure reported by the mail transport.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid {field} address {value:?}: {source}")]
    Address {
        field: &'static str,
        value: String,
        source: lettre::address::AddressError,
    },

    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("failed to configure SMTP relay {host}: {source}")]
    Relay {
        host: String,
        source: lettre::transport::smtp::Error,
    },

    #[error("smtp send failed: {0}")]
    Transport(#[source] BoxError),
}

/// Failure of the overall shutdown sequence.
///
/// Individual cancel/close failures are only logged; these variants are the
/// ones that make shutdown fatal.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("delivery loop exited without signalling completion")]
    LoopAborted,

    #[error("shutdown listener task failed: {0}")]
    Listener(#[from] tokio::task::JoinError),
}
