//! Configuration module.
//!
//! Reads the YAML config file, then applies environment overrides for the
//! broker URL and the SMTP credentials.

use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::info;

use crate::error::ConfigError;

/// Config file used when `CONFIG_PATH` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yml";

/// Env var naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// Overrides `rabbitmq.url`.
pub const RABBITMQ_URL_ENV: &str = "RABBITMQ_URL";

/// Overrides both `smtp.username` and `smtp.sender`.
pub const SMTP_USER_ENV: &str = "SMTP_USER";

/// Overrides `smtp.password`.
pub const SMTP_PASSWORD_ENV: &str = "SMTP_PASSWORD";

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub rabbitmq: BrokerConfig,
    pub smtp: SmtpConfig,
}

/// Broker connection and topology settings.
#[derive(Clone, Deserialize)]
pub struct BrokerConfig {
    /// AMQP URL, may embed credentials
    pub url: String,

    /// Exchange to declare and bind the queue to
    pub exchange: String,

    /// Exchange type understood by the broker (direct, fanout, topic, headers, ...)
    pub exchange_type: String,

    /// Durable queue the worker consumes from
    pub queue: String,

    /// Consumer tag, also sent as the connection name
    pub consumer_tag: String,

    /// Binding key between queue and exchange. Empty binds everything.
    #[serde(default)]
    pub binding_key: String,
}

/// Outbound SMTP settings.
#[derive(Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,

    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Address used in the `From` header
    pub sender: String,

    #[serde(default)]
    pub tls: SmtpTls,
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// Plaintext, for local relays such as Mailpit
    None,
    /// Upgrade with STARTTLS (usually port 587)
    #[default]
    Starttls,
    /// Implicit TLS from the first byte (usually port 465)
    Wrapper,
}

impl Config {
    /// Load the config file named by `CONFIG_PATH` (or the default path) and
    /// apply environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = Self::load(&path)?;
        config.apply_env(|name| env::var(name).ok());

        info!(path = %path.display(), "config_file_loaded");
        Ok(config)
    }

    /// Load and parse a YAML config file without applying overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml_ng::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides using `lookup` to read variables.
    ///
    /// Variables that are absent leave the file values untouched.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(RABBITMQ_URL_ENV) {
            self.rabbitmq.url = url;
        }

        if let Some(user) = lookup(SMTP_USER_ENV) {
            self.smtp.username = user.clone();
            self.smtp.sender = user;
        }

        if let Some(password) = lookup(SMTP_PASSWORD_ENV) {
            self.smtp.password = password;
        }
    }
}

// Hand-written so that broker credentials and SMTP passwords stay out of logs.
impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("url_length", &self.url.len())
            .field("exchange", &self.exchange)
            .field("exchange_type", &self.exchange_type)
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .field("binding_key", &self.binding_key)
            .finish()
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password_set", &!self.password.is_empty())
            .field("sender", &self.sender)
            .field("tls", &self.tls)
            .finish()
    }
}
