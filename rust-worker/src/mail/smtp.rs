//! SMTP mailer built on lettre.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, AsyncSmtpTransportBuilder},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, error};

use super::Mailer;
use crate::config::{SmtpConfig, SmtpTls};
use crate::error::MailError;

/// Mailer that relays through the configured SMTP server.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    host: String,
}

impl SmtpMailer {
    /// Build the transport. No connection is made until the first send.
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let sender = parse_mailbox("sender", &config.sender)?;

        let mut builder = Self::builder(config)?.port(config.port);

        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        debug!(
            host = %config.host,
            port = config.port,
            tls = ?config.tls,
            has_credentials = !config.username.is_empty(),
            "smtp_transport_built"
        );

        Ok(Self {
            transport: builder.build(),
            sender,
            host: config.host.clone(),
        })
    }

    fn builder(config: &SmtpConfig) -> Result<AsyncSmtpTransportBuilder, MailError> {
        let relay_error = |source: lettre::transport::smtp::Error| MailError::Relay {
            host: config.host.clone(),
            source,
        };

        match config.tls {
            SmtpTls::None => Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
                &config.host,
            )),
            SmtpTls::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                    .map_err(relay_error)
            }
            SmtpTls::Wrapper => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host).map_err(relay_error)
            }
        }
    }

    /// Build the plain-text message for one request.
    pub fn build_message(&self, to: &str, subject: &str, body: &str) -> Result<Message, MailError> {
        let to = parse_mailbox("to", to)?;

        let message = Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;

        Ok(message)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        debug!(from = %self.sender, to = %to, host = %self.host, "smtp_sending");

        let message = self.build_message(to, subject, body)?;

        self.transport.send(message).await.map_err(|e| {
            error!(to = %to, error = %e, "smtp_send_failed");
            MailError::Transport(Box::new(e))
        })?;

        debug!(to = %to, "smtp_sent");
        Ok(())
    }
}

fn parse_mailbox(field: &'static str, value: &str) -> Result<Mailbox, MailError> {
    value.parse().map_err(|source| MailError::Address {
        field,
        value: value.to_string(),
        source,
    })
}
