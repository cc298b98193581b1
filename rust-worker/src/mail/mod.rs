//! Outbound mail transport.
//!
//! The delivery loop only sees the [`Mailer`] trait; [`SmtpMailer`] is the
//! production implementation.

pub mod smtp;

use async_trait::async_trait;

use crate::error::MailError;

pub use smtp::SmtpMailer;

/// Sends a single plain-text email.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}
