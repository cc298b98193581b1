//! Mail dispatch worker - RabbitMQ consumer that forwards email requests to SMTP.
//!
//! ## Architecture
//!
//! ```text
//! exchange → queue → ConnectionManager → delivery loop → Mailer (SMTP)
//!                          ↑
//!             ShutdownCoordinator (SIGINT/SIGTERM)
//! ```
//!
//! Messages are auto-acknowledged on receipt, so delivery is at-most-once:
//! a failed decode or send drops the message.

pub mod config;
pub mod delivery;
pub mod error;
pub mod mail;
pub mod queue;
pub mod shutdown;

// Re-export commonly used types
pub use config::Config;
pub use error::{ConfigError, ConnectError, DecodeError, MailError, ShutdownError};
pub use mail::{Mailer, SmtpMailer};
pub use queue::{ConnectionManager, ConnectionState, ConsumptionHandle, EmailRequest};
pub use shutdown::{DrainGate, DrainSignal, ShutdownCoordinator, Teardown};
