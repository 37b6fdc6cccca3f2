//! Error types and reconnect classification.
//!
//! Every failure the crate reports, whether returned to a caller or handed
//! to the error sink, is an [`enum@Error`]. The classifier methods decide
//! which failures mean the connection itself is gone.

use std::{io, sync::Arc};

use mongodb::error::ErrorKind;
use thiserror::Error;

use crate::operation::Operation;

/// Errors that can occur when using a [`crate::ResilientClient`].
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Opening or using the connection timed out.
    #[error("Connection timed out: {0}")]
    Timeout(String),

    /// An error raised by the MongoDB driver.
    #[error("MongoDB error: {0}")]
    Driver(Arc<mongodb::error::Error>),

    /// A driver-level failure known only by its message.
    #[error("Database error: {0}")]
    Database(String),

    /// No live connection is available. The last connect sequence failed
    /// or the client was destroyed while connecting.
    #[error("Connection unavailable")]
    Unavailable,

    /// A name passed to `to_wrap` does not match any known operation.
    #[error("Unknown operation '{0}'")]
    UnknownOperation(String),

    /// The operation exists but was not enabled for this client.
    #[error("Operation '{0}' is not enabled for this client")]
    NotAllowed(Operation),

    /// The client configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Returns `true` for connection-timeout-class failures.
    ///
    /// These are the only failures retried while establishing a connection.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Driver(err) => match err.kind.as_ref() {
                ErrorKind::ServerSelection { .. } => true,
                ErrorKind::Io(io_err) => io_err.kind() == io::ErrorKind::TimedOut,
                _ => false,
            },
            _ => false,
        }
    }

    /// Returns `true` if the failure means the connection is lost and a
    /// reconnect should be attempted.
    ///
    /// Reconnectable failures are timeouts and topology-lost errors, i.e. the
    /// driver reports the topology as destroyed or closed. Everything else is
    /// an application-level error.
    pub fn is_reconnectable(&self) -> bool {
        if self.is_timeout() {
            return true;
        }
        match self {
            Error::Unavailable => true,
            Error::Database(message) => is_topology_lost(message),
            Error::Driver(err) => {
                matches!(err.kind.as_ref(), ErrorKind::Shutdown) || is_topology_lost(&err.to_string())
            }
            _ => false,
        }
    }
}

impl From<mongodb::error::Error> for Error {
    fn from(err: mongodb::error::Error) -> Self {
        Error::Driver(Arc::new(err))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(err.to_string())
    }
}

/// Messages the driver uses once its topology can no longer serve requests.
const TOPOLOGY_LOST_MESSAGES: [&str; 2] = ["topology was destroyed", "topology is closed, please connect"];

fn is_topology_lost(message: &str) -> bool {
    let message = message.to_lowercase();
    TOPOLOGY_LOST_MESSAGES.iter().any(|pattern| message.contains(pattern))
}
