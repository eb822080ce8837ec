//! Crate-level error type
//!
//! Configuration failures are fatal to the call that raised them and carry a
//! human-readable message. Transport failures are transient from the router's
//! point of view: the affected loop logs, counts, and carries on (or triggers
//! a reconnect when the connection has left the `Open` state).

use std::time::Duration;

use thiserror::Error;

/// Error type for channel and connection operations
#[derive(Debug, Error)]
pub enum Error {
    /// The channel configuration is invalid (unknown stream or connection,
    /// duplicate identifier, duplicate input mapping, mutation after start).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An operation was attempted on a connection that is not open.
    #[error("connection '{0}' is not open")]
    NotConnected(String),

    /// The connection was closed while an operation was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// A transmit did not complete within the configured timeout.
    #[error("transmit timed out after {0:?}")]
    TransmitTimeout(Duration),

    /// The peer sent a payload frame the wire codec could not accept.
    #[error("malformed payload frame: {0}")]
    MalformedFrame(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for an [`Error::InvalidConfiguration`] with a formatted message.
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::InvalidConfiguration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
