//! Error taxonomy shared across the engine

use thiserror::Error;

/// Coarse error kind surfaced through the transport → manager → decoder
/// path. Richer diagnostics stay in [`TransportError`] and are logged at
/// the layer that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InterfaceError {
    #[error("request timed out")]
    Timeout,
}

/// Transport-level failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("adapter rejected the exchange")]
    AdapterError,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport not supported: {0}")]
    Unsupported(String),
}
