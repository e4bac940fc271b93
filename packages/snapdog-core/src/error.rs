//! Centralized error types for the SnapDog integration core.
//!
//! Every public operation in this crate returns [`SnapDogResult`]. Component-local
//! error types (`RpcError`, `MqttError`, `KnxError`) convert into [`SnapDogError`]
//! via `From` so call sites can propagate with `?` regardless of which subsystem
//! raised the failure.

use thiserror::Error;

use crate::knx::KnxError;
use crate::mqtt::MqttError;
use crate::snapcast::rpc::RpcError;

/// Machine-readable error code, stable across releases, for structured logging
/// and for any external collaborator (HTTP layer, metrics) that wants to key on it.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

/// Application-wide error taxonomy (SPEC_FULL.md §7).
#[derive(Debug, Error)]
pub enum SnapDogError {
    /// Connect refused, read/write error, timeout — recoverable by reconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame, unknown notification — log and drop, never fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Out-of-range value, unknown entity, unknown command.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing zone/client/group/stream.
    #[error("not found: {0}")]
    NotFound(String),

    /// Port in use at startup — critical, triggers shutdown.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Cooperative cancellation. Not logged as an error.
    #[error("cancelled")]
    Cancelled,

    /// Programmer error; surfaced to the caller, logged with context.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorCode for SnapDogError {
    fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<RpcError> for SnapDogError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Transport(msg) => Self::Transport(msg),
            RpcError::Protocol(msg) => Self::Protocol(msg),
            RpcError::Timeout => Self::Transport("request timed out".into()),
            RpcError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<MqttError> for SnapDogError {
    fn from(err: MqttError) -> Self {
        match err {
            MqttError::Connect(msg) => Self::Transport(msg),
            MqttError::Publish(msg) => Self::Transport(msg),
        }
    }
}

impl From<KnxError> for SnapDogError {
    fn from(err: KnxError) -> Self {
        match err {
            KnxError::Socket(msg) => Self::Transport(msg),
            KnxError::Frame(msg) => Self::Protocol(msg),
        }
    }
}

/// Crate-wide result alias.
pub type SnapDogResult<T> = Result<T, SnapDogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_has_stable_code() {
        let err = SnapDogError::Validation("volume out of range".into());
        assert_eq!(err.code(), "validation");
    }

    #[test]
    fn cancelled_has_no_payload() {
        let err = SnapDogError::Cancelled;
        assert_eq!(err.code(), "cancelled");
        assert_eq!(err.to_string(), "cancelled");
    }

    #[test]
    fn rpc_timeout_maps_to_transport() {
        let err: SnapDogError = RpcError::Timeout.into();
        assert_eq!(err.code(), "transport");
    }
}
