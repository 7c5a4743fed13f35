//! Crate-wide error type for the broker core.
//!
//! Every request that reaches the router and fails to produce a forward-progress
//! outcome is turned into one of these kinds and carried back to the originator
//! in a RESPONSE payload (see [`crate::message::Message::error_response`]).

use thiserror::Error;

/// Error kinds produced anywhere in the broker core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Malformed frame order or a topic without a service prefix.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// No handler exists for a service at the tree root.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A `rank_forward` envelope could not reach its target rank.
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    /// A send on an overlay endpoint failed.
    #[error("transport error: {0}")]
    TransportError(String),

    /// A named or referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An entity that must be unique already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A request argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The target is mid-operation and cannot service the request yet.
    #[error("busy: {0}")]
    Busy(String),

    /// Data that should be self-consistent was found not to be (treeroot load miss).
    #[error("corruption: {0}")]
    Corruption(String),

    /// The operation was abandoned before it could complete.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl BrokerError {
    /// Stable short name for the error kind, used as the `kind` field of an
    /// error response payload.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ProtocolError(_) => "ProtocolError",
            Self::ServiceUnavailable(_) => "ServiceUnavailable",
            Self::HostUnreachable(_) => "HostUnreachable",
            Self::TransportError(_) => "TransportError",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::Busy(_) => "Busy",
            Self::Corruption(_) => "Corruption",
            Self::Cancelled(_) => "Cancelled",
        }
    }

    /// Reconstructs an error from the `{"error": kind, "message": ...}` shape
    /// produced by [`crate::message::Message::error_response`], e.g. when a
    /// locally-originated upstream call receives an error reply.
    #[must_use]
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "ProtocolError" => Self::ProtocolError(message),
            "ServiceUnavailable" => Self::ServiceUnavailable(message),
            "HostUnreachable" => Self::HostUnreachable(message),
            "TransportError" => Self::TransportError(message),
            "NotFound" => Self::NotFound(message),
            "AlreadyExists" => Self::AlreadyExists(message),
            "InvalidArgument" => Self::InvalidArgument(message),
            "Busy" => Self::Busy(message),
            "Corruption" => Self::Corruption(message),
            "Cancelled" => Self::Cancelled(message),
            other => Self::ProtocolError(format!("unknown error kind {other}: {message}")),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProtocolError(format!("serialization error: {err}"))
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BrokerError>;
