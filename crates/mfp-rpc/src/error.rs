//! Error types for the MFP request pipe.
//!
//! Errors raised at the call site of a proxy. Server-side failures never cross
//! the process boundary as live errors; they travel as a status code plus
//! diagnostic text and are turned back into one of these variants locally.

use std::time::Duration;
use thiserror::Error;

use crate::request::{PeerId, RequestState, RpcId, Status};

/// Main error type for the request pipe and object proxies.
#[derive(Debug, Error)]
pub enum RpcError {
    // Object lifecycle errors
    #[error("Class not found: {class}")]
    ClassNotFound { class: String },

    #[error("Method not found: {method} (rpcid {rpcid})")]
    MethodNotFound { method: String, rpcid: RpcId },

    /// The remote method body failed. `traceback` is the remote diagnostic,
    /// carried verbatim.
    #[error("Remote method {method} failed:\n{traceback}")]
    MethodFailed { method: String, traceback: String },

    // Transport errors
    #[error("Peer {peer_id} is gone")]
    PeerLost { peer_id: PeerId },

    #[error("No peer is managed for id {peer_id}")]
    UnknownPeer { peer_id: PeerId },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Protocol errors
    #[error("Invalid request state transition: {from:?} -> {to:?}")]
    InvalidState { from: RequestState, to: RequestState },

    #[error("Response already attached to request {request_id:?}")]
    ResponseAlreadySet { request_id: Option<u64> },

    #[error("Unexpected response status {status:?} for {method}")]
    UnexpectedStatus { method: String, status: Status },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for request pipe operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Map to the status code a dispatcher would answer with.
    ///
    /// - `NO_CLASS` (-1): class lookup failed
    /// - `NO_METHOD` (-2): method or target object missing
    /// - `METHOD_FAILED` (-3): everything else
    pub fn to_status_code(&self) -> i64 {
        match self {
            RpcError::ClassNotFound { .. } => Status::NO_CLASS,
            RpcError::MethodNotFound { .. } => Status::NO_METHOD,
            _ => Status::METHOD_FAILED,
        }
    }

    /// True when the failure came from losing the peer rather than from the call.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            RpcError::PeerLost { .. }
                | RpcError::UnknownPeer { .. }
                | RpcError::Timeout(_)
                | RpcError::Io { .. }
        )
    }
}
