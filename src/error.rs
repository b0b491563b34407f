use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the trust boundary rejected a caller.
/// The two variants stay distinct so audit logs can tell them apart.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthError {
    #[error("access denied: caller lacks the required capability")]
    PermissionDenied,
    #[error("access denied: caller identity does not match the service trust domain")]
    IdentityMismatch,
}

/// Failures of the session layer itself.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("session closed")]
    Closed,
}

/// Everything a client-side operation can fail with.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("not connected to the telemetry service")]
    NotConnected,

    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    #[error("remote fault: {0}")]
    RemoteFault(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl ClientError {
    /// Authorization failures are per call; the session is still usable.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ClientError::TransportFailure(_))
    }
}
