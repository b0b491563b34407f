//! Wire format between `telemd` and its clients.
//!
//! Transport: Unix domain socket, one JSON object per line.

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, ClientError};
use crate::snapshot::CounterSnapshot;

/// Lines longer than this (1 MiB) are a protocol violation.
pub const MAX_LINE_BYTES: usize = 1_048_576;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    GetCurrentStats,
    IsServiceReady,
    ResetStats,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::GetCurrentStats => "get_current_stats",
            Method::IsServiceReady => "is_service_ready",
            Method::ResetStats => "reset_stats",
        }
    }
}

/// Client -> daemon.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: u64,
    pub method: Method,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Stats(CounterSnapshot),
    Ready(bool),
    Reset,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum RemoteError {
    PermissionDenied,
    IdentityMismatch,
    Fault(String),
}

impl From<AuthError> for RemoteError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::PermissionDenied => RemoteError::PermissionDenied,
            AuthError::IdentityMismatch => RemoteError::IdentityMismatch,
        }
    }
}

impl From<RemoteError> for ClientError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::PermissionDenied => ClientError::Auth(AuthError::PermissionDenied),
            RemoteError::IdentityMismatch => ClientError::Auth(AuthError::IdentityMismatch),
            RemoteError::Fault(msg) => ClientError::RemoteFault(msg),
        }
    }
}

/// Daemon -> client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    Response {
        id: u64,
        outcome: Result<Reply, RemoteError>,
    },
    /// Orderly shutdown notice; the connection closes right after it.
    Closing { reason: String },
}

impl ServerMessage {
    pub fn ok(id: u64, reply: Reply) -> Self {
        ServerMessage::Response {
            id,
            outcome: Ok(reply),
        }
    }

    pub fn err(id: u64, error: RemoteError) -> Self {
        ServerMessage::Response {
            id,
            outcome: Err(error),
        }
    }
}

/// Best-effort recovery of the request id from a line that failed to decode,
/// so the fault can still be correlated by the caller.
pub fn salvage_request_id(line: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    value.get("id")?.as_u64()
}
