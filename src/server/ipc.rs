//! Socket front end of the service.
//!
//! One task per connection. The caller identity comes from the kernel's
//! peer credentials, never from anything the client sends.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::protocol::{salvage_request_id, RemoteError, Request, ServerMessage, MAX_LINE_BYTES};

use super::service::TelemetryService;
use super::trust::{CallerIdentity, TrustDomain};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const SHUTDOWN_REASON: &str = "service shutting down";

pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind the socket, replacing a stale socket file left by a previous run.
    /// Refuses to touch anything that is not a socket, or a socket some other
    /// daemon still answers on.
    pub fn bind(socket_path: &Path, mode: u32) -> io::Result<Self> {
        clear_stale_socket(socket_path)?;
        let listener = UnixListener::bind(socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(mode))?;
        }

        info!(path = %socket_path.display(), mode = %format!("{mode:o}"), "listening");
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The daemon's own trust domain: the owner of the socket it just bound.
    pub fn trust_domain(&self) -> io::Result<TrustDomain> {
        TrustDomain::from_path_owner(&self.socket_path)
    }

    /// Accept until `shutdown` fires. Live clients get a `closing` notice
    /// before their connection is dropped.
    pub async fn serve(self, service: Arc<TelemetryService>, shutdown: CancellationToken) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        connections.spawn(handle_connection(stream, service.clone(), shutdown.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "connection task failed");
                    }
                }
            }
        }

        info!(live = connections.len(), "draining connections");
        while connections.join_next().await.is_some() {}
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
            debug!(path = %self.socket_path.display(), "removed socket");
        }
    }
}

async fn send(
    sink: &mut FramedWrite<OwnedWriteHalf, LinesCodec>,
    message: &ServerMessage,
) -> Result<(), TransportError> {
    let line = serde_json::to_string(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
    sink.send(line).await?;
    Ok(())
}

fn clear_stale_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("another daemon is listening on {}", path.display()),
        ));
    }
    info!(path = %path.display(), "removing stale socket");
    std::fs::remove_file(path)
}

async fn handle_connection(
    stream: UnixStream,
    service: Arc<TelemetryService>,
    shutdown: CancellationToken,
) {
    let caller = match stream.peer_cred() {
        Ok(cred) => CallerIdentity {
            uid: cred.uid(),
            pid: cred.pid(),
        },
        Err(e) => {
            warn!(error = %e, "cannot read peer credentials, dropping connection");
            return;
        }
    };
    info!(uid = caller.uid, pid = ?caller.pid, "client connected");

    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut sink = FramedWrite::new(write_half, LinesCodec::new());

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                let notice = ServerMessage::Closing { reason: SHUTDOWN_REASON.to_string() };
                if let Err(e) = send(&mut sink, &notice).await {
                    debug!(uid = caller.uid, error = %e, "closing notice not delivered");
                }
                break;
            }
            next = lines.next() => next,
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(uid = caller.uid, error = %e, "framing error, disconnecting client");
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => service.dispatch(&caller, request),
            Err(e) => match salvage_request_id(&line) {
                Some(id) => ServerMessage::err(id, RemoteError::Fault(format!("malformed request: {e}"))),
                None => {
                    warn!(uid = caller.uid, error = %e, "undecodable request, disconnecting client");
                    break;
                }
            },
        };

        if let Err(e) = send(&mut sink, &reply).await {
            warn!(uid = caller.uid, error = %e, "write failed, disconnecting client");
            break;
        }
    }

    info!(uid = caller.uid, pid = ?caller.pid, "client disconnected");
}
