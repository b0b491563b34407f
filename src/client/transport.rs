//! Session layer used by the connection manager.
//!
//! A `Transport` opens sessions; a `Session` carries calls and reports its
//! own end exactly once through a single callback slot.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ClientError, TransportError};
use crate::protocol::{Method, RemoteError, Reply, Request, ServerMessage, MAX_LINE_BYTES};

/// How a session ended, from the client's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The service announced an orderly close.
    Closed,
    /// The session vanished without notice.
    Died(String),
}

pub type SessionEndCallback = Box<dyn FnOnce(SessionEnd) + Send + 'static>;

pub trait Session: Send + Sync + 'static {
    fn call(&self, method: Method) -> impl Future<Output = Result<Reply, ClientError>> + Send;

    /// Register the end-of-session callback. Fires at most once; if the
    /// session already ended it fires immediately.
    fn on_session_end(&self, callback: SessionEndCallback);

    /// Local, orderly close. Does not fire the end callback.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    fn request_connect(&self) -> impl Future<Output = Result<Self::Session, TransportError>> + Send;
}

// ── End-of-session slot ─────────────────────────────────────

#[derive(Default)]
struct EndSlotState {
    callback: Option<SessionEndCallback>,
    ended: Option<SessionEnd>,
    fired: bool,
}

/// Single callback slot with at-most-once delivery, independent of whether
/// the end or the registration happens first.
#[derive(Default)]
pub struct SessionEndSlot {
    state: Mutex<EndSlotState>,
}

impl SessionEndSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EndSlotState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Replaces any callback registered earlier.
    pub fn register(&self, callback: SessionEndCallback) {
        let ready = {
            let mut state = self.lock();
            if state.fired {
                return;
            }
            match state.ended.clone() {
                Some(end) => {
                    state.fired = true;
                    Some(end)
                }
                None => {
                    state.callback = Some(callback);
                    return;
                }
            }
        };
        if let Some(end) = ready {
            callback(end);
        }
    }

    /// Record the end. The first call wins; later ones are ignored.
    pub fn fire(&self, end: SessionEnd) {
        let callback = {
            let mut state = self.lock();
            if state.fired || state.ended.is_some() {
                return;
            }
            state.ended = Some(end.clone());
            match state.callback.take() {
                Some(cb) => {
                    state.fired = true;
                    cb
                }
                None => return,
            }
        };
        callback(end);
    }

    /// Mark the slot spent without delivering anything.
    pub fn disarm(&self) {
        let mut state = self.lock();
        state.fired = true;
        state.callback = None;
    }

    pub fn has_ended(&self) -> bool {
        self.lock().ended.is_some()
    }
}

// ── Unix socket transport ───────────────────────────────────

#[derive(Debug, Clone)]
pub struct UnixTransport {
    socket_path: PathBuf,
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl UnixTransport {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self::from_config(&ClientConfig {
            socket_path: socket_path.into(),
            ..ClientConfig::default()
        })
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }
}

impl Transport for UnixTransport {
    type Session = UnixSession;

    async fn request_connect(&self) -> Result<UnixSession, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout.as_millis() as u64))?
            .map_err(TransportError::Connect)?;
        Ok(UnixSession::start(stream, self.call_timeout))
    }
}

type Pending = HashMap<u64, oneshot::Sender<Result<Reply, RemoteError>>>;

struct SessionShared {
    id: Uuid,
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    open: AtomicBool,
    end: SessionEndSlot,
    stop_reader: CancellationToken,
    call_timeout: Duration,
}

impl SessionShared {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Close the door, then wake every waiter with a dropped sender.
    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.pending().clear();
    }
}

/// Session over a connected Unix socket. A reader task routes responses to
/// waiting callers by request id and watches for the end of the stream.
pub struct UnixSession {
    shared: Arc<SessionShared>,
}

impl UnixSession {
    pub fn start(stream: UnixStream, call_timeout: Duration) -> Self {
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(SessionShared {
            id: Uuid::new_v4(),
            writer: tokio::sync::Mutex::new(FramedWrite::new(write_half, LinesCodec::new())),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            open: AtomicBool::new(true),
            end: SessionEndSlot::new(),
            stop_reader: CancellationToken::new(),
            call_timeout,
        });
        let lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        tokio::spawn(read_loop(shared.clone(), lines));
        info!(session = %shared.id, "session established");
        Self { shared }
    }
}

async fn read_loop(shared: Arc<SessionShared>, mut lines: FramedRead<OwnedReadHalf, LinesCodec>) {
    let end = loop {
        let next = tokio::select! {
            _ = shared.stop_reader.cancelled() => break None,
            next = lines.next() => next,
        };
        match next {
            Some(Ok(line)) => match serde_json::from_str::<ServerMessage>(&line) {
                Ok(ServerMessage::Response { id, outcome }) => {
                    let waiter = shared.pending().remove(&id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(outcome);
                        }
                        None => debug!(session = %shared.id, id, "response for abandoned call"),
                    }
                }
                Ok(ServerMessage::Closing { reason }) => {
                    info!(session = %shared.id, %reason, "service closed the session");
                    break Some(SessionEnd::Closed);
                }
                Err(e) => {
                    warn!(session = %shared.id, error = %e, "undecodable message from service");
                    break Some(SessionEnd::Died(format!("protocol violation: {e}")));
                }
            },
            Some(Err(e)) => break Some(SessionEnd::Died(format!("read failed: {e}"))),
            None => break Some(SessionEnd::Died("connection lost".to_string())),
        }
    };

    shared.shut();
    if let Some(end) = end {
        if let SessionEnd::Died(reason) = &end {
            warn!(session = %shared.id, %reason, "session died");
        }
        shared.end.fire(end);
    }
}

impl Session for UnixSession {
    async fn call(&self, method: Method) -> Result<Reply, ClientError> {
        let shared = &self.shared;
        if !shared.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed.into());
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        shared.pending().insert(id, tx);
        // The reader may have shut down between the check and the insert.
        if !shared.open.load(Ordering::SeqCst) {
            shared.pending().remove(&id);
            return Err(TransportError::Closed.into());
        }

        let line = serde_json::to_string(&Request { id, method })
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let exchange = async {
            shared.writer.lock().await.send(line).await?;
            let outcome = rx.await.map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>(outcome)
        };
        let result = match tokio::time::timeout(shared.call_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(shared.call_timeout.as_millis() as u64)),
        };

        match result {
            Ok(outcome) => outcome.map_err(ClientError::from),
            Err(e) => {
                shared.pending().remove(&id);
                Err(e.into())
            }
        }
    }

    fn on_session_end(&self, callback: SessionEndCallback) {
        self.shared.end.register(callback);
    }

    async fn close(&self) {
        let shared = &self.shared;
        shared.end.disarm();
        shared.stop_reader.cancel();
        shared.shut();
        let mut writer = shared.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!(session = %shared.id, error = %e, "shutdown after close");
        }
        info!(session = %shared.id, "session closed");
    }
}
