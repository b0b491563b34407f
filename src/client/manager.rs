//! Client-side owner of the session to `telemd`.
//!
//! State lives in a `watch` channel so any number of observers can follow it
//! and late subscribers see the current value immediately. Every mutation
//! goes through `ConnectionGraph::transition`.
//!
//! Each connect attempt gets a generation number. Callbacks and call failures
//! that belong to an older generation are ignored, so a session that dies
//! after being replaced can never knock a newer one offline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ClientError, TransportError};
use crate::protocol::{Method, Reply};
use crate::snapshot::CounterSnapshot;

use super::cache::StatsSource;
use super::connection::{ConnectionEvent, ConnectionGraph, ConnectionState};
use super::transport::{Session, SessionEnd, Transport};

struct Live<S> {
    generation: u64,
    session: Arc<S>,
}

struct Shared<T: Transport> {
    transport: T,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Live<T::Session>>>,
    generation: AtomicU64,
    /// Serializes connect and disconnect.
    connect_lock: tokio::sync::Mutex<()>,
}

impl<T: Transport> Shared<T> {
    fn session(&self) -> MutexGuard<'_, Option<Live<T::Session>>> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Apply `event` if the graph allows it and, when `expect` is set, the
    /// generation still matches. With `advance` a successful transition also
    /// starts a new generation. Returns the generation after the step.
    fn apply(&self, event: ConnectionEvent, expect: Option<u64>, advance: bool) -> Option<u64> {
        let mut applied = None;
        self.state.send_if_modified(|state| {
            let current = self.generation.load(Ordering::SeqCst);
            if expect.is_some_and(|g| g != current) {
                debug!(expected = ?expect, current, ?event, "stale connection event ignored");
                return false;
            }
            let Some(next) = ConnectionGraph::transition(state, event) else {
                return false;
            };
            debug!(from = ?state, to = ?next, "connection state");
            *state = next;
            applied = Some(if advance {
                self.generation.fetch_add(1, Ordering::SeqCst) + 1
            } else {
                current
            });
            true
        });
        applied
    }

    fn take_session(&self, generation: u64) -> Option<Live<T::Session>> {
        let mut slot = self.session();
        match slot.as_ref() {
            Some(live) if live.generation == generation => slot.take(),
            _ => None,
        }
    }

    fn session_ended(&self, generation: u64, end: SessionEnd) {
        let event = match end {
            SessionEnd::Closed => ConnectionEvent::SessionClosed,
            SessionEnd::Died(reason) => ConnectionEvent::SessionDied(reason),
        };
        if self.apply(event, Some(generation), true).is_some() {
            self.take_session(generation);
            info!(generation, "session ended");
        }
    }
}

/// Reverts a pending attempt to `Disconnected` if the connect future is
/// dropped before the transport answers.
struct AttemptGuard<'a, T: Transport> {
    shared: &'a Shared<T>,
    generation: u64,
    armed: bool,
}

impl<T: Transport> Drop for AttemptGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared
                .apply(ConnectionEvent::ConnectAbandoned, Some(self.generation), false);
            info!(generation = self.generation, "connect abandoned");
        }
    }
}

pub struct ConnectionManager<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                transport,
                state,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// New observer; the current state is visible right away.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Bring the session up. Already connected is success. Concurrent calls
    /// queue behind each other.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let shared = &self.shared;
        let _serial = shared.connect_lock.lock().await;
        if self.state().is_connected() {
            return Ok(());
        }

        let Some(generation) = shared.apply(ConnectionEvent::ConnectRequested, None, true) else {
            warn!(state = ?self.state(), "connect requested in unexpected state");
            return Err(ClientError::NotConnected);
        };
        let mut attempt = AttemptGuard {
            shared: shared.as_ref(),
            generation,
            armed: true,
        };

        match shared.transport.request_connect().await {
            Ok(session) => {
                attempt.armed = false;
                let session = Arc::new(session);
                *shared.session() = Some(Live {
                    generation,
                    session: session.clone(),
                });
                shared.apply(ConnectionEvent::SessionEstablished, Some(generation), false);

                let weak: Weak<Shared<T>> = Arc::downgrade(shared);
                session.on_session_end(Box::new(move |end| {
                    if let Some(shared) = weak.upgrade() {
                        shared.session_ended(generation, end);
                    }
                }));
                info!(generation, "connected to telemetry service");
                Ok(())
            }
            Err(e) => {
                attempt.armed = false;
                let message = e.to_string();
                warn!(generation, error = %message, "connect failed");
                shared.apply(ConnectionEvent::ConnectFailed(message), Some(generation), false);
                Err(ClientError::TransportFailure(e))
            }
        }
    }

    /// Orderly local close. Only meaningful while connected.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let _serial = shared.connect_lock.lock().await;
        let live = shared.session().take();
        if shared
            .apply(ConnectionEvent::DisconnectRequested, None, true)
            .is_some()
        {
            info!("disconnected from telemetry service");
        }
        if let Some(live) = live {
            live.session.close().await;
        }
    }

    async fn call(&self, method: Method) -> Result<Reply, ClientError> {
        let live = self
            .shared
            .session()
            .as_ref()
            .map(|live| (live.generation, live.session.clone()));
        let Some((generation, session)) = live else {
            return Err(ClientError::NotConnected);
        };

        match session.call(method).await {
            Err(e) if e.is_session_fatal() => {
                warn!(op = method.as_str(), error = %e, "call failed, dropping session");
                let failed = ConnectionEvent::CallFailed(e.to_string());
                if self.shared.apply(failed, Some(generation), true).is_some() {
                    if let Some(live) = self.shared.take_session(generation) {
                        live.session.close().await;
                    }
                }
                Err(e)
            }
            other => other,
        }
    }

    pub async fn get_current_stats(&self) -> Result<CounterSnapshot, ClientError> {
        match self.call(Method::GetCurrentStats).await? {
            Reply::Stats(snapshot) => Ok(snapshot),
            other => Err(unexpected(Method::GetCurrentStats, &other)),
        }
    }

    pub async fn is_service_ready(&self) -> Result<bool, ClientError> {
        match self.call(Method::IsServiceReady).await? {
            Reply::Ready(ready) => Ok(ready),
            other => Err(unexpected(Method::IsServiceReady, &other)),
        }
    }

    pub async fn reset_stats(&self) -> Result<(), ClientError> {
        match self.call(Method::ResetStats).await? {
            Reply::Reset => Ok(()),
            other => Err(unexpected(Method::ResetStats, &other)),
        }
    }
}

fn unexpected(method: Method, reply: &Reply) -> ClientError {
    TransportError::Protocol(format!("unexpected reply to {}: {reply:?}", method.as_str())).into()
}

impl<T: Transport> StatsSource for ConnectionManager<T> {
    fn is_usable(&self) -> bool {
        self.state().is_connected()
    }

    async fn fetch_stats(&self) -> Result<CounterSnapshot, ClientError> {
        self.get_current_stats().await
    }
}
