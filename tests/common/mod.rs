#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use telemd::client::{ConnectionState, Session, SessionEnd, SessionEndCallback, SessionEndSlot, Transport};
use telemd::error::{ClientError, TransportError};
use telemd::metrics::{DeviceMetrics, FixedMetrics};
use telemd::protocol::{Method, Reply, Request, ServerMessage};
use telemd::server::{CallerIdentity, CapabilityProvider, CounterStore, TelemetryService, TrustDomain, TrustValidator};
use telemd::time::{Clock, ManualClock};
use tokio::sync::watch;

pub const DAEMON_UID: u32 = 1000;
pub const CAPABILITY: &str = "telemd.permission.ACCESS_ANALYTICS";

// ── Capability provider spy ─────────────────────────────────

/// Grants by flag and counts how often each predicate is consulted.
pub struct SpyProvider {
    pub grant: AtomicBool,
    pub same_domain: AtomicBool,
    pub capability_checks: AtomicU64,
    pub identity_checks: AtomicU64,
}

impl SpyProvider {
    pub fn new(grant: bool, same_domain: bool) -> Arc<Self> {
        Arc::new(Self {
            grant: AtomicBool::new(grant),
            same_domain: AtomicBool::new(same_domain),
            capability_checks: AtomicU64::new(0),
            identity_checks: AtomicU64::new(0),
        })
    }

    pub fn full_checks(&self) -> u64 {
        self.capability_checks.load(Ordering::SeqCst)
    }
}

impl CapabilityProvider for SpyProvider {
    fn has_capability(&self, _caller: &CallerIdentity, capability: &str) -> bool {
        self.capability_checks.fetch_add(1, Ordering::SeqCst);
        capability == CAPABILITY && self.grant.load(Ordering::SeqCst)
    }

    fn identities_match(&self, _caller: &CallerIdentity, _domain: &TrustDomain) -> bool {
        self.identity_checks.fetch_add(1, Ordering::SeqCst);
        self.same_domain.load(Ordering::SeqCst)
    }
}

// ── Service fixture ─────────────────────────────────────────

pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub provider: Arc<SpyProvider>,
    pub validator: Arc<TrustValidator>,
    pub counters: Arc<CounterStore>,
    pub service: Arc<TelemetryService>,
}

pub fn fixture_with(provider: Arc<SpyProvider>, metrics: FixedMetrics) -> Fixture {
    fixture_with_ttl(provider, metrics, 30_000)
}

pub fn fixture_with_ttl(provider: Arc<SpyProvider>, metrics: FixedMetrics, ttl_ms: u64) -> Fixture {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let validator = Arc::new(TrustValidator::new(
        provider.clone(),
        dyn_clock.clone(),
        CAPABILITY,
        TrustDomain::new(DAEMON_UID),
        ttl_ms,
    ));
    let counters = Arc::new(CounterStore::new(dyn_clock.clone()));
    let metrics: Arc<dyn DeviceMetrics> = Arc::new(metrics);
    let service = Arc::new(TelemetryService::new(
        validator.clone(),
        counters.clone(),
        metrics,
        dyn_clock,
    ));
    Fixture {
        clock,
        provider,
        validator,
        counters,
        service,
    }
}

pub fn fixture() -> Fixture {
    fixture_with(SpyProvider::new(true, true), FixedMetrics::new(80, 50.0, 10.0))
}

pub fn caller() -> CallerIdentity {
    CallerIdentity::new(DAEMON_UID)
}

// ── In-process transport ────────────────────────────────────

struct MockSessionInner {
    service: Arc<TelemetryService>,
    caller: CallerIdentity,
    transport: Arc<MockTransportInner>,
    open: AtomicBool,
    end: SessionEndSlot,
    next_id: AtomicU64,
}

/// Session that dispatches straight into a `TelemetryService`.
pub struct MockSession {
    inner: Arc<MockSessionInner>,
}

impl Session for MockSession {
    async fn call(&self, method: Method) -> Result<Reply, ClientError> {
        let inner = &self.inner;
        inner.transport.calls.fetch_add(1, Ordering::SeqCst);
        if !inner.open.load(Ordering::SeqCst) || inner.transport.fail_calls.load(Ordering::SeqCst) {
            return Err(TransportError::Closed.into());
        }
        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        match inner.service.dispatch(&inner.caller, Request { id, method }) {
            ServerMessage::Response { outcome, .. } => outcome.map_err(ClientError::from),
            ServerMessage::Closing { .. } => Err(TransportError::Closed.into()),
        }
    }

    fn on_session_end(&self, callback: SessionEndCallback) {
        self.inner.end.register(callback);
    }

    async fn close(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.end.disarm();
        self.inner.transport.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockTransportInner {
    service: Arc<TelemetryService>,
    caller: CallerIdentity,
    refuse: AtomicBool,
    hang: AtomicBool,
    fail_calls: AtomicBool,
    connects: AtomicU64,
    calls: AtomicU64,
    closes: AtomicU64,
    sessions: Mutex<Vec<Arc<MockSessionInner>>>,
}

/// Clone it to keep a control handle after giving one to the manager.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockTransportInner>,
}

impl MockTransport {
    pub fn new(service: Arc<TelemetryService>, caller: CallerIdentity) -> Self {
        Self {
            inner: Arc::new(MockTransportInner {
                service,
                caller,
                refuse: AtomicBool::new(false),
                hang: AtomicBool::new(false),
                fail_calls: AtomicBool::new(false),
                connects: AtomicU64::new(0),
                calls: AtomicU64::new(0),
                closes: AtomicU64::new(0),
                sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn refuse(&self, on: bool) {
        self.inner.refuse.store(on, Ordering::SeqCst);
    }

    pub fn hang(&self, on: bool) {
        self.inner.hang.store(on, Ordering::SeqCst);
    }

    pub fn fail_calls(&self, on: bool) {
        self.inner.fail_calls.store(on, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.inner.closes.load(Ordering::SeqCst)
    }

    fn latest(&self) -> Arc<MockSessionInner> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session was opened")
    }

    /// Simulate the service process dying under the latest session.
    pub fn kill_latest(&self) {
        let session = self.latest();
        session.open.store(false, Ordering::SeqCst);
        session.end.fire(SessionEnd::Died("service process died".into()));
    }

    /// Simulate an orderly close from the service side.
    pub fn close_latest(&self) {
        let session = self.latest();
        session.open.store(false, Ordering::SeqCst);
        session.end.fire(SessionEnd::Closed);
    }

    /// Fire an end on an arbitrary earlier session.
    pub fn kill_session(&self, index: usize) {
        let session = self.inner.sessions.lock().unwrap()[index].clone();
        session.open.store(false, Ordering::SeqCst);
        session.end.fire(SessionEnd::Died("stale session died".into()));
    }
}

impl Transport for MockTransport {
    type Session = MockSession;

    async fn request_connect(&self) -> Result<MockSession, TransportError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.inner.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "service unavailable",
            )));
        }
        let session = Arc::new(MockSessionInner {
            service: self.inner.service.clone(),
            caller: self.inner.caller,
            transport: self.inner.clone(),
            open: AtomicBool::new(true),
            end: SessionEndSlot::new(),
            next_id: AtomicU64::new(1),
        });
        self.inner.sessions.lock().unwrap().push(session.clone());
        Ok(MockSession { inner: session })
    }
}

// ── Helpers ─────────────────────────────────────────────────

/// Wait (bounded) until the state stream shows a state matching `pred`.
pub async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    pred: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&*current) {
                    return current.clone();
                }
            }
            rx.changed().await.expect("state sender dropped");
        }
    })
    .await
    .expect("timed out waiting for connection state")
}

/// Unique socket path per test.
pub fn temp_socket(tag: &str) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let n = SEQ.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("telemd-{tag}-{}-{n}.sock", std::process::id()))
}
