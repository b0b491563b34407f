//! Presentation state for a telemetry dashboard. No rendering, only the
//! model a UI would bind to.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::snapshot::CounterSnapshot;

use super::cache::StatsCache;
use super::connection::ConnectionState;
use super::manager::ConnectionManager;
use super::transport::Transport;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardState {
    pub snapshot: Option<CounterSnapshot>,
    pub connection: ConnectionState,
    pub is_loading: bool,
    pub error: Option<String>,
    pub is_device_ready: bool,
}

impl DashboardState {
    pub fn can_perform_transaction(&self) -> bool {
        self.connection.is_connected() && self.is_device_ready
    }
}

/// Outcome of the "start transaction" action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStart {
    NotConnected,
    DeviceNotReady,
    Started,
}

impl fmt::Display for TransactionStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TransactionStart::NotConnected => "Cannot start transaction: Service not connected",
            TransactionStart::DeviceNotReady => {
                "Cannot start transaction: Device not ready (check battery, memory, CPU)"
            }
            TransactionStart::Started => "Transaction started successfully",
        };
        f.write_str(msg)
    }
}

pub struct Dashboard<T: Transport> {
    manager: ConnectionManager<T>,
    cache: StatsCache<ConnectionManager<T>>,
    state: watch::Sender<DashboardState>,
    initial_load_done: AtomicBool,
}

impl<T: Transport> Dashboard<T> {
    pub fn new(manager: ConnectionManager<T>, cache: StatsCache<ConnectionManager<T>>) -> Self {
        let (state, _) = watch::channel(DashboardState {
            connection: manager.state(),
            ..DashboardState::default()
        });
        Self {
            manager,
            cache,
            state,
            initial_load_done: AtomicBool::new(false),
        }
    }

    pub fn manager(&self) -> &ConnectionManager<T> {
        &self.manager
    }

    pub fn state(&self) -> DashboardState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardState> {
        self.state.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut DashboardState)) {
        self.state.send_modify(f);
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.update(|s| {
            s.is_loading = true;
            s.error = None;
        });
        let result = self.manager.connect().await;
        self.update(|s| {
            s.is_loading = false;
            if let Err(e) = &result {
                s.error = Some(format!("Failed to connect to analytics service: {e}"));
            }
        });
        result
    }

    /// Stats through the cache, readiness straight from the service.
    pub async fn refresh(&self) {
        self.update(|s| {
            s.is_loading = true;
            s.error = None;
        });

        let stats = self.cache.get_stats().await;
        let ready = match &stats {
            Ok(_) => self.manager.is_service_ready().await,
            Err(_) => Ok(false),
        };

        self.update(|s| {
            s.is_loading = false;
            match (stats, ready) {
                (Ok(snapshot), Ok(ready)) => {
                    s.snapshot = Some(snapshot);
                    s.is_device_ready = ready;
                    s.error = None;
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "dashboard refresh failed");
                    s.error = Some(format!("Failed to get analytics data: {e}"));
                }
            }
        });
    }

    pub fn begin_transaction(&self) -> TransactionStart {
        let state = self.state.borrow();
        let outcome = if !state.connection.is_connected() {
            TransactionStart::NotConnected
        } else if !state.is_device_ready {
            TransactionStart::DeviceNotReady
        } else {
            TransactionStart::Started
        };
        info!(?outcome, "transaction start requested");
        outcome
    }

    /// Post-transaction upload and maintenance diagnostics both boil down to
    /// a refresh while connected.
    pub async fn after_transaction(&self) {
        let connected = self.state.borrow().connection.is_connected();
        if connected {
            debug!("uploading aggregated performance logs");
            self.refresh().await;
        }
    }

    pub async fn reset(&self) -> Result<(), ClientError> {
        let result = self.manager.reset_stats().await;
        self.cache.invalidate().await;
        match &result {
            Ok(()) => self.refresh().await,
            Err(e) => self.update(|s| s.error = Some(format!("Failed to reset statistics: {e}"))),
        }
        result
    }

    /// Mirror connection changes into the dashboard. The first time the link
    /// comes up the dashboard loads its data.
    pub fn follow_connection(self: &Arc<Self>) -> JoinHandle<()> {
        let dashboard = Arc::clone(self);
        let mut states = self.manager.subscribe();
        tokio::spawn(async move {
            loop {
                let connection = states.borrow_and_update().clone();
                let connected = connection.is_connected();
                dashboard.update(|s| s.connection = connection);

                if connected && !dashboard.initial_load_done.swap(true, Ordering::SeqCst) {
                    dashboard.refresh().await;
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}
