use std::sync::Arc;

use tracing::{debug, info};

use crate::error::AuthError;
use crate::metrics::DeviceMetrics;
use crate::protocol::{Method, RemoteError, Reply, Request, ServerMessage};
use crate::snapshot::CounterSnapshot;
use crate::time::Clock;

use super::counters::CounterStore;
use super::trust::{CallerIdentity, TrustValidator};

/// The three operations exposed to clients. Every one of them authorizes the
/// caller before touching any state.
pub struct TelemetryService {
    validator: Arc<TrustValidator>,
    counters: Arc<CounterStore>,
    metrics: Arc<dyn DeviceMetrics>,
    clock: Arc<dyn Clock>,
}

impl TelemetryService {
    pub fn new(
        validator: Arc<TrustValidator>,
        counters: Arc<CounterStore>,
        metrics: Arc<dyn DeviceMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            validator,
            counters,
            metrics,
            clock,
        }
    }

    pub fn get_current_stats(&self, caller: &CallerIdentity) -> Result<CounterSnapshot, AuthError> {
        self.validator.authorize(caller)?;
        debug!(uid = caller.uid, pid = ?caller.pid, "get_current_stats");

        let counters = self.counters.snapshot_counters();
        Ok(CounterSnapshot {
            transaction_count: counters.total,
            successful_transactions: counters.success,
            failed_transactions: counters.failed,
            last_transaction_time: counters.last_time,
            battery_level: self.metrics.read_battery(),
            memory_usage_percent: self.metrics.read_memory(),
            cpu_usage_percent: self.metrics.read_cpu(),
            timestamp: self.clock.now_ms(),
        })
    }

    /// Authorizes, then re-reads a fresh snapshot (which authorizes again).
    pub fn is_service_ready(&self, caller: &CallerIdentity) -> Result<bool, AuthError> {
        self.validator.authorize(caller)?;
        let stats = self.get_current_stats(caller)?;
        Ok(stats.is_device_ready())
    }

    pub fn reset_stats(&self, caller: &CallerIdentity) -> Result<(), AuthError> {
        self.validator.authorize(caller)?;
        info!(uid = caller.uid, pid = ?caller.pid, "reset_stats");
        self.counters.reset();
        Ok(())
    }

    /// Runs one decoded request and wraps the outcome for the wire.
    pub fn dispatch(&self, caller: &CallerIdentity, request: Request) -> ServerMessage {
        let outcome = match request.method {
            Method::GetCurrentStats => self.get_current_stats(caller).map(Reply::Stats),
            Method::IsServiceReady => self.is_service_ready(caller).map(Reply::Ready),
            Method::ResetStats => self.reset_stats(caller).map(|()| Reply::Reset),
        };
        match outcome {
            Ok(reply) => ServerMessage::ok(request.id, reply),
            Err(e) => {
                info!(
                    uid = caller.uid,
                    pid = ?caller.pid,
                    op = request.method.as_str(),
                    error = %e,
                    "call rejected"
                );
                ServerMessage::err(request.id, RemoteError::from(e))
            }
        }
    }
}
