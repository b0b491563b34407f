use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ClientError;
use crate::snapshot::CounterSnapshot;
use crate::time::{Clock, Millis};

pub const DEFAULT_MIN_STATS_INTERVAL_MS: Millis = 1_000;

/// Anything that can produce a fresh snapshot.
pub trait StatsSource: Send + Sync {
    /// False once the link behind the source is gone. Cached values must not
    /// outlive it.
    fn is_usable(&self) -> bool;

    fn fetch_stats(&self) -> impl Future<Output = Result<CounterSnapshot, ClientError>> + Send;
}

#[derive(Debug, Clone, Copy)]
struct CachedSnapshot {
    value: CounterSnapshot,
    fetched_at_ms: Millis,
}

/// Rate limiter in front of `get_current_stats`. Within `min_interval_ms` of
/// the last successful fetch the cached snapshot is returned without a round
/// trip. Failures are never cached, and nothing is served while the source
/// is unusable.
pub struct StatsCache<S> {
    source: S,
    clock: Arc<dyn Clock>,
    min_interval_ms: Millis,
    last: Mutex<Option<CachedSnapshot>>,
}

impl<S: StatsSource> StatsCache<S> {
    pub fn new(source: S, clock: Arc<dyn Clock>, min_interval_ms: Millis) -> Self {
        Self {
            source,
            clock,
            min_interval_ms,
            last: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Holding the lock across the fetch collapses concurrent misses into a
    /// single round trip.
    pub async fn get_stats(&self) -> Result<CounterSnapshot, ClientError> {
        let mut last = self.last.lock().await;
        if !self.source.is_usable() {
            if last.take().is_some() {
                debug!("source unusable, cached stats dropped");
            }
            return Err(ClientError::NotConnected);
        }
        let now = self.clock.now_ms();
        if let Some(cached) = *last {
            let age = now.saturating_sub(cached.fetched_at_ms);
            if age < self.min_interval_ms {
                debug!(age_ms = age, "stats served from cache");
                return Ok(cached.value);
            }
        }

        let value = self.source.fetch_stats().await?;
        *last = Some(CachedSnapshot {
            value,
            fetched_at_ms: now,
        });
        Ok(value)
    }

    /// Forget the cached snapshot so the next read goes to the service.
    pub async fn invalidate(&self) {
        *self.last.lock().await = None;
    }
}
