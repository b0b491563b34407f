use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::counters::CounterStore;

pub const DEFAULT_ACTIVITY_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_SUCCESS_RATE: f64 = 0.9;

/// Simulated transaction traffic. Best effort; only ever calls `increment`.
pub struct TransactionActivityGenerator {
    counters: Arc<CounterStore>,
    every: Duration,
    success_rate: f64,
}

impl TransactionActivityGenerator {
    pub fn new(counters: Arc<CounterStore>, every: Duration, success_rate: f64) -> Self {
        Self {
            counters,
            every,
            success_rate: success_rate.clamp(0.0, 1.0),
        }
    }

    /// Record one simulated transaction. Returns whether it succeeded.
    pub fn tick_once<R: Rng>(&self, rng: &mut R) -> bool {
        let success = rng.gen_bool(self.success_rate);
        self.counters.increment(success);
        success
    }

    /// First transaction lands one full interval after start.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.every.as_millis() as u64, "transaction activity started");
            let mut rng = StdRng::from_entropy();
            let mut cadence = interval_at(Instant::now() + self.every, self.every);
            cadence.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = cadence.tick() => {
                        let success = self.tick_once(&mut rng);
                        debug!(
                            success,
                            total = self.counters.snapshot_counters().total,
                            "simulated transaction"
                        );
                    }
                }
            }
            info!("transaction activity stopped");
        })
    }
}
