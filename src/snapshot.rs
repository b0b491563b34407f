use serde::{Deserialize, Serialize};

use crate::time::Millis;

pub const MIN_BATTERY_PERCENT: u8 = 20;
pub const MAX_MEMORY_PERCENT: f32 = 85.0;
pub const MAX_CPU_PERCENT: f32 = 90.0;

/// Point-in-time read of the transaction counters plus device telemetry.
/// Built fresh for every request and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub transaction_count: u64,
    pub successful_transactions: u64,
    pub failed_transactions: u64,
    /// 0 when no transaction has happened since start or the last reset.
    pub last_transaction_time: Millis,
    pub battery_level: u8,
    pub memory_usage_percent: f32,
    pub cpu_usage_percent: f32,
    pub timestamp: Millis,
}

impl CounterSnapshot {
    /// Gate for starting a transaction on this device.
    pub fn is_device_ready(&self) -> bool {
        self.battery_level > MIN_BATTERY_PERCENT
            && self.memory_usage_percent < MAX_MEMORY_PERCENT
            && self.cpu_usage_percent < MAX_CPU_PERCENT
    }
}
