//! Device telemetry consumed by the service on every snapshot.
//!
//! Readers must answer immediately. Anything slow (sysfs, procfs) happens in
//! the collector's own polling task and is served from its cache.

pub mod collector;

pub use collector::MetricsCollector;

pub trait DeviceMetrics: Send + Sync {
    /// Percent in [0, 100].
    fn read_battery(&self) -> u8;
    /// Percent in [0, 100].
    fn read_memory(&self) -> f32;
    /// Percent in [0, 100].
    fn read_cpu(&self) -> f32;
}

/// Constant readings. Used by tests and as a headless stand-in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedMetrics {
    pub battery: u8,
    pub memory: f32,
    pub cpu: f32,
}

impl FixedMetrics {
    pub fn new(battery: u8, memory: f32, cpu: f32) -> Self {
        Self {
            battery,
            memory,
            cpu,
        }
    }
}

impl DeviceMetrics for FixedMetrics {
    fn read_battery(&self) -> u8 {
        self.battery
    }

    fn read_memory(&self) -> f32 {
        self.memory
    }

    fn read_cpu(&self) -> f32 {
        self.cpu
    }
}
