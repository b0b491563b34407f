use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::DeviceMetrics;
use crate::time::Clock;

const DEFAULT_PROC_ROOT: &str = "/proc";
const DEFAULT_POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

/// Cumulative jiffies from the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub idle: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.busy + self.idle
    }
}

/// Periodic poller of battery, memory and CPU load.
///
/// Readings live in atomics so `DeviceMetrics` reads never wait on I/O.
/// A source that cannot be read is replaced by a plausible mocked value.
pub struct MetricsCollector {
    battery: AtomicU32,
    memory_bits: AtomicU32,
    cpu_bits: AtomicU32,
    proc_root: PathBuf,
    power_supply_root: PathBuf,
    last_cpu: Mutex<Option<CpuTimes>>,
    clock: Arc<dyn Clock>,
}

impl MetricsCollector {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_sources(clock, DEFAULT_PROC_ROOT, DEFAULT_POWER_SUPPLY_ROOT)
    }

    pub fn with_sources(
        clock: Arc<dyn Clock>,
        proc_root: impl Into<PathBuf>,
        power_supply_root: impl Into<PathBuf>,
    ) -> Self {
        let proc_root = proc_root.into();
        let primed = read_cpu_times(&proc_root);
        Self {
            battery: AtomicU32::new(50),
            memory_bits: AtomicU32::new(0f32.to_bits()),
            cpu_bits: AtomicU32::new(0f32.to_bits()),
            proc_root,
            power_supply_root: power_supply_root.into(),
            last_cpu: Mutex::new(primed),
            clock,
        }
    }

    /// One polling round.
    pub fn collect(&self) {
        let battery = read_battery_percent(&self.power_supply_root).unwrap_or_else(mock_battery);
        let memory = read_memory_percent(&self.proc_root).unwrap_or_else(mock_memory);
        let cpu = self
            .sample_cpu()
            .unwrap_or_else(|| mock_cpu(self.clock.now_ms()));

        self.battery.store(u32::from(battery), Ordering::Relaxed);
        self.memory_bits.store(memory.to_bits(), Ordering::Relaxed);
        self.cpu_bits.store(cpu.to_bits(), Ordering::Relaxed);
        debug!(battery, memory, cpu, "metrics collected");
    }

    fn sample_cpu(&self) -> Option<f32> {
        let now = read_cpu_times(&self.proc_root)?;
        let mut last = self.last_cpu.lock().unwrap_or_else(|p| p.into_inner());
        let previous = last.replace(now)?;
        cpu_usage_between(previous, now)
    }

    pub fn spawn(self: Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = every.as_millis() as u64, "metrics collection started");
            let mut cadence = tokio::time::interval(every);
            cadence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = cadence.tick() => self.collect(),
                }
            }
            info!("metrics collection stopped");
        })
    }
}

impl DeviceMetrics for MetricsCollector {
    fn read_battery(&self) -> u8 {
        self.battery.load(Ordering::Relaxed).min(100) as u8
    }

    fn read_memory(&self) -> f32 {
        f32::from_bits(self.memory_bits.load(Ordering::Relaxed))
    }

    fn read_cpu(&self) -> f32 {
        f32::from_bits(self.cpu_bits.load(Ordering::Relaxed))
    }
}

// ── Sources ─────────────────────────────────────────────────

/// Capacity of the first power supply whose `type` is `Battery`.
pub fn read_battery_percent(power_supply_root: &Path) -> Option<u8> {
    let entries = std::fs::read_dir(power_supply_root).ok()?;
    for entry in entries.flatten() {
        let dir = entry.path();
        let is_battery = std::fs::read_to_string(dir.join("type"))
            .map(|t| t.trim() == "Battery")
            .unwrap_or(false);
        if !is_battery {
            continue;
        }
        if let Ok(raw) = std::fs::read_to_string(dir.join("capacity")) {
            if let Ok(level) = raw.trim().parse::<u32>() {
                return Some(level.min(100) as u8);
            }
        }
    }
    None
}

pub fn read_memory_percent(proc_root: &Path) -> Option<f32> {
    let raw = std::fs::read_to_string(proc_root.join("meminfo")).ok()?;
    parse_meminfo(&raw)
}

/// Used share of memory from `/proc/meminfo` contents.
pub fn parse_meminfo(raw: &str) -> Option<f32> {
    let mut total = None;
    let mut available = None;
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse::<u64>().ok()),
            Some("MemAvailable:") => available = parts.next().and_then(|v| v.parse::<u64>().ok()),
            _ => {}
        }
    }
    let (total, available) = (total?, available?);
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available) as f64;
    Some(((used / total as f64) * 100.0).clamp(0.0, 100.0) as f32)
}

fn read_cpu_times(proc_root: &Path) -> Option<CpuTimes> {
    let raw = std::fs::read_to_string(proc_root.join("stat")).ok()?;
    raw.lines().next().and_then(parse_cpu_line)
}

/// Parses the aggregate `cpu  user nice system idle iowait irq softirq steal ...` line.
pub fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.take(8).map(|f| f.parse().ok()).collect::<Option<_>>()?;
    if values.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let busy = values.iter().sum::<u64>() - idle;
    Some(CpuTimes { busy, idle })
}

pub fn cpu_usage_between(previous: CpuTimes, current: CpuTimes) -> Option<f32> {
    let total = current.total().checked_sub(previous.total())?;
    if total == 0 {
        return None;
    }
    let busy = current.busy.saturating_sub(previous.busy) as f64;
    Some(((busy / total as f64) * 100.0).clamp(0.0, 100.0) as f32)
}

// ── Fallbacks ───────────────────────────────────────────────

fn mock_battery() -> u8 {
    (75 + rand::thread_rng().gen_range(-10..15)).clamp(20, 100) as u8
}

fn mock_memory() -> f32 {
    (45.0 + rand::thread_rng().gen::<f32>() * 30.0).clamp(30.0, 80.0)
}

/// A slow 60-step wave around 15% with a little noise.
pub fn mock_cpu(now_ms: u64) -> f32 {
    let phase = ((now_ms / 10_000) % 60) as f64;
    let wave = (phase * std::f64::consts::PI / 30.0).sin() as f32 * 10.0;
    let noise = rand::thread_rng().gen_range(-4.0f32..4.0);
    (15.0 + wave + noise).clamp(5.0, 45.0)
}
