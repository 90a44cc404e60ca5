//! Per-component performance telemetry.
//!
//! Each monitor step (capture, detection, prediction, sending, ...) appends a
//! [`ComponentMetricSample`] to a bounded rolling window. Windows aggregate on
//! demand into average / median / p95 / p99 / peak summaries which the
//! orchestrator publishes and checks against [`BottleneckThresholds`].
//!
//! Resource deltas come from [`ResourceProbe`], which reads `/proc/self` on
//! Linux (on the blocking pool) and reports zeros elsewhere.

use std::collections::{BTreeMap, VecDeque};

use tokio::time::Instant;

use serde::{Deserialize, Serialize};

// =============================================================================
// Rolling window
// =============================================================================

/// Fixed-capacity FIFO window; pushing past capacity evicts the oldest value.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    values: VecDeque<T>,
    capacity: usize,
    total: u64,
}

impl<T> RollingWindow<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            total: 0,
        }
    }

    /// Push a value, returning the evicted one when full.
    pub fn push(&mut self, value: T) -> Option<T> {
        self.total += 1;
        let evicted = if self.values.len() >= self.capacity {
            self.values.pop_front()
        } else {
            None
        };
        self.values.push_back(value);
        evicted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Values ever pushed, including evicted ones.
    #[must_use]
    pub fn total_pushed(&self) -> u64 {
        self.total
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&T> {
        self.values.back()
    }
}

impl RollingWindow<f64> {
    /// Aggregate the retained values.
    #[must_use]
    pub fn stats(&self) -> WindowStats {
        WindowStats::from_values(self.values.iter().copied())
    }
}

/// Aggregate over a window of values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub count: usize,
    pub avg: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
    pub peak: f64,
}

impl WindowStats {
    #[must_use]
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        let mut sorted: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        Self {
            count,
            avg: sum / count as f64,
            median: quantile_sorted(&sorted, 0.5),
            p95: quantile_sorted(&sorted, 0.95),
            p99: quantile_sorted(&sorted, 0.99),
            peak: sorted[count - 1],
        }
    }
}

/// Nearest-rank quantile over an ascending slice.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * q.clamp(0.0, 1.0)) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

// =============================================================================
// Samples
// =============================================================================

/// One measured execution of a monitor component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentMetricSample {
    pub component: String,
    pub duration_ms: f64,
    pub memory_delta_mb: f64,
    pub cpu_percent: f64,
    pub net_bytes: u64,
    pub success: bool,
}

/// Window sizes for component metrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Timing samples kept per component
    pub timing_samples: usize,
    /// Memory / CPU / network samples kept per component
    pub resource_samples: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            timing_samples: 100,
            resource_samples: 50,
        }
    }
}

#[derive(Debug, Clone)]
struct ComponentWindow {
    durations: RollingWindow<f64>,
    memory: RollingWindow<f64>,
    cpu: RollingWindow<f64>,
    /// (bytes, duration_ms) pairs for throughput
    net: RollingWindow<(u64, f64)>,
    outcomes: RollingWindow<bool>,
}

impl ComponentWindow {
    fn new(config: WindowConfig) -> Self {
        Self {
            durations: RollingWindow::new(config.timing_samples),
            memory: RollingWindow::new(config.resource_samples),
            cpu: RollingWindow::new(config.resource_samples),
            net: RollingWindow::new(config.resource_samples),
            outcomes: RollingWindow::new(config.timing_samples),
        }
    }
}

/// Aggregated view of one component's rolling windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSummary {
    pub component: String,
    pub total_samples: u64,
    pub success_rate: f64,
    pub duration_ms: WindowStats,
    pub memory_delta_mb: WindowStats,
    pub cpu_percent: WindowStats,
    /// Network bytes per second over the retained samples.
    pub net_bytes_per_sec: f64,
}

/// Rolling per-component metrics for one monitor loop.
#[derive(Debug, Clone)]
pub struct ComponentMetrics {
    config: WindowConfig,
    components: BTreeMap<String, ComponentWindow>,
}

impl Default for ComponentMetrics {
    fn default() -> Self {
        Self::new(WindowConfig::default())
    }
}

impl ComponentMetrics {
    #[must_use]
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            components: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, sample: ComponentMetricSample) {
        let config = self.config;
        let window = self
            .components
            .entry(sample.component.clone())
            .or_insert_with(|| ComponentWindow::new(config));
        window.durations.push(sample.duration_ms);
        window.memory.push(sample.memory_delta_mb);
        window.cpu.push(sample.cpu_percent);
        window.net.push((sample.net_bytes, sample.duration_ms));
        window.outcomes.push(sample.success);
    }

    /// Retained sample count for a component.
    #[must_use]
    pub fn retained(&self, component: &str) -> usize {
        self.components
            .get(component)
            .map_or(0, |w| w.durations.len())
    }

    #[must_use]
    pub fn summary(&self, component: &str) -> Option<ComponentSummary> {
        let window = self.components.get(component)?;
        let successes = window.outcomes.iter().filter(|ok| **ok).count();
        let success_rate = if window.outcomes.is_empty() {
            1.0
        } else {
            successes as f64 / window.outcomes.len() as f64
        };
        let (bytes, millis) = window
            .net
            .iter()
            .fold((0u64, 0.0f64), |(b, m), (nb, ms)| (b + nb, m + ms));
        let net_bytes_per_sec = if millis > 0.0 {
            bytes as f64 / (millis / 1000.0)
        } else {
            0.0
        };
        Some(ComponentSummary {
            component: component.to_string(),
            total_samples: window.durations.total_pushed(),
            success_rate,
            duration_ms: window.durations.stats(),
            memory_delta_mb: window.memory.stats(),
            cpu_percent: window.cpu.stats(),
            net_bytes_per_sec,
        })
    }

    /// Summaries for every component, sorted by name.
    #[must_use]
    pub fn summaries(&self) -> Vec<ComponentSummary> {
        self.components
            .keys()
            .filter_map(|name| self.summary(name))
            .collect()
    }
}

// =============================================================================
// Bottlenecks
// =============================================================================

/// Advisory limits on rolling averages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BottleneckThresholds {
    pub avg_duration_ms: f64,
    /// Applied to the absolute average memory delta
    pub memory_delta_mb: f64,
    pub cpu_percent: f64,
    pub net_bytes_per_sec: f64,
}

impl Default for BottleneckThresholds {
    fn default() -> Self {
        Self {
            avg_duration_ms: 100.0,
            memory_delta_mb: 5.0,
            cpu_percent: 50.0,
            net_bytes_per_sec: 1024.0 * 1024.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    Duration,
    Memory,
    Cpu,
    Network,
}

/// A component whose rolling average exceeds a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub component: String,
    pub kind: BottleneckKind,
    pub observed: f64,
    pub threshold: f64,
}

impl ComponentSummary {
    #[must_use]
    pub fn bottlenecks(&self, limits: &BottleneckThresholds) -> Vec<Bottleneck> {
        let checks = [
            (
                BottleneckKind::Duration,
                self.duration_ms.avg,
                limits.avg_duration_ms,
            ),
            (
                BottleneckKind::Memory,
                self.memory_delta_mb.avg.abs(),
                limits.memory_delta_mb,
            ),
            (BottleneckKind::Cpu, self.cpu_percent.avg, limits.cpu_percent),
            (
                BottleneckKind::Network,
                self.net_bytes_per_sec,
                limits.net_bytes_per_sec,
            ),
        ];
        checks
            .into_iter()
            .filter(|(_, observed, threshold)| observed > threshold)
            .map(|(kind, observed, threshold)| Bottleneck {
                component: self.component.clone(),
                kind,
                observed,
                threshold,
            })
            .collect()
    }
}

// =============================================================================
// Resource probe
// =============================================================================

/// Point-in-time process resource counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceReading {
    pub rss_bytes: u64,
    /// User + system CPU time consumed so far
    pub cpu_time_ms: u64,
    /// Received + transmitted bytes across interfaces
    pub net_bytes: u64,
}

/// Reads process resource counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceProbe;

impl ResourceProbe {
    /// Read the counters without blocking the runtime. A failed read yields
    /// zeros.
    pub async fn read(self) -> ResourceReading {
        tokio::task::spawn_blocking(read_resources)
            .await
            .unwrap_or_default()
    }

    /// Start measuring a component step.
    pub async fn start(self, component: &'static str) -> StepMeter {
        let before = self.read().await;
        StepMeter {
            component,
            started: Instant::now(),
            before,
            probe: self,
        }
    }
}

/// In-flight measurement of one step.
#[derive(Debug)]
pub struct StepMeter {
    component: &'static str,
    started: Instant,
    before: ResourceReading,
    probe: ResourceProbe,
}

impl StepMeter {
    pub async fn finish(self, success: bool) -> ComponentMetricSample {
        let elapsed = self.started.elapsed();
        let after = self.probe.read().await;
        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        let memory_delta_mb =
            (after.rss_bytes as f64 - self.before.rss_bytes as f64) / (1024.0 * 1024.0);
        let cpu_ms = after.cpu_time_ms.saturating_sub(self.before.cpu_time_ms) as f64;
        let cpu_percent = if duration_ms > 0.0 {
            (cpu_ms / duration_ms * 100.0).min(100.0 * available_cpus() as f64)
        } else {
            0.0
        };
        ComponentMetricSample {
            component: self.component.to_string(),
            duration_ms,
            memory_delta_mb,
            cpu_percent,
            net_bytes: after.net_bytes.saturating_sub(self.before.net_bytes),
            success,
        }
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn read_resources() -> ResourceReading {
    let mut reading = ResourceReading::default();

    if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            if let Some(val) = line.strip_prefix("VmRSS:") {
                if let Some(kb) = parse_kb_value(val) {
                    reading.rss_bytes = kb * 1024;
                }
            }
        }
    }

    if let Ok(stat) = std::fs::read_to_string("/proc/self/stat") {
        reading.cpu_time_ms = parse_cpu_time_ms(&stat).unwrap_or(0);
    }

    if let Ok(dev) = std::fs::read_to_string("/proc/self/net/dev") {
        reading.net_bytes = parse_net_dev(&dev);
    }

    reading
}

#[cfg(not(target_os = "linux"))]
fn read_resources() -> ResourceReading {
    ResourceReading::default()
}

/// Parse a value like "  12345 kB" → Some(12345).
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_kb_value(s: &str) -> Option<u64> {
    s.trim().strip_suffix("kB")?.trim().parse().ok()
}

/// utime + stime from `/proc/<pid>/stat`, in milliseconds (USER_HZ = 100).
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_cpu_time_ms(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest starts at field 3 (state); utime is field 14, stime field 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) * 10)
}

/// Sum of receive and transmit bytes over all non-loopback interfaces.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_net_dev(dev: &str) -> u64 {
    dev.lines()
        .skip(2)
        .filter_map(|line| {
            let (iface, data) = line.split_once(':')?;
            if iface.trim() == "lo" {
                return None;
            }
            let fields: Vec<u64> = data
                .split_whitespace()
                .filter_map(|f| f.parse().ok())
                .collect();
            Some(fields.first().copied().unwrap_or(0) + fields.get(8).copied().unwrap_or(0))
        })
        .sum()
}
