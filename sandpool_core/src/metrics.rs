//! Pool and execution telemetry.
//!
//! Counters and gauges are plain atomics so every concurrent caller can update them
//! without touching the pool lock. Snapshots are cheap copies for operators.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counter metric (monotonically increasing until reset)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Raise the gauge to `value` if it is currently lower.
    pub fn set_max(&self, value: u64) {
        self.value.fetch_max(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Lock-protected snapshot of the pool, as returned by `stats()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub sandboxes_created: u64,
    pub sandboxes_reused: u64,
    pub sandboxes_destroyed: u64,
    pub creation_failures: u64,
    pub acquire_timeouts: u64,
    /// Live handles, including those being created.
    pub pool_size: u64,
    pub in_use: u64,
    pub idle: u64,
    pub peak_in_use: u64,
    pub executions: u64,
    pub total_execution_ms: u64,
}

impl PoolMetrics {
    /// Fraction of acquisitions served by an idle sandbox.
    pub fn hit_rate(&self) -> f64 {
        let total = self.sandboxes_created + self.sandboxes_reused;
        if total == 0 {
            0.0
        } else {
            self.sandboxes_reused as f64 / total as f64
        }
    }
}

/// Operator view of every counter (`counts`) and timing (`durations`, milliseconds).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counts: BTreeMap<String, u64>,
    pub durations: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    pub fn count(&self, name: &str) -> u64 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    pub fn duration_ms(&self, name: &str) -> f64 {
        self.durations.get(name).copied().unwrap_or(0.0)
    }
}

/// Process-wide sink shared by the pool and the executor.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    sandboxes_created: Counter,
    sandboxes_reused: Counter,
    sandboxes_destroyed: Counter,
    creation_failures: Counter,
    acquire_timeouts: Counter,
    acquire_wait_us: Counter,

    pool_size: Gauge,
    in_use: Gauge,
    peak_in_use: Gauge,

    executions: Counter,
    execution_failures: Counter,
    execution_timeouts: Counter,
    tainted_releases: Counter,
    execution_time_us: Counter,
    execution_max_us: Gauge,
    peak_memory_bytes: Gauge,

    failures_by_kind: Mutex<HashMap<ErrorKind, u64>>,
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

fn as_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sandbox_created(&self) {
        self.sandboxes_created.inc();
    }

    pub fn record_sandbox_reused(&self) {
        self.sandboxes_reused.inc();
    }

    pub fn record_sandbox_destroyed(&self) {
        self.sandboxes_destroyed.inc();
    }

    pub fn record_creation_failure(&self) {
        self.creation_failures.inc();
    }

    pub fn record_acquire_timeout(&self) {
        self.acquire_timeouts.inc();
    }

    pub fn record_acquire_wait(&self, waited: Duration) {
        self.acquire_wait_us.add(micros(waited));
    }

    /// Publish the pool's current occupancy; tracks the in-use high-water mark.
    pub fn set_pool_gauges(&self, pool_size: usize, in_use: usize) {
        self.pool_size.set(pool_size as u64);
        self.in_use.set(in_use as u64);
        self.peak_in_use.set_max(in_use as u64);
    }

    pub fn record_tainted_release(&self) {
        self.tainted_releases.inc();
    }

    pub fn record_memory_usage(&self, bytes: u64) {
        self.peak_memory_bytes.set_max(bytes);
    }

    /// Record one finished execution, successful or not.
    pub fn record_execution(&self, duration: Duration, failure: Option<ErrorKind>, timed_out: bool) {
        let us = micros(duration);
        self.executions.inc();
        self.execution_time_us.add(us);
        self.execution_max_us.set_max(us);

        if timed_out {
            self.execution_timeouts.inc();
        }
        if let Some(kind) = failure {
            self.execution_failures.inc();
            if let Ok(mut by_kind) = self.failures_by_kind.lock() {
                *by_kind.entry(kind).or_insert(0) += 1;
            }
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions.get()
    }

    /// Pool view; `pool_size`, `in_use` and `idle` come from the caller's locked state.
    pub fn pool_metrics(&self, pool_size: usize, in_use: usize, idle: usize) -> PoolMetrics {
        PoolMetrics {
            sandboxes_created: self.sandboxes_created.get(),
            sandboxes_reused: self.sandboxes_reused.get(),
            sandboxes_destroyed: self.sandboxes_destroyed.get(),
            creation_failures: self.creation_failures.get(),
            acquire_timeouts: self.acquire_timeouts.get(),
            pool_size: pool_size as u64,
            in_use: in_use as u64,
            idle: idle as u64,
            peak_in_use: self.peak_in_use.get().max(in_use as u64),
            executions: self.executions.get(),
            total_execution_ms: self.execution_time_us.get() / 1000,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut counts = BTreeMap::new();
        for (name, value) in [
            ("sandboxes_created", self.sandboxes_created.get()),
            ("sandboxes_reused", self.sandboxes_reused.get()),
            ("sandboxes_destroyed", self.sandboxes_destroyed.get()),
            ("creation_failures", self.creation_failures.get()),
            ("acquire_timeouts", self.acquire_timeouts.get()),
            ("pool_size", self.pool_size.get()),
            ("in_use", self.in_use.get()),
            ("peak_in_use", self.peak_in_use.get()),
            ("executions", self.executions.get()),
            ("execution_failures", self.execution_failures.get()),
            ("execution_timeouts", self.execution_timeouts.get()),
            ("tainted_releases", self.tainted_releases.get()),
            ("peak_memory_bytes", self.peak_memory_bytes.get()),
        ] {
            counts.insert(name.to_string(), value);
        }
        if let Ok(by_kind) = self.failures_by_kind.lock() {
            for (kind, value) in by_kind.iter() {
                counts.insert(format!("failures.{}", kind.as_str()), *value);
            }
        }

        let executions = self.executions.get();
        let total_us = self.execution_time_us.get();
        let mean_us = if executions == 0 { 0 } else { total_us / executions };

        let mut durations = BTreeMap::new();
        durations.insert("execution_total_ms".to_string(), as_ms(total_us));
        durations.insert("execution_mean_ms".to_string(), as_ms(mean_us));
        durations.insert(
            "execution_max_ms".to_string(),
            as_ms(self.execution_max_us.get()),
        );
        durations.insert(
            "acquire_wait_total_ms".to_string(),
            as_ms(self.acquire_wait_us.get()),
        );

        MetricsSnapshot { counts, durations }
    }

    /// Zero every counter. Occupancy gauges keep describing the live pool.
    pub fn reset(&self) {
        for counter in [
            &self.sandboxes_created,
            &self.sandboxes_reused,
            &self.sandboxes_destroyed,
            &self.creation_failures,
            &self.acquire_timeouts,
            &self.acquire_wait_us,
            &self.executions,
            &self.execution_failures,
            &self.execution_timeouts,
            &self.tainted_releases,
            &self.execution_time_us,
        ] {
            counter.reset();
        }
        self.execution_max_us.set(0);
        self.peak_memory_bytes.set(0);
        self.peak_in_use.set(self.in_use.get());
        if let Ok(mut by_kind) = self.failures_by_kind.lock() {
            by_kind.clear();
        }
    }
}
