//! # Sandbox Pool
//!
//! A bounded set of reusable sandboxes shared by concurrent executions.
//!
//! ## Core Concepts
//!
//! * **`SandboxHandle`**: bookkeeping for one sandbox: id, constraints, workspace path,
//!   timestamps and its [`SandboxState`].
//! * **`SandboxLease`**: the exclusive borrow of one handle for one execution. Hand it back
//!   with [`SandboxPool::release`]. A lease dropped without release (cancelled caller,
//!   panic) is treated as tainted and its sandbox destroyed in the background.
//! * **`SandboxPool`**: owns every handle. A single mutex guards the bookkeeping and is
//!   never held across runtime calls (creation, health checks, destruction).
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --acquire--> InUse --release(clean)--> Idle
//!                     |
//!                     +--release(tainted) / failed reset / clear--> Draining --> Destroyed
//! Idle --evict_idle / clear--> Destroyed
//! ```
//!
//! Live sandboxes (tracked + being created + being destroyed) never exceed `max_size`.
//! When the pool is full, `acquire` waits on a [`Notify`] until a release or destruction
//! frees capacity, bounded by `acquire_timeout`.

use crate::error::{Result, SandboxOperation, TypedError};
use crate::metrics::{MetricsRegistry, PoolMetrics};
use crate::retry::{RetryConfig, execute_with_retry};
use crate::runtime::{ContainerRuntime, SandboxConstraints};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{Instant, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;

static SANDBOX_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_sandbox_id() -> String {
    format!("sbx-{}", SANDBOX_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
}

/// Configuration for pool behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Upper bound on live sandboxes.
    pub max_size: usize,
    /// How long `acquire` waits for capacity.
    #[serde(rename = "acquire_timeout_ms", with = "crate::retry::millis")]
    pub acquire_timeout: Duration,
    /// Bound on the health check plus workspace reset of a clean release.
    #[serde(rename = "health_check_timeout_ms", with = "crate::retry::millis")]
    pub health_check_timeout: Duration,
    /// Idle sandboxes unused for longer than this are evicted by the sweeper.
    #[serde(rename = "idle_timeout_ms", with = "crate::retry::millis")]
    pub idle_timeout: Duration,
    #[serde(rename = "cleanup_interval_ms", with = "crate::retry::millis")]
    pub cleanup_interval: Duration,
    /// Attempts per sandbox creation, including the first.
    pub create_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 4,
            acquire_timeout: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            create_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Idle,
    InUse,
    /// Leased, but destroyed instead of recycled when released.
    Draining,
    Destroyed,
}

/// Bookkeeping for one pooled sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxHandle {
    pub id: String,
    pub constraints: SandboxConstraints,
    /// Host-side workspace directory.
    pub workspace: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub state: SandboxState,
    /// Completed leases.
    pub uses: u64,
    #[serde(skip)]
    last_used: Instant,
}

impl SandboxHandle {
    fn new(id: String, constraints: SandboxConstraints, workspace: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            constraints,
            workspace,
            created_at: now,
            last_used_at: now,
            state: SandboxState::InUse,
            uses: 0,
            last_used: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_used_at = Utc::now();
        self.last_used = Instant::now();
    }

    /// Time since this sandbox was last handed out or returned.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<SandboxHandle>,
    creating: usize,
    destroying: usize,
}

impl PoolState {
    fn live(&self) -> usize {
        self.entries.len() + self.creating + self.destroying
    }

    fn count(&self, state: SandboxState) -> usize {
        self.entries.iter().filter(|h| h.state == state).count()
    }

    fn leased(&self) -> usize {
        self.count(SandboxState::InUse) + self.count(SandboxState::Draining)
    }

    /// Remove a handle and account for it until its destruction completes.
    fn retire(&mut self, sandbox_id: &str) -> bool {
        match self.entries.iter().position(|h| h.id == sandbox_id) {
            Some(index) => {
                self.entries.swap_remove(index);
                self.destroying += 1;
                true
            }
            None => false,
        }
    }
}

/// Result of one pass over the pool state in `acquire`.
enum AcquireStep {
    Reused(SandboxHandle),
    /// A creation slot was reserved.
    Create,
    /// A mismatched idle sandbox was retired; its destruction frees the capacity.
    Evicted(String),
    Wait,
}

/// Exclusive borrow of one pooled sandbox.
#[derive(Debug)]
pub struct SandboxLease {
    pool: Arc<SandboxPool>,
    handle: SandboxHandle,
    reused: bool,
    released: bool,
}

impl SandboxLease {
    pub fn id(&self) -> &str {
        &self.handle.id
    }

    pub fn workspace(&self) -> &Path {
        &self.handle.workspace
    }

    pub fn constraints(&self) -> &SandboxConstraints {
        &self.handle.constraints
    }

    /// Whether the sandbox came from the idle set rather than a fresh creation.
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                "Lease for sandbox {} dropped without release; discarding it",
                self.handle.id
            );
            self.pool.retire_in_background(&self.handle.id);
        }
    }
}

/// Releases a reserved creation slot unless disarmed, so a cancelled `acquire` cannot
/// leak capacity.
struct CreationSlot<'a> {
    pool: &'a SandboxPool,
    armed: bool,
}

impl Drop for CreationSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.transition(|st| st.creating -= 1);
            self.pool.available.notify_waiters();
        }
    }
}

/// Bounded pool of reusable sandboxes.
pub struct SandboxPool {
    runtime: Arc<dyn ContainerRuntime>,
    config: PoolConfig,
    create_retry: RetryConfig,
    metrics: Arc<MetricsRegistry>,
    state: Mutex<PoolState>,
    available: Notify,
    shutdown_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SandboxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxPool")
            .field("runtime", &self.runtime.name())
            .field("config", &self.config)
            .finish()
    }
}

impl SandboxPool {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: PoolConfig,
        retry: RetryConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        tracing::info!(
            "Creating sandbox pool (runtime: {}, max_size: {})",
            runtime.name(),
            config.max_size
        );
        let create_retry = retry.with_max_retries(config.create_attempts.saturating_sub(1));

        Self {
            runtime,
            config,
            create_retry,
            metrics,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            shutdown_token: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the locked state and publish the resulting occupancy.
    fn transition<R>(&self, f: impl FnOnce(&mut PoolState) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut state);
        self.metrics.set_pool_gauges(state.live(), state.leased());
        result
    }

    /// Borrow a sandbox matching `constraints`, creating one if the pool has room.
    pub async fn acquire(
        self: &Arc<Self>,
        constraints: &SandboxConstraints,
    ) -> Result<SandboxLease> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let max_size = self.config.max_size;
            let step = self.transition(|st| {
                if let Some(handle) = st
                    .entries
                    .iter_mut()
                    .find(|h| h.state == SandboxState::Idle && h.constraints == *constraints)
                {
                    handle.state = SandboxState::InUse;
                    handle.touch();
                    return AcquireStep::Reused(handle.clone());
                }

                if st.live() < max_size {
                    st.creating += 1;
                    return AcquireStep::Create;
                }

                // Full, but an idle sandbox with other constraints can make room.
                if let Some(victim) = st
                    .entries
                    .iter()
                    .find(|h| h.state == SandboxState::Idle)
                    .map(|h| h.id.clone())
                {
                    st.retire(&victim);
                    return AcquireStep::Evicted(victim);
                }

                AcquireStep::Wait
            });

            match step {
                AcquireStep::Reused(handle) => {
                    tracing::debug!("Reusing idle sandbox {}", handle.id);
                    self.metrics.record_sandbox_reused();
                    self.metrics.record_acquire_wait(started.elapsed());
                    return Ok(self.lease(handle, true));
                }
                AcquireStep::Create => {
                    let mut slot = CreationSlot {
                        pool: self,
                        armed: true,
                    };
                    let created = self.create_sandbox(constraints).await;
                    slot.armed = false;
                    let handle = match created {
                        Ok(handle) => handle,
                        Err(err) => {
                            self.transition(|st| st.creating -= 1);
                            self.available.notify_waiters();
                            self.metrics.record_creation_failure();
                            return Err(err);
                        }
                    };
                    self.transition(|st| {
                        st.creating -= 1;
                        st.entries.push(handle.clone());
                    });
                    self.metrics.record_sandbox_created();
                    self.metrics.record_acquire_wait(started.elapsed());
                    return Ok(self.lease(handle, false));
                }
                AcquireStep::Evicted(victim) => {
                    tracing::debug!("Evicting idle sandbox {} to make room", victim);
                    self.spawn_destroy(victim);
                }
                AcquireStep::Wait => {
                    tracing::debug!("Pool at capacity ({}), waiting for a release", max_size);
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                self.metrics.record_acquire_timeout();
                self.metrics.record_acquire_wait(started.elapsed());
                return Err(TypedError::sandbox(
                    SandboxOperation::Acquire,
                    None,
                    format!(
                        "no sandbox became available within {}ms (pool size {})",
                        self.config.acquire_timeout.as_millis(),
                        max_size
                    ),
                )
                .with_hint(
                    "Raise pool.max_size or pool.acquire_timeout_ms, or retry when load drops.",
                ));
            }
        }
    }

    fn lease(self: &Arc<Self>, handle: SandboxHandle, reused: bool) -> SandboxLease {
        SandboxLease {
            pool: Arc::clone(self),
            handle,
            reused,
            released: false,
        }
    }

    async fn create_sandbox(&self, constraints: &SandboxConstraints) -> Result<SandboxHandle> {
        execute_with_retry(&self.create_retry, "create sandbox", || async move {
            let id = next_sandbox_id();
            match self.runtime.create(&id, constraints).await {
                Ok(workspace) => {
                    tracing::info!("Created sandbox {} ({})", id, constraints.image);
                    Ok(SandboxHandle::new(id, constraints.clone(), workspace))
                }
                Err(e) => {
                    // Partially created containers must not linger.
                    let _ = self.runtime.destroy(&id).await;
                    Err(e.into_typed(SandboxOperation::Create, Some(&id)))
                }
            }
        })
        .await
    }

    /// Return a leased sandbox. Clean releases are health-checked and reset before the
    /// sandbox becomes idle; anything else destroys it in the background.
    ///
    /// The lease stays armed until the handle is back in the pool or retired, so a release
    /// abandoned mid health check still discards the sandbox through the lease's `Drop`.
    pub async fn release(self: &Arc<Self>, mut lease: SandboxLease, tainted: bool) {
        let id = lease.handle.id.clone();

        let draining = self.transition(|st| {
            st.entries
                .iter()
                .find(|h| h.id == id)
                .is_none_or(|h| h.state == SandboxState::Draining)
        });

        if tainted {
            self.metrics.record_tainted_release();
        }

        if !tainted && !draining && self.recycle(&id, &lease.handle.workspace).await {
            let returned = self.transition(|st| {
                match st.entries.iter_mut().find(|h| h.id == id) {
                    Some(handle) if handle.state == SandboxState::InUse => {
                        handle.state = SandboxState::Idle;
                        handle.uses += 1;
                        handle.touch();
                        true
                    }
                    _ => false,
                }
            });
            if returned {
                lease.released = true;
                tracing::debug!("Returned sandbox {} to the pool", id);
                self.available.notify_waiters();
                return;
            }
        }

        tracing::debug!(
            "Discarding sandbox {} (tainted: {}, draining: {})",
            id,
            tainted,
            draining
        );
        lease.released = true;
        self.retire_in_background(&id);
    }

    async fn recycle(&self, sandbox_id: &str, workspace: &Path) -> bool {
        let check = async {
            self.runtime.health_check(sandbox_id).await?;
            self.runtime.reset_workspace(sandbox_id, workspace).await
        };
        match timeout(self.config.health_check_timeout, check).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!("Sandbox {} failed its release check: {}", sandbox_id, e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Sandbox {} release check exceeded {}ms",
                    sandbox_id,
                    self.config.health_check_timeout.as_millis()
                );
                false
            }
        }
    }

    /// Stop tracking `sandbox_id` and destroy it on a background task.
    fn retire_in_background(self: &Arc<Self>, sandbox_id: &str) {
        if self.transition(|st| st.retire(sandbox_id)) {
            self.spawn_destroy(sandbox_id.to_string());
        }
    }

    /// Destroy an already retired sandbox on a background task.
    fn spawn_destroy(self: &Arc<Self>, id: String) {
        let pool = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.destroy_sandbox(&id).await });
            }
            Err(_) => {
                tracing::warn!("No async runtime to destroy sandbox {}; dropping it", id);
                pool.finish_destroy();
            }
        }
    }

    /// Destroy a retired sandbox and release its capacity.
    async fn destroy_sandbox(&self, sandbox_id: &str) {
        self.destroy_untracked(sandbox_id).await;
        self.finish_destroy();
    }

    async fn destroy_untracked(&self, sandbox_id: &str) {
        if let Err(e) = self.runtime.destroy(sandbox_id).await {
            tracing::warn!("Failed to destroy sandbox {}: {}", sandbox_id, e);
        } else {
            tracing::debug!("Destroyed sandbox {}", sandbox_id);
        }
        self.metrics.record_sandbox_destroyed();
    }

    fn finish_destroy(&self) {
        self.transition(|st| st.destroying = st.destroying.saturating_sub(1));
        self.available.notify_waiters();
    }

    /// Destroy idle sandboxes unused for at least `older_than`.
    pub async fn evict_idle(&self, older_than: Duration) -> usize {
        let victims: Vec<String> = self.transition(|st| {
            let ids: Vec<String> = st
                .entries
                .iter()
                .filter(|h| h.state == SandboxState::Idle && h.idle_for() >= older_than)
                .map(|h| h.id.clone())
                .collect();
            for id in &ids {
                st.retire(id);
            }
            ids
        });

        for id in &victims {
            self.destroy_sandbox(id).await;
        }
        if !victims.is_empty() {
            tracing::debug!("Evicted {} idle sandboxes", victims.len());
        }
        victims.len()
    }

    /// Destroy every idle sandbox now and mark leased ones to be destroyed on release.
    ///
    /// Returns how many sandboxes were destroyed or marked.
    pub async fn clear(&self) -> usize {
        let (idle, marked) = self.transition(|st| {
            let mut marked = 0;
            for handle in st.entries.iter_mut() {
                if handle.state == SandboxState::InUse {
                    handle.state = SandboxState::Draining;
                    marked += 1;
                }
            }
            let idle: Vec<String> = st
                .entries
                .iter()
                .filter(|h| h.state == SandboxState::Idle)
                .map(|h| h.id.clone())
                .collect();
            for id in &idle {
                st.retire(id);
            }
            (idle, marked)
        });

        for id in &idle {
            self.destroy_sandbox(id).await;
        }
        tracing::info!(
            "Cleared pool: destroyed {} idle, marked {} in use for draining",
            idle.len(),
            marked
        );
        idle.len() + marked
    }

    /// Wait until background destructions have finished, up to `limit`.
    pub async fn wait_for_pending_destroys(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().destroying == 0 {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.lock().destroying == 0;
            }
        }
    }

    pub fn stats(&self) -> PoolMetrics {
        let state = self.lock();
        self.metrics.pool_metrics(
            state.live(),
            state.leased(),
            state.count(SandboxState::Idle),
        )
    }

    pub fn handles(&self) -> Vec<SandboxHandle> {
        self.lock().entries.clone()
    }

    /// Start the periodic idle sweep (call this after wrapping the pool in an `Arc`).
    pub fn start_background_tasks(self: Arc<Self>) {
        let token = self.shutdown_token.clone();
        let interval_period = self.config.cleanup_interval;
        let idle_timeout = self.config.idle_timeout;
        let pool = Arc::clone(&self);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        pool.evict_idle(idle_timeout).await;
                    }
                }
            }
            tracing::debug!("Sandbox pool sweeper stopped");
        });

        if let Ok(mut sweeper) = self.sweeper.lock() {
            *sweeper = Some(task);
        }
        tracing::info!(
            "Sandbox pool sweeper started (every {}ms)",
            interval_period.as_millis()
        );
    }

    /// Stop the sweeper, clear the pool and wait for destructions to finish.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down sandbox pool");
        self.shutdown_token.cancel();
        let sweeper = self.sweeper.lock().ok().and_then(|mut s| s.take());
        if let Some(task) = sweeper {
            let _ = task.await;
        }
        self.clear().await;
        if !self
            .wait_for_pending_destroys(self.config.health_check_timeout)
            .await
        {
            tracing::warn!("Some sandboxes were still being destroyed at shutdown");
        }
    }
}
