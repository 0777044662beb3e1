//! Load test execution engine: run state machine, tick loop and worker pool.
//!
//! [`LoadTestEngine`] is the top-level orchestrator that:
//! - Validates the config and builds the shared HTTP client
//! - Ticks once per second on absolute deadlines, asking the load-shape
//!   policy for a target and spawning or stopping virtual users to match
//! - Emits one [`MetricsSnapshot`] per tick through an mpsc channel
//! - Coordinates shutdown via [`CancellationToken`] and waits for in-flight
//!   requests through [`TaskTracker`]
//!
//! State moves `Pending -> Running -> (Completed | Cancelled | Failed)`, or
//! `Pending -> Failed` when setup fails. Only the engine drives transitions,
//! and the first terminal transition wins.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{self, TestConfig, TestStep};
use crate::error::LoadTestError;
use crate::executor::RequestExecutor;
use crate::metrics::{MetricsSnapshot, StatsAggregator};
use crate::policy::{closing_concurrency, target_concurrency};
use crate::report::{RunRecord, RunSummary};
use crate::selector::ScenarioSelector;
use crate::vu::{vu_loop, ActiveVuCounter, VuContext};

/// Heartbeat driving concurrency adjustment and snapshot emission.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Lateness at which a tick is reported as skewed.
const SKEW_WARN_THRESHOLD: Duration = Duration::from_millis(100);

/// Compile-time Send bounds verification for channel-transported types.
fn _assert_send<T: Send>() {}
#[allow(dead_code)]
fn _check_send_bounds() {
    _assert_send::<MetricsSnapshot>();
    _assert_send::<RunSummary>();
    _assert_send::<LoadTestEngine>();
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RunState {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
    Failed = 4,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Cloneable handle for observing and cancelling a run from any task.
#[derive(Debug, Clone)]
pub struct RunControl {
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
}

impl RunControl {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(RunState::Pending as u8)),
            cancel: CancellationToken::new(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests cancellation. Idempotent: returns `true` only for the call
    /// that actually requested it.
    pub fn cancel(&self) -> bool {
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!(state = %self.state(), "cancellation requested");
        self.cancel.cancel();
        true
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Moves `from -> to` atomically; `false` if the state was not `from`.
    fn transition(&self, from: RunState, to: RunState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if moved {
            tracing::info!(%from, %to, "run state changed");
        }
        moved
    }
}

/// Live set of virtual users, owned by the tick loop.
///
/// Stops VUs in LIFO order (last spawned, first stopped) through per-VU
/// child tokens of `root`.
struct WorkerPool {
    ctx: Arc<VuContext>,
    root: CancellationToken,
    tracker: TaskTracker,
    active_vus: ActiveVuCounter,
    tokens: Vec<CancellationToken>,
    next_vu_id: u32,
}

impl WorkerPool {
    fn new(ctx: Arc<VuContext>, root: CancellationToken) -> Self {
        Self {
            ctx,
            root,
            tracker: TaskTracker::new(),
            active_vus: ActiveVuCounter::new(),
            tokens: Vec::new(),
            next_vu_id: 0,
        }
    }

    fn len(&self) -> u32 {
        self.tokens.len() as u32
    }

    fn resize(&mut self, target: u32) {
        let current = self.len();
        if target > current {
            for _ in current..target {
                let token = self.root.child_token();
                self.tokens.push(token.clone());
                self.tracker.spawn(vu_loop(
                    self.next_vu_id,
                    self.ctx.clone(),
                    token,
                    self.active_vus.clone(),
                ));
                self.next_vu_id += 1;
            }
        } else {
            for _ in target..current {
                if let Some(token) = self.tokens.pop() {
                    token.cancel();
                }
            }
        }
        if target != current {
            tracing::debug!(
                from = current,
                to = target,
                working = self.active_vus.get(),
                "adjusted virtual users"
            );
        }
    }

    /// Stops every VU and waits for in-flight requests to finish.
    async fn shutdown(self) {
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Checks the aggregator's conservation law and monotonic counters.
fn check_invariants(
    previous: Option<&MetricsSnapshot>,
    current: &MetricsSnapshot,
) -> Result<(), String> {
    if current.successful_requests + current.failed_requests != current.total_requests {
        return Err(format!(
            "tick {}: successful ({}) + failed ({}) != total ({})",
            current.time,
            current.successful_requests,
            current.failed_requests,
            current.total_requests
        ));
    }
    if let Some(prev) = previous {
        if current.total_requests < prev.total_requests
            || current.successful_requests < prev.successful_requests
            || current.failed_requests < prev.failed_requests
        {
            return Err(format!(
                "tick {}: counters decreased since tick {}",
                current.time, prev.time
            ));
        }
        if current.time != prev.time + 1 {
            return Err(format!(
                "tick {} does not follow tick {}",
                current.time, prev.time
            ));
        }
    }
    Ok(())
}

fn tick_deadline(start: Instant, tick: u64) -> Instant {
    start + TICK_INTERVAL.saturating_mul(u32::try_from(tick).unwrap_or(u32::MAX))
}

/// Top-level load test engine configuration and entry point.
pub struct LoadTestEngine {
    config: TestConfig,
    steps: Vec<TestStep>,
    control: RunControl,
}

impl LoadTestEngine {
    /// Creates an engine in the `Pending` state. An empty `steps` list means
    /// single-endpoint mode using `config.url`.
    pub fn new(config: TestConfig, steps: Vec<TestStep>) -> Self {
        Self {
            config,
            steps,
            control: RunControl::new(),
        }
    }

    /// Returns a reference to the engine's configuration.
    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    pub fn steps(&self) -> &[TestStep] {
        &self.steps
    }

    /// Handle for cancelling or observing the run from other tasks.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn state(&self) -> RunState {
        self.control.state()
    }

    /// See [`RunControl::cancel`].
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    /// Moves the engine onto a tokio task and returns a handle to it.
    pub fn spawn(self) -> RunHandle {
        let (snapshot_tx, snapshots) = mpsc::unbounded_channel();
        let control = self.control.clone();
        let task = tokio::spawn(async move { self.run(snapshot_tx).await });
        RunHandle {
            snapshots,
            control,
            task,
        }
    }

    /// Run the load test to completion or cancellation.
    ///
    /// Sends one snapshot per tick (`time = 1, 2, ...`) to `snapshots`; a
    /// dropped receiver does not stop the run. Returns the summary for
    /// `Completed` and `Cancelled` runs, or the error that moved the run to
    /// `Failed`.
    pub async fn run(
        &self,
        snapshots: mpsc::UnboundedSender<MetricsSnapshot>,
    ) -> Result<RunSummary, LoadTestError> {
        if self.state() != RunState::Pending {
            return Err(LoadTestError::AlreadyStarted);
        }

        let start = Instant::now();
        let ctx = match self.prepare(start) {
            Ok(ctx) => ctx,
            Err(err) => {
                if !self.control.transition(RunState::Pending, RunState::Failed) {
                    return Err(LoadTestError::AlreadyStarted);
                }
                tracing::warn!(error = %err, "run failed before starting");
                return Err(err);
            },
        };
        if !self.control.transition(RunState::Pending, RunState::Running) {
            return Err(LoadTestError::AlreadyStarted);
        }

        let started_at = Utc::now();
        let duration = self.config.duration;
        let aggregator = ctx.aggregator.clone();
        tracing::info!(
            url = %self.config.url,
            steps = self.steps.len(),
            test_type = %self.config.test_type,
            virtual_users = self.config.virtual_users,
            duration_secs = duration,
            "load test started"
        );

        let mut pool = WorkerPool::new(ctx, self.control.cancel.child_token());
        if !self.control.is_cancel_requested() {
            pool.resize(target_concurrency(0, &self.config));
        }

        let mut history: Vec<MetricsSnapshot> = Vec::new();
        let mut interrupted = false;
        let mut fault = None;

        for tick in 1..=duration {
            let deadline = tick_deadline(start, tick);
            tokio::select! {
                biased;

                _ = self.control.cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }

            let skew = Instant::now().saturating_duration_since(deadline);
            if skew >= SKEW_WARN_THRESHOLD {
                tracing::warn!(
                    tick,
                    skew_ms = skew.as_millis() as u64,
                    "tick fired late"
                );
            }

            let active = if tick < duration {
                target_concurrency(tick, &self.config)
            } else {
                closing_concurrency(&self.config)
            };
            pool.resize(active);

            let mut snapshot = aggregator.snapshot();
            snapshot.time = tick;
            snapshot.active_virtual_users = active;
            if let Err(message) = check_invariants(history.last(), &snapshot) {
                fault = Some(message);
                break;
            }
            let _ = snapshots.send(snapshot.clone());
            history.push(snapshot);
        }

        pool.shutdown().await;
        let elapsed = start.elapsed();
        let ended_at = Utc::now();

        if let Some(message) = fault {
            self.control.transition(RunState::Running, RunState::Failed);
            tracing::warn!(%message, "engine fault, run aborted");
            return Err(LoadTestError::EngineFault { message });
        }

        let state = if interrupted {
            RunState::Cancelled
        } else {
            RunState::Completed
        };
        self.control.transition(RunState::Running, state);

        let summary = RunSummary::from_run(RunRecord {
            state,
            config: &self.config,
            steps: &self.steps,
            history: &history,
            stats: &aggregator,
            elapsed,
            started_at,
            ended_at,
        });
        tracing::info!(
            %state,
            total_requests = summary.metrics.total_requests,
            failed_requests = summary.metrics.failed_requests,
            elapsed_secs = summary.elapsed_secs,
            "load test finished"
        );
        Ok(summary)
    }

    /// Validates the config and builds everything the VUs share.
    fn prepare(&self, start: Instant) -> Result<Arc<VuContext>, LoadTestError> {
        config::validate(&self.config, &self.steps)?;
        let executor = RequestExecutor::new(&self.config, start.into_std())?;
        Ok(Arc::new(VuContext {
            selector: ScenarioSelector::new(&self.config, &self.steps),
            executor,
            aggregator: Arc::new(StatsAggregator::new(TICK_INTERVAL)),
            request_pause: self.config.request_pause(),
            permits: Arc::new(Semaphore::new(self.config.virtual_users as usize)),
        }))
    }
}

/// A run executing on its own task.
pub struct RunHandle {
    snapshots: mpsc::UnboundedReceiver<MetricsSnapshot>,
    control: RunControl,
    task: JoinHandle<Result<RunSummary, LoadTestError>>,
}

impl RunHandle {
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// See [`RunControl::cancel`].
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    /// Next per-tick snapshot, or `None` once the run has ended and every
    /// snapshot has been received.
    pub async fn next_snapshot(&mut self) -> Option<MetricsSnapshot> {
        self.snapshots.recv().await
    }

    /// Waits for the run to end and returns its summary.
    pub async fn finish(self) -> Result<RunSummary, LoadTestError> {
        match self.task.await {
            Ok(result) => result,
            Err(join_err) => {
                self.control
                    .transition(RunState::Running, RunState::Failed);
                Err(LoadTestError::EngineFault {
                    message: format!("engine task failed: {join_err}"),
                })
            },
        }
    }
}
