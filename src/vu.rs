//! Virtual user (VU) task loop for load generation.
//!
//! Each VU independently picks weighted-random steps, executes them and
//! records the outcome into the shared [`StatsAggregator`]. Values captured by
//! extraction rules live in the VU's own [`Variables`] and are never shared. A VU holds one
//! permit of the run's concurrency semaphore for its whole life, so the
//! number of working VUs never exceeds the configured ceiling even while
//! stopped VUs finish their last request and replacements start up.

use rand::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::executor::RequestExecutor;
use crate::metrics::StatsAggregator;
use crate::selector::ScenarioSelector;
use crate::variables::Variables;

/// Atomic counter tracking the number of currently active virtual users.
///
/// Lightweight wrapper around `Arc<AtomicU32>` for clone-friendly sharing
/// across VU tasks and the engine.
#[derive(Clone)]
pub struct ActiveVuCounter(Arc<AtomicU32>);

impl ActiveVuCounter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU32::new(0)))
    }

    /// Increments the active VU count by one.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the active VU count by one.
    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns the current number of active VUs.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for ActiveVuCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a VU shares with its siblings for one run.
pub struct VuContext {
    pub selector: ScenarioSelector,
    pub executor: RequestExecutor,
    pub aggregator: Arc<StatsAggregator>,
    /// Pause after every request.
    pub request_pause: Duration,
    /// One permit per allowed concurrent VU.
    pub permits: Arc<Semaphore>,
}

/// Sleeps for `duration` unless `stop` fires first.
///
/// Returns `true` if the full pause elapsed and the VU should continue.
async fn pause(duration: Duration, stop: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !stop.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = stop.cancelled() => false,
    }
}

/// Main virtual user task loop.
///
/// Each VU:
/// 1. Waits for a concurrency permit (or exits if stopped first).
/// 2. Picks a step, sleeps its `delay`, executes it, records the outcome,
///    then sleeps the run's request pause.
/// 3. Checks `stop` at every suspension point except the request itself,
///    so an in-flight request always completes or hits its own timeout.
///    Retries stop as soon as `stop` fires.
///
/// The `active_vus` counter covers the time the permit is held.
pub async fn vu_loop(
    vu_id: u32,
    ctx: Arc<VuContext>,
    stop: CancellationToken,
    active_vus: ActiveVuCounter,
) {
    let permit = tokio::select! {
        permit = ctx.permits.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
        _ = stop.cancelled() => return,
    };
    active_vus.increment();
    tracing::debug!(vu = vu_id, "virtual user started");

    let mut rng = StdRng::from_rng(&mut rand::rng());
    let mut variables = Variables::new();
    let mut iterations: u64 = 0;
    while !stop.is_cancelled() {
        let step = ctx.selector.pick(&mut rng);
        if !pause(step.delay_as_duration(), &stop).await {
            break;
        }

        let outcome = ctx.executor.execute(step, &mut variables, &stop).await;
        ctx.aggregator.record(&outcome);
        iterations += 1;

        if !pause(ctx.request_pause, &stop).await {
            break;
        }
    }

    tracing::debug!(
        vu = vu_id,
        iterations,
        variables = variables.len(),
        "virtual user stopped"
    );
    active_vus.decrement();
    drop(permit);
}
