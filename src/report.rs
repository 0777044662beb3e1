//! Terminal run summary: final metrics, time series and breakdowns.
//!
//! [`RunSummary`] is the single value a run ends with. It is self-contained:
//! the full config and step list are embedded next to the results so anyone
//! reading a serialized summary knows exactly what was run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::config::{TestConfig, TestStep};
use crate::engine::RunState;
use crate::metrics::{MetricsSnapshot, PercentileRow, StatsAggregator, StepSnapshot};

/// Schema version for the serialized summary.
///
/// Increment when making breaking changes to the structure.
const SCHEMA_VERSION: &str = "1.0";

/// Average latency of the requests completed during one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTimePoint {
    pub time: u64,
    pub response_time: f64,
}

/// Concurrency target and throughput of one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveUsersPoint {
    pub time: u64,
    pub users: u32,
    pub rps: f64,
}

/// Failed requests completed during one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPoint {
    pub time: u64,
    pub errors: u64,
}

/// Per-step metrics with the step's display name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub name: String,
    #[serde(flatten)]
    pub metrics: StepSnapshot,
}

/// Everything known about a finished (or cancelled) run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Format version for parser compatibility.
    pub schema_version: String,
    pub state: RunState,
    /// `true` when the run was cancelled before its duration elapsed.
    pub partial: bool,
    pub config: TestConfig,
    pub steps: Vec<TestStep>,
    /// Whole-run metrics; `requestsPerSecond` is the run average.
    pub metrics: MetricsSnapshot,
    pub response_time_series: Vec<ResponseTimePoint>,
    pub active_users_series: Vec<ActiveUsersPoint>,
    pub error_timeline: Vec<ErrorPoint>,
    pub percentiles: Vec<PercentileRow>,
    pub per_step: Vec<StepSummary>,
    pub status_codes: BTreeMap<u16, u64>,
    pub error_categories: BTreeMap<String, u64>,
    /// Highest per-tick requests-per-second observed.
    pub peak_rps: f64,
    pub elapsed_secs: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Inputs collected by the engine when a run ends.
pub struct RunRecord<'a> {
    pub state: RunState,
    pub config: &'a TestConfig,
    pub steps: &'a [TestStep],
    /// Every snapshot emitted, in tick order.
    pub history: &'a [MetricsSnapshot],
    pub stats: &'a StatsAggregator,
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunSummary {
    /// Assemble the summary from the emitted history and the aggregator's
    /// final state (which includes requests that completed after the last tick).
    pub fn from_run(run: RunRecord<'_>) -> Self {
        let mut metrics = run.stats.final_snapshot(run.elapsed);
        match run.history.last() {
            Some(last) => {
                metrics.time = last.time;
                metrics.active_virtual_users = last.active_virtual_users;
            },
            None => metrics.time = run.elapsed.as_secs(),
        }

        let response_time_series = run
            .history
            .iter()
            .map(|s| ResponseTimePoint {
                time: s.time,
                response_time: s.window_avg_latency_ms,
            })
            .collect();
        let active_users_series = run
            .history
            .iter()
            .map(|s| ActiveUsersPoint {
                time: s.time,
                users: s.active_virtual_users,
                rps: s.requests_per_second,
            })
            .collect();
        let error_timeline = run
            .history
            .iter()
            .map(|s| ErrorPoint {
                time: s.time,
                errors: s.window_errors,
            })
            .collect();
        let peak_rps = run
            .history
            .iter()
            .map(|s| s.requests_per_second)
            .fold(0.0, f64::max);

        let per_step = run
            .stats
            .step_snapshots()
            .into_iter()
            .map(|metrics| StepSummary {
                name: step_display_name(run.config, run.steps, &metrics.step_id),
                metrics,
            })
            .collect();

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            state: run.state,
            partial: run.state == RunState::Cancelled,
            config: run.config.clone(),
            steps: run.steps.to_vec(),
            metrics,
            response_time_series,
            active_users_series,
            error_timeline,
            percentiles: run.stats.percentile_table(),
            per_step,
            status_codes: run.stats.status_code_counts(),
            error_categories: run.stats.error_category_counts(),
            peak_rps,
            elapsed_secs: run.elapsed.as_secs_f64(),
            started_at: run.started_at,
            ended_at: run.ended_at,
        }
    }
}

fn step_display_name(config: &TestConfig, steps: &[TestStep], step_id: &str) -> String {
    match steps.iter().find(|s| s.id == step_id) {
        Some(step) if !step.name.is_empty() => step.name.clone(),
        Some(step) => step.id.clone(),
        None if steps.is_empty() => config.url.clone(),
        None => step_id.to_string(),
    }
}

/// Write a summary as pretty-printed JSON to `path`.
pub fn write_summary(summary: &RunSummary, path: &Path) -> Result<(), std::io::Error> {
    let json = serde_json::to_string_pretty(summary).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}
