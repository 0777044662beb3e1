//! HdrHistogram-based statistics aggregation shared by all virtual users.
//!
//! [`StatsAggregator`] ingests [`RequestOutcome`]s from many tasks at once and
//! produces [`MetricsSnapshot`]s on the engine's tick. All state sits behind a
//! single `parking_lot::Mutex`; both `record` and `snapshot` hold it only for a
//! handful of counter updates, so contention stays low even at high request
//! rates.
//!
//! - **Exact counters**: totals, min, max and the latency sum are tracked
//!   directly, so `successful + failed == total` holds at every observation.
//! - **Percentiles**: recorded into an auto-resizing histogram with 3
//!   significant figures and clamped into `[min, max]`, which keeps
//!   `p50 <= p95 <= p99` and keeps them inside the observed range.
//! - **Windows**: per-tick request, error and latency counters reset on each
//!   [`StatsAggregator::snapshot`] and drive the RPS and time-series values.
//! - **Millisecond resolution**: matches how users think about latency.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::RequestError;

/// Quantiles reported in the summary percentile table.
const PERCENTILE_TABLE: [(&str, f64); 5] = [
    ("P50", 0.50),
    ("P75", 0.75),
    ("P90", 0.90),
    ("P95", 0.95),
    ("P99", 0.99),
];

/// Distinct `(status, message)` pairs kept per step; later pairs are dropped.
pub const MAX_ERROR_DETAILS: usize = 30;

/// Characters of a failure message kept for grouping.
const MAX_MESSAGE_CHARS: usize = 200;

/// Result of executing one step, including any retries.
///
/// Latency and status describe the last attempt only.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    /// Id of the step that produced this outcome.
    pub step_id: String,
    /// Whole seconds since the run started when the outcome completed.
    pub timestamp_secs: u64,
    /// Dispatch to final byte (or failure) of the last attempt.
    pub latency: Duration,
    pub success: bool,
    /// HTTP status of the last attempt, 0 when no response arrived.
    pub status_code: u16,
    /// Number of attempts made, at least 1.
    pub attempts: u32,
    /// Classified failure of the last attempt.
    pub error: Option<RequestError>,
    /// Response body excerpt of a failed attempt, when one was read.
    pub detail: Option<String>,
}

impl RequestOutcome {
    /// Create a successful single-attempt outcome.
    pub fn success(step_id: impl Into<String>, status_code: u16, latency: Duration) -> Self {
        Self {
            step_id: step_id.into(),
            timestamp_secs: 0,
            latency,
            success: true,
            status_code,
            attempts: 1,
            error: None,
            detail: None,
        }
    }

    /// Create a failed single-attempt outcome.
    pub fn failure(
        step_id: impl Into<String>,
        status_code: u16,
        latency: Duration,
        error: RequestError,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            timestamp_secs: 0,
            latency,
            success: false,
            status_code,
            attempts: 1,
            error: Some(error),
            detail: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn at(mut self, timestamp_secs: u64) -> Self {
        self.timestamp_secs = timestamp_secs;
        self
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }

    /// Message used to group this failure: the body excerpt when there is
    /// one, the error text otherwise. `None` for successes.
    pub fn failure_message(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        let message = match self.detail.as_deref().map(str::trim) {
            Some(detail) if !detail.is_empty() => detail.to_string(),
            _ => error.to_string(),
        };
        Some(truncate_chars(&message, MAX_MESSAGE_CHARS))
    }

    fn latency_ms(&self) -> u64 {
        u64::try_from(self.latency.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Point-in-time view of the aggregated metrics.
///
/// Cumulative fields cover the whole run so far; `window*` fields and
/// `requests_per_second` cover the interval since the previous snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Seconds since the run started (tick number).
    pub time: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub min_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub requests_per_second: f64,
    /// Failed requests as a percentage of all requests (0.0..=100.0).
    pub error_rate: f64,
    pub active_virtual_users: u32,
    pub window_requests: u64,
    pub window_errors: u64,
    pub window_avg_latency_ms: f64,
}

/// Per-step metrics with latency percentiles.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    pub step_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub min_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    /// Percentage (0.0..=100.0).
    pub error_rate: f64,
    /// Distinct failures, most frequent first.
    pub error_details: Vec<StepErrorDetail>,
}

/// How often one distinct failure occurred on a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepErrorDetail {
    /// 0 when no response arrived.
    pub status_code: u16,
    pub count: u64,
    pub message: String,
}

/// One row of the percentile breakdown table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileRow {
    /// `"P50"`, `"P75"`, `"P90"`, `"P95"`, `"P99"` or `"Max"`.
    pub label: String,
    pub value_ms: u64,
}

/// Exact counters plus a histogram for one population of requests.
struct LatencyStats {
    histogram: Histogram<u64>,
    total: u64,
    success: u64,
    failed: u64,
    min_ms: u64,
    max_ms: u64,
    sum_ms: u128,
}

impl LatencyStats {
    fn new() -> Self {
        let mut histogram = Histogram::<u64>::new(3).expect("3 sigfigs is always valid");
        histogram.auto(true);
        Self {
            histogram,
            total: 0,
            success: 0,
            failed: 0,
            min_ms: 0,
            max_ms: 0,
            sum_ms: 0,
        }
    }

    fn record(&mut self, ms: u64, success: bool) {
        if self.total == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.total += 1;
        if success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
        self.sum_ms += u128::from(ms);
        let _ = self.histogram.record(ms);
    }

    fn avg_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.sum_ms as f64 / self.total as f64
        }
    }

    /// Quantile clamped into the observed range, 0 when empty.
    fn quantile(&self, q: f64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        self.histogram
            .value_at_quantile(q)
            .clamp(self.min_ms, self.max_ms)
    }

    fn error_rate_pct(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Default)]
struct Window {
    requests: u64,
    errors: u64,
    latency_sum_ms: u128,
}

impl Window {
    fn avg_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.latency_sum_ms as f64 / self.requests as f64
        }
    }
}

struct AggregatorState {
    overall: LatencyStats,
    per_step: HashMap<String, LatencyStats>,
    step_errors: HashMap<String, HashMap<(u16, String), u64>>,
    status_codes: BTreeMap<u16, u64>,
    error_categories: BTreeMap<&'static str, u64>,
    window: Window,
}

/// Thread-safe aggregator of request outcomes.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use httpload::metrics::{RequestOutcome, StatsAggregator};
///
/// let stats = StatsAggregator::new(Duration::from_secs(1));
/// stats.record(&RequestOutcome::success("default", 200, Duration::from_millis(42)));
///
/// let snap = stats.snapshot();
/// assert_eq!(snap.total_requests, 1);
/// assert_eq!(snap.p50, 42);
/// ```
pub struct StatsAggregator {
    tick_interval: Duration,
    state: Mutex<AggregatorState>,
}

impl StatsAggregator {
    /// Creates an empty aggregator. `tick_interval` is the divisor for the
    /// windowed requests-per-second value.
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            tick_interval,
            state: Mutex::new(AggregatorState {
                overall: LatencyStats::new(),
                per_step: HashMap::new(),
                step_errors: HashMap::new(),
                status_codes: BTreeMap::new(),
                error_categories: BTreeMap::new(),
                window: Window::default(),
            }),
        }
    }

    /// Ingests one outcome. Safe to call from any number of tasks at once.
    pub fn record(&self, outcome: &RequestOutcome) {
        let ms = outcome.latency_ms();
        let mut state = self.state.lock();
        state.overall.record(ms, outcome.success);
        state
            .per_step
            .entry(outcome.step_id.clone())
            .or_insert_with(LatencyStats::new)
            .record(ms, outcome.success);
        *state.status_codes.entry(outcome.status_code).or_insert(0) += 1;
        if let Some(err) = &outcome.error {
            *state.error_categories.entry(err.error_category()).or_insert(0) += 1;
        }
        if let Some(message) = outcome.failure_message() {
            let errors = state
                .step_errors
                .entry(outcome.step_id.clone())
                .or_default();
            let key = (outcome.status_code, message);
            if let Some(count) = errors.get_mut(&key) {
                *count += 1;
            } else if errors.len() < MAX_ERROR_DETAILS {
                errors.insert(key, 1);
            }
        }
        state.window.requests += 1;
        state.window.latency_sum_ms += u128::from(ms);
        if !outcome.success {
            state.window.errors += 1;
        }
    }

    /// Reads the current metrics and starts a new window.
    ///
    /// `time` and `active_virtual_users` are left at 0 for the caller to fill.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut state = self.state.lock();
        let window = std::mem::take(&mut state.window);
        let secs = self.tick_interval.as_secs_f64();
        let rps = if secs > 0.0 {
            window.requests as f64 / secs
        } else {
            0.0
        };
        build_snapshot(&state.overall, &window, rps)
    }

    /// Whole-run view: RPS is the average over `elapsed`, the current window
    /// is reported but not reset.
    pub fn final_snapshot(&self, elapsed: Duration) -> MetricsSnapshot {
        let state = self.state.lock();
        let secs = elapsed.as_secs_f64();
        let rps = if secs > 0.0 {
            state.overall.total as f64 / secs
        } else {
            0.0
        };
        build_snapshot(&state.overall, &state.window, rps)
    }

    /// P50/P75/P90/P95/P99/Max over every recorded request.
    pub fn percentile_table(&self) -> Vec<PercentileRow> {
        let state = self.state.lock();
        let mut rows: Vec<PercentileRow> = PERCENTILE_TABLE
            .iter()
            .map(|(label, q)| PercentileRow {
                label: (*label).to_string(),
                value_ms: state.overall.quantile(*q),
            })
            .collect();
        rows.push(PercentileRow {
            label: "Max".to_string(),
            value_ms: state.overall.max_ms,
        });
        rows
    }

    /// Per-step breakdown sorted by step id.
    pub fn step_snapshots(&self) -> Vec<StepSnapshot> {
        let state = self.state.lock();
        let mut steps: Vec<StepSnapshot> = state
            .per_step
            .iter()
            .map(|(id, stats)| StepSnapshot {
                step_id: id.clone(),
                total_requests: stats.total,
                successful_requests: stats.success,
                failed_requests: stats.failed,
                min_latency_ms: stats.min_ms,
                avg_latency_ms: stats.avg_ms(),
                max_latency_ms: stats.max_ms,
                p50: stats.quantile(0.50),
                p95: stats.quantile(0.95),
                p99: stats.quantile(0.99),
                error_rate: stats.error_rate_pct(),
                error_details: state
                    .step_errors
                    .get(id)
                    .map(error_details)
                    .unwrap_or_default(),
            })
            .collect();
        steps.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        steps
    }

    /// Response counts by HTTP status; 0 counts transport failures.
    pub fn status_code_counts(&self) -> BTreeMap<u16, u64> {
        self.state.lock().status_codes.clone()
    }

    /// Failure counts by [`RequestError::error_category`].
    pub fn error_category_counts(&self) -> BTreeMap<String, u64> {
        self.state
            .lock()
            .error_categories
            .iter()
            .map(|(k, v)| ((*k).to_string(), *v))
            .collect()
    }

    pub fn total_requests(&self) -> u64 {
        self.state.lock().overall.total
    }
}

fn error_details(errors: &HashMap<(u16, String), u64>) -> Vec<StepErrorDetail> {
    let mut details: Vec<StepErrorDetail> = errors
        .iter()
        .map(|((status_code, message), count)| StepErrorDetail {
            status_code: *status_code,
            count: *count,
            message: message.clone(),
        })
        .collect();
    details.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(a.status_code.cmp(&b.status_code))
            .then_with(|| a.message.cmp(&b.message))
    });
    details
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn build_snapshot(overall: &LatencyStats, window: &Window, rps: f64) -> MetricsSnapshot {
    MetricsSnapshot {
        time: 0,
        total_requests: overall.total,
        successful_requests: overall.success,
        failed_requests: overall.failed,
        min_latency_ms: overall.min_ms,
        avg_latency_ms: overall.avg_ms(),
        max_latency_ms: overall.max_ms,
        p50: overall.quantile(0.50),
        p95: overall.quantile(0.95),
        p99: overall.quantile(0.99),
        requests_per_second: rps,
        error_rate: overall.error_rate_pct(),
        active_virtual_users: 0,
        window_requests: window.requests,
        window_errors: window.errors,
        window_avg_latency_ms: window.avg_ms(),
    }
}
