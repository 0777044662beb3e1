//! k6-style terminal rendering of run progress and results.
//!
//! Both renderers take structured data and return a formatted [`String`];
//! printing is left to the caller.
//!
//! Colors come from `colored` and honor [`colored::control::set_override`],
//! which the CLI turns off for `--no-color` or piped stdout.

use colored::Colorize;

use crate::config::TestConfig;
use crate::engine::RunState;
use crate::metrics::MetricsSnapshot;
use crate::report::RunSummary;

/// Width for dotted metric row padding.
const PAD_WIDTH: usize = 32;

/// Distinct failures shown per step in the terminal summary.
const MAX_DETAIL_LINES: usize = 5;

fn color_error_rate(pct: f64) -> String {
    let text = format!("{pct:.1}%");
    if pct > 5.0 {
        text.red().to_string()
    } else if pct > 1.0 {
        text.yellow().to_string()
    } else {
        text.green().to_string()
    }
}

fn color_latency(ms: u64) -> String {
    let text = format!("{ms}ms");
    if ms > 1000 {
        text.yellow().to_string()
    } else {
        text.green().to_string()
    }
}

/// One progress line for a per-tick snapshot.
///
/// ```text
///   [  3/60s] vus=25/100  rps=412.0  p95=87ms  errors=3 (0.2%)
/// ```
pub fn format_tick_line(snapshot: &MetricsSnapshot, config: &TestConfig) -> String {
    let errors = if snapshot.failed_requests > 0 {
        snapshot.failed_requests.to_string().red().to_string()
    } else {
        snapshot.failed_requests.to_string()
    };
    format!(
        "  [{:>3}/{}s] vus={}/{}  rps={:.1}  p95={}  errors={} ({})",
        snapshot.time,
        config.duration,
        snapshot.active_virtual_users,
        config.virtual_users,
        snapshot.requests_per_second,
        color_latency(snapshot.p95),
        errors,
        color_error_rate(snapshot.error_rate),
    )
}

/// Render the final summary of a run.
///
/// # Layout
///
/// ```text
///   httpload run                      completed
///
///   target:    https://api.example.com/health
///   shape:     ramp-up, 50 vus, 120s
///   scenario:  3 steps
///
///   http_req_duration...........: min=3ms avg=41.2ms max=912ms
///   http_req_percentiles........: p50=35ms p95=120ms p99=450ms
///   http_reqs...................: 12000
///   http_req_success............: 11940
///   http_req_failed.............: 60
///   http_req_error_rate.........: 0.5%
///   http_req_rate...............: 100.0 req/s (peak 131.0)
///   run_elapsed.................: 120.0s
/// ```
pub fn render_summary(summary: &RunSummary) -> String {
    let m = &summary.metrics;
    let config = &summary.config;
    let mut lines = Vec::new();

    let state = match summary.state {
        RunState::Completed => summary.state.to_string().green().to_string(),
        RunState::Cancelled => format!("{} (partial)", summary.state).yellow().to_string(),
        _ => summary.state.to_string().red().to_string(),
    };
    lines.push(String::new());
    lines.push(format!("  {:<34}{}", "httpload run".bold(), state));
    lines.push(String::new());

    let target = if summary.steps.is_empty() {
        format!("{} {}", config.method, config.url)
    } else {
        format!("{} steps", summary.steps.len())
    };
    lines.push(format!("  target:    {target}"));
    lines.push(format!(
        "  shape:     {}, {} vus, {}s",
        config.test_type, config.virtual_users, config.duration
    ));
    lines.push(String::new());

    lines.push(format_metric_row(
        "http_req_duration",
        &format!(
            "min={}ms avg={:.1}ms max={}",
            m.min_latency_ms,
            m.avg_latency_ms,
            color_latency(m.max_latency_ms)
        ),
    ));
    lines.push(format_metric_row(
        "http_req_percentiles",
        &format!("p50={}ms p95={}ms p99={}", m.p50, m.p95, color_latency(m.p99)),
    ));
    lines.push(format_metric_row("http_reqs", &m.total_requests.to_string()));
    lines.push(format_metric_row(
        "http_req_success",
        &m.successful_requests.to_string().green().to_string(),
    ));
    let failed = if m.failed_requests > 0 {
        m.failed_requests.to_string().red().to_string()
    } else {
        m.failed_requests.to_string()
    };
    lines.push(format_metric_row("http_req_failed", &failed));
    lines.push(format_metric_row(
        "http_req_error_rate",
        &color_error_rate(m.error_rate),
    ));
    lines.push(format_metric_row(
        "http_req_rate",
        &format!(
            "{:.1} req/s (peak {:.1})",
            m.requests_per_second, summary.peak_rps
        ),
    ));
    lines.push(format_metric_row(
        "run_elapsed",
        &format!("{:.1}s", summary.elapsed_secs),
    ));

    if !summary.percentiles.is_empty() && m.total_requests > 0 {
        lines.push(String::new());
        lines.push("  percentiles:".to_string());
        for row in &summary.percentiles {
            lines.push(format_metric_row(
                &format!("    {}", row.label),
                &format!("{}ms", row.value_ms),
            ));
        }
    }

    if !summary.status_codes.is_empty() {
        lines.push(String::new());
        lines.push("  status codes:".to_string());
        for (code, count) in &summary.status_codes {
            let label = if *code == 0 {
                "    no response".to_string()
            } else {
                format!("    {code}")
            };
            lines.push(format_metric_row(&label, &count.to_string()));
        }
    }

    if !summary.error_categories.is_empty() {
        lines.push(String::new());
        lines.push("  errors:".to_string());
        let mut categories: Vec<_> = summary.error_categories.iter().collect();
        categories.sort_by(|a, b| b.1.cmp(a.1));
        for (category, count) in categories {
            lines.push(format_metric_row(
                &format!("    {category}"),
                &count.to_string().red().to_string(),
            ));
        }
    }

    if summary.per_step.len() > 1 {
        lines.push(String::new());
        lines.push("  per-step metrics:".to_string());
        lines.push(String::new());
        lines.push(format!(
            "  {:<30} {:>7} {:>7} {:>7} {:>7} {:>7}",
            "step", "reqs", "err%", "p50", "p95", "p99"
        ));
        lines.push(format!("  {}", "\u{2500}".repeat(70)));
        for step in &summary.per_step {
            let name = if step.name.chars().count() > 30 {
                let truncated: String = step.name.chars().take(27).collect();
                format!("{truncated}...")
            } else {
                step.name.clone()
            };
            lines.push(format!(
                "  {:<30} {:>7} {:>7} {:>7} {:>7} {:>7}",
                name,
                step.metrics.total_requests,
                format!("{:.1}%", step.metrics.error_rate),
                format!("{}ms", step.metrics.p50),
                format!("{}ms", step.metrics.p95),
                format!("{}ms", step.metrics.p99),
            ));
        }
    }

    let failing: Vec<_> = summary
        .per_step
        .iter()
        .filter(|step| !step.metrics.error_details.is_empty())
        .collect();
    if !failing.is_empty() {
        lines.push(String::new());
        lines.push("  failure details:".to_string());
        for step in failing {
            lines.push(format!("    {}", step.name));
            for detail in step.metrics.error_details.iter().take(MAX_DETAIL_LINES) {
                let status = if detail.status_code == 0 {
                    "---".to_string()
                } else {
                    detail.status_code.to_string()
                };
                lines.push(format!(
                    "      {} x{}  {}",
                    status.red(),
                    detail.count,
                    detail.message.replace(['\n', '\r'], " ")
                ));
            }
        }
    }

    lines.join("\n")
}

/// Format a single metric row with dot-padding.
///
/// Produces: `"  metric_name..................: value_string"`
fn format_metric_row(name: &str, value: &str) -> String {
    format!("  {name:.<PAD_WIDTH$}: {value}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestStep;
    use crate::error::RequestError;
    use crate::metrics::{RequestOutcome, StatsAggregator};
    use crate::report::RunRecord;
    use chrono::Utc;
    use std::time::Duration;

    /// Disable colors in tests for deterministic assertions.
    fn setup_no_color() {
        colored::control::set_override(false);
    }

    fn config() -> TestConfig {
        TestConfig {
            url: "http://localhost:3000/health".to_string(),
            virtual_users: 10,
            duration: 60,
            ..TestConfig::default()
        }
    }

    fn summary_with(state: RunState, steps: &[TestStep], outcomes: &[RequestOutcome]) -> RunSummary {
        let stats = StatsAggregator::new(Duration::from_secs(1));
        for outcome in outcomes {
            stats.record(outcome);
        }
        let mut snap = stats.snapshot();
        snap.time = 1;
        snap.active_virtual_users = 10;
        let config = config();
        let now = Utc::now();
        RunSummary::from_run(RunRecord {
            state,
            config: &config,
            steps,
            history: &[snap],
            stats: &stats,
            elapsed: Duration::from_secs(60),
            started_at: now,
            ended_at: now,
        })
    }

    #[test]
    fn test_format_metric_row_pads_with_dots() {
        let row = format_metric_row("http_reqs", "42");
        assert!(row.starts_with("  http_reqs......"));
        assert!(row.ends_with(": 42"));
        assert_eq!(row.find(':'), Some(2 + PAD_WIDTH));
    }

    #[test]
    fn test_format_tick_line() {
        setup_no_color();
        let snapshot = MetricsSnapshot {
            time: 3,
            active_virtual_users: 25,
            requests_per_second: 412.0,
            p95: 87,
            failed_requests: 3,
            total_requests: 1500,
            successful_requests: 1497,
            error_rate: 0.2,
            ..MetricsSnapshot::default()
        };
        let line = format_tick_line(&snapshot, &config());
        assert_eq!(
            line,
            "  [  3/60s] vus=25/10  rps=412.0  p95=87ms  errors=3 (0.2%)"
        );
    }

    #[test]
    fn test_render_summary_header_and_metrics() {
        setup_no_color();
        let outcomes = vec![
            RequestOutcome::success("default", 200, Duration::from_millis(42)),
            RequestOutcome::success("default", 200, Duration::from_millis(58)),
        ];
        let output = render_summary(&summary_with(RunState::Completed, &[], &outcomes));

        assert!(output.contains("httpload run"));
        assert!(output.contains("completed"));
        assert!(output.contains("GET http://localhost:3000/health"));
        assert!(output.contains("fixed, 10 vus, 60s"));
        assert!(output.contains("min=42ms avg=50.0ms max=58ms"));
        assert!(output.contains("P99"));
        assert!(!output.contains("errors:"), "no error section without errors");
        assert!(!output.contains("per-step"), "single endpoint has no step table");
        assert!(!output.contains("failure details:"));
    }

    #[test]
    fn test_render_summary_error_breakdown_and_partial() {
        setup_no_color();
        let outcomes = vec![
            RequestOutcome::failure("default", 0, Duration::from_millis(1000), RequestError::Timeout),
            RequestOutcome::failure("default", 0, Duration::from_millis(1000), RequestError::Timeout),
            RequestOutcome::failure(
                "default",
                503,
                Duration::from_millis(5),
                RequestError::StatusMismatch {
                    status: 503,
                    expected: "2xx".to_string(),
                },
            ),
        ];
        let output = render_summary(&summary_with(RunState::Cancelled, &[], &outcomes));

        assert!(output.contains("cancelled (partial)"));
        assert!(output.contains("errors:"));
        assert!(output.contains("timeout"));
        assert!(output.contains("no response"));
        assert!(output.contains("503"));
        let timeout_pos = output.find("    timeout").unwrap();
        let status_pos = output.find("    status").unwrap();
        assert!(timeout_pos < status_pos, "categories sorted by count");
        assert!(output.contains("failure details:"));
        assert!(output.contains("      --- x2  Request timed out"));
        assert!(output.contains("      503 x1  HTTP 503: expected 2xx"));
    }

    #[test]
    fn test_render_summary_per_step_table() {
        setup_no_color();
        let mut login = TestStep::new("login", "http://localhost/login");
        login.name = "Log in with a very long descriptive step name".to_string();
        let search = TestStep::new("search", "http://localhost/search");
        let steps = vec![login, search];
        let outcomes = vec![
            RequestOutcome::success("login", 200, Duration::from_millis(10)),
            RequestOutcome::success("search", 200, Duration::from_millis(20)),
        ];
        let output = render_summary(&summary_with(RunState::Completed, &steps, &outcomes));

        assert!(output.contains("2 steps"));
        assert!(output.contains("per-step metrics:"));
        assert!(output.contains("Log in with a very long desc..."));
        assert!(output.contains("search"));
    }
}
