//! HTTP load-generation engine.
//!
//! Drives a configurable number of virtual users against one endpoint or a
//! weighted scenario of request steps, shaping concurrency over time with a
//! load-shape policy (fixed, ramp-up, spike, stress). Once per second the
//! engine emits a [`metrics::MetricsSnapshot`]; when the run ends it returns a
//! [`report::RunSummary`] with time series, percentiles and breakdowns.
//!
//! # Example
//!
//! ```no_run
//! use httpload::config::TestConfig;
//! use httpload::engine::LoadTestEngine;
//!
//! # async fn demo() -> Result<(), httpload::error::LoadTestError> {
//! let config = TestConfig {
//!     url: "http://localhost:8080/health".to_string(),
//!     virtual_users: 10,
//!     duration: 30,
//!     ..TestConfig::default()
//! };
//!
//! let mut handle = LoadTestEngine::new(config, Vec::new()).spawn();
//! while let Some(snapshot) = handle.next_snapshot().await {
//!     println!("t={} rps={:.1}", snapshot.time, snapshot.requests_per_second);
//! }
//! let summary = handle.finish().await?;
//! println!("p99 = {}ms", summary.metrics.p99);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod policy;
pub mod report;
pub mod selector;
pub mod summary;
pub mod variables;
pub mod vu;
