//! Run configuration: target, load shape, scenario steps and validation.
//!
//! A run is described by a [`TestConfig`] (target, load shape, transport
//! options) plus an optional list of weighted [`TestStep`]s. Both serialize with
//! camelCase field names so the same documents can come from a UI form or a
//! plan file on disk.
//!
//! # Example TOML
//!
//! ```toml
//! [config]
//! url = "https://api.example.com/health"
//! testType = "ramp-up"
//! virtualUsers = 50
//! duration = 120
//! rampUpTime = 30
//! timeout = 10
//! auth = { type = "bearer", token = "abc123" }
//!
//! [[steps]]
//! id = "list"
//! name = "List items"
//! url = "https://api.example.com/items"
//! weight = 3
//!
//! [[steps]]
//! id = "create"
//! name = "Create item"
//! method = "POST"
//! url = "https://api.example.com/items"
//! body = '{"name":"widget"}'
//! expectedStatus = 201
//! retryCount = 2
//! extractionRules = [{ jsonPath = "$.id", saveAs = "itemId" }]
//!
//! [[steps]]
//! id = "fetch"
//! url = "https://api.example.com/items/{{itemId}}"
//! queryParams = { expand = "owner" }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::LoadTestError;

/// Maximum number of retries a step may request.
pub const MAX_RETRY_COUNT: u32 = 5;

/// Load shape applied over the run duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestType {
    /// Constant concurrency for the whole run.
    #[default]
    Fixed,
    /// Linear increase to full concurrency over `rampUpTime`.
    RampUp,
    /// Low baseline with a full-concurrency burst around the midpoint.
    Spike,
    /// Four equal steps climbing to full concurrency.
    Stress,
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fixed => "fixed",
            Self::RampUp => "ramp-up",
            Self::Spike => "spike",
            Self::Stress => "stress",
        };
        f.write_str(s)
    }
}

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    /// Returns `true` if a configured body is sent with this method.
    pub fn carries_body(&self) -> bool {
        !matches!(self, Self::Get | Self::Head)
    }

    /// Converts to the transport's method type.
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
            Self::Head => reqwest::Method::HEAD,
            Self::Options => reqwest::Method::OPTIONS,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_reqwest().as_str())
    }
}

/// One request header. Keys may repeat within a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Captures a value from a successful response into a per-VU variable.
///
/// `jsonPath` supports `$.a.b`, `$.items[0]` and `$['key']`; `$` alone
/// captures the raw body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRule {
    pub json_path: String,
    pub save_as: String,
}

/// Credentials attached to every request of a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

/// Top-level description of a run.
///
/// Immutable once a run starts: the engine owns its own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConfig {
    /// Target URL, used when the scenario has no steps.
    pub url: String,
    /// Method for the single-endpoint mode.
    pub method: HttpMethod,
    /// Load shape.
    pub test_type: TestType,
    /// Upper bound on concurrent virtual users.
    pub virtual_users: u32,
    /// Run duration in seconds.
    pub duration: u64,
    /// Ramp-up period in seconds (only used by [`TestType::RampUp`]).
    pub ramp_up_time: u64,
    /// Global headers applied to every request before step headers.
    pub headers: Vec<Header>,
    /// Body for the single-endpoint mode.
    pub body: Option<String>,
    pub auth: AuthConfig,
    /// Per-request timeout in seconds.
    pub timeout: u64,
    /// Enable TCP keep-alive on client connections.
    pub keep_alive: bool,
    /// Keep idle connections pooled between requests.
    pub connection_reuse: bool,
    /// Pause after each request, in milliseconds.
    pub delay_between_requests: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: HttpMethod::Get,
            test_type: TestType::Fixed,
            virtual_users: 10,
            duration: 60,
            ramp_up_time: 0,
            headers: Vec::new(),
            body: None,
            auth: AuthConfig::None,
            timeout: 30,
            keep_alive: true,
            connection_reuse: true,
            delay_between_requests: 0,
        }
    }
}

impl TestConfig {
    /// Convert the `timeout` field to a [`Duration`].
    pub fn timeout_as_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Convert the `delay_between_requests` field to a [`Duration`].
    pub fn request_pause(&self) -> Duration {
        Duration::from_millis(self.delay_between_requests)
    }
}

/// A weighted request in a multi-step scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStep {
    /// Unique identifier, used to key per-step metrics.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<String>,
    /// Relative selection probability. Non-positive values count as 1.
    #[serde(default = "default_weight")]
    pub weight: i64,
    /// Pause before executing the step, in milliseconds.
    #[serde(default)]
    pub delay: u64,
    /// Exact status that counts as success. Any 2xx when absent.
    #[serde(default)]
    pub expected_status: Option<u16>,
    /// Extra attempts after a failed one.
    #[serde(default)]
    pub retry_count: u32,
    /// Appended to the URL, URL-encoded. Values may use `{{name}}`.
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default)]
    pub extraction_rules: Vec<ExtractionRule>,
}

fn default_weight() -> i64 {
    1
}

impl TestStep {
    /// Creates a GET step with default weight and no retries.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            weight: 1,
            delay: 0,
            expected_status: None,
            retry_count: 0,
            query_params: BTreeMap::new(),
            extraction_rules: Vec::new(),
        }
    }

    /// Builds the implicit single step used when a scenario is empty.
    pub fn from_config(config: &TestConfig) -> Self {
        Self {
            id: "default".to_string(),
            name: config.url.clone(),
            method: config.method,
            url: config.url.clone(),
            headers: Vec::new(),
            body: config.body.clone(),
            weight: 1,
            delay: 0,
            expected_status: None,
            retry_count: 0,
            query_params: BTreeMap::new(),
            extraction_rules: Vec::new(),
        }
    }

    /// Selection weight with non-positive values mapped to 1.
    pub fn effective_weight(&self) -> u64 {
        if self.weight <= 0 {
            1
        } else {
            self.weight as u64
        }
    }

    /// Convert the `delay` field to a [`Duration`].
    pub fn delay_as_duration(&self) -> Duration {
        Duration::from_millis(self.delay)
    }
}

/// A config plus its scenario, as loaded from a plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestPlan {
    pub config: TestConfig,
    #[serde(default)]
    pub steps: Vec<TestStep>,
}

impl LoadTestPlan {
    /// Parse a TOML string into a validated [`LoadTestPlan`].
    pub fn from_toml(content: &str) -> Result<Self, LoadTestError> {
        let plan: Self = toml::from_str(content)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Parse a JSON string into a validated [`LoadTestPlan`].
    pub fn from_json(content: &str) -> Result<Self, LoadTestError> {
        let plan: Self = serde_json::from_str(content)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Load and validate a plan from a file path.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as TOML.
    pub fn load(path: &Path) -> Result<Self, LoadTestError> {
        let plan = Self::read(path)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Parse a plan file without validating it, so callers can apply
    /// overrides first.
    pub fn read(path: &Path) -> Result<Self, LoadTestError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadTestError::ConfigIo {
            source,
            path: path.display().to_string(),
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(toml::from_str(&content)?)
        }
    }

    pub fn validate(&self) -> Result<(), LoadTestError> {
        validate(&self.config, &self.steps)
    }
}

/// Validate a config and its scenario before a run starts.
///
/// Checks:
/// - `url` is a parseable http(s) URL when there are no steps
/// - every step has a unique non-empty id and a parseable http(s) URL
/// - `virtualUsers`, `duration` and `timeout` are at least 1
/// - `retryCount` is within `0..=5` and `expectedStatus` within `100..=599`
/// - header keys are non-empty
/// - extraction rules name both a path and a variable
///
/// URLs containing `{{name}}` placeholders are only checked at request time.
pub fn validate(config: &TestConfig, steps: &[TestStep]) -> Result<(), LoadTestError> {
    if config.virtual_users == 0 {
        return Err(LoadTestError::validation(
            "virtualUsers must be at least 1",
        ));
    }
    if config.duration == 0 {
        return Err(LoadTestError::validation("duration must be at least 1 second"));
    }
    if config.timeout == 0 {
        return Err(LoadTestError::validation("timeout must be at least 1 second"));
    }
    validate_headers(&config.headers, "config")?;

    if steps.is_empty() {
        if config.url.trim().is_empty() {
            return Err(LoadTestError::validation(
                "url is required when no steps are defined",
            ));
        }
        validate_url(&config.url, "config")?;
        return Ok(());
    }

    let mut seen = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(LoadTestError::validation("step id must not be empty"));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(LoadTestError::validation(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        let context = format!("step '{}'", step.id);
        validate_url(&step.url, &context)?;
        validate_headers(&step.headers, &context)?;
        if step.retry_count > MAX_RETRY_COUNT {
            return Err(LoadTestError::validation(format!(
                "{context}: retryCount {} exceeds maximum of {MAX_RETRY_COUNT}",
                step.retry_count
            )));
        }
        if let Some(status) = step.expected_status {
            if !(100..=599).contains(&status) {
                return Err(LoadTestError::validation(format!(
                    "{context}: expectedStatus {status} is outside 100..=599"
                )));
            }
        }
        if step
            .extraction_rules
            .iter()
            .any(|r| r.json_path.trim().is_empty() || r.save_as.trim().is_empty())
        {
            return Err(LoadTestError::validation(format!(
                "{context}: extraction rules need both jsonPath and saveAs"
            )));
        }
    }
    Ok(())
}

fn validate_url(raw: &str, context: &str) -> Result<(), LoadTestError> {
    if raw.contains("{{") {
        return Ok(());
    }
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| LoadTestError::validation(format!("{context}: invalid url '{raw}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(LoadTestError::validation(format!(
            "{context}: unsupported url scheme '{other}' (expected http or https)"
        ))),
    }
}

fn validate_headers(headers: &[Header], context: &str) -> Result<(), LoadTestError> {
    if headers.iter().any(|h| h.key.trim().is_empty()) {
        return Err(LoadTestError::validation(format!(
            "{context}: header keys must not be empty"
        )));
    }
    Ok(())
}
