//! Error types for the load generation engine.
//!
//! Defines [`LoadTestError`] for run-level failures (configuration, setup,
//! engine faults) and [`RequestError`] for per-request transport and protocol
//! failures. Per-request errors are recorded as failed outcomes and never
//! abort a run.

/// Errors that end a run or prevent it from starting.
#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    /// TOML parse failure -- the plan file contains invalid TOML syntax
    /// or does not match the expected schema.
    #[error("Failed to parse plan TOML: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// JSON parse failure -- the plan document is not valid JSON or does not
    /// match the expected schema.
    #[error("Failed to parse plan JSON: {source}")]
    ConfigJson {
        #[from]
        source: serde_json::Error,
    },

    /// Semantic validation failure -- the config parsed successfully but
    /// contains invalid values (e.g., zero virtual users, unparseable URL).
    #[error("Config validation error: {message}")]
    ConfigValidation { message: String },

    /// File I/O failure -- the plan file could not be read from disk.
    #[error("Failed to read plan file '{path}': {source}")]
    ConfigIo {
        source: std::io::Error,
        path: String,
    },

    /// The shared HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {source}")]
    HttpClient { source: reqwest::Error },

    /// `run` was invoked on an engine that already left the pending state.
    #[error("Run already started")]
    AlreadyStarted,

    /// Internal invariant violation detected while the run was in progress.
    #[error("Engine fault: {message}")]
    EngineFault { message: String },
}

impl LoadTestError {
    /// Shorthand for a [`LoadTestError::ConfigValidation`] error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }
}

/// Transport and protocol errors encountered while executing one request.
///
/// Each variant represents a distinct error category that the metrics pipeline
/// counts and reports separately.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The response arrived but its status did not satisfy the expectation.
    #[error("HTTP {status}: expected {expected}")]
    StatusMismatch { status: u16, expected: String },

    /// The request exceeded the configured per-request timeout.
    #[error("Request timed out")]
    Timeout,

    /// Connection-level failure (DNS resolution, TCP connect, TLS handshake).
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Any other failure while sending the request or reading the body.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The request could not be built: unknown `{{variable}}`, invalid
    /// header or URL after substitution. Nothing was sent.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// The response arrived but an extraction rule could not be applied.
    #[error("Extraction failed: {message}")]
    Extraction { message: String },
}

impl RequestError {
    /// Returns the error category as a static string for metrics classification.
    ///
    /// Categories: `"status"`, `"timeout"`, `"connection"`, `"transport"`,
    /// `"request"`, `"extraction"`.
    pub fn error_category(&self) -> &'static str {
        match self {
            Self::StatusMismatch { .. } => "status",
            Self::Timeout => "timeout",
            Self::Connection { .. } => "connection",
            Self::Transport { .. } => "transport",
            Self::InvalidRequest { .. } => "request",
            Self::Extraction { .. } => "extraction",
        }
    }

    /// Returns `true` for failures that happened below the HTTP layer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connection { .. } | Self::Transport { .. }
        )
    }

    /// Returns `true` if another attempt may succeed: transport failures and
    /// status mismatches. Request-building and extraction errors repeat.
    pub fn is_retryable(&self) -> bool {
        self.is_transport() || matches!(self, Self::StatusMismatch { .. })
    }

    /// Classify a [`reqwest::Error`] into the appropriate [`RequestError`] variant.
    pub fn classify_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connection {
                message: err.to_string(),
            }
        } else {
            Self::Transport {
                message: err.to_string(),
            }
        }
    }
}
