//! Single-request execution with auth, headers, timeout and retries.
//!
//! [`RequestExecutor`] owns the shared `reqwest::Client` and the run-wide
//! request settings. [`RequestExecutor::execute`] resolves a step's
//! `{{name}}` placeholders against the calling VU's [`Variables`], performs
//! the request, retrying on failure with capped exponential backoff, and
//! returns a [`RequestOutcome`] describing the last attempt. It never touches
//! shared metrics state; the caller records the outcome.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use base64::prelude::*;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{AuthConfig, Header, TestConfig, TestStep, MAX_RETRY_COUNT};
use crate::error::{LoadTestError, RequestError};
use crate::metrics::RequestOutcome;
use crate::variables::Variables;

/// Base delay before the first retry.
const BASE_BACKOFF_MS: u64 = 50;

/// Upper bound on any single retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// TCP keep-alive interval used when `keepAlive` is enabled.
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Characters of a failing response body kept as the failure detail.
const MAX_DETAIL_CHARS: usize = 200;

/// Delay before retry number `attempt + 1`: `min(50ms * 2^attempt, 1s)`.
pub fn retry_backoff(attempt: u32) -> Duration {
    let ms = 1u64
        .checked_shl(attempt)
        .and_then(|factor| BASE_BACKOFF_MS.checked_mul(factor))
        .unwrap_or(u64::MAX);
    Duration::from_millis(ms).min(MAX_BACKOFF)
}

/// `Authorization` header value for the configured credentials.
pub fn authorization_header(auth: &AuthConfig) -> Option<String> {
    match auth {
        AuthConfig::None => None,
        AuthConfig::Bearer { token } => Some(format!("Bearer {token}")),
        AuthConfig::Basic { username, password } => Some(format!(
            "Basic {}",
            BASE64_STANDARD.encode(format!("{username}:{password}"))
        )),
    }
}

/// Content type assumed for a body sent without an explicit `Content-Type`.
pub fn infer_content_type(body: &str) -> &'static str {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    }
}

/// `status == expected`, or any 2xx when no expectation is set.
pub fn is_expected_status(status: u16, expected: Option<u16>) -> bool {
    match expected {
        Some(code) => status == code,
        None => (200..300).contains(&status),
    }
}

fn expected_label(expected: Option<u16>) -> String {
    expected.map_or_else(|| "2xx".to_string(), |code| code.to_string())
}

fn header_entry(header: &Header, vars: &Variables) -> Result<(HeaderName, HeaderValue), RequestError> {
    let name = HeaderName::from_bytes(header.key.trim().as_bytes()).map_err(|e| {
        RequestError::InvalidRequest {
            message: format!("invalid header name '{}': {e}", header.key),
        }
    })?;
    let value = vars.substitute(&header.value)?;
    let value = HeaderValue::from_str(&value).map_err(|e| RequestError::InvalidRequest {
        message: format!("invalid value for header '{}': {e}", header.key),
    })?;
    Ok((name, value))
}

/// A step with every `{{name}}` resolved, ready to send any number of times.
struct PreparedRequest {
    url: Url,
    headers: HeaderMap,
    body: Option<String>,
}

/// Response of an attempt whose status met the expectation.
struct Exchange {
    status: u16,
    body: Vec<u8>,
}

/// Why an attempt failed, with whatever the server returned.
struct AttemptFailure {
    status: u16,
    error: RequestError,
    detail: Option<String>,
}

impl AttemptFailure {
    fn new(status: u16, error: RequestError) -> Self {
        Self {
            status,
            error,
            detail: None,
        }
    }
}

fn body_excerpt(body: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.chars().take(MAX_DETAIL_CHARS).collect())
    }
}

/// Executes scenario steps against the target.
pub struct RequestExecutor {
    client: Client,
    auth_header: Option<String>,
    global_headers: Vec<Header>,
    timeout: Duration,
    test_start: Instant,
}

impl RequestExecutor {
    /// Builds the shared client from the config's transport settings.
    ///
    /// `test_start` anchors the `timestamp_secs` of every outcome.
    pub fn new(config: &TestConfig, test_start: Instant) -> Result<Self, LoadTestError> {
        let timeout = config.timeout_as_duration();
        let mut builder = Client::builder().timeout(timeout);
        builder = if config.keep_alive {
            builder.tcp_keepalive(TCP_KEEPALIVE)
        } else {
            builder.tcp_keepalive(None::<Duration>)
        };
        if !config.connection_reuse {
            builder = builder.pool_max_idle_per_host(0);
        }
        let client = builder
            .build()
            .map_err(|source| LoadTestError::HttpClient { source })?;

        Ok(Self {
            client,
            auth_header: authorization_header(&config.auth),
            global_headers: config.headers.clone(),
            timeout,
            test_start,
        })
    }

    /// Headers for one request of `step`, with `{{name}}` placeholders in
    /// values resolved from `vars`.
    ///
    /// The configured auth goes first, then global headers are appended in
    /// order, then each step header replaces every earlier value with the
    /// same name. An explicit `Authorization` header in either list drops the
    /// configured one. Keys repeated inside one list are all sent.
    pub fn build_headers(&self, step: &TestStep, vars: &Variables) -> Result<HeaderMap, RequestError> {
        let mut headers = HeaderMap::new();
        if let Some(auth) = &self.auth_header {
            let value = HeaderValue::from_str(auth).map_err(|e| RequestError::InvalidRequest {
                message: format!("invalid authorization value: {e}"),
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut explicit_auth = false;
        for header in &self.global_headers {
            let (name, value) = header_entry(header, vars)?;
            if name == AUTHORIZATION && !explicit_auth {
                headers.remove(AUTHORIZATION);
                explicit_auth = true;
            }
            headers.append(name, value);
        }

        let mut replaced = HashSet::new();
        for header in &step.headers {
            let (name, value) = header_entry(header, vars)?;
            if replaced.insert(name.clone()) {
                headers.remove(&name);
            }
            headers.append(name, value);
        }
        Ok(headers)
    }

    /// Target URL of `step` with placeholders resolved and query
    /// parameters appended.
    pub fn build_url(&self, step: &TestStep, vars: &Variables) -> Result<Url, RequestError> {
        let raw = vars.substitute(step.url.trim())?;
        let mut url = Url::parse(&raw).map_err(|e| RequestError::InvalidRequest {
            message: format!("invalid url '{raw}': {e}"),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RequestError::InvalidRequest {
                message: format!("unsupported url scheme '{}'", url.scheme()),
            });
        }
        if !step.query_params.is_empty() {
            let mut pairs = Vec::with_capacity(step.query_params.len());
            for (key, value) in &step.query_params {
                pairs.push((vars.substitute(key)?, vars.substitute(value)?));
            }
            let mut query = url.query_pairs_mut();
            for (key, value) in &pairs {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn prepare(&self, step: &TestStep, vars: &Variables) -> Result<PreparedRequest, RequestError> {
        let url = self.build_url(step, vars)?;
        let mut headers = self.build_headers(step, vars)?;
        let body = match &step.body {
            Some(body) if step.method.carries_body() => {
                let body = vars.substitute(body)?;
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static(infer_content_type(&body)),
                    );
                }
                Some(body)
            }
            _ => None,
        };
        Ok(PreparedRequest { url, headers, body })
    }

    /// Performs `step`, retrying up to `retry_count` extra times.
    ///
    /// Placeholders are resolved from `vars` once, before the first attempt.
    /// On success the step's extraction rules write into `vars`. Once `stop`
    /// fires no further attempt starts and a pending backoff is cut short;
    /// the outcome of the last finished attempt is returned.
    pub async fn execute(
        &self,
        step: &TestStep,
        vars: &mut Variables,
        stop: &CancellationToken,
    ) -> RequestOutcome {
        let prepared = match self.prepare(step, vars) {
            Ok(prepared) => prepared,
            Err(err) => {
                tracing::debug!(step = %step.id, error = %err, "request not sent");
                return RequestOutcome::failure(&step.id, 0, Duration::ZERO, err)
                    .at(self.test_start.elapsed().as_secs());
            }
        };

        let max_attempts = step.retry_count.min(MAX_RETRY_COUNT) + 1;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let start = Instant::now();
            let result = self.attempt(step, &prepared).await;
            let latency = start.elapsed();
            let timestamp = self.test_start.elapsed().as_secs();

            let outcome = match result {
                Ok(exchange) => match vars.capture(&step.extraction_rules, &exchange.body) {
                    Ok(()) => RequestOutcome::success(&step.id, exchange.status, latency),
                    Err(err) => RequestOutcome::failure(&step.id, exchange.status, latency, err),
                },
                Err(failed) => {
                    RequestOutcome::failure(&step.id, failed.status, latency, failed.error)
                        .with_detail(failed.detail)
                }
            };
            let retryable = outcome.error.as_ref().is_some_and(RequestError::is_retryable);
            if !retryable || attempts >= max_attempts || stop.is_cancelled() {
                return outcome.with_attempts(attempts).at(timestamp);
            }

            let backoff = retry_backoff(attempts - 1);
            tracing::debug!(
                step = %step.id,
                attempt = attempts,
                status = outcome.status_code,
                backoff_ms = backoff.as_millis() as u64,
                "request failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = stop.cancelled() => {
                    tracing::debug!(step = %step.id, attempt = attempts, "retry abandoned on stop");
                    return outcome.with_attempts(attempts).at(timestamp);
                }
            }
        }
    }

    /// One attempt, capped by the timeout from dispatch to final body byte.
    ///
    /// A status that arrived before the timeout is kept on the failure.
    async fn attempt(
        &self,
        step: &TestStep,
        prepared: &PreparedRequest,
    ) -> Result<Exchange, AttemptFailure> {
        let mut request = self
            .client
            .request(step.method.as_reqwest(), prepared.url.clone())
            .headers(prepared.headers.clone())
            .timeout(self.timeout);
        if let Some(body) = &prepared.body {
            request = request.body(body.clone());
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        let response = match tokio::time::timeout_at(deadline, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(AttemptFailure::new(0, RequestError::classify_reqwest(&e))),
            Err(_) => return Err(AttemptFailure::new(0, RequestError::Timeout)),
        };
        let status = response.status().as_u16();
        let body = match tokio::time::timeout_at(deadline, response.bytes()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                return Err(AttemptFailure::new(
                    status,
                    RequestError::classify_reqwest(&e),
                ))
            }
            Err(_) => return Err(AttemptFailure::new(status, RequestError::Timeout)),
        };

        if !is_expected_status(status, step.expected_status) {
            return Err(AttemptFailure {
                status,
                error: RequestError::StatusMismatch {
                    status,
                    expected: expected_label(step.expected_status),
                },
                detail: body_excerpt(&body),
            });
        }
        let body = if step.extraction_rules.is_empty() {
            Vec::new()
        } else {
            body.to_vec()
        };
        Ok(Exchange { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExtractionRule, HttpMethod};
    use mockito::Matcher;

    fn config_for(url: &str) -> TestConfig {
        TestConfig {
            url: url.to_string(),
            virtual_users: 1,
            duration: 1,
            timeout: 1,
            ..TestConfig::default()
        }
    }

    fn step(url: String) -> TestStep {
        TestStep::new("step", url)
    }

    async fn run(executor: &RequestExecutor, step: &TestStep) -> RequestOutcome {
        executor
            .execute(step, &mut Variables::new(), &CancellationToken::new())
            .await
    }

    #[test]
    fn test_retry_backoff_is_capped_exponential() {
        assert_eq!(retry_backoff(0), Duration::from_millis(50));
        assert_eq!(retry_backoff(1), Duration::from_millis(100));
        assert_eq!(retry_backoff(4), Duration::from_millis(800));
        assert_eq!(retry_backoff(5), Duration::from_secs(1));
        assert_eq!(retry_backoff(64), Duration::from_secs(1));
    }

    #[test]
    fn test_authorization_header_values() {
        assert_eq!(authorization_header(&AuthConfig::None), None);
        assert_eq!(
            authorization_header(&AuthConfig::Bearer {
                token: "abc".to_string()
            })
            .as_deref(),
            Some("Bearer abc")
        );
        assert_eq!(
            authorization_header(&AuthConfig::Basic {
                username: "user".to_string(),
                password: "pass".to_string(),
            })
            .as_deref(),
            Some("Basic dXNlcjpwYXNz")
        );
    }

    #[test]
    fn test_infer_content_type() {
        assert_eq!(infer_content_type(r#"{"a":1}"#), "application/json");
        assert_eq!(infer_content_type("  [1,2]"), "application/json");
        assert_eq!(infer_content_type("name=value"), "text/plain; charset=utf-8");
    }

    #[test]
    fn test_is_expected_status() {
        assert!(is_expected_status(200, None));
        assert!(is_expected_status(204, None));
        assert!(!is_expected_status(301, None));
        assert!(!is_expected_status(500, None));
        assert!(is_expected_status(404, Some(404)));
        assert!(!is_expected_status(200, Some(201)));
    }

    #[test]
    fn test_step_headers_replace_global_values() {
        let mut config = config_for("http://localhost");
        config.headers = vec![
            Header::new("X-Env", "global"),
            Header::new("X-Trace", "one"),
            Header::new("X-Trace", "two"),
        ];
        let executor = RequestExecutor::new(&config, Instant::now()).unwrap();
        let mut s = step("http://localhost".to_string());
        s.headers = vec![Header::new("x-env", "step-a"), Header::new("X-Env", "step-b")];

        let headers = executor.build_headers(&s, &Variables::new()).unwrap();
        let env: Vec<_> = headers.get_all("x-env").iter().collect();
        assert_eq!(env, vec!["step-a", "step-b"]);
        let trace: Vec<_> = headers.get_all("x-trace").iter().collect();
        assert_eq!(trace, vec!["one", "two"]);
    }

    #[test]
    fn test_explicit_authorization_overrides_auth() {
        let mut config = config_for("http://localhost");
        config.auth = AuthConfig::Bearer {
            token: "configured".to_string(),
        };
        let executor = RequestExecutor::new(&config, Instant::now()).unwrap();

        let plain = executor
            .build_headers(&step("http://localhost".to_string()), &Variables::new())
            .unwrap();
        assert_eq!(plain.get(AUTHORIZATION).unwrap(), "Bearer configured");

        let mut s = step("http://localhost".to_string());
        s.headers = vec![Header::new("Authorization", "Token explicit")];
        let headers = executor.build_headers(&s, &Variables::new()).unwrap();
        let values: Vec<_> = headers.get_all(AUTHORIZATION).iter().collect();
        assert_eq!(values, vec!["Token explicit"]);
    }

    #[test]
    fn test_global_authorization_overrides_auth_and_auth_comes_first() {
        let mut config = config_for("http://localhost");
        config.auth = AuthConfig::Bearer {
            token: "configured".to_string(),
        };
        config.headers = vec![Header::new("X-Env", "global")];
        let executor = RequestExecutor::new(&config, Instant::now()).unwrap();
        let headers = executor
            .build_headers(&step("http://localhost".to_string()), &Variables::new())
            .unwrap();
        assert_eq!(headers.keys().next(), Some(&AUTHORIZATION));

        config.headers = vec![
            Header::new("Authorization", "Token a"),
            Header::new("Authorization", "Token b"),
        ];
        let executor = RequestExecutor::new(&config, Instant::now()).unwrap();
        let headers = executor
            .build_headers(&step("http://localhost".to_string()), &Variables::new())
            .unwrap();
        let values: Vec<_> = headers.get_all(AUTHORIZATION).iter().collect();
        assert_eq!(values, vec!["Token a", "Token b"]);
    }

    #[test]
    fn test_invalid_header_name_is_request_error() {
        let executor = RequestExecutor::new(&config_for("http://localhost"), Instant::now()).unwrap();
        let mut s = step("http://localhost".to_string());
        s.headers = vec![Header::new("bad header", "x")];
        let err = executor.build_headers(&s, &Variables::new()).unwrap_err();
        assert_eq!(err.error_category(), "request");
    }

    #[tokio::test]
    async fn test_execute_success_with_bearer_and_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .match_header("authorization", "Bearer abc")
            .match_header("x-env", "step")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let mut config = config_for(&server.url());
        config.auth = AuthConfig::Bearer {
            token: "abc".to_string(),
        };
        config.headers = vec![Header::new("X-Env", "global")];
        let executor = RequestExecutor::new(&config, Instant::now()).unwrap();
        let mut s = step(format!("{}/health", server.url()));
        s.headers = vec![Header::new("X-Env", "step")];

        let outcome = run(&executor, &s).await;
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.step_id, "step");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_execute_basic_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header("authorization", "Basic dXNlcjpwYXNz")
            .with_status(204)
            .create_async()
            .await;

        let mut config = config_for(&server.url());
        config.auth = AuthConfig::Basic {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let executor = RequestExecutor::new(&config, Instant::now()).unwrap();
        let outcome = run(&executor, &step(format!("{}/", server.url()))).await;
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.status_code, 204);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_execute_posts_body_with_inferred_content_type() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/items")
            .match_header("content-type", "application/json")
            .match_body(r#"{"name":"widget"}"#)
            .with_status(201)
            .create_async()
            .await;

        let executor = RequestExecutor::new(&config_for(&server.url()), Instant::now()).unwrap();
        let mut s = step(format!("{}/items", server.url()));
        s.method = HttpMethod::Post;
        s.body = Some(r#"{"name":"widget"}"#.to_string());
        s.expected_status = Some(201);

        let outcome = run(&executor, &s).await;
        assert!(outcome.success, "{outcome:?}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_never_sends_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header("content-type", Matcher::Missing)
            .match_body("")
            .with_status(200)
            .create_async()
            .await;

        let executor = RequestExecutor::new(&config_for(&server.url()), Instant::now()).unwrap();
        let mut s = step(format!("{}/", server.url()));
        s.body = Some("ignored".to_string());

        let outcome = run(&executor, &s).await;
        assert!(outcome.success, "{outcome:?}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_execute_retries_on_status_mismatch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let executor = RequestExecutor::new(&config_for(&server.url()), Instant::now()).unwrap();
        let mut s = step(format!("{}/flaky", server.url()));
        s.retry_count = 2;

        let started = Instant::now();
        let outcome = run(&executor, &s).await;
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.status_code, 500);
        assert_eq!(
            outcome.error,
            Some(RequestError::StatusMismatch {
                status: 500,
                expected: "2xx".to_string(),
            })
        );
        // 50ms + 100ms of backoff between the three attempts
        assert!(started.elapsed() >= Duration::from_millis(150));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_expected_status_mismatch_on_2xx() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(200)
            .create_async()
            .await;

        let executor = RequestExecutor::new(&config_for(&server.url()), Instant::now()).unwrap();
        let mut s = step(format!("{}/", server.url()));
        s.expected_status = Some(201);

        let outcome = run(&executor, &s).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.error.unwrap().error_category(), "status");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_failure() {
        let executor =
            RequestExecutor::new(&config_for("http://127.0.0.1:1"), Instant::now()).unwrap();
        let outcome = run(&executor, &step("http://127.0.0.1:1/".to_string())).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status_code, 0);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.error.unwrap().is_transport());
    }

    #[tokio::test]
    async fn test_timeout_caps_unresponsive_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let url = format!("http://{addr}/");
        let executor = RequestExecutor::new(&config_for(&url), Instant::now()).unwrap();
        let outcome = run(&executor, &step(url)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error, Some(RequestError::Timeout));
        assert!(outcome.latency >= Duration::from_millis(900));
        assert!(outcome.latency < Duration::from_secs(3));
        hold.abort();
    }

    #[tokio::test]
    async fn test_body_timeout_keeps_received_status() {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut socket, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf);
                let _ = socket.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial");
                std::thread::sleep(Duration::from_secs(3));
            }
        });

        let url = format!("http://{addr}/");
        let executor = RequestExecutor::new(&config_for(&url), Instant::now()).unwrap();
        let outcome = run(&executor, &step(url)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error, Some(RequestError::Timeout));
        assert_eq!(outcome.status_code, 200);
    }

    #[tokio::test]
    async fn test_stop_cuts_retry_backoff_short() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/down")
            .with_status(500)
            .expect_at_least(1)
            .create_async()
            .await;

        let executor = RequestExecutor::new(&config_for(&server.url()), Instant::now()).unwrap();
        let mut s = step(format!("{}/down", server.url()));
        s.retry_count = 5;

        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = executor.execute(&s, &mut Variables::new(), &stop).await;
        // full backoff schedule for five retries is 1.55s
        assert!(started.elapsed() < Duration::from_millis(600), "{:?}", started.elapsed());
        assert!(outcome.attempts < 6, "{outcome:?}");
        assert_eq!(outcome.status_code, 500);
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_already_stopped_makes_single_attempt() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/down")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let executor = RequestExecutor::new(&config_for(&server.url()), Instant::now()).unwrap();
        let mut s = step(format!("{}/down", server.url()));
        s.retry_count = 3;
        let stop = CancellationToken::new();
        stop.cancel();

        let outcome = executor.execute(&s, &mut Variables::new(), &stop).await;
        assert_eq!(outcome.attempts, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_mismatch_carries_body_detail() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(500)
            .with_body("  database locked\n")
            .create_async()
            .await;

        let executor = RequestExecutor::new(&config_for(&server.url()), Instant::now()).unwrap();
        let outcome = run(&executor, &step(format!("{}/", server.url()))).await;
        assert_eq!(outcome.detail.as_deref(), Some("database locked"));
        assert_eq!(outcome.failure_message().as_deref(), Some("database locked"));
    }

    #[test]
    fn test_build_url_appends_encoded_query_params() {
        let executor = RequestExecutor::new(&config_for("http://localhost"), Instant::now()).unwrap();
        let mut s = step("http://api.local/{{section}}?x=1".to_string());
        s.query_params.insert("q".to_string(), "{{term}}".to_string());
        s.query_params.insert("page".to_string(), "2".to_string());
        let mut vars = Variables::new();
        vars.insert("section", "search");
        vars.insert("term", "a b&c");

        let url = executor.build_url(&s, &vars).unwrap();
        assert_eq!(url.as_str(), "http://api.local/search?x=1&page=2&q=a+b%26c");

        let err = executor.build_url(&s, &Variables::new()).unwrap_err();
        assert_eq!(err.error_category(), "request");
    }

    #[test]
    fn test_header_values_are_substituted() {
        let mut config = config_for("http://localhost");
        config.headers = vec![Header::new("X-Tenant", "{{tenant}}")];
        let executor = RequestExecutor::new(&config, Instant::now()).unwrap();
        let mut vars = Variables::new();
        vars.insert("tenant", "acme");

        let headers = executor
            .build_headers(&step("http://localhost".to_string()), &vars)
            .unwrap();
        assert_eq!(headers.get("x-tenant").unwrap(), "acme");
    }

    #[tokio::test]
    async fn test_extracted_values_feed_later_requests() {
        let mut server = mockito::Server::new_async().await;
        let login = server
            .mock("POST", "/login")
            .with_status(200)
            .with_body(r#"{"token":"t-1","user":{"id":42}}"#)
            .create_async()
            .await;
        let profile = server
            .mock("PUT", "/users/42")
            .match_header("authorization", "Bearer t-1")
            .match_query(Matcher::UrlEncoded("fields".into(), "name email".into()))
            .match_body(r#"{"owner":"42"}"#)
            .with_status(204)
            .create_async()
            .await;

        let executor = RequestExecutor::new(&config_for(&server.url()), Instant::now()).unwrap();
        let mut first = TestStep::new("login", format!("{}/login", server.url()));
        first.method = HttpMethod::Post;
        first.extraction_rules = vec![
            ExtractionRule {
                json_path: "$.token".to_string(),
                save_as: "token".to_string(),
            },
            ExtractionRule {
                json_path: "user.id".to_string(),
                save_as: "userId".to_string(),
            },
        ];
        let mut second = TestStep::new("profile", format!("{}/users/{{{{userId}}}}", server.url()));
        second.method = HttpMethod::Put;
        second.headers = vec![Header::new("Authorization", "Bearer {{token}}")];
        second
            .query_params
            .insert("fields".to_string(), "name email".to_string());
        second.body = Some(r#"{"owner":"{{userId}}"}"#.to_string());

        let mut vars = Variables::new();
        let stop = CancellationToken::new();
        let outcome = executor.execute(&first, &mut vars, &stop).await;
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(vars.get("token"), Some("t-1"));

        let outcome = executor.execute(&second, &mut vars, &stop).await;
        assert!(outcome.success, "{outcome:?}");
        login.assert_async().await;
        profile.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_variable_fails_without_sending() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let executor = RequestExecutor::new(&config_for(&server.url()), Instant::now()).unwrap();
        let mut s = step(format!("{}/items/{{{{itemId}}}}", server.url()));
        s.retry_count = 3;
        let outcome = run(&executor, &s).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status_code, 0);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.error.unwrap().error_category(), "request");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_extraction_failure_keeps_status_and_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/page")
            .with_status(200)
            .with_body("<html></html>")
            .expect(1)
            .create_async()
            .await;

        let executor = RequestExecutor::new(&config_for(&server.url()), Instant::now()).unwrap();
        let mut s = step(format!("{}/page", server.url()));
        s.retry_count = 2;
        s.extraction_rules = vec![ExtractionRule {
            json_path: "$.id".to_string(),
            save_as: "id".to_string(),
        }];
        let mut vars = Variables::new();
        let outcome = executor
            .execute(&s, &mut vars, &CancellationToken::new())
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.error.unwrap().error_category(), "extraction");
        assert!(vars.is_empty());
        mock.assert_async().await;
    }
}
