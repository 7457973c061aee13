//! HTTP dispatch pipeline (spec §4.G).
//!
//! `Transport` is the single seam that every service client dispatches
//! through: it owns the pooled `reqwest::Client` for one service plus that
//! service's rate limiter and circuit breaker, and runs the eight-step
//! pipeline described in the spec on every call. Service clients never
//! touch `reqwest` directly.

#[cfg(test)]
pub(crate) mod test_support;

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::Authorizer;
use crate::config::RetryPolicy;
use crate::context::CallContext;
use crate::error::{Error, ErrorKind, Result};
use crate::logging::LoggerHandle;
use crate::rate_limit::{CircuitBreaker, RateLimiter};
use crate::services::ServiceName;
use crate::version::{ApiVersion, VersionChecker};

#[derive(Debug, Clone)]
pub enum BodyKind {
    None,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: BodyKind,
    pub extra_headers: Vec<(String, String)>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        RequestSpec {
            method,
            path: path.into(),
            query: Vec::new(),
            body: BodyKind::None,
            extra_headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        RequestSpec::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        RequestSpec::new(Method::POST, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: BodyKind) -> Self {
        self.body = body;
        self
    }

    pub fn json_body(self, value: &impl Serialize) -> Result<Self> {
        let json = serde_json::to_value(value).map_err(Error::from)?;
        Ok(self.body(BodyKind::Json(json)))
    }
}

/// Builds a request URL the same way on every call: trailing slashes on
/// `base` and leading slashes on `path` are normalized to exactly one `/`
/// between them, and query parameters are percent-encoded via `reqwest`'s
/// own `Url::query_pairs_mut` rather than hand-rolled escaping.
pub fn build_url(base: &str, path: &str, query: &[(String, String)]) -> Result<reqwest::Url> {
    let trimmed_base = base.trim_end_matches('/');
    let trimmed_path = path.trim_start_matches('/');
    let full = format!("{trimmed_base}/{trimmed_path}");
    let mut url = reqwest::Url::parse(&full).map_err(|e| Error::validation_msg(format!("invalid URL: {e}")))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    Ok(url)
}

pub struct TransportResponse {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: bytes::Bytes,
}

impl TransportResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(Error::from)
    }

    pub fn is_no_content(&self) -> bool {
        self.status == 204
    }
}

/// Classifies a ≥400 response into the closed error taxonomy using status
/// code and parsed body (spec §4.B, §4.G step 6).
pub fn classify_error(status: u16, headers: &reqwest::header::HeaderMap, body: &[u8]) -> Error {
    let raw_body = String::from_utf8_lossy(body).to_string();
    let body_json: Option<serde_json::Value> = serde_json::from_slice(body).ok();
    let field = |name: &str| body_json.as_ref().and_then(|v| v.get(name)).and_then(|v| v.as_str());

    match status {
        401 => {
            let token_expired = field("code").map(|c| c.eq_ignore_ascii_case("authentication_timeout")).unwrap_or(false)
                || field("error").map(|c| c.eq_ignore_ascii_case("invalid_token")).unwrap_or(false);
            Error::auth_failed(status, token_expired, raw_body)
        }
        403 => Error::forbidden(status, raw_body),
        404 => Error::not_found(status, raw_body),
        400 | 422 => Error::validation(status, raw_body),
        409 => Error::conflict(status, raw_body),
        429 => {
            let retry_after = headers
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            Error::rate_limited(status, retry_after, raw_body)
        }
        500..=599 => Error::server(status, raw_body),
        _ => Error::server(status, raw_body),
    }
}

pub struct Transport {
    service: ServiceName,
    base_url: String,
    client: Arc<reqwest::Client>,
    authorizer: Option<Arc<dyn Authorizer>>,
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
    logger: LoggerHandle,
    user_agent: String,
    supported_version: ApiVersion,
    version_checker: Arc<VersionChecker>,
    check_api_version: bool,
    debug: bool,
    trace: bool,
}

pub struct TransportBuilder {
    service: ServiceName,
    base_url: String,
    client: Arc<reqwest::Client>,
    authorizer: Option<Arc<dyn Authorizer>>,
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
    logger: LoggerHandle,
    user_agent: String,
    supported_version: ApiVersion,
    version_checker: Arc<VersionChecker>,
    check_api_version: bool,
    debug: bool,
    trace: bool,
}

impl TransportBuilder {
    pub fn new(service: ServiceName, base_url: impl Into<String>, client: Arc<reqwest::Client>) -> Self {
        TransportBuilder {
            service,
            base_url: base_url.into(),
            client,
            authorizer: None,
            rate_limiter: Arc::new(RateLimiter::new(Default::default())),
            circuit_breaker: Arc::new(CircuitBreaker::new(Default::default())),
            retry_policy: RetryPolicy::default(),
            logger: LoggerHandle::default_handle(),
            user_agent: "sdk-core/0.1".to_string(),
            supported_version: ApiVersion::unversioned(service.as_str()),
            version_checker: Arc::new(VersionChecker::new()),
            check_api_version: true,
            debug: false,
            trace: false,
        }
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn rate_limiter(mut self, rl: Arc<RateLimiter>) -> Self {
        self.rate_limiter = rl;
        self
    }

    pub fn circuit_breaker(mut self, cb: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = cb;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn logger(mut self, logger: LoggerHandle) -> Self {
        self.logger = logger;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn supported_version(mut self, version: ApiVersion) -> Self {
        self.supported_version = version;
        self
    }

    pub fn version_checker(mut self, checker: Arc<VersionChecker>) -> Self {
        self.version_checker = checker;
        self
    }

    pub fn check_api_version(mut self, enabled: bool) -> Self {
        self.check_api_version = enabled;
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn trace(mut self, enabled: bool) -> Self {
        self.trace = enabled;
        self
    }

    pub fn build(self) -> Transport {
        Transport {
            service: self.service,
            base_url: self.base_url,
            client: self.client,
            authorizer: self.authorizer,
            rate_limiter: self.rate_limiter,
            circuit_breaker: self.circuit_breaker,
            retry_policy: self.retry_policy,
            logger: self.logger,
            user_agent: self.user_agent,
            supported_version: self.supported_version,
            version_checker: self.version_checker,
            check_api_version: self.check_api_version,
            debug: self.debug,
            trace: self.trace,
        }
    }
}

impl Transport {
    fn redact(&self, headers: &[(String, String)]) -> String {
        headers
            .iter()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case("authorization") && !self.trace {
                    format!("{k}: <redacted>")
                } else {
                    format!("{k}: {v}")
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn check_version_if_due(&self, server_version: Option<&str>) -> Result<()> {
        if !self.check_api_version {
            return Ok(());
        }
        if !self.version_checker.should_check(self.service.as_str()) {
            return Ok(());
        }
        let Some(raw) = server_version else {
            return Ok(());
        };
        let Some(advertised) = ApiVersion::parse(self.service.as_str(), raw) else {
            return Ok(());
        };
        if !self.supported_version.is_compatible_with(&advertised) {
            return Err(Error::version_mismatch(format!(
                "{} advertised {advertised} which is incompatible with required {}",
                self.service, self.supported_version
            )));
        }
        if advertised.is_ahead_of(&self.supported_version) {
            self.logger
                .warn(|| format!("{} server is ahead of the version this client targets ({advertised})", self.service));
        }
        Ok(())
    }

    async fn send_once(&self, ctx: &CallContext, spec: &RequestSpec, authenticate: bool) -> Result<TransportResponse> {
        self.rate_limiter.wait(ctx).await?;

        let url = build_url(&self.base_url, &spec.path, &spec.query)?;
        let mut builder = self.client.request(spec.method.clone(), url);
        builder = builder.header(reqwest::header::USER_AGENT, &self.user_agent);

        let mut sent_headers = vec![("User-Agent".to_string(), self.user_agent.clone())];

        if authenticate {
            if let Some(authorizer) = &self.authorizer {
                let token = authorizer.token(ctx).await?;
                let header_value = token.header_value();
                sent_headers.push(("Authorization".to_string(), header_value.clone()));
                builder = builder.header(reqwest::header::AUTHORIZATION, header_value);
            }
        }

        for (k, v) in &spec.extra_headers {
            sent_headers.push((k.clone(), v.clone()));
            builder = builder.header(k, v);
        }

        builder = match &spec.body {
            BodyKind::None => builder,
            BodyKind::Json(value) => {
                sent_headers.push(("Content-Type".to_string(), "application/json".to_string()));
                builder.json(value)
            }
            BodyKind::Form(pairs) => {
                sent_headers.push(("Content-Type".to_string(), "application/x-www-form-urlencoded".to_string()));
                builder.form(pairs)
            }
        };

        if self.debug || self.trace {
            self.logger.debug(|| format!("{} {} [{}]", spec.method, spec.path, self.redact(&sent_headers)));
        }

        // The breaker guards the whole round-trip, not just the transport-level
        // send: a classified retryable status (e.g. a 503) must count as a
        // failure too, or a sustained 5xx streak would never trip it (`send`
        // itself returns `Ok` for any HTTP response, success or not).
        if !self.circuit_breaker.allow() {
            return Err(Error::circuit_open());
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                self.circuit_breaker.record_failure();
                return Err(Error::from(e));
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        self.rate_limiter.update_from_headers(&headers);

        let server_version = headers
            .get("X-Service-Version")
            .or_else(|| headers.get("X-API-Version"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.check_version_if_due(server_version.as_deref()).await?;

        let body = response.bytes().await.map_err(Error::from)?;

        if self.trace {
            self.logger
                .debug(|| format!("<- {status} {}", String::from_utf8_lossy(&body)));
        }

        if status >= 400 {
            let err = classify_error(status, &headers, &body);
            if err.is_retryable() {
                self.circuit_breaker.record_failure();
            } else {
                self.circuit_breaker.record_success();
            }
            return Err(err);
        }

        self.circuit_breaker.record_success();
        Ok(TransportResponse { status, headers, body })
    }

    /// Runs the full pipeline including retries (spec §4.G steps 1-8).
    /// `authenticate` is false only for the identity client's own
    /// token-exchange calls, which cannot carry a bearer header yet. Auth
    /// failures get at most one transparent cache-invalidate-and-retry
    /// (spec §7); every other retryable kind follows the ordinary backoff
    /// budget.
    async fn dispatch(&self, ctx: &CallContext, spec: RequestSpec, authenticate: bool) -> Result<TransportResponse> {
        let _span = tracing::debug_span!(
            "transport.dispatch",
            service = %self.service,
            correlation_id = %ctx.correlation_id(),
            path = %spec.path,
        )
        .entered();

        let mut reauth_used = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.send_once(ctx, &spec, authenticate).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if e.kind == ErrorKind::AuthFailed && e.token_expired && !reauth_used {
                        reauth_used = true;
                        if let Some(authorizer) = &self.authorizer {
                            authorizer.invalidate().await;
                        }
                        continue;
                    }
                    if !e.is_retryable() || attempt >= self.retry_policy.backoff.max_attempts {
                        return Err(e);
                    }
                    let delay = self.retry_policy.backoff.delay(attempt);
                    tracing::warn!(
                        correlation_id = %ctx.correlation_id(),
                        attempt,
                        delay = %humantime::format_duration(delay),
                        "retrying after transient failure",
                    );
                    ctx.sleep(delay).await?;
                }
            }
        }
    }

    pub async fn send(&self, ctx: &CallContext, spec: RequestSpec) -> Result<TransportResponse> {
        self.dispatch(ctx, spec, true).await
    }

    pub async fn send_unauthenticated(&self, ctx: &CallContext, spec: RequestSpec) -> Result<TransportResponse> {
        self.dispatch(ctx, spec, false).await
    }

    pub fn service(&self) -> ServiceName {
        self.service
    }
}

/// Placeholder for query-string maps built up ad hoc by service clients.
pub type QueryMap = HashMap<String, String>;

/// Exercises the real pipeline end to end against an actual HTTP server.
/// `transport::test_support::MockTransport` is a same-shaped in-memory
/// double used everywhere else in the crate, but it's a different concrete
/// type than `Transport` and never touches `reqwest` or URL building at
/// all - these tests are the only place `build_url`, header injection, and
/// retry-over-the-wire are checked against a server that actually speaks
/// HTTP (spec §8 scenario S3, "Retry with backoff").
#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use std::time::Duration;
    use crate::config::RetryPolicy;
    use crate::rate_limit::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport_for(base_url: String, retry_policy: RetryPolicy) -> Transport {
        TransportBuilder::new(ServiceName::Transfer, base_url, Arc::new(reqwest::Client::new()))
            .rate_limiter(Arc::new(RateLimiter::new(RateLimiterConfig {
                requests_per_second: 1000.0,
                burst: 1000.0,
                adaptive: true,
            })))
            .circuit_breaker(Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())))
            .retry_policy(retry_policy)
            .check_api_version(false)
            .build()
    }

    #[tokio::test]
    async fn retries_503_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let mut policy = RetryPolicy::default();
        policy.backoff.initial = Duration::from_millis(1);
        policy.backoff.max_delay = Duration::from_millis(5);
        policy.backoff.max_attempts = 5;
        let transport = transport_for(server.uri(), policy);

        let ctx = CallContext::new();
        let resp = transport.send(&ctx, RequestSpec::get("/flaky")).await.unwrap();
        let body: serde_json::Value = resp.json().unwrap();
        assert_eq!(body["ok"], true);

        server.verify().await;
    }

    #[tokio::test]
    async fn classifies_real_404_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({"error": "no such thing"})))
            .mount(&server)
            .await;

        let transport = transport_for(server.uri(), RetryPolicy::default());
        let ctx = CallContext::new();
        let err = transport.send(&ctx, RequestSpec::get("/missing")).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.http_status, Some(404));
    }

    #[tokio::test]
    async fn rate_limit_headers_cap_subsequent_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/throttled"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"ok": true}))
                    .insert_header("X-RateLimit-Limit", "10")
                    .insert_header("X-RateLimit-Remaining", "0")
                    .insert_header("X-RateLimit-Reset", "9999999999"),
            )
            .mount(&server)
            .await;

        let transport = transport_for(server.uri(), RetryPolicy::default());
        let ctx = CallContext::new();
        transport.send(&ctx, RequestSpec::get("/throttled")).await.unwrap();

        // The adaptive update should have capped the bucket's tokens at the
        // server-reported `Remaining: 0`, so the rate limiter itself (not
        // the transport) now has nothing left to hand out immediately.
        assert_eq!(transport.rate_limiter.available_tokens(), 0.0);
    }
}
