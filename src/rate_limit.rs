//! Adaptive token bucket, exponential backoff, and circuit breaker (spec §4.C).
//!
//! The token bucket's `wait`/adaptive-update split and the circuit breaker's
//! explicit FSM are grounded on the Hyperliquid adapter's `TokenBucket`
//! (capacity/refill_per_sec/throttle_until) from the broader example pack;
//! the backoff arithmetic mirrors `fusillade::request::transitions::Request
//! <Failed>::retry`'s `backoff_ms.saturating_mul(backoff_factor.saturating_
//! pow(attempt))` capped at `max_backoff_ms`, with jitter layered on top as
//! the spec requires.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::header::HeaderMap;

use crate::context::CallContext;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub requests_per_second: f64,
    pub burst: f64,
    /// When true, response headers are allowed to adjust `refill_rate` and
    /// cap `tokens` (spec "Adaptive Update").
    pub adaptive: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            requests_per_second: 10.0,
            burst: 10.0,
            adaptive: true,
        }
    }
}

struct BucketState {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
    /// Forced minimum wait from a `Retry-After` header.
    cooldown_until: Option<Instant>,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }
}

/// A thread-safe adaptive token bucket. Acquisition is serialized through an
/// internal mutex; waiters loop on the computed deficit rather than holding
/// the lock, so there's no lock held across an `.await`.
pub struct RateLimiter {
    state: Mutex<BucketState>,
    adaptive: bool,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        RateLimiter {
            state: Mutex::new(BucketState {
                tokens: config.burst,
                capacity: config.burst,
                refill_rate: config.requests_per_second.max(f64::MIN_POSITIVE),
                last_refill: Instant::now(),
                cooldown_until: None,
            }),
            adaptive: config.adaptive,
        }
    }

    /// Blocks (cancellably, per `ctx`) until a token is available.
    pub async fn wait(&self, ctx: &CallContext) -> Result<()> {
        loop {
            let wait_for = {
                let mut st = self.state.lock();
                let now = Instant::now();
                if let Some(until) = st.cooldown_until {
                    if now < until {
                        Some(until - now)
                    } else {
                        st.cooldown_until = None;
                        None
                    }
                } else {
                    st.refill(now);
                    if st.tokens >= 1.0 {
                        st.tokens -= 1.0;
                        None
                    } else {
                        let deficit = 1.0 - st.tokens;
                        Some(Duration::from_secs_f64(deficit / st.refill_rate))
                    }
                }
            };

            match wait_for {
                None => return Ok(()),
                Some(d) => ctx.sleep(d).await?,
            }
            // Loop back and re-check under the lock rather than assuming
            // the wait was sufficient, to avoid a stampede of wasted wakeups.
        }
    }

    /// Updates bucket state from response headers (spec "Adaptive Update").
    pub fn update_from_headers(&self, headers: &HeaderMap) {
        let info = parse_rate_limit_headers(headers);
        let mut st = self.state.lock();

        if let Some(retry_after) = info.retry_after {
            st.cooldown_until = Some(Instant::now() + retry_after);
        }

        if !self.adaptive {
            return;
        }

        if let (Some(remaining), Some(reset)) = (info.remaining, info.reset_epoch) {
            let now_epoch = chrono::Utc::now().timestamp();
            let seconds_to_reset = (reset - now_epoch).max(1) as f64;
            st.refill_rate = (remaining as f64 / seconds_to_reset).max(f64::MIN_POSITIVE);
            st.tokens = st.tokens.min(remaining as f64);
        }
    }

    /// Current token count without refilling or consuming one. Exposed for
    /// tests that assert on adaptive-update behavior rather than timing.
    pub(crate) fn available_tokens(&self) -> f64 {
        self.state.lock().tokens
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RateLimitHeaderInfo {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_epoch: Option<i64>,
    pub retry_after: Option<Duration>,
}

/// Parses standard `X-RateLimit-*`/`Retry-After` headers, plus
/// `X-Globus-RateLimit-*` vendor variants (spec §6: honored when the
/// `Server` header identifies that backend).
pub fn parse_rate_limit_headers(headers: &HeaderMap) -> RateLimitHeaderInfo {
    let vendor_prefix = headers
        .get(reqwest::header::SERVER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase().contains("globus"))
        .unwrap_or(false);

    let header_u64 = |name: &str| -> Option<u64> {
        headers.get(name).and_then(|v| v.to_str().ok()).and_then(|s| s.trim().parse().ok())
    };
    let header_i64 = |name: &str| -> Option<i64> {
        headers.get(name).and_then(|v| v.to_str().ok()).and_then(|s| s.trim().parse().ok())
    };

    let (limit, remaining, reset_epoch) = if vendor_prefix {
        (
            header_u64("X-Globus-RateLimit-Limit").or_else(|| header_u64("X-RateLimit-Limit")),
            header_u64("X-Globus-RateLimit-Remaining").or_else(|| header_u64("X-RateLimit-Remaining")),
            header_i64("X-Globus-RateLimit-Reset").or_else(|| header_i64("X-RateLimit-Reset")),
        )
    } else {
        (
            header_u64("X-RateLimit-Limit"),
            header_u64("X-RateLimit-Remaining"),
            header_i64("X-RateLimit-Reset"),
        )
    };

    let retry_after = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    RateLimitHeaderInfo {
        limit,
        remaining,
        reset_epoch,
        retry_after,
    }
}

// ---------------------------------------------------------------------
// Exponential backoff
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct BackoffStrategy {
    pub initial: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: f64,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl BackoffStrategy {
    /// `delay(n) = min(max_delay, initial * factor^(n-1)) * (1 + jitter * U[0,1))`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let scale = self.factor.powi(exponent.min(i32::MAX as u32) as i32);
        let base = self.initial.mul_f64(scale).min(self.max_delay);
        if self.jitter <= 0.0 {
            return base;
        }
        let jitter_fraction = 1.0 + self.jitter * rand::random::<f64>();
        base.mul_f64(jitter_fraction).min(self.max_delay.mul_f64(1.0 + self.jitter))
    }
}

// ---------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            half_open_successes: 2,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

pub type CircuitObserver = Box<dyn Fn(CircuitState) + Send + Sync>;

pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    config: CircuitBreakerConfig,
    observer: Option<CircuitObserver>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker::with_observer(config, None)
    }

    pub fn with_observer(config: CircuitBreakerConfig, observer: Option<CircuitObserver>) -> Self {
        CircuitBreaker {
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
            config,
            observer,
        }
    }

    fn notify(&self, state: CircuitState) {
        if let Some(observer) = &self.observer {
            observer(state);
        }
    }

    /// Returns `true` if a call is currently allowed; transitions OPEN ->
    /// HALF_OPEN if the timeout has elapsed. Per spec, while OPEN every
    /// `execute` fails fast without invoking the wrapped call.
    pub fn allow(&self) -> bool {
        let transitioned = {
            let mut st = self.state.lock();
            match st.state {
                CircuitState::Closed | CircuitState::HalfOpen => None,
                CircuitState::Open => {
                    let elapsed = st.opened_at.is_some_and(|t| t.elapsed() >= self.config.open_timeout);
                    if elapsed {
                        st.state = CircuitState::HalfOpen;
                        st.half_open_successes = 0;
                        Some(CircuitState::HalfOpen)
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(s) = transitioned {
            self.notify(s);
        }
        !matches!(self.state.lock().state, CircuitState::Open)
    }

    pub fn record_success(&self) {
        let transitioned = {
            let mut st = self.state.lock();
            match st.state {
                CircuitState::Closed => {
                    st.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    st.half_open_successes += 1;
                    if st.half_open_successes >= self.config.half_open_successes {
                        st.state = CircuitState::Closed;
                        st.consecutive_failures = 0;
                        Some(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };
        if let Some(s) = transitioned {
            self.notify(s);
        }
    }

    pub fn record_failure(&self) {
        let transitioned = {
            let mut st = self.state.lock();
            match st.state {
                CircuitState::Closed => {
                    st.consecutive_failures += 1;
                    if st.consecutive_failures >= self.config.failure_threshold {
                        st.state = CircuitState::Open;
                        st.opened_at = Some(Instant::now());
                        Some(CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    st.state = CircuitState::Open;
                    st.opened_at = Some(Instant::now());
                    st.half_open_successes = 0;
                    Some(CircuitState::Open)
                }
                CircuitState::Open => None,
            }
        };
        if let Some(s) = transitioned {
            self.notify(s);
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Runs `f` under the breaker's protection: fails fast with
    /// `CIRCUIT_OPEN` if the gate is shut, else records the outcome.
    pub async fn guard<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.allow() {
            return Err(Error::circuit_open());
        }
        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

/// Generic retry loop driven by a [`BackoffStrategy`] and a
/// retryability predicate (spec §4.C "Retry Loop").
pub async fn retry<F, Fut, T>(
    ctx: &CallContext,
    strategy: &BackoffStrategy,
    mut f: F,
    classify: impl Fn(&Error) -> bool,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !classify(&e) || attempt >= strategy.max_attempts {
                    return Err(e);
                }
                ctx.sleep(strategy.delay(attempt)).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test_log::test(tokio::test(start_paused = true))]
    async fn bucket_allows_burst_then_throttles() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            requests_per_second: 1.0,
            burst: 2.0,
            adaptive: false,
        });
        let ctx = CallContext::new();
        limiter.wait(&ctx).await.unwrap();
        limiter.wait(&ctx).await.unwrap();

        let start = tokio::time::Instant::now();
        let handle = tokio::spawn({
            let ctx = ctx.clone();
            async move { limiter.wait(&ctx).await }
        });
        tokio::time::advance(Duration::from_millis(1100)).await;
        handle.await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[rstest]
    #[case(BackoffStrategy::default())]
    #[case(BackoffStrategy { initial: Duration::from_millis(10), factor: 3.0, max_delay: Duration::from_secs(2), max_attempts: 8, jitter: 0.0 })]
    #[case(BackoffStrategy { initial: Duration::from_secs(1), factor: 1.5, max_delay: Duration::from_millis(500), max_attempts: 3, jitter: 0.5 })]
    fn backoff_is_bounded(#[case] strategy: BackoffStrategy) {
        for attempt in 1..=10 {
            let d = strategy.delay(attempt);
            assert!(d <= strategy.max_delay.mul_f64(1.0 + strategy.jitter));
        }
    }

    #[test]
    fn circuit_breaker_fsm() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            open_timeout: Duration::from_millis(0),
            half_open_successes: 2,
        });
        assert_eq!(breaker.current_state(), CircuitState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Open);
        // timeout is zero, so the very next `allow()` probes into HALF_OPEN
        assert!(breaker.allow());
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Open);
    }

    #[test]
    fn circuit_breaker_closes_after_half_open_successes() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_millis(0),
            half_open_successes: 2,
        });
        breaker.record_failure();
        assert_eq!(breaker.current_state(), CircuitState::Open);
        assert!(breaker.allow());
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.current_state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }
}
