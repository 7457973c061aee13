//! Runtime configuration (spec §A.3, §6 "Configuration inputs").
//!
//! `SdkConfig` is a plain, immutable-once-built struct assembled with a
//! `Builder`, mirroring the `DaemonConfig`/builder split the rest of this
//! codebase uses for long-lived runtime objects. Nothing here reads
//! environment variables or files directly - callers decide where values
//! come from and pass them in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::logging::{LogLevel, Logger, LoggerHandle, TracingLogger};
use crate::pool::PoolConfig;
use crate::rate_limit::{BackoffStrategy, CircuitBreakerConfig, RateLimiterConfig};
use crate::services::ServiceName;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            backoff: BackoffStrategy::default(),
        }
    }
}

#[derive(Clone)]
pub struct SdkConfig {
    pub base_urls: HashMap<ServiceName, String>,
    pub user_agent: String,
    pub logger: LoggerHandle,
    pub retry_policy: RetryPolicy,
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub pool_overrides: HashMap<ServiceName, PoolConfig>,
    pub check_api_version: bool,
    pub debug: bool,
    pub trace: bool,
    /// Escape hatch: forces every pooled client to keep zero idle
    /// connections (every request pays a fresh handshake). Intended for
    /// environments where a long-lived pool would hold a load balancer's
    /// connection hostage (spec §6).
    pub disable_connection_pool: bool,
    pub request_timeout: Duration,
}

impl SdkConfig {
    pub fn builder() -> SdkConfigBuilder {
        SdkConfigBuilder::default()
    }

    pub fn base_url_for(&self, service: ServiceName) -> Option<&str> {
        self.base_urls.get(&service).map(String::as_str)
    }

    pub fn pool_config_for(&self, service: ServiceName, fallback: &PoolConfig) -> PoolConfig {
        self.pool_overrides
            .get(&service)
            .cloned()
            .unwrap_or_else(|| fallback.clone())
    }
}

pub struct SdkConfigBuilder {
    base_urls: HashMap<ServiceName, String>,
    user_agent: String,
    logger: Option<Arc<dyn Logger>>,
    log_level: LogLevel,
    retry_policy: RetryPolicy,
    rate_limiter: RateLimiterConfig,
    circuit_breaker: CircuitBreakerConfig,
    pool_overrides: HashMap<ServiceName, PoolConfig>,
    check_api_version: bool,
    debug: bool,
    trace: bool,
    disable_connection_pool: bool,
    request_timeout: Duration,
}

impl Default for SdkConfigBuilder {
    fn default() -> Self {
        SdkConfigBuilder {
            base_urls: HashMap::new(),
            user_agent: "sdk-core/0.1".to_string(),
            logger: None,
            log_level: LogLevel::Info,
            retry_policy: RetryPolicy::default(),
            rate_limiter: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pool_overrides: HashMap::new(),
            check_api_version: true,
            debug: false,
            trace: false,
            disable_connection_pool: false,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl SdkConfigBuilder {
    pub fn base_url(mut self, service: ServiceName, url: impl Into<String>) -> Self {
        self.base_urls.insert(service, url.into());
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = config;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn pool_override(mut self, service: ServiceName, config: PoolConfig) -> Self {
        self.pool_overrides.insert(service, config);
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

    /// Caller decides whether this is on; the SDK never inspects the
    /// environment to guess (spec §6: "`SdkConfig` takes a plain `bool`").
    pub fn disable_connection_pool(mut self, disabled: bool) -> Self {
        self.disable_connection_pool = disabled;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> SdkConfig {
        let level = if self.trace {
            LogLevel::Debug
        } else if self.debug {
            LogLevel::Debug
        } else {
            self.log_level
        };
        let logger = LoggerHandle::new(self.logger.unwrap_or_else(|| Arc::new(TracingLogger)), level);

        SdkConfig {
            base_urls: self.base_urls,
            user_agent: self.user_agent,
            logger,
            retry_policy: self.retry_policy,
            rate_limiter: self.rate_limiter,
            circuit_breaker: self.circuit_breaker,
            pool_overrides: self.pool_overrides,
            check_api_version: self.check_api_version,
            debug: self.debug,
            trace: self.trace,
            disable_connection_pool: self.disable_connection_pool,
            request_timeout: self.request_timeout,
        }
    }
}
