//! Leveled, dependency-injected logging sink (spec §4.A).
//!
//! The spec's "Logger" component is a thin facade over `tracing` so call
//! sites can inject a test double (a `Logger` trait object) while production
//! code gets the crate's normal structured `tracing` events for free -
//! downstream consumers attach whatever `tracing_subscriber` they like
//! without this crate fighting for stdout. No global mutable logger exists;
//! every component that logs is handed a [`LoggerHandle`] explicitly.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None,
    Error,
    Warn,
    Info,
    Debug,
}

/// A pluggable log sink. Implementations receive an already-rendered message;
/// [`LoggerHandle`] is responsible for not calling this at all when the
/// configured threshold doesn't admit the level (so callers can pass an
/// expensive-to-format closure without paying for it).
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default logger: forwards to `tracing` at the matching level. With no
/// subscriber installed this is a no-op, same as any other `tracing`
/// instrumentation in this ecosystem.
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => tracing::error!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::None => {}
        }
    }
}

/// Handle combining a [`Logger`] with a threshold. Cloned freely (`Arc`
/// inside); this is what gets passed down into `Transport`, `Authorizer`
/// impls, etc.
#[derive(Clone)]
pub struct LoggerHandle {
    inner: Arc<dyn Logger>,
    threshold: LogLevel,
}

impl LoggerHandle {
    pub fn new(inner: Arc<dyn Logger>, threshold: LogLevel) -> Self {
        LoggerHandle { inner, threshold }
    }

    pub fn default_handle() -> Self {
        LoggerHandle::new(Arc::new(TracingLogger), LogLevel::Info)
    }

    fn admits(&self, level: LogLevel) -> bool {
        self.threshold != LogLevel::None && level <= self.threshold
    }

    pub fn error(&self, f: impl FnOnce() -> String) {
        if self.admits(LogLevel::Error) {
            self.inner.log(LogLevel::Error, &f());
        }
    }

    pub fn warn(&self, f: impl FnOnce() -> String) {
        if self.admits(LogLevel::Warn) {
            self.inner.log(LogLevel::Warn, &f());
        }
    }

    pub fn info(&self, f: impl FnOnce() -> String) {
        if self.admits(LogLevel::Info) {
            self.inner.log(LogLevel::Info, &f());
        }
    }

    pub fn debug(&self, f: impl FnOnce() -> String) {
        if self.admits(LogLevel::Debug) {
            self.inner.log(LogLevel::Debug, &f());
        }
    }
}

impl Default for LoggerHandle {
    fn default() -> Self {
        LoggerHandle::default_handle()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingLogger;
    use super::*;
    use std::sync::Arc;

    #[test]
    fn threshold_gates_emission() {
        let recorder = Arc::new(RecordingLogger::default());
        let handle = LoggerHandle::new(recorder.clone(), LogLevel::Warn);

        let mut called = false;
        handle.debug(|| {
            called = true;
            "debug message".to_string()
        });
        assert!(!called, "debug formatting must not run below threshold");

        handle.warn(|| "warn message".to_string());
        assert_eq!(recorder.lines.lock().len(), 1);
    }

    #[test]
    fn none_threshold_suppresses_everything() {
        let recorder = Arc::new(RecordingLogger::default());
        let handle = LoggerHandle::new(recorder.clone(), LogLevel::None);
        handle.error(|| "should not appear".to_string());
        assert!(recorder.lines.lock().is_empty());
    }
}
