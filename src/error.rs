//! Closed error taxonomy shared by every component in the crate (spec §4.B, §7).
//!
//! Every failure the core can produce is one of a fixed set of [`ErrorKind`]s,
//! each carrying enough structure (`http_status`, `raw_body`, optional
//! resource context) to drive retries or user messaging without callers
//! having to downcast. Service clients may attach resource context to an
//! error but never change its `kind`.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of failure kinds the core classifies every error into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AuthFailed,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Conflict,
    Server,
    Network,
    Cancelled,
    CircuitOpen,
    VersionMismatch,
}

/// Identifies the kind of resource a `NOT_FOUND` (or other) error refers to,
/// when the calling service client supplied that context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Flow,
    Run,
    Task,
    Endpoint,
    Group,
    Search,
    Timer,
    Other,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Flow => "flow",
            ResourceKind::Run => "run",
            ResourceKind::Task => "task",
            ResourceKind::Endpoint => "endpoint",
            ResourceKind::Group => "group",
            ResourceKind::Search => "search",
            ResourceKind::Timer => "timer",
            ResourceKind::Other => "resource",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceContext {
    pub resource_kind: ResourceKind,
    pub resource_id: String,
}

/// A structured, user-visible failure. See spec §7: `{kind, message,
/// http_status?, resource_kind?, resource_id?, raw_body}`.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub http_status: Option<u16>,
    pub resource: Option<ResourceContext>,
    pub raw_body: Option<String>,
    /// Set only for `AUTH_FAILED` when the body was parseable as an expired-token response.
    pub token_expired: bool,
    /// Set only for `RATE_LIMITED` when a `Retry-After` value was parsed.
    pub retry_after: Option<Duration>,
}

impl Error {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            http_status: None,
            resource: None,
            raw_body: None,
            token_expired: false,
            retry_after: None,
        }
    }

    pub fn auth_failed(status: u16, token_expired: bool, raw_body: impl Into<String>) -> Self {
        Error {
            http_status: Some(status),
            token_expired,
            raw_body: Some(raw_body.into()),
            ..Error::new(ErrorKind::AuthFailed, "authorization failed")
        }
    }

    pub fn forbidden(status: u16, raw_body: impl Into<String>) -> Self {
        Error {
            http_status: Some(status),
            raw_body: Some(raw_body.into()),
            ..Error::new(ErrorKind::Forbidden, "forbidden")
        }
    }

    pub fn not_found(status: u16, raw_body: impl Into<String>) -> Self {
        Error {
            http_status: Some(status),
            raw_body: Some(raw_body.into()),
            ..Error::new(ErrorKind::NotFound, "not found")
        }
    }

    /// Convenience constructor for a locally-detected not-found (no HTTP round trip),
    /// e.g. a missing checkpoint.
    pub fn not_found_local(resource_kind: ResourceKind, resource_id: impl Into<String>) -> Self {
        let resource_id = resource_id.into();
        Error {
            resource: Some(ResourceContext {
                resource_kind,
                resource_id: resource_id.clone(),
            }),
            ..Error::new(ErrorKind::NotFound, format!("{resource_kind} {resource_id} not found"))
        }
    }

    pub fn validation(status: u16, raw_body: impl Into<String>) -> Self {
        Error {
            http_status: Some(status),
            raw_body: Some(raw_body.into()),
            ..Error::new(ErrorKind::Validation, "validation error")
        }
    }

    pub fn validation_msg(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Validation, message)
    }

    pub fn rate_limited(
        status: u16,
        retry_after: Option<Duration>,
        raw_body: impl Into<String>,
    ) -> Self {
        Error {
            http_status: Some(status),
            raw_body: Some(raw_body.into()),
            retry_after,
            ..Error::new(ErrorKind::RateLimited, "rate limited")
        }
    }

    pub fn conflict(status: u16, raw_body: impl Into<String>) -> Self {
        Error {
            http_status: Some(status),
            raw_body: Some(raw_body.into()),
            ..Error::new(ErrorKind::Conflict, "conflict")
        }
    }

    pub fn server(status: u16, raw_body: impl Into<String>) -> Self {
        Error {
            http_status: Some(status),
            raw_body: Some(raw_body.into()),
            ..Error::new(ErrorKind::Server, "server error")
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Network, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Cancelled, message)
    }

    pub fn circuit_open() -> Self {
        Error::new(ErrorKind::CircuitOpen, "circuit breaker is open")
    }

    pub fn version_mismatch(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::VersionMismatch, message)
    }

    /// Attaches resource context without altering `kind`, per spec §7: "Each
    /// service client may wrap transport errors with resource context...
    /// but never changes the underlying kind."
    pub fn with_resource(mut self, resource_kind: ResourceKind, resource_id: impl Into<String>) -> Self {
        self.resource = Some(ResourceContext {
            resource_kind,
            resource_id: resource_id.into(),
        });
        self
    }

    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Network | ErrorKind::Server | ErrorKind::RateLimited => true,
            // A 409 raised by a conflicting-but-transient server-side state
            // (no http_status at all, e.g. a locally synthesized conflict)
            // is not retryable; only server-reported conflicts with a 5xx
            // flavor would be, and those already classify as SERVER.
            ErrorKind::Conflict => false,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind == ErrorKind::AuthFailed
    }

    pub fn is_forbidden(&self) -> bool {
        self.kind == ErrorKind::Forbidden
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::validation_msg(format!("body decode error: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_predicates() {
        assert!(Error::server(503, "").is_retryable());
        assert!(Error::network("reset").is_retryable());
        assert!(Error::rate_limited(429, None, "").is_retryable());
        assert!(!Error::conflict(409, "").is_retryable());
        assert!(!Error::forbidden(403, "").is_retryable());
        assert!(!Error::circuit_open().is_retryable());
    }

    #[test]
    fn resource_context_does_not_change_kind() {
        let err = Error::not_found(404, "{}").with_resource(ResourceKind::Flow, "abc-123");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.resource.unwrap().resource_id, "abc-123");
    }

    #[test]
    fn predicates_map_to_kinds() {
        assert!(Error::not_found(404, "").is_not_found());
        assert!(Error::auth_failed(401, false, "").is_unauthorized());
        assert!(Error::forbidden(403, "").is_forbidden());
        assert!(Error::cancelled("x").is_cancelled());
    }
}
