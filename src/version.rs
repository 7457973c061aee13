//! API version negotiation (spec §4.E).
//!
//! Each service answers with an `X-Service-Version` (or similar) header
//! shaped like `vN`, `vN.M`, `vN.M.P`, or the bare literal `beta`. The SDK
//! treats a service's advertised version as compatible with what it was
//! built against as long as the major component matches and the advertised
//! minor/patch are not older than what's supported - a warning, not a hard
//! failure, when a service is noticeably ahead.

use std::fmt;

use dashmap::DashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiVersion {
    pub service: String,
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
    pub beta: bool,
}

impl ApiVersion {
    pub fn unversioned(service: &str) -> Self {
        ApiVersion {
            service: service.to_string(),
            major: 0,
            minor: 0,
            patch: None,
            beta: false,
        }
    }

    /// Parses the forms `vN`, `vN.M`, `vN.M.P`, each with an optional
    /// `-beta` suffix, plus the bare literal `beta` (mapped to
    /// `0.0-beta`, since a service in that state hasn't cut a numbered
    /// release yet).
    pub fn parse(service: &str, raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("beta") {
            return Some(ApiVersion {
                service: service.to_string(),
                major: 0,
                minor: 0,
                patch: None,
                beta: true,
            });
        }

        let (body, beta) = match raw.strip_suffix("-beta") {
            Some(stripped) => (stripped, true),
            None => (raw, false),
        };
        let body = body.strip_prefix('v').or_else(|| body.strip_prefix('V'))?;

        let mut parts = body.split('.');
        let major: u32 = parts.next()?.parse().ok()?;
        let minor: u32 = match parts.next() {
            Some(m) => m.parse().ok()?,
            None => 0,
        };
        let patch: Option<u32> = match parts.next() {
            Some(p) => Some(p.parse().ok()?),
            None => None,
        };
        if parts.next().is_some() {
            return None;
        }

        Some(ApiVersion {
            service: service.to_string(),
            major,
            minor,
            patch,
            beta,
        })
    }

    /// `compatible(client, server)` iff same service, same major, the
    /// client's required minor is at or below the server's advertised
    /// minor, and beta-ness matches on both sides (spec §8, property 5).
    pub fn is_compatible_with(&self, server: &ApiVersion) -> bool {
        self.service == server.service
            && self.major == server.major
            && self.minor <= server.minor
            && self.beta == server.beta
    }

    /// Server advertised a version strictly ahead of what the client
    /// requires - worth a warning log, not a hard error.
    pub fn is_ahead_of(&self, client_required: &ApiVersion) -> bool {
        self.major == client_required.major
            && (self.minor, self.patch.unwrap_or(0))
                > (client_required.minor, client_required.patch.unwrap_or(0))
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.beta && self.major == 0 && self.minor == 0 && self.patch.is_none() {
            return write!(f, "beta");
        }
        write!(f, "v{}.{}", self.major, self.minor)?;
        if let Some(p) = self.patch {
            write!(f, ".{p}")?;
        }
        if self.beta {
            write!(f, "-beta")?;
        }
        Ok(())
    }
}

/// Tracks which services have already had their version checked this
/// process lifetime, so the check (and any warning log it produces) fires
/// once per service rather than once per request.
#[derive(Default)]
pub struct VersionChecker {
    checked: DashSet<String>,
}

impl VersionChecker {
    pub fn new() -> Self {
        VersionChecker::default()
    }

    /// Returns `true` the first time a given service name is seen; `false`
    /// on every subsequent call for that same service.
    pub fn should_check(&self, service: &str) -> bool {
        self.checked.insert(service.to_string())
    }

    pub fn reset(&self, service: &str) {
        self.checked.remove(service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_literal_forms() {
        assert_eq!(
            ApiVersion::parse("x", "v1").unwrap(),
            ApiVersion {
                service: "x".into(),
                major: 1,
                minor: 0,
                patch: None,
                beta: false
            }
        );
        assert_eq!(
            ApiVersion::parse("x", "v1.2").unwrap().minor,
            2
        );
        let full = ApiVersion::parse("x", "v1.2.3").unwrap();
        assert_eq!(full.patch, Some(3));
        let beta = ApiVersion::parse("x", "beta").unwrap();
        assert!(beta.beta && beta.major == 0);
        let suffixed = ApiVersion::parse("x", "v2.0-beta").unwrap();
        assert!(suffixed.beta);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ApiVersion::parse("x", "not-a-version").is_none());
        assert!(ApiVersion::parse("x", "v1.2.3.4").is_none());
    }

    #[test]
    fn compatibility_requires_matching_major_and_minor_at_most_server() {
        let client_required = ApiVersion::parse("x", "v1.2").unwrap();
        let same = ApiVersion::parse("x", "v1.2").unwrap();
        let server_ahead = ApiVersion::parse("x", "v1.3").unwrap();
        let server_behind = ApiVersion::parse("x", "v1.1").unwrap();
        let other_major = ApiVersion::parse("x", "v2.0").unwrap();

        assert!(client_required.is_compatible_with(&same));
        assert!(client_required.is_compatible_with(&server_ahead));
        assert!(!client_required.is_compatible_with(&server_behind));
        assert!(!client_required.is_compatible_with(&other_major));
        assert!(server_ahead.is_ahead_of(&client_required));
    }

    #[test]
    fn checker_fires_once_per_service() {
        let checker = VersionChecker::new();
        assert!(checker.should_check("transfer"));
        assert!(!checker.should_check("transfer"));
        checker.reset("transfer");
        assert!(checker.should_check("transfer"));
    }
}
