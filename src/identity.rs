//! Identity/token-exchange client (spec §A.5, §6 "Identity service").
//!
//! Thin, auth-free service client sitting *underneath* [`crate::auth`]:
//! it talks to the OAuth2 token endpoint directly via a bare [`crate::transport::Transport`]
//! (no `Authorizer` in the loop - that would be circular, since this is
//! what produces the tokens `Authorizer` impls cache).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;

use crate::auth::TokenRecord;
use crate::context::CallContext;
use crate::error::Result;
use crate::token_cache::TokenRecord as CachedTokenRecord;
use crate::transport::{BodyKind, RequestSpec, Transport};

/// Wire shape of a `/v2/oauth2/token` response (spec §6). A single grant can
/// describe more than one resource server - the primary token plus
/// `other_tokens[]`, each shaped identically to the top-level response
/// (spec §3 "Token Record": "A response from the identity service may
/// contain multiple records, one per resource server").
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: u64,
    scope: Option<String>,
    refresh_token: Option<String>,
    resource_server: Option<String>,
    #[serde(default)]
    other_tokens: Vec<TokenResponse>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(Debug, Deserialize)]
pub struct IntrospectResponse {
    pub active: bool,
    pub scope: Option<String>,
    pub exp: Option<i64>,
    pub sub: Option<String>,
}

/// Talks to the identity service's `/v2/oauth2/token` and
/// `/v2/oauth2/token/introspect` endpoints.
pub struct IdentityClient {
    transport: Arc<Transport>,
}

impl IdentityClient {
    pub fn new(transport: Arc<Transport>) -> Self {
        IdentityClient { transport }
    }

    fn record_from_response(resp: &TokenResponse) -> TokenRecord {
        TokenRecord {
            access_token: resp.access_token.clone(),
            token_type: resp.token_type.clone(),
            expires_at: Instant::now() + Duration::from_secs(resp.expires_in),
            scope: resp.scope.clone(),
        }
    }

    /// Flattens a (possibly multi-resource-server) `TokenResponse` into the
    /// full [`CachedTokenRecord`] shape the token cache/manager persists,
    /// carrying `resource_server` and `other_tokens[]` through rather than
    /// discarding them (spec §3 "Token Record", §6 identity response shape).
    fn cached_record_from_response(resp: TokenResponse) -> CachedTokenRecord {
        let expires_at = Utc::now() + chrono::Duration::seconds(resp.expires_in as i64);
        let scopes = resp
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let other_tokens = resp.other_tokens.into_iter().map(Self::cached_record_from_response).collect();
        CachedTokenRecord {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            resource_server: resp.resource_server.unwrap_or_default(),
            scopes,
            expires_at,
            other_tokens,
        }
    }

    pub async fn client_credentials_token(
        &self,
        ctx: &CallContext,
        client_id: &str,
        client_secret: &str,
        scope: Option<&str>,
    ) -> Result<TokenRecord> {
        let parsed = self.client_credentials_token_response(ctx, client_id, client_secret, scope).await?;
        Ok(Self::record_from_response(&parsed))
    }

    pub async fn refresh_token_grant(&self, ctx: &CallContext, refresh_token: &str) -> Result<TokenRecord> {
        let parsed = self.refresh_token_grant_response(ctx, refresh_token).await?;
        Ok(Self::record_from_response(&parsed))
    }

    /// Same grant as [`Self::client_credentials_token`], but returns the full
    /// multi-resource-server record for callers (e.g. a [`crate::token_cache::TokenManager`])
    /// that need `resource_server`/`other_tokens[]` rather than just a
    /// header-producing capability.
    pub async fn client_credentials_token_record(
        &self,
        ctx: &CallContext,
        client_id: &str,
        client_secret: &str,
        scope: Option<&str>,
    ) -> Result<CachedTokenRecord> {
        let parsed = self.client_credentials_token_response(ctx, client_id, client_secret, scope).await?;
        Ok(Self::cached_record_from_response(parsed))
    }

    /// Same grant as [`Self::refresh_token_grant`], surfaced as the full
    /// multi-resource-server record. See [`Self::client_credentials_token_record`].
    pub async fn refresh_token_grant_record(&self, ctx: &CallContext, refresh_token: &str) -> Result<CachedTokenRecord> {
        let parsed = self.refresh_token_grant_response(ctx, refresh_token).await?;
        Ok(Self::cached_record_from_response(parsed))
    }

    async fn client_credentials_token_response(
        &self,
        ctx: &CallContext,
        client_id: &str,
        client_secret: &str,
        scope: Option<&str>,
    ) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), client_id.to_string()),
            ("client_secret".to_string(), client_secret.to_string()),
        ];
        if let Some(scope) = scope {
            form.push(("scope".to_string(), scope.to_string()));
        }

        let spec = RequestSpec::post("/v2/oauth2/token").body(BodyKind::Form(form));
        let resp = self.transport.send_unauthenticated(ctx, spec).await?;
        resp.json()
    }

    async fn refresh_token_grant_response(&self, ctx: &CallContext, refresh_token: &str) -> Result<TokenResponse> {
        let form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        let spec = RequestSpec::post("/v2/oauth2/token").body(BodyKind::Form(form));
        let resp = self.transport.send_unauthenticated(ctx, spec).await?;
        resp.json()
    }

    pub async fn introspect(&self, ctx: &CallContext, token: &str) -> Result<IntrospectResponse> {
        let form = vec![("token".to_string(), token.to_string())];
        let spec = RequestSpec::post("/v2/oauth2/token/introspect").body(BodyKind::Form(form));
        let resp = self.transport.send_unauthenticated(ctx, spec).await?;
        resp.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cached_record_carries_resource_server_and_other_tokens() {
        let raw = json!({
            "access_token": "primary-token",
            "expires_in": 3600,
            "scope": "transfer.api.globus.org:all",
            "resource_server": "transfer.api.globus.org",
            "refresh_token": "refresh-abc",
            "other_tokens": [
                {
                    "access_token": "secondary-token",
                    "expires_in": 3600,
                    "scope": "search.api.globus.org:all",
                    "resource_server": "search.api.globus.org"
                }
            ]
        });
        let resp: TokenResponse = serde_json::from_value(raw).unwrap();
        let record = IdentityClient::cached_record_from_response(resp);

        assert_eq!(record.access_token, "primary-token");
        assert_eq!(record.resource_server, "transfer.api.globus.org");
        assert_eq!(record.refresh_token.as_deref(), Some("refresh-abc"));
        assert_eq!(record.scopes, vec!["transfer.api.globus.org:all".to_string()]);
        assert_eq!(record.other_tokens.len(), 1);
        assert_eq!(record.other_tokens[0].resource_server, "search.api.globus.org");
        assert_eq!(record.other_tokens[0].access_token, "secondary-token");
    }
}
