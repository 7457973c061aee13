//! Authorization (spec §4.F).
//!
//! `Authorizer` is the seam between "how do we get a bearer token" and
//! everything downstream that just wants a fresh `Authorization` header.
//! Implementations cache their token and coalesce concurrent refreshes
//! behind a single in-flight network call, the same shape fusillade uses
//! for its per-key semaphores in `daemon::Daemon`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::identity::IdentityClient;

#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: Instant,
    pub scope: Option<String>,
}

impl TokenRecord {
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// Treats a token as expiring 30s early so a request built against it
    /// doesn't race the actual server-side expiry mid-flight.
    pub fn is_fresh(&self) -> bool {
        Instant::now() + Duration::from_secs(30) < self.expires_at
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn token(&self, ctx: &CallContext) -> Result<TokenRecord>;

    /// Invalidates any cached token, forcing the next `token` call to
    /// refresh. Called by the transport after an `AUTH_FAILED` with
    /// `token_expired` to avoid retrying with the same stale credential.
    async fn invalidate(&self);
}

/// Wraps a fixed, caller-supplied token (spec: "a pre-obtained token string
/// for short-lived scripts"). Never refreshes; `invalidate` is a no-op.
pub struct StaticAuthorizer {
    record: TokenRecord,
}

impl StaticAuthorizer {
    pub fn new(access_token: impl Into<String>) -> Self {
        StaticAuthorizer {
            record: TokenRecord {
                access_token: access_token.into(),
                token_type: "Bearer".to_string(),
                expires_at: Instant::now() + Duration::from_secs(365 * 24 * 3600),
                scope: None,
            },
        }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn token(&self, _ctx: &CallContext) -> Result<TokenRecord> {
        Ok(self.record.clone())
    }

    async fn invalidate(&self) {}
}

struct CachedAuthorizer<F> {
    cached: RwLock<Option<TokenRecord>>,
    refresh_lock: AsyncMutex<()>,
    fetch: F,
}

impl<F> CachedAuthorizer<F>
where
    F: Fn(&CallContext) -> futures::future::BoxFuture<'_, Result<TokenRecord>> + Send + Sync,
{
    fn new(fetch: F) -> Self {
        CachedAuthorizer {
            cached: RwLock::new(None),
            refresh_lock: AsyncMutex::new(()),
            fetch,
        }
    }

    async fn token(&self, ctx: &CallContext) -> Result<TokenRecord> {
        if let Some(record) = self.cached.read().clone() {
            if record.is_fresh() {
                return Ok(record);
            }
        }

        // Hold the refresh lock across the network call itself: the first
        // caller in performs the refresh, every concurrent caller blocks
        // here and then observes the now-fresh cached value instead of
        // each firing its own request (spec §4.F: "concurrent callers
        // coalesce onto a single in-flight refresh").
        let _guard = self.refresh_lock.lock().await;
        if let Some(record) = self.cached.read().clone() {
            if record.is_fresh() {
                return Ok(record);
            }
        }

        let fresh = (self.fetch)(ctx).await?;
        *self.cached.write() = Some(fresh.clone());
        Ok(fresh)
    }

    async fn invalidate(&self) {
        *self.cached.write() = None;
    }
}

/// Client-credentials grant: exchanges a client id/secret for a token with
/// no end-user involved (spec: "service accounts").
pub struct ClientCredentialsAuthorizer {
    inner: CachedAuthorizer<
        Box<dyn for<'a> Fn(&'a CallContext) -> futures::future::BoxFuture<'a, Result<TokenRecord>> + Send + Sync>,
    >,
}

impl ClientCredentialsAuthorizer {
    pub fn new(identity: Arc<IdentityClient>, client_id: String, client_secret: String, scope: Option<String>) -> Self {
        let fetch = move |ctx: &CallContext| {
            let identity = identity.clone();
            let client_id = client_id.clone();
            let client_secret = client_secret.clone();
            let scope = scope.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                identity
                    .client_credentials_token(&ctx, &client_id, &client_secret, scope.as_deref())
                    .await
            }) as futures::future::BoxFuture<'static, Result<TokenRecord>>
        };
        ClientCredentialsAuthorizer {
            inner: CachedAuthorizer::new(Box::new(fetch)),
        }
    }
}

#[async_trait]
impl Authorizer for ClientCredentialsAuthorizer {
    async fn token(&self, ctx: &CallContext) -> Result<TokenRecord> {
        self.inner.token(ctx).await
    }

    async fn invalidate(&self) {
        self.inner.invalidate().await
    }
}

/// Refresh-token grant: exchanges a long-lived refresh token for short-lived
/// access tokens, re-exchanging on every expiry (spec: "interactive CLIs
/// that went through a one-time login").
pub struct RefreshTokenAuthorizer {
    inner: CachedAuthorizer<
        Box<dyn for<'a> Fn(&'a CallContext) -> futures::future::BoxFuture<'a, Result<TokenRecord>> + Send + Sync>,
    >,
}

impl RefreshTokenAuthorizer {
    pub fn new(identity: Arc<IdentityClient>, refresh_token: String) -> Self {
        let fetch = move |ctx: &CallContext| {
            let identity = identity.clone();
            let refresh_token = refresh_token.clone();
            let ctx = ctx.clone();
            Box::pin(async move { identity.refresh_token_grant(&ctx, &refresh_token).await })
                as futures::future::BoxFuture<'static, Result<TokenRecord>>
        };
        RefreshTokenAuthorizer {
            inner: CachedAuthorizer::new(Box::new(fetch)),
        }
    }
}

#[async_trait]
impl Authorizer for RefreshTokenAuthorizer {
    async fn token(&self, ctx: &CallContext) -> Result<TokenRecord> {
        self.inner.token(ctx).await
    }

    async fn invalidate(&self) {
        self.inner.invalidate().await
    }
}
