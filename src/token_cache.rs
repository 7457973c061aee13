//! Token Cache / Manager (spec §4.M).
//!
//! A keyed store from scope-set to [`TokenRecord`], with refresh serialized
//! per key so concurrent lookups of the same key during a refresh share one
//! outcome - the same per-key-coalescing shape [`crate::auth::CachedAuthorizer`]
//! uses for a single token, generalized here to many keys at once (one
//! scope set per resource server a caller has ever asked for).

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;

use crate::context::CallContext;
use crate::error::{Error, Result};

/// A canonicalized scope set: sorted and de-duplicated so two callers
/// requesting the same scopes in a different order hit the same cache
/// entry (spec §3: "keyed by scope set").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new(scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut scopes: Vec<String> = scopes.into_iter().map(Into::into).collect();
        scopes.sort();
        scopes.dedup();
        ScopeKey(scopes.join(" "))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A filesystem-safe, fixed-length identifier for this key, used by
    /// the file-backed store so arbitrary scope strings never have to be
    /// escaped into a path.
    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// `{access_token, refresh_token?, resource_server, scopes, expires_at,
/// other_tokens[]}` (spec §3 "Token Record"). A single identity-service
/// response may describe more than one resource server; `other_tokens`
/// carries the rest alongside the primary record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub resource_server: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub other_tokens: Vec<TokenRecord>,
}

impl TokenRecord {
    /// A record is valid iff `now + skew < expires_at` (spec §3).
    pub fn is_valid(&self, skew: std::time::Duration) -> bool {
        let skewed = Utc::now() + chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::zero());
        skewed < self.expires_at
    }
}

/// Pluggable persistence for [`TokenRecord`]s, keyed by [`ScopeKey`] (spec
/// §6 "Persisted state layout"). Both implementations are safe for
/// concurrent use.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self, key: &ScopeKey) -> Result<Option<TokenRecord>>;
    async fn save(&self, key: &ScopeKey, record: &TokenRecord) -> Result<()>;
    async fn remove(&self, key: &ScopeKey) -> Result<()>;
}

/// In-memory `TokenStore`, backed by a `DashMap` the same way the rest of
/// this crate reaches for `dashmap` over a manually-locked `HashMap` for
/// concurrent keyed maps (e.g. `VersionChecker`'s checked-set).
#[derive(Default)]
pub struct InMemoryTokenStore {
    entries: DashMap<ScopeKey, TokenRecord>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        InMemoryTokenStore::default()
    }
}

#[async_trait::async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn load(&self, key: &ScopeKey) -> Result<Option<TokenRecord>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn save(&self, key: &ScopeKey, record: &TokenRecord) -> Result<()> {
        self.entries.insert(key.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, key: &ScopeKey) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// File-backed `TokenStore`: one JSON file per scope-set key under a
/// caller-chosen directory, written via temp-file-then-rename so a reader
/// never observes a partially-written file (spec §6).
#[cfg(feature = "file-store")]
pub struct FileTokenStore {
    dir: PathBuf,
}

#[cfg(feature = "file-store")]
impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileTokenStore { dir: dir.into() }
    }

    fn path_for(&self, key: &ScopeKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.content_hash()))
    }
}

#[cfg(feature = "file-store")]
#[async_trait::async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self, key: &ScopeKey) -> Result<Option<TokenRecord>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::network(format!("reading token cache file {}: {e}", path.display()))),
        }
    }

    async fn save(&self, key: &ScopeKey, record: &TokenRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::network(format!("creating token cache dir {}: {e}", self.dir.display())))?;
        let path = self.path_for(key);
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| Error::network(format!("writing {}: {e}", tmp_path.display())))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| Error::network(format!("renaming {} to {}: {e}", tmp_path.display(), path.display())))?;
        Ok(())
    }

    async fn remove(&self, key: &ScopeKey) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::network(format!("removing {}: {e}", path.display()))),
        }
    }
}

type RefreshFut<'a> = Pin<Box<dyn Future<Output = Result<TokenRecord>> + Send + 'a>>;

/// Coordinates lookup + expiry-aware refresh across a [`TokenStore`].
/// Refreshes are serialized per key via a per-key `tokio::sync::Mutex`, so
/// concurrent lookups of the same key during a refresh await the one
/// in-flight exchange instead of each firing their own (spec §4.M, §5).
pub struct TokenManager<S: TokenStore> {
    store: Arc<S>,
    skew: std::time::Duration,
    refresh_locks: RwLock<HashMap<ScopeKey, Arc<AsyncMutex<()>>>>,
}

impl<S: TokenStore> TokenManager<S> {
    pub fn new(store: Arc<S>, skew: std::time::Duration) -> Self {
        TokenManager {
            store,
            skew,
            refresh_locks: RwLock::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &ScopeKey) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.refresh_locks.read().get(key) {
            return lock.clone();
        }
        self.refresh_locks.write().entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Returns a valid token for `key`, invoking `refresh` at most once per
    /// concurrent wave of callers when the cached record is missing or
    /// expired (within skew).
    pub async fn get_or_refresh<'a, F>(&'a self, ctx: &'a CallContext, key: &ScopeKey, refresh: F) -> Result<TokenRecord>
    where
        F: FnOnce(&'a CallContext) -> RefreshFut<'a>,
    {
        if let Some(record) = self.store.load(key).await? {
            if record.is_valid(self.skew) {
                return Ok(record);
            }
        }

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        // Re-check: another caller may have refreshed while we waited for the lock.
        if let Some(record) = self.store.load(key).await? {
            if record.is_valid(self.skew) {
                return Ok(record);
            }
        }

        let fresh = refresh(ctx).await?;
        self.store.save(key, &fresh).await?;
        Ok(fresh)
    }

    pub async fn invalidate(&self, key: &ScopeKey) -> Result<()> {
        self.store.remove(key).await
    }
}
