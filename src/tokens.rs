//! Loads, refreshes, caches and publishes vehicle API credentials, split
//! into a `TokenReader` capability (Scout) and a `TokenWriter` capability
//! (Worker) so the refresh-token-rotation race between the two tiers is
//! expressed as a type split rather than shared mutable state.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::TokenError;
use crate::vehicle::{expires_at, TokenExchange};

/// Tokens are considered invalid if `access_expires_at - now < 5 min`.
pub const EXPIRY_MARGIN: Duration = Duration::minutes(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenMaterial {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub refresh_token_created_at: Option<DateTime<Utc>>,
}

impl TokenMaterial {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now > EXPIRY_MARGIN
    }

    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_minutes()
    }
}

/// Abstracts the shared secret store (the canonical location, e.g.
/// `fleet-tokens`) and its legacy predecessor used only for one-time
/// migration. A concrete cloud-backed implementation sits behind this
/// trait in production; it is not part of this crate.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn read_canonical(&self) -> Result<Option<TokenMaterial>, TokenError>;
    async fn write_canonical(&self, material: &TokenMaterial) -> Result<(), TokenError>;
    async fn read_legacy(&self) -> Result<Option<TokenMaterial>, TokenError>;
}

/// In-memory `SecretStore`, used by tests and as a drop-in for local
/// development.
#[derive(Default)]
pub struct InMemorySecretStore {
    canonical: RwLock<Option<TokenMaterial>>,
    legacy: RwLock<Option<TokenMaterial>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_legacy(&self, material: TokenMaterial) {
        *self.legacy.write().await = Some(material);
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn read_canonical(&self) -> Result<Option<TokenMaterial>, TokenError> {
        Ok(self.canonical.read().await.clone())
    }

    async fn write_canonical(&self, material: &TokenMaterial) -> Result<(), TokenError> {
        *self.canonical.write().await = Some(material.clone());
        Ok(())
    }

    async fn read_legacy(&self) -> Result<Option<TokenMaterial>, TokenError> {
        Ok(self.legacy.read().await.clone())
    }
}

/// File-backed `SecretStore`: the local substitute for the shared secret
/// manager, in the same spirit as `state_store::JsonFileStateStore`. Scout
/// and Worker run as separate processes, so `InMemorySecretStore` can't be
/// shared between them outside of tests; this is what actually backs the
/// canonical store on a single host. `legacy` is seeded once (e.g. by an
/// operator migrating off an older store) and never written back to.
pub struct FileSecretStore {
    canonical_path: PathBuf,
    legacy_path: Option<PathBuf>,
}

impl FileSecretStore {
    pub fn new(canonical_path: PathBuf, legacy_path: Option<PathBuf>) -> Self {
        FileSecretStore { canonical_path, legacy_path }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn read_canonical(&self) -> Result<Option<TokenMaterial>, TokenError> {
        Ok(read_local_cache(&self.canonical_path).await)
    }

    async fn write_canonical(&self, material: &TokenMaterial) -> Result<(), TokenError> {
        if let Some(parent) = self.canonical_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        write_local_cache(&self.canonical_path, material).await
    }

    async fn read_legacy(&self) -> Result<Option<TokenMaterial>, TokenError> {
        match &self.legacy_path {
            Some(path) => Ok(read_local_cache(path).await),
            None => Ok(None),
        }
    }
}

/// The third fallback tier in `load()`: a plain JSON file.
async fn read_local_cache(path: &PathBuf) -> Option<TokenMaterial> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn write_local_cache(path: &PathBuf, material: &TokenMaterial) -> Result<(), TokenError> {
    let bytes = serde_json::to_vec_pretty(material)
        .map_err(|e| TokenError::Store(e.to_string()))?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| TokenError::Store(e.to_string()))
}

/// Scout's read-only capability. Never writes to the canonical store — on
/// expiry it is the caller's (Scout's) job to RPC Worker's
/// `/refresh-tokens` and call [`TokenReader::reload`] afterwards.
pub struct TokenReader<S: SecretStore> {
    store: Arc<S>,
    cached: RwLock<Option<TokenMaterial>>,
}

impl<S: SecretStore> TokenReader<S> {
    pub fn new(store: Arc<S>) -> Self {
        TokenReader {
            store,
            cached: RwLock::new(None),
        }
    }

    /// Clears any in-memory cache before re-reading.
    pub async fn reload(&self) -> Result<TokenMaterial, TokenError> {
        *self.cached.write().await = None;
        self.load().await
    }

    async fn load(&self) -> Result<TokenMaterial, TokenError> {
        if let Some(cached) = self.cached.read().await.clone() {
            return Ok(cached);
        }
        let material = self
            .store
            .read_canonical()
            .await?
            .or(self.store.read_legacy().await?)
            .ok_or(TokenError::NoTokenMaterial)?;
        *self.cached.write().await = Some(material.clone());
        Ok(material)
    }

    /// Returns the cached/stored token if it is not within 5 minutes of
    /// expiry. Does **not** refresh — only Worker writes to the canonical
    /// store, which removes the refresh-token-rotation race between the
    /// two tiers.
    pub async fn ensure_valid(&self, now: DateTime<Utc>) -> Result<TokenMaterial, TokenError> {
        let material = self.load().await?;
        if material.is_fresh(now) {
            Ok(material)
        } else {
            Err(TokenError::RefreshFailed(
                "token near expiry; read-only capability cannot refresh".to_string(),
            ))
        }
    }
}

/// Worker's read-write capability: the sole writer of the canonical store.
pub struct TokenWriter<S: SecretStore> {
    store: Arc<S>,
    exchange: TokenExchange,
    local_cache_path: PathBuf,
    cached: RwLock<Option<TokenMaterial>>,
}

impl<S: SecretStore> TokenWriter<S> {
    pub fn new(store: Arc<S>, exchange: TokenExchange, local_cache_path: PathBuf) -> Self {
        TokenWriter {
            store,
            exchange,
            local_cache_path,
            cached: RwLock::new(None),
        }
    }

    /// Load order: canonical, then legacy, then local file.
    #[tracing::instrument(skip(self))]
    pub async fn load(&self) -> Result<TokenMaterial, TokenError> {
        if let Some(cached) = self.cached.read().await.clone() {
            return Ok(cached);
        }
        let material = match self.store.read_canonical().await? {
            Some(m) => m,
            None => match self.store.read_legacy().await? {
                Some(m) => m,
                None => read_local_cache(&self.local_cache_path)
                    .await
                    .ok_or(TokenError::NoTokenMaterial)?,
            },
        };
        *self.cached.write().await = Some(material.clone());
        Ok(material)
    }

    #[tracing::instrument(skip(self))]
    pub async fn ensure_valid(&self, now: DateTime<Utc>) -> Result<TokenMaterial, TokenError> {
        let material = self.load().await?;
        if material.is_fresh(now) {
            Ok(material)
        } else {
            self.refresh(now).await
        }
    }

    /// Exchanges the refresh token; writes the canonical store only if the
    /// refresh token value actually changed (the vendor may or may not
    /// rotate it, and unconditional writes are costly). Always updates the
    /// local cache.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<TokenMaterial, TokenError> {
        let previous = self.load().await.ok();
        let exchanged = self
            .exchange
            .refresh(&previous.as_ref().map(|p| p.refresh_token.clone()).ok_or(
                TokenError::NoTokenMaterial,
            )?)
            .await
            .map_err(|e| TokenError::RefreshFailed(e.to_string()))?;

        let rotated = previous
            .as_ref()
            .map(|p| p.refresh_token != exchanged.refresh_token)
            .unwrap_or(true);

        let material = TokenMaterial {
            access_token: exchanged.access_token,
            refresh_token: exchanged.refresh_token,
            expires_at: expires_at(now, exchanged.expires_in),
            refresh_token_created_at: if rotated { Some(now) } else { previous.and_then(|p| p.refresh_token_created_at) },
        };

        if rotated {
            self.store.write_canonical(&material).await?;
            tracing::info!("refresh token rotated, wrote canonical store");
        } else {
            tracing::debug!("refresh token unchanged, skipped canonical write");
        }
        write_local_cache(&self.local_cache_path, &material).await?;
        *self.cached.write().await = Some(material.clone());
        Ok(material)
    }

    /// As `refresh`, but bypasses the not-near-expiry check. Called by
    /// Scout's fallback path (via `/refresh-tokens`) and Worker's
    /// pre-cycle check.
    #[tracing::instrument(skip(self))]
    pub async fn force_refresh(&self, now: DateTime<Utc>) -> Result<TokenMaterial, TokenError> {
        self.refresh(now).await
    }

    /// If the canonical store is empty but legacy refresh-token material
    /// exists, perform one refresh and write the result into the canonical
    /// store.
    #[tracing::instrument(skip(self))]
    pub async fn migrate_from_legacy(&self, now: DateTime<Utc>) -> Result<Option<TokenMaterial>, TokenError> {
        if self.store.read_canonical().await?.is_some() {
            return Ok(None);
        }
        let legacy = match self.store.read_legacy().await? {
            Some(m) => m,
            None => return Ok(None),
        };
        *self.cached.write().await = Some(legacy);
        Ok(Some(self.force_refresh(now).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(expires_in: Duration) -> TokenMaterial {
        TokenMaterial {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: Utc::now() + expires_in,
            refresh_token_created_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn reader_rejects_token_near_expiry() {
        let store = Arc::new(InMemorySecretStore::new());
        store.write_canonical(&material(Duration::minutes(2))).await.unwrap();
        let reader = TokenReader::new(store);
        assert!(reader.ensure_valid(Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn reader_accepts_fresh_token() {
        let store = Arc::new(InMemorySecretStore::new());
        store.write_canonical(&material(Duration::hours(1))).await.unwrap();
        let reader = TokenReader::new(store);
        assert!(reader.ensure_valid(Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn reader_falls_back_to_legacy() {
        let store = Arc::new(InMemorySecretStore::new());
        store.seed_legacy(material(Duration::hours(1))).await;
        let reader = TokenReader::new(store);
        assert!(reader.ensure_valid(Utc::now()).await.is_ok());
    }
}
