//! Key bundles: one source's worth of keys with its own cache state.
//!
//! The key list lives behind an [`ArcSwap`], so readers always see either the
//! previous or the next complete list, never a partially replaced one. A
//! refresh builds the new list off to the side and swaps it in.

pub mod refresh;
pub mod source;

use crate::error::Result;
use crate::fetch::KeySetFetcher;
use crate::key::jwk::KeySetDocument;
use crate::key::material::KeyMaterial;
use crate::key::{Key, KeyKind, KeyUse};
use arc_swap::ArcSwap;
use refresh::CacheState;
use serde_json::Value;
use source::{FileFormat, KeySource, decode_key_set, read_encoded_file, read_jwk_file};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

pub use refresh::BundleState;

/// Ordered keys from a single source
pub struct KeyBundle {
    keys: ArcSwap<Vec<Arc<Key>>>,
    source: KeySource,
    cache_ttl: Duration,
    verify_tls: bool,
    cache: RwLock<CacheState>,
    refresh_latch: tokio::sync::Mutex<()>,
    fetcher: Option<Arc<dyn KeySetFetcher>>,
}

impl KeyBundle {
    fn with_source(source: KeySource, keys: Vec<Key>) -> Self {
        Self {
            keys: ArcSwap::from_pointee(keys.into_iter().map(Arc::new).collect()),
            source,
            cache_ttl: Duration::from_secs(crate::config::DEFAULT_CACHE_TTL_SECS),
            verify_tls: true,
            cache: RwLock::new(CacheState::default()),
            refresh_latch: tokio::sync::Mutex::new(()),
            fetcher: None,
        }
    }

    /// Empty in-memory bundle
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(KeySource::Memory, Vec::new())
    }

    /// In-memory bundle holding already constructed keys
    ///
    /// # Errors
    /// Returns an error if a key's members do not describe valid material.
    pub fn from_keys(keys: impl IntoIterator<Item = Key>) -> Result<Self> {
        let keys = keys
            .into_iter()
            .map(|mut key| -> Result<Key> {
                key.reconcile()?;
                Ok(key)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::with_source(KeySource::Memory, keys))
    }

    /// Decode serialized key objects into an in-memory bundle
    ///
    /// The batch is all-or-nothing: one bad entry fails the whole bundle.
    ///
    /// # Errors
    /// Returns `KeyJarError::KeyLoad` naming the kind and position of the
    /// first entry that cannot be decoded.
    pub fn from_memory(entries: &[Value]) -> Result<Self> {
        let keys = decode_key_set(entries, "memory")?;
        Ok(Self::with_source(KeySource::Memory, keys))
    }

    /// Load a local key file
    ///
    /// `kind` and `usages` only apply to [`FileFormat::Der`]: the file holds
    /// one untagged key, exposed once per usage over shared material.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or decoded.
    pub async fn from_local_file(
        path: impl AsRef<Path>,
        format: FileFormat,
        kind: KeyKind,
        usages: &[KeyUse],
    ) -> Result<Self> {
        let source = KeySource::File {
            path: path.as_ref().to_path_buf(),
            format,
            kind,
            usages: usages.to_vec(),
        };
        let keys = load_file(&source).await?;
        info!(source = %source, keys = keys.len(), "Loaded local key bundle");
        Ok(Self::with_source(source, keys))
    }

    /// Remote bundle; nothing is fetched until the first read
    #[must_use]
    pub fn from_remote(url: impl Into<String>, fetcher: Arc<dyn KeySetFetcher>) -> Self {
        let mut bundle = Self::with_source(KeySource::Remote { url: url.into() }, Vec::new());
        bundle.fetcher = Some(fetcher);
        bundle
    }

    /// Set how long a fetched key set stays fresh
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Enable or disable TLS verification for remote fetches
    #[must_use]
    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Keys, optionally restricted to one kind, refreshing first if stale
    ///
    /// Refresh failures are logged and the cached keys are served.
    pub async fn select(&self, kind: Option<KeyKind>) -> Vec<Arc<Key>> {
        if let Err(e) = self.ensure_fresh().await {
            warn!(source = %self.source, error = %e, "Key set refresh failed, serving cached keys");
        }
        self.keys
            .load()
            .iter()
            .filter(|key| kind.is_none_or(|kind| key.kind() == kind))
            .cloned()
            .collect()
    }

    /// All keys, refreshing first if stale
    pub async fn keys(&self) -> Vec<Arc<Key>> {
        self.select(None).await
    }

    /// Current key list without any refresh
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<Key>>> {
        self.keys.load_full()
    }

    /// Add a key at the end of the list
    ///
    /// A later successful remote refresh replaces the list, including
    /// appended keys.
    ///
    /// # Errors
    /// Returns an error if the key's members do not describe valid material.
    pub fn append(&self, mut key: Key) -> Result<()> {
        key.reconcile()?;
        let key = Arc::new(key);
        self.keys.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(key.clone());
            next
        });
        Ok(())
    }

    /// Remove every key of `kind`, or only those holding `material`
    ///
    /// Returns the number of keys removed.
    pub fn remove(&self, kind: KeyKind, material: Option<&KeyMaterial>) -> usize {
        let mut removed = 0;
        self.keys.rcu(|current| {
            let kept: Vec<Arc<Key>> = current
                .iter()
                .filter(|key| {
                    let doomed = key.kind() == kind && material.is_none_or(|m| key.has_material(m));
                    !doomed
                })
                .cloned()
                .collect();
            removed = current.len() - kept.len();
            kept
        });
        removed
    }

    /// Reload from the source regardless of freshness
    ///
    /// Local files are re-read; remote sources are re-fetched through the
    /// refresh latch. In-memory bundles have nothing to reload.
    ///
    /// # Errors
    /// Returns the load or refresh error; the cached keys stay in place.
    pub async fn update(&self) -> Result<()> {
        match &self.source {
            KeySource::Memory => Ok(()),
            KeySource::File { .. } => {
                let keys = load_file(&self.source).await?;
                info!(source = %self.source, keys = keys.len(), "Reloaded local key bundle");
                self.replace_keys(keys);
                Ok(())
            }
            KeySource::Remote { .. } => {
                let _latch = self.refresh_latch.lock().await;
                self.fetch_remote().await
            }
        }
    }

    /// Public key set document for this bundle
    ///
    /// # Errors
    /// Returns an error if JSON encoding fails.
    pub async fn to_jwks(&self) -> Result<String> {
        let document = KeySetDocument {
            keys: public_entries(&self.keys().await),
        };
        Ok(serde_json::to_string(&document)?)
    }

    /// Number of cached keys; never triggers a refresh
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.load().len()
    }

    /// Whether no keys are cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.load().is_empty()
    }

    /// Where the keys come from
    #[must_use]
    pub fn source(&self) -> &KeySource {
        &self.source
    }

    /// Whether this bundle refreshes over the network
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.source.is_remote()
    }

    /// Local file path, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            KeySource::File { path, .. } => Some(path.as_path()),
            _ => None,
        }
    }

    /// Cache lifetime applied after each successful fetch
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Validator from the last successful fetch
    #[must_use]
    pub fn etag(&self) -> Option<String> {
        self.read_cache().etag.clone()
    }

    /// `Cache-Control` advisory from the last successful fetch
    #[must_use]
    pub fn cache_control(&self) -> Option<String> {
        self.read_cache().cache_control.clone()
    }

    fn replace_keys(&self, keys: Vec<Key>) {
        self.keys.store(Arc::new(keys.into_iter().map(Arc::new).collect()));
    }
}

impl Default for KeyBundle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBundle")
            .field("source", &self.source)
            .field("keys", &self.len())
            .field("state", &self.state())
            .field("cache_ttl", &self.cache_ttl)
            .field("verify_tls", &self.verify_tls)
            .finish()
    }
}

/// Publishable JSON objects for `keys`, in order
pub(crate) fn public_entries(keys: &[Arc<Key>]) -> Vec<Value> {
    keys.iter()
        .map(|key| Value::Object(key.to_public_serializable()))
        .collect()
}

async fn load_file(source: &KeySource) -> Result<Vec<Key>> {
    match source {
        KeySource::File {
            path,
            format: FileFormat::Jwk,
            ..
        } => read_jwk_file(path).await,
        KeySource::File {
            path,
            format: FileFormat::Der,
            kind,
            usages,
        } => read_encoded_file(path, *kind, usages).await,
        KeySource::Memory | KeySource::Remote { .. } => Ok(Vec::new()),
    }
}
