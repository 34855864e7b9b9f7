//! Multi-issuer key registry
//!
//! Issuers map to ordered bundle lists in a sharded [`DashMap`]. Map guards
//! are only held for the structural edit or to clone the `Arc` list out;
//! every refresh happens after the guard is dropped.

use crate::bundle::KeyBundle;
use crate::bundle::source::{FileFormat, SourceLocation};
use crate::config::KeyJarConfig;
use crate::error::{DecodeError, KeyJarError, Result};
use crate::fetch::{HttpFetcher, KeySetFetcher};
use crate::key::material::{HmacSecret, KeyMaterial};
use crate::key::{Key, KeyKind, KeyUse};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Issuer identity reserved for this entity's own keys
pub const SELF_ISSUER: &str = "";

/// Resolved key material grouped by kind, in registration order
pub type KeysByKind = HashMap<KeyKind, Vec<KeyMaterial>>;

/// The subset of provider metadata the jar consumes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer identifier announced by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Location of the provider's published key set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    /// Every other metadata member, kept as received
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Registry of key bundles per issuer
pub struct KeyJar {
    issuers: DashMap<String, Vec<Arc<KeyBundle>>>,
    config: KeyJarConfig,
    fetcher: Arc<dyn KeySetFetcher>,
}

impl KeyJar {
    /// Create a jar whose remote bundles fetch over HTTP
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built from `config`.
    pub fn new(config: KeyJarConfig) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(&config)?);
        Ok(Self::with_fetcher(config, fetcher))
    }

    /// Create a jar with a custom transport for remote bundles
    #[must_use]
    pub fn with_fetcher(config: KeyJarConfig, fetcher: Arc<dyn KeySetFetcher>) -> Self {
        Self {
            issuers: DashMap::new(),
            config,
            fetcher,
        }
    }

    /// Jar configuration
    #[must_use]
    pub fn config(&self) -> &KeyJarConfig {
        &self.config
    }

    /// Register a source for `issuer`, inferring the bundle type from its scheme
    ///
    /// `file://` URLs and bare paths load a local key set document, `http(s)`
    /// URLs create a remote bundle that is fetched on first read, and the
    /// empty string creates an empty in-memory bundle.
    ///
    /// # Errors
    /// Returns `KeyJarError::UnsupportedSourceScheme` for other schemes, or
    /// the load error of a local file. Nothing is registered on error.
    pub async fn register(&self, issuer: &str, source: &str) -> Result<Arc<KeyBundle>> {
        let bundle = self.bundle_for(source).await?;
        Ok(self.add_bundle(issuer, bundle))
    }

    async fn bundle_for(&self, source: &str) -> Result<KeyBundle> {
        Ok(match SourceLocation::parse(source)? {
            SourceLocation::Empty => KeyBundle::new(),
            SourceLocation::Local(path) => {
                KeyBundle::from_local_file(path, FileFormat::Jwk, KeyKind::Rsa, &[]).await?
            }
            SourceLocation::Remote(url) => self.remote_bundle(url),
        })
    }

    /// Register a local key file with an explicit format, kind and usages
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or decoded.
    pub async fn register_local(
        &self,
        issuer: &str,
        path: impl AsRef<Path>,
        format: FileFormat,
        kind: KeyKind,
        usages: &[KeyUse],
    ) -> Result<Arc<KeyBundle>> {
        let bundle = KeyBundle::from_local_file(path, format, kind, usages).await?;
        Ok(self.add_bundle(issuer, bundle))
    }

    /// Register a shared secret as one HMAC key per usage
    ///
    /// All usage views share one copy of the secret. With no usages the
    /// secret is registered once, unrestricted.
    ///
    /// # Errors
    /// Returns an error if the secret is empty.
    pub fn register_symmetric(
        &self,
        issuer: &str,
        secret: impl Into<Vec<u8>>,
        usages: &[KeyUse],
    ) -> Result<Arc<KeyBundle>> {
        let secret = HmacSecret::new(secret);
        if secret.is_empty() {
            return Err(DecodeError::InvalidMaterial("empty symmetric secret".to_string()).into());
        }
        let material = KeyMaterial::Hmac(Arc::new(secret));
        let keys: Vec<Key> = if usages.is_empty() {
            vec![Key::from_material(material)]
        } else {
            usages
                .iter()
                .map(|usage| Key::from_material(material.clone()).with_use(*usage))
                .collect()
        };
        let bundle = KeyBundle::from_keys(keys)?;
        Ok(self.add_bundle(issuer, bundle))
    }

    fn remote_bundle(&self, url: String) -> KeyBundle {
        let verify_tls = self.config.verify_tls_for(&url);
        KeyBundle::from_remote(url, self.fetcher.clone())
            .with_cache_ttl(self.config.cache_ttl())
            .with_verify_tls(verify_tls)
    }

    /// Append a bundle to the issuer's list, creating the entry if needed
    pub fn add_bundle(&self, issuer: &str, bundle: KeyBundle) -> Arc<KeyBundle> {
        let bundle = Arc::new(bundle);
        info!(issuer, source = %bundle.source(), "Registered key bundle");
        self.issuers
            .entry(issuer.to_string())
            .or_default()
            .push(bundle.clone());
        bundle
    }

    /// Replace the issuer's whole bundle list
    pub fn set_bundles(&self, issuer: &str, bundles: Vec<Arc<KeyBundle>>) {
        self.issuers.insert(issuer.to_string(), bundles);
    }

    /// Bundles registered for `issuer`, tolerating a trailing-slash mismatch
    #[must_use]
    pub fn bundles(&self, issuer: &str) -> Option<Vec<Arc<KeyBundle>>> {
        if let Some(entry) = self.issuers.get(issuer) {
            return Some(entry.value().clone());
        }
        if issuer.is_empty() {
            return None;
        }
        let toggled = toggle_trailing_slash(issuer);
        self.issuers.get(&toggled).map(|entry| entry.value().clone())
    }

    /// Whether `issuer` has an entry (exact match)
    #[must_use]
    pub fn contains(&self, issuer: &str) -> bool {
        self.issuers.contains_key(issuer)
    }

    /// Registered issuer identities, sorted
    #[must_use]
    pub fn issuers(&self) -> Vec<String> {
        let mut issuers: Vec<String> = self.issuers.iter().map(|entry| entry.key().clone()).collect();
        issuers.sort();
        issuers
    }

    /// Key material for `usage`, grouped by kind
    ///
    /// `dec` resolves like `enc` and `ver` like `sig`. With a kind filter the
    /// result always holds exactly that kind, possibly with an empty list.
    /// An unknown issuer yields the same result as an issuer without keys.
    pub async fn resolve(&self, usage: KeyUse, kind: Option<KeyKind>, issuer: &str) -> KeysByKind {
        match self.bundles(issuer) {
            Some(bundles) => collect_usable(&bundles, usage, kind).await,
            None => {
                debug!(issuer, "No bundles registered for issuer");
                empty_result(kind)
            }
        }
    }

    /// Like [`KeyJar::resolve`], but reports an unknown issuer
    ///
    /// # Errors
    /// Returns `KeyJarError::UnknownIssuer` if no bundle list is registered
    /// under `issuer` or its trailing-slash twin.
    pub async fn try_resolve(&self, usage: KeyUse, kind: Option<KeyKind>, issuer: &str) -> Result<KeysByKind> {
        let bundles = self
            .bundles(issuer)
            .ok_or_else(|| KeyJarError::UnknownIssuer(issuer.to_string()))?;
        Ok(collect_usable(&bundles, usage, kind).await)
    }

    /// Signing keys of `owner`
    pub async fn signing_keys(&self, kind: Option<KeyKind>, owner: &str) -> KeysByKind {
        self.resolve(KeyUse::Sig, kind, owner).await
    }

    /// Verification keys of `owner`
    pub async fn verification_keys(&self, kind: Option<KeyKind>, owner: &str) -> KeysByKind {
        self.resolve(KeyUse::Ver, kind, owner).await
    }

    /// Encryption keys of `owner`
    pub async fn encryption_keys(&self, kind: Option<KeyKind>, owner: &str) -> KeysByKind {
        self.resolve(KeyUse::Enc, kind, owner).await
    }

    /// Decryption keys of `owner`
    pub async fn decryption_keys(&self, kind: Option<KeyKind>, owner: &str) -> KeysByKind {
        self.resolve(KeyUse::Dec, kind, owner).await
    }

    /// Verification keys of `counterpart` followed by this entity's own
    ///
    /// Duplicates are kept; callers trying keys in order rely on it.
    pub async fn verify_keys(&self, counterpart: &str) -> KeysByKind {
        self.with_own_keys(KeyUse::Ver, counterpart).await
    }

    /// Decryption keys of `counterpart` followed by this entity's own
    pub async fn decrypt_keys(&self, counterpart: &str) -> KeysByKind {
        self.with_own_keys(KeyUse::Dec, counterpart).await
    }

    async fn with_own_keys(&self, usage: KeyUse, counterpart: &str) -> KeysByKind {
        let mut merged = self.resolve(usage, None, counterpart).await;
        for (kind, own) in self.resolve(usage, None, SELF_ISSUER).await {
            merged.entry(kind).or_default().extend(own);
        }
        merged
    }

    /// Revoke keys of `kind` (optionally only those holding `material`)
    ///
    /// Bundles emptied by the removal are dropped, and the issuer entry goes
    /// away once it has no bundles left. Returns the number of keys removed.
    pub fn remove(&self, issuer: &str, kind: KeyKind, material: Option<&KeyMaterial>) -> usize {
        let mut removed = 0;
        if let Some(mut entry) = self.issuers.get_mut(issuer) {
            entry.retain(|bundle| {
                let dropped = bundle.remove(kind, material);
                removed += dropped;
                !(dropped > 0 && bundle.is_empty())
            });
        }
        if self
            .issuers
            .remove_if(issuer, |_, bundles| bundles.is_empty())
            .is_some()
        {
            warn!(issuer, "Pruned issuer with no remaining keys");
        }
        removed
    }

    /// Register the key set announced in provider metadata
    ///
    /// Metadata without `jwks_uri` changes nothing. With `replace`, the
    /// issuer's bundle list is swapped for the new bundle in one map edit.
    ///
    /// # Errors
    /// Returns an error if `jwks_uri` cannot be registered. The issuer's
    /// existing bundles are kept in that case.
    pub async fn discover_and_load(
        &self,
        issuer: &str,
        metadata: &ProviderMetadata,
        replace: bool,
    ) -> Result<Option<Arc<KeyBundle>>> {
        let Some(jwks_uri) = metadata.jwks_uri.as_deref() else {
            debug!(issuer, "Provider metadata has no jwks_uri");
            return Ok(None);
        };
        let bundle = self.bundle_for(jwks_uri).await?;
        if !replace {
            return Ok(Some(self.add_bundle(issuer, bundle)));
        }
        let bundle = Arc::new(bundle);
        if self
            .issuers
            .insert(issuer.to_string(), vec![bundle.clone()])
            .is_some()
        {
            info!(issuer, source = %bundle.source(), "Replaced key bundles");
        } else {
            info!(issuer, source = %bundle.source(), "Registered key bundle");
        }
        Ok(Some(bundle))
    }

    /// Extend this jar with every bundle of `other`
    ///
    /// Bundles are shared, not copied, so refreshes are visible in both jars.
    pub fn merge(&self, other: &KeyJar) {
        if std::ptr::eq(self, other) {
            return;
        }
        for entry in other.issuers.iter() {
            self.issuers
                .entry(entry.key().clone())
                .or_default()
                .extend(entry.value().iter().cloned());
        }
    }

    /// Longest registered issuer that prefixes `url`
    ///
    /// The self issuer never matches.
    ///
    /// # Errors
    /// Returns `KeyJarError::UnknownIssuer` if no issuer matches.
    pub fn match_owner(&self, url: &str) -> Result<String> {
        self.issuers
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|issuer| !issuer.is_empty() && url.starts_with(issuer.as_str()))
            .max_by_key(String::len)
            .ok_or_else(|| KeyJarError::UnknownIssuer(url.to_string()))
    }
}

impl fmt::Debug for KeyJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let issuers: Vec<(String, usize)> = self
            .issuers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();
        f.debug_struct("KeyJar")
            .field("issuers", &issuers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn toggle_trailing_slash(issuer: &str) -> String {
    match issuer.strip_suffix('/') {
        Some(trimmed) => trimmed.to_string(),
        None => format!("{issuer}/"),
    }
}

fn empty_result(kind: Option<KeyKind>) -> KeysByKind {
    let mut result = KeysByKind::new();
    if let Some(kind) = kind {
        result.insert(kind, Vec::new());
    }
    result
}

async fn collect_usable(bundles: &[Arc<KeyBundle>], usage: KeyUse, kind: Option<KeyKind>) -> KeysByKind {
    let selections = join_all(bundles.iter().map(|bundle| bundle.select(kind))).await;

    let mut result = empty_result(kind);
    for key in selections.iter().flatten() {
        if !key.permits(usage) {
            continue;
        }
        if let Some(material) = key.material() {
            result.entry(key.kind()).or_default().push(material);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchFuture;

    struct NoNetwork;

    impl KeySetFetcher for NoNetwork {
        fn fetch<'a>(&'a self, url: &'a str, _etag: Option<&'a str>, _verify_tls: bool) -> FetchFuture<'a> {
            Box::pin(async move { Err(KeyJarError::refresh(url, "offline")) })
        }
    }

    fn jar() -> KeyJar {
        KeyJar::with_fetcher(KeyJarConfig::default(), Arc::new(NoNetwork))
    }

    #[test]
    fn slash_toggle() {
        assert_eq!(toggle_trailing_slash("https://a.example/"), "https://a.example");
        assert_eq!(toggle_trailing_slash("https://a.example"), "https://a.example/");
    }

    #[tokio::test]
    async fn symmetric_views_share_one_secret() {
        let jar = jar();
        let bundle = jar
            .register_symmetric("https://rp.example", b"shared".to_vec(), &[KeyUse::Sig, KeyUse::Enc])
            .unwrap();

        let keys = bundle.keys().await;
        assert_eq!(keys.len(), 2);
        let (a, b) = (keys[0].material().unwrap(), keys[1].material().unwrap());
        assert!(a.ptr_eq(&b));
    }

    #[tokio::test]
    async fn kind_filter_always_names_the_kind() {
        let jar = jar();
        let result = jar.resolve(KeyUse::Sig, Some(KeyKind::Rsa), "https://nobody.example").await;
        assert_eq!(result.get(&KeyKind::Rsa).map(Vec::len), Some(0));

        assert!(jar.resolve(KeyUse::Sig, None, "https://nobody.example").await.is_empty());
        assert!(matches!(
            jar.try_resolve(KeyUse::Sig, None, "https://nobody.example").await,
            Err(KeyJarError::UnknownIssuer(_))
        ));
    }

    #[tokio::test]
    async fn unsupported_scheme_registers_nothing() {
        let jar = jar();
        let err = jar.register("https://op.example", "ftp://op.example/jwks").await.unwrap_err();
        assert!(matches!(err, KeyJarError::UnsupportedSourceScheme(_)));
        assert!(!jar.contains("https://op.example"));
    }

    #[tokio::test]
    async fn discovery_without_jwks_uri_is_a_no_op() {
        let jar = jar();
        jar.register_symmetric("https://op.example", b"s".to_vec(), &[KeyUse::Sig]).unwrap();

        let loaded = jar
            .discover_and_load("https://op.example", &ProviderMetadata::default(), true)
            .await
            .unwrap();
        assert!(loaded.is_none());
        assert_eq!(jar.bundles("https://op.example").map(|b| b.len()), Some(1));
    }

    #[tokio::test]
    async fn discovery_with_replace_drops_old_bundles() {
        let jar = jar();
        jar.register_symmetric("https://op.example", b"s".to_vec(), &[KeyUse::Sig]).unwrap();

        let metadata: ProviderMetadata = serde_json::from_value(serde_json::json!({
            "issuer": "https://op.example",
            "jwks_uri": "https://op.example/jwks",
            "token_endpoint": "https://op.example/token"
        }))
        .unwrap();
        assert!(metadata.extra.contains_key("token_endpoint"));

        let bundle = jar.discover_and_load("https://op.example", &metadata, true).await.unwrap();
        assert!(bundle.is_some_and(|b| b.is_remote()));
        assert_eq!(jar.bundles("https://op.example").map(|b| b.len()), Some(1));
    }

    #[tokio::test]
    async fn failed_replace_keeps_existing_bundles() {
        let jar = jar();
        let existing = jar
            .register_symmetric("https://op.example", b"s".to_vec(), &[KeyUse::Sig])
            .unwrap();
        let metadata: ProviderMetadata = serde_json::from_value(serde_json::json!({
            "jwks_uri": "ftp://op.example/jwks"
        }))
        .unwrap();

        let err = jar.discover_and_load("https://op.example", &metadata, true).await.unwrap_err();
        assert!(matches!(err, KeyJarError::UnsupportedSourceScheme(_)));

        let bundles = jar.bundles("https://op.example").unwrap();
        assert_eq!(bundles.len(), 1);
        assert!(Arc::ptr_eq(&bundles[0], &existing));
    }

    #[test]
    fn match_owner_prefers_longest_prefix() {
        let jar = jar();
        jar.register_symmetric("https://op.example", b"a".to_vec(), &[]).unwrap();
        jar.register_symmetric("https://op.example/tenant", b"b".to_vec(), &[]).unwrap();
        jar.register_symmetric(SELF_ISSUER, b"c".to_vec(), &[]).unwrap();

        assert_eq!(jar.match_owner("https://op.example/tenant/authorize").unwrap(), "https://op.example/tenant");
        assert_eq!(jar.match_owner("https://op.example/authorize").unwrap(), "https://op.example");
        assert!(jar.match_owner("https://other.example/").is_err());
    }

    #[test]
    fn merge_shares_bundles() {
        let a = jar();
        let b = jar();
        b.register_symmetric("https://op.example", b"s".to_vec(), &[KeyUse::Sig]).unwrap();

        a.merge(&b);
        a.merge(&a);
        let (ours, theirs) = (a.bundles("https://op.example").unwrap(), b.bundles("https://op.example").unwrap());
        assert_eq!(ours.len(), 1);
        assert!(Arc::ptr_eq(&ours[0], &theirs[0]));
    }

    #[tokio::test]
    async fn empty_source_registers_empty_bundle() {
        let jar = jar();
        let bundle = jar.register(SELF_ISSUER, "").await.unwrap();
        assert!(jar.contains(SELF_ISSUER));
        assert!(bundle.is_empty());
        assert!(!bundle.is_remote());
    }

    #[test]
    fn empty_secret_is_rejected() {
        let jar = jar();
        assert!(jar.register_symmetric(SELF_ISSUER, Vec::new(), &[KeyUse::Sig]).is_err());
        assert!(!jar.contains(SELF_ISSUER));
    }
}
