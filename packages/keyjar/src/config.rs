//! Key jar configuration
//!
//! Settings shared by every bundle a [`crate::KeyJar`] creates. The struct
//! deserializes from JSON so it can live alongside the rest of an
//! application's configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default time a fetched key set is trusted before a conditional refresh
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Default bound on a single key set request
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Configuration for a [`crate::KeyJar`] and the bundles it creates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeyJarConfig {
    /// Seconds a remote key set stays fresh after a successful fetch
    pub cache_ttl_secs: u64,
    /// Seconds before an outstanding key set request is abandoned
    pub request_timeout_secs: u64,
    /// Verify the TLS certificate of remote key set endpoints
    pub verify_tls: bool,
    /// Skip TLS verification for `localhost` endpoints even when `verify_tls` is set
    pub relax_tls_for_localhost: bool,
    /// PEM bundle of extra trust anchors for remote endpoints
    pub trust_anchor_pem: Option<PathBuf>,
    /// User agent sent with key set requests
    pub user_agent: String,
}

impl Default for KeyJarConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            verify_tls: true,
            relax_tls_for_localhost: false,
            trust_anchor_pem: None,
            user_agent: concat!("cryypt-keyjar/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl KeyJarConfig {
    /// Cache lifetime of a fetched key set
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Timeout applied to each key set request
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Set the cache lifetime
    ///
    /// The lifetime is kept in whole seconds; a partial second rounds up, so
    /// only a zero duration means revalidate on every read.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        self
    }

    /// Set the request timeout
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Enable or disable TLS verification
    #[must_use]
    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Skip TLS verification for `localhost` endpoints
    #[must_use]
    pub fn with_relaxed_localhost_tls(mut self, relax: bool) -> Self {
        self.relax_tls_for_localhost = relax;
        self
    }

    /// Add a PEM file of trust anchors
    #[must_use]
    pub fn with_trust_anchor(mut self, pem_path: impl Into<PathBuf>) -> Self {
        self.trust_anchor_pem = Some(pem_path.into());
        self
    }

    /// Whether a remote source should be fetched with TLS verification
    #[must_use]
    pub fn verify_tls_for(&self, url: &str) -> bool {
        if self.relax_tls_for_localhost && (url.contains("/localhost:") || url.contains("/localhost/")) {
            return false;
        }
        self.verify_tls
    }
}
