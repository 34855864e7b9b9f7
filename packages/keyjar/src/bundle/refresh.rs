//! Demand-driven refresh of remote bundles
//!
//! There are no background timers: staleness is checked on every read and
//! at most one fetch per bundle is in flight. Readers that find a cached key
//! set while a fetch is running get the cached set immediately; only a
//! bundle that has never been fetched makes its readers wait.

use super::KeyBundle;
use super::source::{KeySource, decode_document};
use crate::error::{KeyJarError, Result};
use crate::fetch::FetchOutcome;
use std::sync::{RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Mutable cache metadata of a remote bundle
#[derive(Debug, Clone, Default)]
pub(crate) struct CacheState {
    /// `None` until the first successful fetch
    pub(crate) expires_at: Option<Instant>,
    pub(crate) etag: Option<String>,
    pub(crate) cache_control: Option<String>,
    pub(crate) last_refresh_failed: bool,
    /// Bumped when a fetch completes, successfully or not
    pub(crate) attempts: u64,
    /// Reason of the last failed fetch
    pub(crate) last_error: Option<String>,
}

/// Lifecycle of a bundle's cached key set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    /// In-memory or file-backed; never refreshed over the network
    Local,
    /// Remote and not yet fetched successfully
    Unfetched,
    /// Remote and within its cache lifetime
    Fresh,
    /// Remote and past its cache lifetime; the next read refreshes
    Stale,
    /// Stale and the last refresh failed; cached keys are still served
    StaleButServing,
}

impl KeyBundle {
    pub(super) fn read_cache(&self) -> RwLockReadGuard<'_, CacheState> {
        self.cache.read().unwrap_or_else(|poisoned| {
            warn!("Bundle cache lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.cache.write().unwrap_or_else(|poisoned| {
            warn!("Bundle cache lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Where this bundle sits in its refresh lifecycle
    #[must_use]
    pub fn state(&self) -> BundleState {
        if !self.is_remote() {
            return BundleState::Local;
        }
        let cache = self.read_cache();
        match cache.expires_at {
            None => BundleState::Unfetched,
            Some(expires_at) if Instant::now() < expires_at => BundleState::Fresh,
            Some(_) if cache.last_refresh_failed => BundleState::StaleButServing,
            Some(_) => BundleState::Stale,
        }
    }

    /// Whether the next read must attempt a fetch
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        if !self.is_remote() {
            return false;
        }
        if self.is_empty() {
            return true;
        }
        match self.read_cache().expires_at {
            Some(expires_at) => Instant::now() >= expires_at,
            None => true,
        }
    }

    /// Refresh a stale remote bundle; a no-op for local bundles
    ///
    /// Concurrent callers coalesce onto one fetch. When keys are already
    /// cached and a fetch is running elsewhere, this returns at once. Callers
    /// that waited for a fetch share its outcome instead of fetching again.
    ///
    /// # Errors
    /// Returns `KeyJarError::Refresh` (or a load error for an undecodable
    /// body). The cached keys and expiry are left untouched.
    pub async fn ensure_fresh(&self) -> Result<()> {
        let seen = self.read_cache().attempts;
        if !self.needs_refresh() {
            return Ok(());
        }

        let _latch = if self.is_empty() {
            self.refresh_latch.lock().await
        } else {
            match self.refresh_latch.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(source = %self.source, "Refresh already running, serving cached keys");
                    return Ok(());
                }
            }
        };

        // Another caller may have finished the fetch while we waited.
        if let Some(outcome) = self.completed_since(seen) {
            debug!(source = %self.source, "Sharing outcome of concurrent refresh");
            return outcome;
        }
        if !self.needs_refresh() {
            debug!(source = %self.source, "Refresh coalesced with concurrent caller");
            return Ok(());
        }
        self.fetch_remote().await
    }

    /// Outcome of a fetch that completed after `seen` was read, if any
    fn completed_since(&self, seen: u64) -> Option<Result<()>> {
        let cache = self.read_cache();
        if cache.attempts == seen {
            return None;
        }
        Some(match (&self.source, &cache.last_error) {
            (KeySource::Remote { url }, Some(reason)) if cache.last_refresh_failed => {
                Err(KeyJarError::refresh(url.as_str(), reason.as_str()))
            }
            _ => Ok(()),
        })
    }

    /// One conditional fetch; the caller holds the refresh latch
    pub(super) async fn fetch_remote(&self) -> Result<()> {
        let url = match &self.source {
            KeySource::Remote { url } => url.as_str(),
            _ => return Ok(()),
        };
        let Some(fetcher) = &self.fetcher else {
            return Err(KeyJarError::refresh(url, "no fetcher configured"));
        };

        let etag = self.read_cache().etag.clone();
        debug!(url, etag = ?etag, "Fetching key set");

        let outcome = fetcher.fetch(url, etag.as_deref(), self.verify_tls).await;
        let outcome = outcome.and_then(|outcome| match outcome {
            FetchOutcome::NotModified => Ok(None),
            FetchOutcome::Modified {
                body,
                etag,
                cache_control,
            } => Ok(Some((decode_document(&body, url)?, etag, cache_control))),
        });

        match outcome {
            Ok(None) => {
                let mut cache = self.write_cache();
                cache.expires_at = Some(Instant::now() + self.cache_ttl);
                cache.last_refresh_failed = false;
                cache.last_error = None;
                cache.attempts += 1;
                debug!(url, "Key set not modified");
                Ok(())
            }
            Ok(Some((keys, etag, cache_control))) => {
                let count = keys.len();
                self.replace_keys(keys);
                let mut cache = self.write_cache();
                cache.expires_at = Some(Instant::now() + self.cache_ttl);
                cache.last_refresh_failed = false;
                cache.last_error = None;
                cache.attempts += 1;
                if etag.is_some() {
                    cache.etag = etag;
                }
                if cache_control.is_some() {
                    cache.cache_control = cache_control;
                }
                info!(url, keys = count, "Key set refreshed");
                Ok(())
            }
            Err(e) => {
                let mut cache = self.write_cache();
                cache.last_refresh_failed = true;
                cache.last_error = Some(match &e {
                    KeyJarError::Refresh { reason, .. } => reason.clone(),
                    other => other.to_string(),
                });
                cache.attempts += 1;
                Err(e)
            }
        }
    }
}
