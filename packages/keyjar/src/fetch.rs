//! Conditional key set retrieval
//!
//! Bundles talk to the network only through [`KeySetFetcher`], so the
//! refresh logic can be driven by any transport. [`HttpFetcher`] is the
//! reqwest-backed implementation used by default.

use crate::config::KeyJarConfig;
use crate::error::{KeyJarError, Result};
use reqwest::header::{CACHE_CONTROL, ETAG, HeaderMap, HeaderName, IF_NONE_MATCH};
use reqwest::{Certificate, Client, StatusCode};
use std::future::Future;
use std::pin::Pin;

/// Result of a conditional GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The validator still matches; keep the cached key set
    NotModified,
    /// New content
    Modified {
        /// Response body (a key set document)
        body: Vec<u8>,
        /// `ETag` response header
        etag: Option<String>,
        /// `Cache-Control` response header
        cache_control: Option<String>,
    },
}

/// Boxed future returned by [`KeySetFetcher::fetch`]
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<FetchOutcome>> + Send + 'a>>;

/// Transport used by remote bundles (avoiding `async_trait`)
pub trait KeySetFetcher: Send + Sync {
    /// GET `url`, sending `etag` as `If-None-Match` when present
    ///
    /// Status 304 maps to [`FetchOutcome::NotModified`], 200 to
    /// [`FetchOutcome::Modified`]; every other status and any transport
    /// failure must be reported as `KeyJarError::Refresh`.
    fn fetch<'a>(&'a self, url: &'a str, etag: Option<&'a str>, verify_tls: bool) -> FetchFuture<'a>;
}

/// reqwest client pair for verified and unverified TLS endpoints
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    verifying: Client,
    relaxed: Client,
}

impl HttpFetcher {
    /// Build clients from the jar configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The trust anchor file cannot be read or is not PEM
    /// - HTTP client initialization fails
    pub fn new(config: &KeyJarConfig) -> Result<Self> {
        let trust_anchor = match &config.trust_anchor_pem {
            Some(path) => {
                let pem = std::fs::read(path)?;
                let cert = Certificate::from_pem(&pem).map_err(|e| {
                    KeyJarError::HttpClientInit(format!(
                        "Invalid trust anchor '{}': {e}",
                        path.display()
                    ))
                })?;
                Some(cert)
            }
            None => None,
        };

        let build = |accept_invalid: bool| {
            let mut builder = Client::builder()
                .timeout(config.request_timeout())
                .user_agent(config.user_agent.clone())
                .danger_accept_invalid_certs(accept_invalid);
            if let Some(cert) = &trust_anchor {
                builder = builder.add_root_certificate(cert.clone());
            }
            builder
                .build()
                .map_err(|e| KeyJarError::HttpClientInit(e.to_string()))
        };

        Ok(Self {
            verifying: build(false)?,
            relaxed: build(true)?,
        })
    }

    async fn get(&self, url: &str, etag: Option<&str>, verify_tls: bool) -> Result<FetchOutcome> {
        let client = if verify_tls { &self.verifying } else { &self.relaxed };
        let mut request = client.get(url);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request
            .send()
            .await
            .map_err(|e| KeyJarError::refresh(url, format!("request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(FetchOutcome::NotModified),
            StatusCode::OK => {
                let (etag, cache_control) = {
                    let headers = response.headers();
                    (header_value(headers, ETAG), header_value(headers, CACHE_CONTROL))
                };
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| KeyJarError::refresh(url, format!("failed to read body: {e}")))?;
                Ok(FetchOutcome::Modified {
                    body: body.to_vec(),
                    etag,
                    cache_control,
                })
            }
            status => Err(KeyJarError::refresh(url, format!("server returned status {status}"))),
        }
    }
}

fn header_value(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

impl KeySetFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str, etag: Option<&'a str>, verify_tls: bool) -> FetchFuture<'a> {
        Box::pin(self.get(url, etag, verify_tls))
    }
}
