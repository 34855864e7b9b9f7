//! Shared fixtures for the key jar integration tests

#![allow(dead_code)]

use cryypt_keyjar::{FetchFuture, FetchOutcome, Key, KeyJarError, KeyMaterial, KeySetFetcher, KeyUse, RsaMaterial};
use once_cell::sync::Lazy;
use rsa::RsaPrivateKey;
use rsa::rand_core::OsRng;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Two small RSA keys, generated once per test binary
pub static RSA_KEYS: Lazy<Vec<RsaPrivateKey>> = Lazy::new(|| {
    (0..2)
        .map(|_| RsaPrivateKey::new(&mut OsRng, 1024).expect("rsa key generation"))
        .collect()
});

/// Shared material for one of the fixture keys
pub fn rsa_material(index: usize) -> KeyMaterial {
    KeyMaterial::Rsa(Arc::new(RsaMaterial::Private(RSA_KEYS[index].clone())))
}

/// Public JWK object for a fixture key
pub fn rsa_entry(index: usize, key_use: KeyUse, kid: &str) -> Value {
    let mut key = Key::from_material(rsa_material(index)).with_use(key_use).with_kid(kid);
    key.reconcile().expect("reconcile");
    Value::Object(key.to_public_serializable())
}

/// HMAC JWK object carrying a raw secret
pub fn hmac_entry(secret: &str, key_use: &str) -> Value {
    json!({"kty": "hmac", "key": secret, "use": key_use})
}

/// Key set document body
pub fn jwks_body(entries: &[Value]) -> Vec<u8> {
    serde_json::to_vec(&json!({ "keys": entries })).expect("encode key set")
}

/// One scripted response
#[derive(Debug, Clone)]
pub enum Step {
    /// 200 with body and optional ETag
    Modified(Vec<u8>, Option<&'static str>),
    /// 304
    NotModified,
    /// Transport failure
    Fail,
}

/// In-memory fetcher replaying a script and counting calls
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    etags: Mutex<Vec<Option<String>>>,
    delay: Duration,
}

impl ScriptedFetcher {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        })
    }

    /// Every fetch sleeps for `delay` before answering
    pub fn with_delay(steps: impl IntoIterator<Item = Step>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            delay,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Validators sent with each request, in order
    pub fn etags(&self) -> Vec<Option<String>> {
        self.etags.lock().expect("etag log").clone()
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().expect("script").push_back(step);
    }
}

impl KeySetFetcher for ScriptedFetcher {
    fn fetch<'a>(&'a self, url: &'a str, etag: Option<&'a str>, _verify_tls: bool) -> FetchFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.etags.lock().expect("etag log").push(etag.map(str::to_string));
        let step = self.steps.lock().expect("script").pop_front();

        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match step {
                Some(Step::Modified(body, etag)) => Ok(FetchOutcome::Modified {
                    body,
                    etag: etag.map(str::to_string),
                    cache_control: None,
                }),
                Some(Step::NotModified) => Ok(FetchOutcome::NotModified),
                Some(Step::Fail) | None => Err(KeyJarError::refresh(url, "connection refused")),
            }
        })
    }
}
