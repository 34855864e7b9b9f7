//! Multi-issuer key store for token-based authentication
//!
//! This crate provides:
//! - A closed [`Key`] type over RSA, EC and HMAC keys with JWK encoding
//! - [`KeyBundle`]s loaded from memory, local files or remote key set URLs
//! - Conditional (ETag) refresh of remote key sets, coalesced per bundle
//! - [`KeyJar`] resolution by usage, kind and issuer, including this
//!   entity's own keys under the empty issuer
//! - Helpers to generate, publish and export the local key

#![forbid(unsafe_code)]

pub mod bundle;
pub mod config;
mod error;
pub mod export;
pub mod fetch;
pub mod jar;
pub mod key;

pub use bundle::source::{FileFormat, KeySource};
pub use bundle::{BundleState, KeyBundle};
pub use config::KeyJarConfig;
pub use error::*;
pub use fetch::{FetchFuture, FetchOutcome, HttpFetcher, KeySetFetcher};
pub use jar::{KeyJar, KeysByKind, ProviderMetadata, SELF_ISSUER};
pub use key::material::{EcCurve, EcMaterial, HmacSecret, KeyMaterial, RsaMaterial};
pub use key::{Key, KeyKind, KeyUse};
