//! JWK wire types

use serde::{Deserialize, Serialize};

/// A key set document: `{"keys": [...]}`
///
/// Entries stay as raw JSON values so a failing entry can be reported with
/// its position and kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeySetDocument {
    /// Key objects in source order
    pub keys: Vec<serde_json::Value>,
}

/// Members of a single key object this store understands
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct JwkEntry {
    pub kty: Option<String>,
    pub alg: Option<String>,
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    pub kid: Option<String>,
    pub n: Option<String>,
    pub e: Option<String>,
    pub crv: Option<String>,
    pub x: Option<String>,
    pub y: Option<String>,
    pub k: Option<String>,
    /// Raw secret, as written by older symmetric registrations
    pub key: Option<String>,
}

impl JwkEntry {
    /// `kty` of a raw entry for error reporting, without a full decode
    pub(crate) fn kind_hint(value: &serde_json::Value) -> String {
        value
            .get("kty")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_ascii_lowercase()
    }
}
