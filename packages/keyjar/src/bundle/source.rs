//! Bundle sources and local loaders

use crate::error::{KeyJarError, Result};
use crate::key::jwk::{JwkEntry, KeySetDocument};
use crate::key::material::KeyMaterial;
use crate::key::{Key, KeyKind, KeyUse};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Usages materialised for an encoded key file when none are requested
pub const DEFAULT_FILE_USAGES: [KeyUse; 2] = [KeyUse::Enc, KeyUse::Sig];

/// Encoding of a local key file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Key set document
    #[default]
    Jwk,
    /// Single encoded key (PEM or DER) with no type tag
    Der,
}

impl FromStr for FileFormat {
    type Err = KeyJarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jwk" => Ok(Self::Jwk),
            "der" | "pem" => Ok(Self::Der),
            other => Err(KeyJarError::UnsupportedKeyFormat(other.to_string())),
        }
    }
}

/// Where a bundle's keys come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Keys supplied directly by the caller
    Memory,
    /// Local file
    File {
        /// File path
        path: PathBuf,
        /// File encoding
        format: FileFormat,
        /// Kind assumed for [`FileFormat::Der`] files
        kind: KeyKind,
        /// One key view is created per usage for [`FileFormat::Der`] files
        usages: Vec<KeyUse>,
    },
    /// Published key set endpoint
    Remote {
        /// http(s) URL
        url: String,
    },
}

impl KeySource {
    /// Whether refreshes go over the network
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::File { path, .. } => write!(f, "{}", path.display()),
            Self::Remote { url } => f.write_str(url),
        }
    }
}

/// A registration source string, classified by scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// Empty string: an empty in-memory bundle
    Empty,
    /// `file://` URL or bare path
    Local(PathBuf),
    /// `http://` or `https://` URL
    Remote(String),
}

impl SourceLocation {
    /// Classify a source string
    ///
    /// # Errors
    /// Returns `KeyJarError::UnsupportedSourceScheme` for any other `scheme://`.
    pub fn parse(source: &str) -> Result<Self> {
        if source.is_empty() {
            return Ok(Self::Empty);
        }
        if let Some(path) = source.strip_prefix("file://") {
            return Ok(Self::Local(PathBuf::from(path)));
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            return Ok(Self::Remote(source.to_string()));
        }
        if source.contains("://") {
            return Err(KeyJarError::UnsupportedSourceScheme(source.to_string()));
        }
        Ok(Self::Local(PathBuf::from(source)))
    }
}

/// Decode every entry of a key set, failing the whole batch on the first bad entry
pub(crate) fn decode_key_set(entries: &[serde_json::Value], origin: &str) -> Result<Vec<Key>> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            Key::decode(entry).map_err(|e| {
                KeyJarError::key_load(JwkEntry::kind_hint(entry), origin, e.at_position(index))
            })
        })
        .collect()
}

/// Parse a key set document body
pub(crate) fn decode_document(body: &[u8], origin: &str) -> Result<Vec<Key>> {
    let document: KeySetDocument = serde_json::from_slice(body)?;
    decode_key_set(&document.keys, origin)
}

/// Read a local key set document
pub(crate) async fn read_jwk_file(path: &Path) -> Result<Vec<Key>> {
    let body = tokio::fs::read(path).await?;
    decode_document(&body, &path.display().to_string())
}

/// Read one encoded key and expose it once per usage, sharing the material
pub(crate) async fn read_encoded_file(path: &Path, kind: KeyKind, usages: &[KeyUse]) -> Result<Vec<Key>> {
    let content = tokio::fs::read(path).await?;
    let material = KeyMaterial::from_encoded(kind, &content)
        .map_err(|e| KeyJarError::key_load(kind.as_str(), path.display().to_string(), e))?;

    let usages: &[KeyUse] = if usages.is_empty() { &DEFAULT_FILE_USAGES } else { usages };
    usages
        .iter()
        .map(|usage| {
            let mut key = Key::from_material(material.clone()).with_use(*usage);
            key.reconcile()
                .map_err(|e| KeyJarError::key_load(kind.as_str(), path.display().to_string(), e))?;
            Ok(key)
        })
        .collect()
}
