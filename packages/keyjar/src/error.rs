//! Error types for key decoding, bundle loading and issuer resolution

use thiserror::Error;

/// Failure to turn a serialized key object into a [`crate::Key`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The `kty` discriminator names a kind this store does not model
    #[error("Unsupported key kind '{kind}'{}", position_suffix(*position))]
    UnsupportedKeyKind {
        /// The offending `kty` value
        kind: String,
        /// Index of the entry inside its key set, when known
        position: Option<usize>,
    },

    /// The `use` member is not one of sig, ver, enc, dec
    #[error("Unsupported key use '{0}'")]
    UnsupportedKeyUse(String),

    /// A member required to build key material is absent
    #[error("Missing '{field}' for {kind} key")]
    MissingField {
        /// Key kind being decoded
        kind: &'static str,
        /// Name of the absent member
        field: &'static str,
    },

    /// The key object is not shaped like a JWK
    #[error("Malformed key: {0}")]
    Malformed(String),

    /// Numeric or encoded members do not describe valid key material
    #[error("Invalid key material: {0}")]
    InvalidMaterial(String),
}

impl DecodeError {
    /// Attach the entry position to an unsupported-kind error
    #[must_use]
    pub fn at_position(self, index: usize) -> Self {
        match self {
            Self::UnsupportedKeyKind { kind, .. } => Self::UnsupportedKeyKind {
                kind,
                position: Some(index),
            },
            other => other,
        }
    }
}

fn position_suffix(position: Option<usize>) -> String {
    position
        .map(|index| format!(" at entry {index}"))
        .unwrap_or_default()
}

/// Errors raised by bundles, the key jar and the export helpers
#[derive(Debug, Error)]
pub enum KeyJarError {
    /// A key could not be loaded from its source
    #[error("Failed to load {kind} key from '{origin}' ({source})")]
    KeyLoad {
        /// Kind of the offending entry, as written in the source
        kind: String,
        /// Source name (file path, URL or "memory")
        origin: String,
        /// Underlying decode failure
        #[source]
        source: DecodeError,
    },

    /// A single key object failed to decode
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Remote refresh failed; cached keys are left untouched
    #[error("Refresh of '{url}' failed: {reason}")]
    Refresh {
        /// Key set endpoint
        url: String,
        /// Transport error or unexpected status
        reason: String,
    },

    /// The source is neither a local path nor an http(s) URL
    #[error("Unsupported source type: {0}")]
    UnsupportedSourceScheme(String),

    /// A base URL could not be parsed
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The rejected input
        url: String,
        /// Parser message
        reason: String,
    },

    /// No bundle list is registered for the issuer
    #[error("No keys registered for issuer '{0}'")]
    UnknownIssuer(String),

    /// The local key file format or key kind cannot be loaded
    #[error("Unsupported key file format: {0}")]
    UnsupportedKeyFormat(String),

    /// Key setup asked for usages that cannot share one key
    #[error("Conflicting key setup: {0}")]
    ConflictingKeySetup(String),

    /// Generating or persisting fresh key material failed
    #[error("Key generation error: {0}")]
    KeyGeneration(String),

    /// The HTTP client could not be built
    #[error("HTTP client initialization failed: {0}")]
    HttpClientInit(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KeyJarError {
    /// Create a refresh error for the given endpoint
    pub fn refresh(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Refresh {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a decode failure with the entry kind and source name
    pub fn key_load(kind: impl Into<String>, origin: impl Into<String>, source: DecodeError) -> Self {
        Self::KeyLoad {
            kind: kind.into(),
            origin: origin.into(),
            source,
        }
    }

    /// Whether this error came from decoding a key object
    #[must_use]
    pub fn is_decode_error(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::KeyLoad { .. })
    }
}

/// Result type for key jar operations
pub type Result<T> = std::result::Result<T, KeyJarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_kind_names_kind_and_position() {
        let err = DecodeError::UnsupportedKeyKind {
            kind: "dsa".to_string(),
            position: None,
        }
        .at_position(2);

        assert_eq!(err.to_string(), "Unsupported key kind 'dsa' at entry 2");
    }

    #[test]
    fn key_load_keeps_decode_source() {
        let err = KeyJarError::key_load(
            "dsa",
            "memory",
            DecodeError::UnsupportedKeyKind {
                kind: "dsa".to_string(),
                position: Some(0),
            },
        );

        assert!(err.is_decode_error());
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("Unsupported key kind 'dsa' at entry 0"));
    }
}
