//! Local key setup and key set publishing
//!
//! These helpers generate (or reload) this entity's long-term RSA key, wrap
//! it in a bundle for the self issuer, and write the public key set where a
//! web server can serve it.

use crate::bundle::{KeyBundle, public_entries};
use crate::error::{KeyJarError, Result};
use crate::jar::{KeyJar, SELF_ISSUER};
use crate::key::jwk::KeySetDocument;
use crate::key::material::{KeyMaterial, RsaMaterial};
use crate::key::{Key, KeyKind, KeyUse};
use reqwest::Url;
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::rand_core::OsRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Default RSA modulus size for generated keys
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Default file name of the stored private key inside a vault
pub const DEFAULT_KEY_NAME: &str = "keyjar";

/// Key to provide for one usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpec {
    /// Key kind; only RSA can be generated
    pub kind: KeyKind,
    /// Modulus size in bits
    pub bits: usize,
}

impl KeySpec {
    /// RSA key of the default size
    #[must_use]
    pub fn rsa() -> Self {
        Self {
            kind: KeyKind::Rsa,
            bits: DEFAULT_RSA_BITS,
        }
    }

    /// Override the modulus size
    #[must_use]
    pub fn with_bits(mut self, bits: usize) -> Self {
        self.bits = bits;
        self
    }
}

/// Which usages the local key is published for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySetup {
    /// Signing key
    pub sig: Option<KeySpec>,
    /// Encryption key
    pub enc: Option<KeySpec>,
    /// File name of the private key inside the vault
    pub key_name: String,
}

impl Default for KeySetup {
    fn default() -> Self {
        Self {
            sig: Some(KeySpec::rsa()),
            enc: None,
            key_name: DEFAULT_KEY_NAME.to_string(),
        }
    }
}

/// Write the public keys of `bundles` as one key set document
///
/// Missing parent directories are created.
///
/// # Errors
/// Returns an error if encoding or writing fails.
pub async fn dump_jwks(bundles: &[Arc<KeyBundle>], target: &Path) -> Result<()> {
    let mut keys = Vec::new();
    for bundle in bundles {
        keys.extend(public_entries(&bundle.keys().await));
    }
    let text = serde_json::to_string(&KeySetDocument { keys })?;

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(target, text).await?;
    debug!(target = %target.display(), "Wrote key set");
    Ok(())
}

/// Generate an RSA key pair and store it in `dir`
///
/// Writes `<name>` (PKCS#8 PEM) and `<name>.pub` (SPKI PEM).
///
/// # Errors
/// Returns `KeyJarError::KeyGeneration` if generation or encoding fails, or
/// an I/O error if the files cannot be written.
pub async fn create_and_store_rsa_key_pair(name: &str, dir: &Path, bits: usize) -> Result<RsaPrivateKey> {
    let key = tokio::task::spawn_blocking(move || RsaPrivateKey::new(&mut OsRng, bits))
        .await
        .map_err(|e| KeyJarError::KeyGeneration(format!("Key generation task failed: {e}")))?
        .map_err(|e| KeyJarError::KeyGeneration(e.to_string()))?;

    let private_pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| KeyJarError::KeyGeneration(format!("PKCS#8 encoding failed: {e}")))?;
    let public_pem = key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| KeyJarError::KeyGeneration(format!("SPKI encoding failed: {e}")))?;

    fs::create_dir_all(dir).await?;
    fs::write(dir.join(name), private_pem.as_bytes()).await?;
    fs::write(dir.join(format!("{name}.pub")), public_pem.as_bytes()).await?;
    info!(dir = %dir.display(), name, bits, "Stored new RSA key pair");
    Ok(key)
}

async fn load_or_create(vault: &Path, setup: &KeySetup, spec: KeySpec) -> Result<KeyMaterial> {
    if spec.kind != KeyKind::Rsa {
        return Err(KeyJarError::UnsupportedKeyFormat(format!(
            "cannot generate {} keys",
            spec.kind
        )));
    }

    let path = vault.join(&setup.key_name);
    let material = if fs::try_exists(&path).await? {
        let pem = fs::read_to_string(&path).await?;
        let material = RsaMaterial::from_pem(&pem)
            .map_err(|e| KeyJarError::key_load(KeyKind::Rsa.as_str(), path.display().to_string(), e))?;
        debug!(path = %path.display(), "Loaded stored RSA key");
        material
    } else {
        RsaMaterial::Private(create_and_store_rsa_key_pair(&setup.key_name, vault, spec.bits).await?)
    };
    Ok(KeyMaterial::Rsa(Arc::new(material)))
}

/// Load or generate the local key and publish it per requested usage
///
/// Every usage shares the same key, tagged with incrementing key IDs
/// starting at `1`. A signing key requested without an encryption key is
/// also published for encryption.
///
/// # Errors
/// Returns `KeyJarError::ConflictingKeySetup` if `sig` and `enc` ask for
/// different keys, or an error if the vault cannot be read or written or the
/// stored key cannot be parsed.
pub async fn key_setup(vault: &Path, setup: &KeySetup) -> Result<KeyBundle> {
    if let (Some(sig), Some(enc)) = (setup.sig, setup.enc) {
        if sig != enc {
            return Err(KeyJarError::ConflictingKeySetup(format!(
                "sig ({} {} bits) and enc ({} {} bits) share one key",
                sig.kind, sig.bits, enc.kind, enc.bits
            )));
        }
    }
    fs::create_dir_all(vault).await?;

    let mut keys = Vec::new();
    let mut material: Option<KeyMaterial> = None;
    let mut kid = 1u32;

    for (usage, spec) in [(KeyUse::Sig, setup.sig), (KeyUse::Enc, setup.enc)] {
        let Some(spec) = spec else { continue };
        let shared = match &material {
            Some(material) => material.clone(),
            None => {
                let loaded = load_or_create(vault, setup, spec).await?;
                material = Some(loaded.clone());
                loaded
            }
        };

        keys.push(Key::from_material(shared.clone()).with_use(usage).with_kid(kid.to_string()));
        kid += 1;
        if usage == KeyUse::Sig && setup.enc.is_none() {
            keys.push(Key::from_material(shared).with_use(KeyUse::Enc).with_kid(kid.to_string()));
            kid += 1;
        }
    }

    KeyBundle::from_keys(keys)
}

/// Set up the local key, register it for the self issuer and export it
///
/// The document is written to `<export_root>/<base path>/<local_path>/jwks`
/// and the URL it will be served at is returned.
///
/// # Errors
/// Returns `KeyJarError::InvalidUrl` for an unparsable `base_url`, or the
/// setup or write error.
pub async fn key_export(
    base_url: &str,
    export_root: &Path,
    local_path: &str,
    vault: &Path,
    jar: &KeyJar,
    setup: &KeySetup,
) -> Result<String> {
    let mut url = Url::parse(base_url).map_err(|e| KeyJarError::InvalidUrl {
        url: base_url.to_string(),
        reason: e.to_string(),
    })?;

    let segments: Vec<&str> = [url.path(), local_path]
        .iter()
        .map(|part| part.trim_matches('/'))
        .filter(|part| !part.is_empty())
        .collect();
    let relative = segments.join("/");

    let bundle = jar.add_bundle(SELF_ISSUER, key_setup(vault, setup).await?);

    let mut target = PathBuf::from(export_root);
    if !relative.is_empty() {
        target.push(&relative);
    }
    target.push("jwks");
    dump_jwks(&[bundle], &target).await?;

    let public_path = if relative.is_empty() {
        "/jwks".to_string()
    } else {
        format!("/{relative}/jwks")
    };
    url.set_path(&public_path);
    url.set_query(None);
    url.set_fragment(None);
    info!(url = %url, target = %target.display(), "Exported key set");
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dump_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/jwks.json");
        let bundle = Arc::new(KeyBundle::new());
        bundle.append(Key::hmac(b"s".to_vec()).with_use(KeyUse::Sig)).unwrap();

        dump_jwks(&[bundle], &target).await.unwrap();

        let text = std::fs::read_to_string(&target).unwrap();
        let document: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(document["keys"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn non_rsa_setup_is_rejected() {
        let vault = tempfile::tempdir().unwrap();
        let setup = KeySetup {
            sig: Some(KeySpec {
                kind: KeyKind::Ec,
                bits: 256,
            }),
            ..KeySetup::default()
        };
        let err = key_setup(vault.path(), &setup).await.unwrap_err();
        assert!(matches!(err, KeyJarError::UnsupportedKeyFormat(_)));
    }
}
