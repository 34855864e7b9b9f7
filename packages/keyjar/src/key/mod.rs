//! Key representation independent of wire encoding
//!
//! A [`Key`] pairs the JWK attributes (`kty`, `alg`, `use`, `kid` and the
//! kind-specific members) with a shared handle to usable material. Either
//! side may be authoritative; [`Key::reconcile`] derives the other lazily.

pub mod jwk;
pub mod material;

use crate::error::DecodeError;
use jwk::JwkEntry;
use material::{EcMaterial, HmacSecret, KeyMaterial, RsaMaterial, b64_decode, b64_encode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Closed set of key kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyKind {
    /// RSA key pair or public key
    Rsa,
    /// Elliptic curve key
    Ec,
    /// Symmetric HMAC secret
    Hmac,
}

impl KeyKind {
    /// Lowercase `kty` value written for this kind
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rsa => "rsa",
            Self::Ec => "ec",
            Self::Hmac => "hmac",
        }
    }
}

impl FromStr for KeyKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(Self::Rsa),
            "ec" => Ok(Self::Ec),
            "hmac" | "oct" => Ok(Self::Hmac),
            _ => Err(DecodeError::UnsupportedKeyKind {
                kind: s.to_string(),
                position: None,
            }),
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational role a key is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyUse {
    /// Sign
    Sig,
    /// Verify
    Ver,
    /// Encrypt
    Enc,
    /// Decrypt
    Dec,
}

impl KeyUse {
    /// The `use` tag a JWK records for this role
    ///
    /// A JWK carries one canonical tag per key pair: verification resolves to
    /// `sig` and decryption to `enc`.
    #[must_use]
    pub fn canonical(self) -> Self {
        match self {
            Self::Sig | Self::Ver => Self::Sig,
            Self::Enc | Self::Dec => Self::Enc,
        }
    }

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sig => "sig",
            Self::Ver => "ver",
            Self::Enc => "enc",
            Self::Dec => "dec",
        }
    }
}

impl FromStr for KeyUse {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sig" => Ok(Self::Sig),
            "ver" => Ok(Self::Ver),
            "enc" => Ok(Self::Enc),
            "dec" => Ok(Self::Dec),
            other => Err(DecodeError::UnsupportedKeyUse(other.to_string())),
        }
    }
}

impl fmt::Display for KeyUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct RsaParams {
    n: Option<String>,
    e: Option<String>,
    material: Option<Arc<RsaMaterial>>,
}

#[derive(Debug, Clone)]
struct EcParams {
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
    material: Option<Arc<EcMaterial>>,
}

#[derive(Debug, Clone)]
enum KeyParams {
    Rsa(RsaParams),
    Ec(EcParams),
    Hmac(Arc<HmacSecret>),
}

/// A usage-tagged key with its JWK attributes
#[derive(Debug, Clone)]
pub struct Key {
    alg: Option<String>,
    key_use: Option<KeyUse>,
    kid: Option<String>,
    params: KeyParams,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl Key {
    /// Wrap existing material; serializable members are derived on [`Key::reconcile`]
    #[must_use]
    pub fn from_material(material: KeyMaterial) -> Self {
        let params = match material {
            KeyMaterial::Rsa(material) => KeyParams::Rsa(RsaParams {
                n: None,
                e: None,
                material: Some(material),
            }),
            KeyMaterial::Ec(material) => KeyParams::Ec(EcParams {
                crv: None,
                x: None,
                y: None,
                material: Some(material),
            }),
            KeyMaterial::Hmac(secret) => KeyParams::Hmac(secret),
        };
        Self {
            alg: None,
            key_use: None,
            kid: None,
            params,
        }
    }

    /// Wrap a raw symmetric secret
    #[must_use]
    pub fn hmac(secret: impl Into<Vec<u8>>) -> Self {
        Self::from_material(KeyMaterial::Hmac(Arc::new(HmacSecret::new(secret))))
    }

    /// Set the usage tag
    #[must_use]
    pub fn with_use(mut self, key_use: KeyUse) -> Self {
        self.key_use = Some(key_use);
        self
    }

    /// Set the key ID
    #[must_use]
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// Set the algorithm
    #[must_use]
    pub fn with_alg(mut self, alg: impl Into<String>) -> Self {
        self.alg = Some(alg.into());
        self
    }

    /// Construct the matching variant from a serialized key object
    ///
    /// The result is reconciled, so its material is ready for use.
    ///
    /// # Errors
    /// `DecodeError::UnsupportedKeyKind` when `kty` is not rsa, ec or hmac;
    /// other `DecodeError` variants for missing or invalid members.
    pub fn decode(value: &Value) -> Result<Self, DecodeError> {
        let entry = JwkEntry::deserialize(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let kty = non_empty(entry.kty).ok_or(DecodeError::MissingField {
            kind: "unknown",
            field: "kty",
        })?;
        let kind: KeyKind = kty.parse()?;
        let key_use = non_empty(entry.key_use)
            .map(|u| u.parse::<KeyUse>())
            .transpose()?;

        let params = match kind {
            KeyKind::Rsa => {
                let n = non_empty(entry.n).ok_or(DecodeError::MissingField { kind: "rsa", field: "n" })?;
                let e = non_empty(entry.e).ok_or(DecodeError::MissingField { kind: "rsa", field: "e" })?;
                KeyParams::Rsa(RsaParams {
                    n: Some(n),
                    e: Some(e),
                    material: None,
                })
            }
            KeyKind::Ec => {
                let crv = non_empty(entry.crv).ok_or(DecodeError::MissingField { kind: "ec", field: "crv" })?;
                let x = non_empty(entry.x).ok_or(DecodeError::MissingField { kind: "ec", field: "x" })?;
                let y = non_empty(entry.y).ok_or(DecodeError::MissingField { kind: "ec", field: "y" })?;
                KeyParams::Ec(EcParams {
                    crv: Some(crv),
                    x: Some(x),
                    y: Some(y),
                    material: None,
                })
            }
            KeyKind::Hmac => {
                let secret = match (non_empty(entry.k), non_empty(entry.key)) {
                    (Some(k), _) => b64_decode(&k, "k")?,
                    (None, Some(raw)) => raw.into_bytes(),
                    (None, None) => {
                        return Err(DecodeError::MissingField { kind: "hmac", field: "k" });
                    }
                };
                KeyParams::Hmac(Arc::new(HmacSecret::new(secret)))
            }
        };

        let mut key = Self {
            alg: non_empty(entry.alg),
            key_use,
            kid: non_empty(entry.kid),
            params,
        };
        key.reconcile()?;
        Ok(key)
    }

    /// Bring material and serializable members into agreement
    ///
    /// With material but no members, the members are derived (export path).
    /// With members but no material, the material is derived (use path).
    /// Otherwise nothing happens, so repeated calls are harmless.
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidMaterial` if the members do not describe a
    /// valid key.
    pub fn reconcile(&mut self) -> Result<(), DecodeError> {
        match &mut self.params {
            KeyParams::Rsa(params) => {
                if let Some(material) = &params.material {
                    if params.n.is_none() || params.e.is_none() {
                        let (n, e) = material.components();
                        params.n = Some(n);
                        params.e = Some(e);
                    }
                } else if let (Some(n), Some(e)) = (&params.n, &params.e) {
                    let material = RsaMaterial::from_components(n, e)?;
                    params.material = Some(Arc::new(material));
                }
            }
            KeyParams::Ec(params) => {
                if let Some(material) = &params.material {
                    if params.crv.is_none() || params.x.is_none() || params.y.is_none() {
                        let (x, y) = material.coordinates()?;
                        params.crv = Some(material.curve().name().to_string());
                        params.x = Some(x);
                        params.y = Some(y);
                    }
                } else if let (Some(crv), Some(x), Some(y)) = (&params.crv, &params.x, &params.y) {
                    let material = EcMaterial::from_coordinates(crv, x, y)?;
                    params.material = Some(Arc::new(material));
                }
            }
            KeyParams::Hmac(_) => {}
        }
        Ok(())
    }

    /// Non-empty attributes of this key as a JWK object, secrets included
    #[must_use]
    pub fn to_serializable(&self) -> Map<String, Value> {
        let mut map = self.to_public_serializable();
        if let KeyParams::Hmac(secret) = &self.params {
            map.insert("k".to_string(), Value::String(b64_encode(secret.as_bytes())));
        }
        map
    }

    /// Non-empty attributes suitable for publishing; HMAC secrets are omitted
    #[must_use]
    pub fn to_public_serializable(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let mut put = |name: &str, value: Option<&str>| {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                map.insert(name.to_string(), Value::String(value.to_string()));
            }
        };

        put("kty", Some(self.kind().as_str()));
        put("alg", self.alg.as_deref());
        put("use", self.key_use.map(KeyUse::as_str));
        put("kid", self.kid.as_deref());
        match &self.params {
            KeyParams::Rsa(params) => {
                put("n", params.n.as_deref());
                put("e", params.e.as_deref());
            }
            KeyParams::Ec(params) => {
                put("crv", params.crv.as_deref());
                put("x", params.x.as_deref());
                put("y", params.y.as_deref());
            }
            KeyParams::Hmac(_) => {}
        }
        map
    }

    /// Kind of this key; fixed at construction
    #[must_use]
    pub fn kind(&self) -> KeyKind {
        match self.params {
            KeyParams::Rsa(_) => KeyKind::Rsa,
            KeyParams::Ec(_) => KeyKind::Ec,
            KeyParams::Hmac(_) => KeyKind::Hmac,
        }
    }

    /// Algorithm hint
    #[must_use]
    pub fn alg(&self) -> Option<&str> {
        self.alg.as_deref()
    }

    /// Usage tag; `None` means unrestricted
    #[must_use]
    pub fn key_use(&self) -> Option<KeyUse> {
        self.key_use
    }

    /// Key ID
    #[must_use]
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    /// Usable material, if it has been derived
    #[must_use]
    pub fn material(&self) -> Option<KeyMaterial> {
        match &self.params {
            KeyParams::Rsa(params) => params.material.clone().map(KeyMaterial::Rsa),
            KeyParams::Ec(params) => params.material.clone().map(KeyMaterial::Ec),
            KeyParams::Hmac(secret) => Some(KeyMaterial::Hmac(secret.clone())),
        }
    }

    /// Whether this key may serve the given usage
    ///
    /// Only the requested usage is canonicalised; a key tagged `ver` or `dec`
    /// matches nothing.
    #[must_use]
    pub fn permits(&self, usage: KeyUse) -> bool {
        match self.key_use {
            Some(own) => own == usage.canonical(),
            None => true,
        }
    }

    /// Whether this key holds material equal to `material`
    #[must_use]
    pub fn has_material(&self, material: &KeyMaterial) -> bool {
        self.material().is_some_and(|own| own.ptr_eq(material) || own == *material)
    }

    /// Compare key values, ignoring usage tags and IDs
    ///
    /// RSA keys compare modulus and exponent, EC keys curve and point, HMAC
    /// keys their secret bytes. Keys of different kinds never compare equal.
    #[must_use]
    pub fn equals(&self, other: &Key) -> bool {
        match (&self.params, &other.params) {
            (KeyParams::Rsa(a), KeyParams::Rsa(b)) => match (&a.material, &b.material) {
                (Some(x), Some(y)) => x == y,
                _ => a.n.is_some() && a.n == b.n && a.e == b.e,
            },
            (KeyParams::Ec(a), KeyParams::Ec(b)) => match (&a.material, &b.material) {
                (Some(x), Some(y)) => x == y,
                _ => a.x.is_some() && a.crv == b.crv && a.x == b.x && a.y == b.y,
            },
            (KeyParams::Hmac(a), KeyParams::Hmac(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::elliptic_curve::rand_core::OsRng;
    use serde_json::json;

    fn ec_key() -> Key {
        let secret = p256::SecretKey::random(&mut OsRng);
        let mut key = Key::from_material(KeyMaterial::Ec(Arc::new(EcMaterial::P256Secret(secret))))
            .with_use(KeyUse::Sig)
            .with_kid("ec-1");
        key.reconcile().expect("reconcile");
        key
    }

    #[test]
    fn kind_parsing_is_case_insensitive() {
        assert_eq!("RSA".parse::<KeyKind>().unwrap(), KeyKind::Rsa);
        assert_eq!("Ec".parse::<KeyKind>().unwrap(), KeyKind::Ec);
        assert_eq!("oct".parse::<KeyKind>().unwrap(), KeyKind::Hmac);
        assert!("dsa".parse::<KeyKind>().is_err());
    }

    #[test]
    fn usage_canonicalisation() {
        assert_eq!(KeyUse::Dec.canonical(), KeyUse::Enc);
        assert_eq!(KeyUse::Ver.canonical(), KeyUse::Sig);
        assert_eq!(KeyUse::Sig.canonical(), KeyUse::Sig);
    }

    #[test]
    fn decode_rejects_dsa() {
        let err = Key::decode(&json!({"kty": "dsa", "use": "sig"})).unwrap_err();
        match err {
            DecodeError::UnsupportedKeyKind { kind, .. } => assert_eq!(kind, "dsa"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn decode_requires_kty() {
        let err = Key::decode(&json!({"use": "sig"})).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField { field: "kty", .. }));
    }

    #[test]
    fn ec_round_trip_preserves_attributes() {
        let key = ec_key();
        let decoded = Key::decode(&Value::Object(key.to_serializable())).expect("decode");

        assert_eq!(decoded.kind(), KeyKind::Ec);
        assert_eq!(decoded.key_use(), Some(KeyUse::Sig));
        assert_eq!(decoded.kid(), Some("ec-1"));
        assert_eq!(decoded.to_serializable(), key.to_serializable());
        assert!(decoded.equals(&key));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let mut key = ec_key();
        let once = key.to_serializable();
        key.reconcile().expect("second reconcile");
        assert_eq!(key.to_serializable(), once);
    }

    #[test]
    fn serializable_omits_empty_members() {
        let key = Key::hmac(b"secret".to_vec());
        let map = key.to_serializable();

        assert_eq!(map.get("kty"), Some(&json!("hmac")));
        assert!(!map.contains_key("use"));
        assert!(!map.contains_key("kid"));
        assert!(!key.to_public_serializable().contains_key("k"));
    }

    #[test]
    fn hmac_accepts_raw_key_member() {
        let key = Key::decode(&json!({"kty": "hmac", "key": "shared", "use": "sig"})).expect("decode");
        assert!(key.equals(&Key::hmac(b"shared".to_vec())));
    }

    #[test]
    fn cross_kind_keys_are_never_equal() {
        assert!(!ec_key().equals(&Key::hmac(b"x".to_vec())));
    }

    #[test]
    fn unrestricted_key_permits_every_usage() {
        let key = Key::hmac(b"x".to_vec());
        assert!(key.permits(KeyUse::Sig));
        assert!(key.permits(KeyUse::Dec));

        let enc = Key::hmac(b"x".to_vec()).with_use(KeyUse::Enc);
        assert!(enc.permits(KeyUse::Dec));
        assert!(!enc.permits(KeyUse::Ver));
    }

    #[test]
    fn alias_tagged_keys_match_no_usage() {
        let ver = Key::hmac(b"x".to_vec()).with_use(KeyUse::Ver);
        assert!(!ver.permits(KeyUse::Sig));
        assert!(!ver.permits(KeyUse::Ver));

        let dec = Key::hmac(b"x".to_vec()).with_use(KeyUse::Dec);
        assert!(!dec.permits(KeyUse::Enc));
        assert!(!dec.permits(KeyUse::Dec));
    }
}
