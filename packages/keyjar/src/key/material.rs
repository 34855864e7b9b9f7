//! Cryptographic material handles
//!
//! Material is owned by `Arc` so several usage views of one loaded key share
//! it without cloning. All arithmetic is delegated to the `rsa`, `p256` and
//! `p384` crates; this module only converts between their types and the
//! base64url members of a JWK.

use super::KeyKind;
use crate::error::DecodeError;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

const PEM_PREFIX: &[u8] = b"-----BEGIN";

/// Decode a base64url (unpadded) member
pub(crate) fn b64_decode(value: &str, field: &str) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| DecodeError::InvalidMaterial(format!("'{field}' is not base64url: {e}")))
}

/// Encode bytes as base64url without padding
pub(crate) fn b64_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// RSA key pair or public key
#[derive(Clone)]
pub enum RsaMaterial {
    /// Private key (the public half is derivable)
    Private(RsaPrivateKey),
    /// Public key only
    Public(RsaPublicKey),
}

impl RsaMaterial {
    /// Build a public key from base64url modulus and exponent
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidMaterial` if either member is not base64url
    /// or the pair is rejected by the RSA implementation.
    pub fn from_components(n: &str, e: &str) -> Result<Self, DecodeError> {
        let n = BigUint::from_bytes_be(&b64_decode(n, "n")?);
        let e = BigUint::from_bytes_be(&b64_decode(e, "e")?);
        RsaPublicKey::new(n, e)
            .map(Self::Public)
            .map_err(|e| DecodeError::InvalidMaterial(format!("Invalid RSA public key: {e}")))
    }

    /// Modulus and exponent as base64url strings
    #[must_use]
    pub fn components(&self) -> (String, String) {
        (
            b64_encode(&self.modulus().to_bytes_be()),
            b64_encode(&self.exponent().to_bytes_be()),
        )
    }

    /// Modulus `n`
    #[must_use]
    pub fn modulus(&self) -> &BigUint {
        match self {
            Self::Private(key) => key.n(),
            Self::Public(key) => key.n(),
        }
    }

    /// Public exponent `e`
    #[must_use]
    pub fn exponent(&self) -> &BigUint {
        match self {
            Self::Private(key) => key.e(),
            Self::Public(key) => key.e(),
        }
    }

    /// Public half of the key
    #[must_use]
    pub fn public_key(&self) -> RsaPublicKey {
        match self {
            Self::Private(key) => key.to_public_key(),
            Self::Public(key) => key.clone(),
        }
    }

    /// Private key, if this material carries one
    #[must_use]
    pub fn private_key(&self) -> Option<&RsaPrivateKey> {
        match self {
            Self::Private(key) => Some(key),
            Self::Public(_) => None,
        }
    }

    /// Parse a PEM document (PKCS#8, PKCS#1 or SPKI)
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidMaterial` if no supported encoding matches.
    pub fn from_pem(pem: &str) -> Result<Self, DecodeError> {
        use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
        use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};

        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
            return Ok(Self::Private(key));
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
            return Ok(Self::Private(key));
        }
        if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
            return Ok(Self::Public(key));
        }
        RsaPublicKey::from_pkcs1_pem(pem)
            .map(Self::Public)
            .map_err(|e| DecodeError::InvalidMaterial(format!("Unrecognised RSA PEM: {e}")))
    }

    /// Parse a DER document (PKCS#8, PKCS#1 or SPKI)
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidMaterial` if no supported encoding matches.
    pub fn from_der(der: &[u8]) -> Result<Self, DecodeError> {
        use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
        use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};

        if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der) {
            return Ok(Self::Private(key));
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_der(der) {
            return Ok(Self::Private(key));
        }
        if let Ok(key) = RsaPublicKey::from_public_key_der(der) {
            return Ok(Self::Public(key));
        }
        RsaPublicKey::from_pkcs1_der(der)
            .map(Self::Public)
            .map_err(|e| DecodeError::InvalidMaterial(format!("Unrecognised RSA DER: {e}")))
    }
}

impl PartialEq for RsaMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.modulus() == other.modulus() && self.exponent() == other.exponent()
    }
}

impl fmt::Debug for RsaMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaMaterial")
            .field("private", &self.private_key().is_some())
            .field("bits", &self.modulus().bits())
            .finish()
    }
}

/// Named elliptic curves supported for EC keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    /// NIST P-256
    P256,
    /// NIST P-384
    P384,
}

impl EcCurve {
    /// JWK `crv` name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::P256 => "P-256",
            Self::P384 => "P-384",
        }
    }

    /// Length of one affine coordinate in bytes
    #[must_use]
    pub fn coordinate_len(self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
        }
    }

    /// Parse a JWK `crv` name
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidMaterial` for curves other than P-256 and P-384.
    pub fn from_name(name: &str) -> Result<Self, DecodeError> {
        match name {
            "P-256" => Ok(Self::P256),
            "P-384" => Ok(Self::P384),
            other => Err(DecodeError::InvalidMaterial(format!(
                "Unsupported curve '{other}'"
            ))),
        }
    }
}

/// EC private or public key on a supported curve
#[derive(Clone)]
pub enum EcMaterial {
    /// P-256 private key
    P256Secret(p256::SecretKey),
    /// P-256 public key
    P256Public(p256::PublicKey),
    /// P-384 private key
    P384Secret(p384::SecretKey),
    /// P-384 public key
    P384Public(p384::PublicKey),
}

impl EcMaterial {
    /// Curve of this key
    #[must_use]
    pub fn curve(&self) -> EcCurve {
        match self {
            Self::P256Secret(_) | Self::P256Public(_) => EcCurve::P256,
            Self::P384Secret(_) | Self::P384Public(_) => EcCurve::P384,
        }
    }

    /// Whether this material carries the private scalar
    #[must_use]
    pub fn is_private(&self) -> bool {
        matches!(self, Self::P256Secret(_) | Self::P384Secret(_))
    }

    /// Build a public key from a curve name and base64url affine coordinates
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidMaterial` for unknown curves, wrong
    /// coordinate lengths or points not on the curve.
    pub fn from_coordinates(crv: &str, x: &str, y: &str) -> Result<Self, DecodeError> {
        let curve = EcCurve::from_name(crv)?;
        let x = b64_decode(x, "x")?;
        let y = b64_decode(y, "y")?;
        let expected = curve.coordinate_len();
        if x.len() != expected || y.len() != expected {
            return Err(DecodeError::InvalidMaterial(format!(
                "{} coordinates must be {expected} bytes",
                curve.name()
            )));
        }

        let off_curve = || DecodeError::InvalidMaterial(format!("Point is not on {}", curve.name()));
        match curve {
            EcCurve::P256 => {
                let point = p256::EncodedPoint::from_affine_coordinates(
                    p256::FieldBytes::from_slice(&x),
                    p256::FieldBytes::from_slice(&y),
                    false,
                );
                Option::<p256::PublicKey>::from(p256::PublicKey::from_encoded_point(&point))
                    .map(Self::P256Public)
                    .ok_or_else(off_curve)
            }
            EcCurve::P384 => {
                let point = p384::EncodedPoint::from_affine_coordinates(
                    p384::FieldBytes::from_slice(&x),
                    p384::FieldBytes::from_slice(&y),
                    false,
                );
                Option::<p384::PublicKey>::from(p384::PublicKey::from_encoded_point(&point))
                    .map(Self::P384Public)
                    .ok_or_else(off_curve)
            }
        }
    }

    /// Affine coordinates of the public point as base64url strings
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidMaterial` if the point is the identity.
    pub fn coordinates(&self) -> Result<(String, String), DecodeError> {
        let coordinates = match self {
            Self::P256Secret(secret) => p256_coordinates(&secret.public_key()),
            Self::P256Public(public) => p256_coordinates(public),
            Self::P384Secret(secret) => p384_coordinates(&secret.public_key()),
            Self::P384Public(public) => p384_coordinates(public),
        };
        coordinates
            .ok_or_else(|| DecodeError::InvalidMaterial("EC point has no affine coordinates".into()))
    }

    /// Parse a PEM document (PKCS#8, SEC1 or SPKI) on P-256 or P-384
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidMaterial` if no supported encoding matches.
    pub fn from_pem(pem: &str) -> Result<Self, DecodeError> {
        use p256::pkcs8::{DecodePrivateKey, DecodePublicKey};

        if let Ok(key) = p256::SecretKey::from_pkcs8_pem(pem) {
            return Ok(Self::P256Secret(key));
        }
        if let Ok(key) = p256::SecretKey::from_sec1_pem(pem) {
            return Ok(Self::P256Secret(key));
        }
        if let Ok(key) = p256::PublicKey::from_public_key_pem(pem) {
            return Ok(Self::P256Public(key));
        }
        if let Ok(key) = p384::SecretKey::from_pkcs8_pem(pem) {
            return Ok(Self::P384Secret(key));
        }
        if let Ok(key) = p384::SecretKey::from_sec1_pem(pem) {
            return Ok(Self::P384Secret(key));
        }
        p384::PublicKey::from_public_key_pem(pem)
            .map(Self::P384Public)
            .map_err(|e| DecodeError::InvalidMaterial(format!("Unrecognised EC PEM: {e}")))
    }

    /// Parse a DER document (PKCS#8, SEC1 or SPKI) on P-256 or P-384
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidMaterial` if no supported encoding matches.
    pub fn from_der(der: &[u8]) -> Result<Self, DecodeError> {
        use p256::pkcs8::{DecodePrivateKey, DecodePublicKey};

        if let Ok(key) = p256::SecretKey::from_pkcs8_der(der) {
            return Ok(Self::P256Secret(key));
        }
        if let Ok(key) = p256::SecretKey::from_sec1_der(der) {
            return Ok(Self::P256Secret(key));
        }
        if let Ok(key) = p256::PublicKey::from_public_key_der(der) {
            return Ok(Self::P256Public(key));
        }
        if let Ok(key) = p384::SecretKey::from_pkcs8_der(der) {
            return Ok(Self::P384Secret(key));
        }
        if let Ok(key) = p384::SecretKey::from_sec1_der(der) {
            return Ok(Self::P384Secret(key));
        }
        p384::PublicKey::from_public_key_der(der)
            .map(Self::P384Public)
            .map_err(|e| DecodeError::InvalidMaterial(format!("Unrecognised EC DER: {e}")))
    }
}

impl PartialEq for EcMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.curve() == other.curve() && self.coordinates().ok() == other.coordinates().ok()
    }
}

fn p256_coordinates(public: &p256::PublicKey) -> Option<(String, String)> {
    let point = public.to_encoded_point(false);
    Some((b64_encode(point.x()?), b64_encode(point.y()?)))
}

fn p384_coordinates(public: &p384::PublicKey) -> Option<(String, String)> {
    let point = public.to_encoded_point(false);
    Some((b64_encode(point.x()?), b64_encode(point.y()?)))
}

impl fmt::Debug for EcMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcMaterial")
            .field("curve", &self.curve().name())
            .field("private", &self.is_private())
            .finish()
    }
}

/// Shared HMAC secret, zeroized on drop
#[derive(Clone)]
pub struct HmacSecret(Zeroizing<Vec<u8>>);

impl HmacSecret {
    /// Wrap raw secret bytes
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    /// Raw secret bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Secret length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the secret is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for HmacSecret {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && bool::from(self.as_bytes().ct_eq(other.as_bytes()))
    }
}

impl fmt::Debug for HmacSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HmacSecret([REDACTED; {}])", self.0.len())
    }
}

/// Handle to usable key material, shared between usage views
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    /// RSA key
    Rsa(Arc<RsaMaterial>),
    /// Elliptic curve key
    Ec(Arc<EcMaterial>),
    /// Symmetric secret
    Hmac(Arc<HmacSecret>),
}

impl KeyMaterial {
    /// Kind of key this material belongs to
    #[must_use]
    pub fn kind(&self) -> KeyKind {
        match self {
            Self::Rsa(_) => KeyKind::Rsa,
            Self::Ec(_) => KeyKind::Ec,
            Self::Hmac(_) => KeyKind::Hmac,
        }
    }

    /// Whether two handles point at the same allocation
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Rsa(a), Self::Rsa(b)) => Arc::ptr_eq(a, b),
            (Self::Ec(a), Self::Ec(b)) => Arc::ptr_eq(a, b),
            (Self::Hmac(a), Self::Hmac(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Load one key object of the given kind from encoded file content
    ///
    /// PEM is detected by its armour; anything else is treated as DER. For
    /// HMAC the content itself is the secret.
    ///
    /// # Errors
    /// Returns `DecodeError::InvalidMaterial` if the content cannot be parsed.
    pub fn from_encoded(kind: KeyKind, content: &[u8]) -> Result<Self, DecodeError> {
        let is_pem = content.starts_with(PEM_PREFIX);
        match kind {
            KeyKind::Hmac if content.is_empty() => {
                Err(DecodeError::InvalidMaterial("HMAC secret is empty".into()))
            }
            KeyKind::Hmac => Ok(Self::Hmac(Arc::new(HmacSecret::new(content)))),
            KeyKind::Rsa if is_pem => {
                RsaMaterial::from_pem(pem_text(content)?).map(|m| Self::Rsa(Arc::new(m)))
            }
            KeyKind::Rsa => RsaMaterial::from_der(content).map(|m| Self::Rsa(Arc::new(m))),
            KeyKind::Ec if is_pem => {
                EcMaterial::from_pem(pem_text(content)?).map(|m| Self::Ec(Arc::new(m)))
            }
            KeyKind::Ec => EcMaterial::from_der(content).map(|m| Self::Ec(Arc::new(m))),
        }
    }
}

fn pem_text(content: &[u8]) -> Result<&str, DecodeError> {
    std::str::from_utf8(content)
        .map_err(|_| DecodeError::InvalidMaterial("Invalid UTF-8 in PEM key".into()))
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Rsa(a), Self::Rsa(b)) => a == b,
            (Self::Ec(a), Self::Ec(b)) => a == b,
            (Self::Hmac(a), Self::Hmac(b)) => a == b,
            _ => false,
        }
    }
}
