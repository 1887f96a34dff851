//! Client private key validation.
//!
//! SMART Backend Services allows two assertion signing algorithms:
//!
//! - **RS384**: RSA with SHA-384
//! - **ES384**: ECDSA on the P-384 curve
//!
//! Keys are accepted as PEM in PKCS#8 (`PRIVATE KEY`), PKCS#1
//! (`RSA PRIVATE KEY`) or SEC1 (`EC PRIVATE KEY`) form. EC keys always sign
//! with ES384. RSA keys sign with RS384 unless another RSA algorithm is
//! requested explicitly.

use std::fmt;
use std::str::FromStr;

use jsonwebtoken::{Algorithm, EncodingKey};
use p384::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, ObjectIdentifier, PrivateKeyInfo, SecretDocument};

use crate::BulkResult;
use crate::error::BulkError;

const OID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// Key family of a validated client key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// RSA key.
    Rsa,
    /// Elliptic curve key on P-384.
    EcP384,
}

/// A validated private key ready to sign client assertions.
#[derive(Clone)]
pub struct ClientKey {
    kind: KeyKind,
    algorithm: Algorithm,
    encoding_key: EncodingKey,
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKey")
            .field("kind", &self.kind)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl ClientKey {
    /// Validates a PEM private key and assigns its signing algorithm.
    ///
    /// `algorithm` is an optional override (e.g. `"RS512"`) honored only for
    /// RSA keys.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::InvalidKey`] for malformed PEM, key types other
    /// than RSA or EC, curves other than P-384, or an algorithm override that
    /// does not match the key.
    pub fn from_pem(pem: &str, algorithm: Option<&str>) -> BulkResult<Self> {
        let hint = algorithm.map(parse_algorithm).transpose()?;
        let (kind, encoding_key) = match pem_label(pem)? {
            "PRIVATE KEY" => load_pkcs8(pem)?,
            "RSA PRIVATE KEY" => {
                RsaPrivateKey::from_pkcs1_pem(pem)
                    .map_err(|e| BulkError::invalid_key(format!("Malformed RSA key: {e}.")))?;
                (KeyKind::Rsa, rsa_encoding_key(pem)?)
            }
            "EC PRIVATE KEY" => load_sec1(pem)?,
            other => {
                return Err(BulkError::invalid_key(format!(
                    "Unsupported PEM block encountered: {other}."
                )));
            }
        };

        let algorithm = match (kind, hint) {
            (KeyKind::EcP384, None | Some(Algorithm::ES384)) => Algorithm::ES384,
            (KeyKind::EcP384, Some(other)) => {
                return Err(BulkError::invalid_key(format!(
                    "Algorithm {other:?} cannot be used with a P-384 key."
                )));
            }
            (KeyKind::Rsa, None) => Algorithm::RS384,
            (KeyKind::Rsa, Some(alg)) if is_rsa_algorithm(alg) => alg,
            (KeyKind::Rsa, Some(other)) => {
                return Err(BulkError::invalid_key(format!(
                    "Algorithm {other:?} cannot be used with an RSA key."
                )));
            }
        };

        Ok(Self {
            kind,
            algorithm,
            encoding_key,
        })
    }

    /// Key family.
    #[must_use]
    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// Assigned signing algorithm.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }
}

/// Returns the JOSE name of an algorithm, e.g. `"RS384"`.
#[must_use]
pub fn algorithm_name(algorithm: Algorithm) -> String {
    format!("{algorithm:?}")
}

fn parse_algorithm(value: &str) -> BulkResult<Algorithm> {
    Algorithm::from_str(value.trim())
        .map_err(|_| BulkError::invalid_key(format!("Unknown signing algorithm: {value}.")))
}

fn is_rsa_algorithm(algorithm: Algorithm) -> bool {
    matches!(
        algorithm,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
    )
}

fn pem_label(pem: &str) -> BulkResult<&str> {
    pem.lines()
        .map(str::trim)
        .find_map(|line| {
            line.strip_prefix("-----BEGIN ")
                .and_then(|rest| rest.strip_suffix("-----"))
        })
        .ok_or_else(|| BulkError::invalid_key("Private key is not PEM encoded."))
}

fn load_pkcs8(pem: &str) -> BulkResult<(KeyKind, EncodingKey)> {
    let (_, document) = SecretDocument::from_pem(pem)
        .map_err(|e| BulkError::invalid_key(format!("Malformed PKCS#8 key: {e}.")))?;
    let info = PrivateKeyInfo::try_from(document.as_bytes())
        .map_err(|e| BulkError::invalid_key(format!("Malformed PKCS#8 key: {e}.")))?;

    let oid = info.algorithm.oid;
    if oid == OID_RSA_ENCRYPTION {
        RsaPrivateKey::from_pkcs8_der(document.as_bytes())
            .map_err(|e| BulkError::invalid_key(format!("Malformed RSA key: {e}.")))?;
        return Ok((KeyKind::Rsa, rsa_encoding_key(pem)?));
    }
    if oid != OID_EC_PUBLIC_KEY {
        return Err(BulkError::invalid_key(format!(
            "Invalid key type (kty) encountered: {}.",
            key_type_name(&oid)
        )));
    }

    let curve = info
        .algorithm
        .parameters_oid()
        .map_err(|_| BulkError::invalid_key("Elliptic Curve key does not name its curve."))?;
    if curve != OID_SECP384R1 {
        return Err(BulkError::invalid_key(format!(
            "Invalid Elliptic Curve encountered: {}.",
            curve_name(&curve)
        )));
    }
    p384::SecretKey::from_pkcs8_der(document.as_bytes())
        .map_err(|e| BulkError::invalid_key(format!("Malformed P-384 key: {e}.")))?;
    let encoding_key = EncodingKey::from_ec_pem(pem.as_bytes())
        .map_err(|e| BulkError::invalid_key(format!("Malformed P-384 key: {e}.")))?;
    Ok((KeyKind::EcP384, encoding_key))
}

fn load_sec1(pem: &str) -> BulkResult<(KeyKind, EncodingKey)> {
    let secret = p384::SecretKey::from_sec1_pem(pem).map_err(|_| {
        BulkError::invalid_key("Invalid Elliptic Curve encountered: SEC1 key is not on P-384.")
    })?;
    // jsonwebtoken only reads EC keys in PKCS#8 form.
    let pkcs8 = secret
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| BulkError::invalid_key(format!("Malformed P-384 key: {e}.")))?;
    let encoding_key = EncodingKey::from_ec_pem(pkcs8.as_bytes())
        .map_err(|e| BulkError::invalid_key(format!("Malformed P-384 key: {e}.")))?;
    Ok((KeyKind::EcP384, encoding_key))
}

fn rsa_encoding_key(pem: &str) -> BulkResult<EncodingKey> {
    EncodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| BulkError::invalid_key(format!("Malformed RSA key: {e}.")))
}

fn curve_name(oid: &ObjectIdentifier) -> String {
    match oid.to_string().as_str() {
        "1.2.840.10045.3.1.7" => "P-256".to_string(),
        "1.3.132.0.35" => "P-521".to_string(),
        "1.3.132.0.10" => "secp256k1".to_string(),
        other => other.to_string(),
    }
}

fn key_type_name(oid: &ObjectIdentifier) -> String {
    match oid.to_string().as_str() {
        "1.3.101.112" | "1.3.101.113" => "OKP".to_string(),
        "1.2.840.10040.4.1" => "DSA".to_string(),
        other => other.to_string(),
    }
}
