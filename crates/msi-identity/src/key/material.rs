//! Asymmetric key material.
//!
//! A [`KeyMaterial`] wraps one of three signers:
//!
//! - an in-process RSA key (`rsa` crate),
//! - an in-process ECDSA P-256 key (`ring`),
//! - a [`PlatformKey`] living behind an OS key store or an isolation boundary.
//!
//! Callers only ever see signing and public-key operations. Private bytes can
//! be exported for the TLS stack, except for keys classified
//! [`KeyOrigin::HardwareIsolated`], which never leave their boundary.

use crate::der;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_ASN1_SIGNING};
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Modulus size of generated RSA keys.
pub const RSA_KEY_BITS: usize = 2048;

const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
const OID_EC_PUBLIC_KEY: &[u64] = &[1, 2, 840, 10045, 2, 1];
const OID_PRIME256V1: &[u64] = &[1, 2, 840, 10045, 3, 1, 7];

/// Public key algorithm of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// RSA, signing with SHA-256 and PKCS#1 v1.5 padding.
    Rsa,
    /// ECDSA over P-256 with SHA-256.
    EcdsaP256,
}

impl KeyAlgorithm {
    /// The matching rcgen signature algorithm.
    pub fn signature_algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::Rsa => &rcgen::PKCS_RSA_SHA256,
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        }
    }
}

/// Where a key came from, which decides what may be done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyOrigin {
    /// Generated in memory for this process.
    Ephemeral,
    /// Opened from the user-scoped key store.
    Software,
    /// Opened from the machine-scoped key store.
    Machine,
    /// Machine key whose private half never leaves an isolation boundary.
    HardwareIsolated,
}

/// A key held outside the process, such as in an OS key store.
pub trait PlatformKey: Send + Sync {
    fn algorithm(&self) -> KeyAlgorithm;

    /// Raw public key: PKCS#1 `RSAPublicKey` DER for RSA, the uncompressed
    /// point for P-256.
    fn public_key(&self) -> &[u8];

    /// Signs `message` (not a digest) with the key's SHA-256 scheme.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// The key's isolation property. Non-zero means hardware isolated.
    fn isolation_property(&self) -> Option<u32> {
        None
    }

    /// PKCS#8 DER of the private key, if the store allows export.
    fn export_pkcs8_der(&self) -> Option<Zeroizing<Vec<u8>>> {
        None
    }
}

enum Signer {
    Rsa(RsaPrivateKey),
    Ecdsa {
        key: EcdsaKeyPair,
        pkcs8: Zeroizing<Vec<u8>>,
    },
    Platform(Arc<dyn PlatformKey>),
}

/// A private/public key pair with its origin classification.
pub struct KeyMaterial {
    signer: Signer,
    algorithm: KeyAlgorithm,
    public_key: Vec<u8>,
    origin: KeyOrigin,
    created_at: DateTime<Utc>,
}

impl KeyMaterial {
    /// Generates an in-memory key, classified [`KeyOrigin::Ephemeral`].
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self> {
        match algorithm {
            KeyAlgorithm::Rsa => {
                let key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
                    .map_err(|e| Error::certificate_creation("RSA key generation failed", e))?;
                Self::from_rsa(key, KeyOrigin::Ephemeral)
            }
            KeyAlgorithm::EcdsaP256 => {
                let rng = SystemRandom::new();
                let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
                    .map_err(|e| {
                        Error::certificate_creation("ECDSA key generation failed", e.to_string())
                    })?;
                Self::from_ecdsa_pkcs8(pkcs8.as_ref(), KeyOrigin::Ephemeral)
            }
        }
    }

    /// Loads a PKCS#8 DER private key (P-256 or RSA).
    pub fn from_pkcs8_der(der: &[u8], origin: KeyOrigin) -> Result<Self> {
        if let Ok(key) = Self::from_ecdsa_pkcs8(der, origin) {
            return Ok(key);
        }

        let key = RsaPrivateKey::from_pkcs8_der(der).map_err(|e| {
            Error::certificate_creation(
                "unsupported PKCS#8 key (expected P-256 or RSA)",
                e.to_string(),
            )
        })?;
        Self::from_rsa(key, origin)
    }

    /// Loads a PEM `PRIVATE KEY` block.
    pub fn from_pkcs8_pem(pem_str: &str, origin: KeyOrigin) -> Result<Self> {
        let parsed = pem::parse(pem_str)
            .map_err(|e| Error::certificate_creation("failed to parse key PEM", e))?;
        if parsed.tag() != "PRIVATE KEY" {
            return Err(Error::certificate_creation(
                "not a PKCS#8 private key",
                format!("unexpected PEM label {}", parsed.tag()),
            ));
        }
        let der = Zeroizing::new(parsed.into_contents());
        Self::from_pkcs8_der(&der, origin)
    }

    /// Wraps a key held by the platform.
    pub fn from_platform(key: Arc<dyn PlatformKey>, origin: KeyOrigin) -> Self {
        Self {
            algorithm: key.algorithm(),
            public_key: key.public_key().to_vec(),
            signer: Signer::Platform(key),
            origin,
            created_at: Utc::now(),
        }
    }

    fn from_rsa(key: RsaPrivateKey, origin: KeyOrigin) -> Result<Self> {
        let public_key = key
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|e| {
                Error::certificate_creation("failed to encode RSA public key", e.to_string())
            })?
            .as_bytes()
            .to_vec();

        Ok(Self {
            signer: Signer::Rsa(key),
            algorithm: KeyAlgorithm::Rsa,
            public_key,
            origin,
            created_at: Utc::now(),
        })
    }

    fn from_ecdsa_pkcs8(pkcs8: &[u8], origin: KeyOrigin) -> Result<Self> {
        let rng = SystemRandom::new();
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &rng)
            .map_err(|e| Error::certificate_creation("invalid P-256 key", e.to_string()))?;
        let public_key = key.public_key().as_ref().to_vec();

        Ok(Self {
            signer: Signer::Ecdsa {
                key,
                pkcs8: Zeroizing::new(pkcs8.to_vec()),
            },
            algorithm: KeyAlgorithm::EcdsaP256,
            public_key,
            origin,
            created_at: Utc::now(),
        })
    }

    /// Returns the key with a different origin classification.
    pub fn with_origin(mut self, origin: KeyOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Raw public key, see [`PlatformKey::public_key`].
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Isolation property reported by a platform key.
    pub fn isolation_property(&self) -> Option<u32> {
        match &self.signer {
            Signer::Platform(key) => key.isolation_property(),
            _ => None,
        }
    }

    /// Modulus and public exponent (big-endian), for RSA keys.
    pub fn rsa_public_components(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        match (&self.signer, self.algorithm) {
            (Signer::Rsa(key), _) => Ok((key.n().to_bytes_be(), key.e().to_bytes_be())),
            (Signer::Platform(_), KeyAlgorithm::Rsa) => parse_rsa_public_key(&self.public_key),
            _ => Err(Error::NotSupported(
                "RSA components requested for a non-RSA key".to_string(),
            )),
        }
    }

    /// DER `SubjectPublicKeyInfo` for this key.
    pub fn subject_public_key_info(&self) -> Result<Vec<u8>> {
        let algorithm = match self.algorithm {
            KeyAlgorithm::Rsa => der::sequence(&[&der::oid(OID_RSA_ENCRYPTION)?, &der::null()]),
            KeyAlgorithm::EcdsaP256 => {
                der::sequence(&[&der::oid(OID_EC_PUBLIC_KEY)?, &der::oid(OID_PRIME256V1)?])
            }
        };
        Ok(der::sequence(&[&algorithm, &der::bit_string(&self.public_key)]))
    }

    /// Signs `message` with SHA-256 under the key's scheme.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match &self.signer {
            Signer::Rsa(key) => {
                let digest = Sha256::digest(message);
                key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
                    .map_err(|e| Error::certificate_creation("RSA signing failed", e))
            }
            Signer::Ecdsa { key, .. } => key
                .sign(&SystemRandom::new(), message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|e| Error::certificate_creation("ECDSA signing failed", e.to_string())),
            Signer::Platform(key) => key.sign(message),
        }
    }

    /// PKCS#8 DER of the private key.
    ///
    /// Hardware-isolated keys always refuse.
    pub fn export_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        if self.origin == KeyOrigin::HardwareIsolated {
            return Err(Error::NotSupported(
                "hardware-isolated keys cannot be exported".to_string(),
            ));
        }

        match &self.signer {
            Signer::Rsa(key) => key
                .to_pkcs8_der()
                .map(|doc| Zeroizing::new(doc.as_bytes().to_vec()))
                .map_err(|e| {
                    Error::certificate_creation("failed to encode RSA key", e.to_string())
                }),
            Signer::Ecdsa { pkcs8, .. } => Ok(pkcs8.clone()),
            Signer::Platform(key) => key.export_pkcs8_der().ok_or_else(|| {
                Error::NotSupported("platform key does not allow export".to_string())
            }),
        }
    }

    /// An rcgen key pair whose signing is delegated to this key.
    pub fn to_rcgen_key_pair(self: &Arc<Self>) -> Result<rcgen::KeyPair> {
        rcgen::KeyPair::from_remote(Box::new(RemoteKey(self.clone())))
            .map_err(|e| Error::certificate_creation("failed to adapt key for rcgen", e))
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("algorithm", &self.algorithm)
            .field("origin", &self.origin)
            .field("created_at", &self.created_at)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

struct RemoteKey(Arc<KeyMaterial>);

impl rcgen::RemoteKeyPair for RemoteKey {
    fn public_key(&self) -> &[u8] {
        self.0.public_key()
    }

    fn sign(&self, msg: &[u8]) -> std::result::Result<Vec<u8>, rcgen::Error> {
        self.0.sign(msg).map_err(|_| rcgen::Error::RemoteKeyError)
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        self.0.algorithm.signature_algorithm()
    }
}

/// Splits a PKCS#1 `RSAPublicKey` into modulus and exponent.
fn parse_rsa_public_key(pkcs1: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let key = RsaPublicKey::from_pkcs1_der(pkcs1)
        .map_err(|e| Error::InvalidResponse(format!("malformed RSAPublicKey: {e}")))?;
    Ok((key.n().to_bytes_be(), key.e().to_bytes_be()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ec_key, rsa_key, TestPlatformKey};

    #[test]
    fn test_generate_ecdsa() {
        let key = KeyMaterial::generate(KeyAlgorithm::EcdsaP256).unwrap();
        assert_eq!(key.origin(), KeyOrigin::Ephemeral);
        assert_eq!(key.algorithm(), KeyAlgorithm::EcdsaP256);
        assert_eq!(key.public_key().len(), 65);
        assert_eq!(key.public_key()[0], 0x04);
    }

    #[test]
    fn test_pkcs8_detects_algorithm() {
        let ec_der = ec_key().export_pkcs8_der().unwrap();
        let ec = KeyMaterial::from_pkcs8_der(&ec_der, KeyOrigin::Software).unwrap();
        assert_eq!(ec.algorithm(), KeyAlgorithm::EcdsaP256);
        assert_eq!(ec.origin(), KeyOrigin::Software);

        let rsa_der = rsa_key().export_pkcs8_der().unwrap();
        let rsa = KeyMaterial::from_pkcs8_der(&rsa_der, KeyOrigin::Machine).unwrap();
        assert_eq!(rsa.algorithm(), KeyAlgorithm::Rsa);
        assert_eq!(rsa.public_key(), rsa_key().public_key());
    }

    #[test]
    fn test_garbage_pkcs8_rejected() {
        let err = KeyMaterial::from_pkcs8_der(&[0x30, 0x03, 0x02, 0x01, 0x00], KeyOrigin::Software)
            .unwrap_err();
        assert!(matches!(err, Error::CertificateCreationFailed { .. }));
    }

    #[test]
    fn test_rsa_components_match_pkcs1() {
        let key = rsa_key();
        let (n, e) = key.rsa_public_components().unwrap();
        assert_eq!(e, vec![0x01, 0x00, 0x01]);
        assert_eq!(n.len(), RSA_KEY_BITS / 8);
        assert_eq!(parse_rsa_public_key(key.public_key()).unwrap(), (n, e));
    }

    #[test]
    fn test_platform_rsa_components_from_pkcs1() {
        let platform = KeyMaterial::from_platform(
            Arc::new(TestPlatformKey::rsa(None)),
            KeyOrigin::Machine,
        );
        assert_eq!(platform.algorithm(), KeyAlgorithm::Rsa);
        assert_eq!(
            platform.rsa_public_components().unwrap(),
            rsa_key().rsa_public_components().unwrap()
        );
        assert!(matches!(
            parse_rsa_public_key(&[0x30, 0x03, 0x02, 0x01, 0x01]),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_rsa_components_unavailable_for_ec() {
        assert!(matches!(
            ec_key().rsa_public_components(),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_rsa_signature_verifies() {
        let key = rsa_key();
        let message = b"certification request info";
        let signature = key.sign(message).unwrap();

        let (n, e) = key.rsa_public_components().unwrap();
        let public = RsaPublicKey::new(
            rsa::BigUint::from_bytes_be(&n),
            rsa::BigUint::from_bytes_be(&e),
        )
        .unwrap();
        let digest = Sha256::digest(message);
        public
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .unwrap();
    }

    #[test]
    fn test_ecdsa_signature_verifies() {
        let key = ec_key();
        let message = b"to be signed";
        let signature = key.sign(message).unwrap();

        let public = ring::signature::UnparsedPublicKey::new(
            &ring::signature::ECDSA_P256_SHA256_ASN1,
            key.public_key(),
        );
        public.verify(message, &signature).unwrap();
    }

    #[test]
    fn test_hardware_isolated_never_exports() {
        let platform = Arc::new(TestPlatformKey::new(Some(1)));
        let key = KeyMaterial::from_platform(platform, KeyOrigin::HardwareIsolated);
        assert!(matches!(key.export_pkcs8_der(), Err(Error::NotSupported(_))));
        assert_eq!(key.isolation_property(), Some(1));

        // Signing still works.
        assert!(!key.sign(b"message").unwrap().is_empty());
    }

    #[test]
    fn test_spki_parses() {
        use x509_parser::prelude::FromDer;

        for key in [ec_key(), rsa_key()] {
            let spki = key.subject_public_key_info().unwrap();
            let (_, parsed) =
                x509_parser::x509::SubjectPublicKeyInfo::from_der(&spki).unwrap();
            assert_eq!(parsed.subject_public_key.data.as_ref(), key.public_key());
        }
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let debug = format!("{:?}", ec_key());
        assert!(debug.contains("REDACTED"));
        assert!(debug.contains("EcdsaP256"));
    }
}
