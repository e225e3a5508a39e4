//! X.509 certificate handling for binding certificates.
//!
//! A [`BindingCertificate`] pairs a certificate chain with the [`KeyMaterial`]
//! of its leaf. It is what the transport presents during the mTLS handshake
//! and what the caches inspect to decide on rotation.

use crate::key::KeyMaterial;
use crate::{Error, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Lifetime of a self-signed binding certificate.
pub const SELF_SIGNED_VALIDITY_DAYS: i64 = 730;

/// Fraction of the lifetime after which a certificate is due for rotation.
pub const ROTATION_THRESHOLD: f64 = 0.70;

/// An X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// DER-encoded certificate data.
    der: Vec<u8>,
    /// PEM representation (cached).
    pem: String,
}

impl Certificate {
    /// Creates a certificate from DER-encoded bytes.
    pub fn from_der(der: Vec<u8>) -> Self {
        let pem = pem::encode(&pem::Pem::new("CERTIFICATE", der.clone()));
        Self { der, pem }
    }

    /// Creates a certificate from a single PEM block.
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let parsed = pem::parse(pem_str)
            .map_err(|e| Error::InvalidResponse(format!("failed to parse PEM: {e}")))?;
        Ok(Self::from_der(parsed.into_contents()))
    }

    /// Returns the DER-encoded certificate.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the PEM-encoded certificate.
    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    fn parse(&self) -> Result<x509_parser::certificate::X509Certificate<'_>> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der)
            .map_err(|e| Error::InvalidResponse(format!("failed to parse certificate: {e}")))?;
        Ok(cert)
    }

    /// Returns the certificate's not-before time.
    pub fn not_before(&self) -> Result<DateTime<Utc>> {
        let timestamp = self.parse()?.validity().not_before.timestamp();
        DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| Error::InvalidResponse("invalid not_before timestamp".to_string()))
    }

    /// Returns the certificate's not-after (expiry) time.
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let timestamp = self.parse()?.validity().not_after.timestamp();
        DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| Error::InvalidResponse("invalid not_after timestamp".to_string()))
    }

    /// Returns the certificate's subject as a string.
    pub fn subject(&self) -> Result<String> {
        Ok(self.parse()?.subject().to_string())
    }

    /// Raw subject public key (the BIT STRING contents of the SPKI).
    pub fn public_key(&self) -> Result<Vec<u8>> {
        Ok(self.parse()?.public_key().subject_public_key.data.to_vec())
    }
}

/// A certificate chain plus the key of its leaf.
pub struct BindingCertificate {
    chain: Vec<Certificate>,
    key: Arc<KeyMaterial>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    thumbprint: String,
}

impl BindingCertificate {
    /// Synthesizes a self-signed certificate over `key`, valid for
    /// [`SELF_SIGNED_VALIDITY_DAYS`] from `now`.
    pub fn self_signed(key: Arc<KeyMaterial>, subject: &str, now: DateTime<Utc>) -> Result<Self> {
        let failed = |e: rcgen::Error| {
            Error::certificate_creation("self-signed certificate synthesis failed", e)
        };

        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(failed)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject.to_string());
        params.distinguished_name = dn;

        let not_after = now + chrono::Duration::days(SELF_SIGNED_VALIDITY_DAYS);
        params.not_before = to_offset_date_time(now)?;
        params.not_after = to_offset_date_time(not_after)?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let key_pair = key.to_rcgen_key_pair()?;
        let cert = params.self_signed(&key_pair).map_err(failed)?;

        Self::from_chain(vec![Certificate::from_der(cert.der().to_vec())], key)
            .map_err(|e| Error::certificate_creation("synthesized certificate is unreadable", e))
    }

    /// Wraps an issued certificate, given as base64 DER or PEM (one or more blocks).
    pub fn from_issued(encoded: &str, key: Arc<KeyMaterial>) -> Result<Self> {
        let trimmed = encoded.trim();
        let chain = if trimmed.starts_with("-----BEGIN") {
            parse_cert_chain_pem(trimmed)?
        } else {
            let der = base64::engine::general_purpose::STANDARD
                .decode(trimmed)
                .map_err(|e| Error::InvalidResponse(format!("certificate is not base64: {e}")))?;
            vec![Certificate::from_der(der)]
        };
        Self::from_chain(chain, key)
    }

    /// Wraps a chain (leaf first). The leaf must certify `key`.
    pub fn from_chain(chain: Vec<Certificate>, key: Arc<KeyMaterial>) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::InvalidResponse("empty certificate chain".to_string()))?;

        if leaf.public_key()? != key.public_key() {
            return Err(Error::InvalidResponse(
                "certificate does not certify the binding key".to_string(),
            ));
        }

        let not_before = leaf.not_before()?;
        let not_after = leaf.not_after()?;
        let thumbprint = hex::encode(Sha256::digest(leaf.der()));

        Ok(Self {
            chain,
            key,
            not_before,
            not_after,
            thumbprint,
        })
    }

    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    /// Returns the leaf certificate.
    pub fn leaf(&self) -> &Certificate {
        &self.chain[0]
    }

    pub fn key(&self) -> &Arc<KeyMaterial> {
        &self.key
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Hex SHA-256 of the leaf DER.
    pub fn thumbprint(&self) -> String {
        self.thumbprint.clone()
    }

    /// Fraction of the validity window that has elapsed at `now`, clamped to `0.0..=1.0`.
    pub fn lifetime_fraction_elapsed(&self, now: DateTime<Utc>) -> f64 {
        let lifetime = (self.not_after - self.not_before).num_milliseconds();
        if lifetime <= 0 {
            return 1.0;
        }
        let elapsed = (now - self.not_before).num_milliseconds();
        (elapsed as f64 / lifetime as f64).clamp(0.0, 1.0)
    }

    /// Whether [`ROTATION_THRESHOLD`] of the lifetime has elapsed at `now`.
    pub fn is_due_for_rotation(&self, now: DateTime<Utc>) -> bool {
        self.lifetime_fraction_elapsed(now) >= ROTATION_THRESHOLD
    }

    /// Whether `not_after - buffer` is still ahead of `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>, buffer: chrono::Duration) -> bool {
        self.not_after - buffer > now
    }

    /// Returns the certificate chain as PEM.
    pub fn chain_pem(&self) -> String {
        self.chain.iter().map(Certificate::to_pem).collect()
    }

    /// PEM bundle of the chain followed by the PKCS#8 private key, as the
    /// TLS client identity expects.
    pub fn to_pem_identity(&self) -> Result<Zeroizing<Vec<u8>>> {
        let key_der = self.key.export_pkcs8_der()?;
        let key_pem = Zeroizing::new(pem::encode(&pem::Pem::new(
            "PRIVATE KEY",
            key_der.to_vec(),
        )));

        let mut bundle = Zeroizing::new(self.chain_pem().into_bytes());
        bundle.extend_from_slice(key_pem.as_bytes());
        Ok(bundle)
    }
}

impl std::fmt::Debug for BindingCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingCertificate")
            .field("thumbprint", &self.thumbprint)
            .field("chain_len", &self.chain.len())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("key", &self.key)
            .finish()
    }
}

fn to_offset_date_time(at: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::certificate_creation("timestamp out of range", e))
}

/// Parses a PEM-encoded certificate chain, skipping non-certificate blocks.
fn parse_cert_chain_pem(pem_str: &str) -> Result<Vec<Certificate>> {
    let blocks = pem::parse_many(pem_str)
        .map_err(|e| Error::InvalidResponse(format!("failed to parse PEM chain: {e}")))?;
    Ok(blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| Certificate::from_der(block.into_contents()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyMaterial, KeyOrigin};
    use crate::testutil::{ec_key, TestPlatformKey};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_self_signed_validity_window() {
        let cert = BindingCertificate::self_signed(ec_key(), "msi-binding", now()).unwrap();

        assert_eq!(cert.not_before(), now());
        assert_eq!(cert.not_after(), now() + chrono::Duration::days(730));
        assert!(cert.leaf().subject().unwrap().contains("msi-binding"));
        assert_eq!(cert.thumbprint().len(), 64);
    }

    #[test]
    fn test_rotation_threshold() {
        let cert = BindingCertificate::self_signed(ec_key(), "msi-binding", now()).unwrap();
        let lifetime_ms = (cert.not_after() - cert.not_before()).num_milliseconds();
        let at = |permille: i64| {
            now() + chrono::Duration::milliseconds(lifetime_ms * permille / 1000)
        };

        assert!(!cert.is_due_for_rotation(now()));
        assert!(!cert.is_due_for_rotation(at(699)));
        assert!(cert.is_due_for_rotation(at(700)));
        assert!(cert.is_due_for_rotation(at(710)));
        assert!((cert.lifetime_fraction_elapsed(at(500)) - 0.5).abs() < 1e-9);
        assert_eq!(cert.lifetime_fraction_elapsed(now() - chrono::Duration::days(1)), 0.0);
    }

    #[test]
    fn test_is_valid_at_honours_buffer() {
        let cert = BindingCertificate::self_signed(ec_key(), "msi-binding", now()).unwrap();
        let buffer = chrono::Duration::minutes(60);

        assert!(cert.is_valid_at(now(), buffer));
        assert!(cert.is_valid_at(cert.not_after() - chrono::Duration::minutes(61), buffer));
        assert!(!cert.is_valid_at(cert.not_after() - chrono::Duration::minutes(60), buffer));
        assert!(!cert.is_valid_at(cert.not_after() - chrono::Duration::minutes(59), buffer));
    }

    #[test]
    fn test_from_issued_accepts_base64_and_pem() {
        let key = ec_key();
        let issued = BindingCertificate::self_signed(key.clone(), "issued", now()).unwrap();

        let b64 = base64::engine::general_purpose::STANDARD.encode(issued.leaf().der());
        let from_b64 = BindingCertificate::from_issued(&b64, key.clone()).unwrap();
        assert_eq!(from_b64.thumbprint(), issued.thumbprint());

        let from_pem = BindingCertificate::from_issued(&issued.chain_pem(), key).unwrap();
        assert_eq!(from_pem.thumbprint(), issued.thumbprint());
        assert_eq!(from_pem.not_after(), issued.not_after());
    }

    #[test]
    fn test_from_issued_rejects_foreign_key() {
        let issued = BindingCertificate::self_signed(ec_key(), "issued", now()).unwrap();
        let other = Arc::new(KeyMaterial::generate(crate::KeyAlgorithm::EcdsaP256).unwrap());

        let err = BindingCertificate::from_issued(&issued.chain_pem(), other).unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[test]
    fn test_from_issued_rejects_garbage() {
        assert!(matches!(
            BindingCertificate::from_issued("%%%", ec_key()),
            Err(Error::InvalidResponse(_))
        ));
        assert!(matches!(
            BindingCertificate::from_issued("", ec_key()),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_pem_identity_contains_chain_and_key() {
        let cert = BindingCertificate::self_signed(ec_key(), "msi-binding", now()).unwrap();
        let identity = cert.to_pem_identity().unwrap();
        let text = std::str::from_utf8(&identity).unwrap();

        assert!(text.contains("BEGIN CERTIFICATE"));
        assert!(text.contains("BEGIN PRIVATE KEY"));
        assert!(text.find("CERTIFICATE").unwrap() < text.find("PRIVATE KEY").unwrap());
    }

    #[test]
    fn test_hardware_isolated_identity_not_exportable() {
        let key = Arc::new(KeyMaterial::from_platform(
            Arc::new(TestPlatformKey::new(Some(2))),
            KeyOrigin::HardwareIsolated,
        ));
        let cert = BindingCertificate::self_signed(key, "msi-binding", now()).unwrap();

        assert!(matches!(cert.to_pem_identity(), Err(Error::NotSupported(_))));
    }
}
