//! Certificate Signing Request (CSR) construction.
//!
//! The request binds the managed identity to the binding key:
//!
//! - subject `CN=<client id>, DC=<tenant id>`,
//! - the key's `SubjectPublicKeyInfo`,
//! - a `challengePassword` attribute (`1.2.840.113549.1.9.7`) carrying the
//!   platform's correlation id (CUID),
//!
//! signed with the same key (SHA-256, PKCS#1 v1.5 for RSA).
//!
//! Two encoders are available. [`NativeCsrEncoder`] uses rcgen;
//! [`DerCsrEncoder`] assembles the DER by hand with [`crate::der`].
//! [`CsrEncoding::Auto`] prefers the native encoder and falls back to the
//! hand-rolled one if it fails.
//!
//! # Example
//!
//! ```no_run
//! use msi_identity::{CsrBuilder, CsrEncoding, KeyAlgorithm, KeyMaterial};
//! use std::sync::Arc;
//!
//! let key = Arc::new(KeyMaterial::generate(KeyAlgorithm::Rsa).unwrap());
//! let csr = CsrBuilder::new(CsrEncoding::Auto)
//!     .build("client-id", "tenant-id", "cuid", &key)
//!     .unwrap();
//! assert_eq!(csr.der()[0], 0x30);
//! ```

use crate::der;
use crate::key::{KeyAlgorithm, KeyMaterial};
use crate::{Error, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use x509_parser::der_parser::der::parse_der;
use x509_parser::prelude::FromDer;

/// `challengePassword` (PKCS#9).
pub const OID_CHALLENGE_PASSWORD: &[u64] = &[1, 2, 840, 113549, 1, 9, 7];

/// `domainComponent` (RFC 4519).
pub const OID_DOMAIN_COMPONENT: &[u64] = &[0, 9, 2342, 19200300, 100, 1, 25];

const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];
const OID_SHA256_WITH_RSA: &[u64] = &[1, 2, 840, 113549, 1, 1, 11];
const OID_ECDSA_WITH_SHA256: &[u64] = &[1, 2, 840, 10045, 4, 3, 2];

const DOMAIN_COMPONENT_ID: &str = "0.9.2342.19200300.100.1.25";
const CHALLENGE_PASSWORD_ID: &str = "1.2.840.113549.1.9.7";

/// Which encoder builds the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CsrEncoding {
    /// Native encoder, falling back to the hand-rolled one on failure.
    #[default]
    Auto,
    /// rcgen only.
    Native,
    /// Hand-rolled DER only.
    Der,
}

/// A DER-encoded PKCS#10 request.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateSigningRequest {
    der: Vec<u8>,
}

impl CertificateSigningRequest {
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Standard base64 of the DER, as the issuance endpoint expects.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.der)
    }

    /// PEM `CERTIFICATE REQUEST` block.
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", self.der.clone()))
    }
}

impl std::fmt::Debug for CertificateSigningRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateSigningRequest")
            .field("len", &self.der.len())
            .finish()
    }
}

/// Identity values bound into a request.
#[derive(Debug, Clone, Copy)]
pub struct CsrSubject<'a> {
    pub client_id: &'a str,
    pub tenant_id: &'a str,
    pub cuid: &'a str,
}

/// Encodes a signed request for a subject and key.
pub trait CsrEncoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, subject: &CsrSubject<'_>, key: &Arc<KeyMaterial>) -> Result<Vec<u8>>;
}

/// Encoder backed by rcgen.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCsrEncoder;

impl CsrEncoder for NativeCsrEncoder {
    fn name(&self) -> &'static str {
        "native"
    }

    fn encode(&self, subject: &CsrSubject<'_>, key: &Arc<KeyMaterial>) -> Result<Vec<u8>> {
        let failed = |e: rcgen::Error| Error::certificate_creation("CSR serialization failed", e);

        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).map_err(failed)?;
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, subject.client_id.to_string());
        let tenant = rcgen::Ia5String::try_from(subject.tenant_id.to_string())
            .map_err(|e| Error::certificate_creation("tenant id is not IA5", e.to_string()))?;
        dn.push(
            rcgen::DnType::CustomDnType(OID_DOMAIN_COMPONENT.to_vec()),
            rcgen::DnValue::Ia5String(tenant),
        );
        params.distinguished_name = dn;

        let challenge = rcgen::Attribute {
            oid: OID_CHALLENGE_PASSWORD,
            values: der::set(&[&der::directory_string(subject.cuid)]),
        };

        let key_pair = key.to_rcgen_key_pair()?;
        let csr = params
            .serialize_request_with_attributes(&key_pair, vec![challenge])
            .map_err(failed)?;
        Ok(csr.der().to_vec())
    }
}

/// Hand-rolled DER encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct DerCsrEncoder;

impl DerCsrEncoder {
    fn subject_name(subject: &CsrSubject<'_>) -> Result<Vec<u8>> {
        let cn = der::sequence(&[
            &der::oid(OID_COMMON_NAME)?,
            &der::directory_string(subject.client_id),
        ]);
        let dc_value = der::ia5_string(subject.tenant_id)
            .unwrap_or_else(|_| der::utf8_string(subject.tenant_id));
        let dc = der::sequence(&[&der::oid(OID_DOMAIN_COMPONENT)?, &dc_value]);
        Ok(der::sequence(&[&der::set(&[&cn]), &der::set(&[&dc])]))
    }

    fn public_key_info(key: &KeyMaterial) -> Result<Vec<u8>> {
        match key.algorithm() {
            KeyAlgorithm::Rsa => {
                let (modulus, exponent) = key.rsa_public_components()?;
                let rsa_public_key = der::sequence(&[
                    &der::unsigned_integer(&modulus),
                    &der::unsigned_integer(&exponent),
                ]);
                let algorithm = der::sequence(&[
                    &der::oid(&[1, 2, 840, 113549, 1, 1, 1])?,
                    &der::null(),
                ]);
                Ok(der::sequence(&[&algorithm, &der::bit_string(&rsa_public_key)]))
            }
            KeyAlgorithm::EcdsaP256 => key.subject_public_key_info(),
        }
    }

    fn signature_algorithm(algorithm: KeyAlgorithm) -> Result<Vec<u8>> {
        Ok(match algorithm {
            KeyAlgorithm::Rsa => {
                der::sequence(&[&der::oid(OID_SHA256_WITH_RSA)?, &der::null()])
            }
            KeyAlgorithm::EcdsaP256 => der::sequence(&[&der::oid(OID_ECDSA_WITH_SHA256)?]),
        })
    }
}

impl CsrEncoder for DerCsrEncoder {
    fn name(&self) -> &'static str {
        "der"
    }

    fn encode(&self, subject: &CsrSubject<'_>, key: &Arc<KeyMaterial>) -> Result<Vec<u8>> {
        let challenge = der::sequence(&[
            &der::oid(OID_CHALLENGE_PASSWORD)?,
            &der::set(&[&der::directory_string(subject.cuid)]),
        ]);
        let attributes = der::context_constructed(0, &challenge);

        let info = der::sequence(&[
            &der::small_integer(0),
            &Self::subject_name(subject)?,
            &Self::public_key_info(key)?,
            &attributes,
        ]);

        let signature = key.sign(&info)?;
        Ok(der::sequence(&[
            &info,
            &Self::signature_algorithm(key.algorithm())?,
            &der::bit_string(&signature),
        ]))
    }
}

/// Builds requests with the configured encoder.
pub struct CsrBuilder {
    encoding: CsrEncoding,
    native: NativeCsrEncoder,
    fallback: DerCsrEncoder,
}

impl CsrBuilder {
    pub fn new(encoding: CsrEncoding) -> Self {
        Self {
            encoding,
            native: NativeCsrEncoder,
            fallback: DerCsrEncoder,
        }
    }

    pub fn encoding(&self) -> CsrEncoding {
        self.encoding
    }

    /// Builds and signs a request for `client_id`/`tenant_id` carrying `cuid`.
    pub fn build(
        &self,
        client_id: &str,
        tenant_id: &str,
        cuid: &str,
        key: &Arc<KeyMaterial>,
    ) -> Result<CertificateSigningRequest> {
        let subject = CsrSubject {
            client_id,
            tenant_id,
            cuid,
        };

        let (der, encoder) = match self.encoding {
            CsrEncoding::Native => (self.native.encode(&subject, key)?, self.native.name()),
            CsrEncoding::Der => (self.fallback.encode(&subject, key)?, self.fallback.name()),
            CsrEncoding::Auto => match self.native.encode(&subject, key) {
                Ok(der) => (der, self.native.name()),
                Err(e) => {
                    warn!(error = %e, "native CSR encoder failed, using DER fallback");
                    (self.fallback.encode(&subject, key)?, self.fallback.name())
                }
            },
        };

        if cfg!(debug_assertions) {
            self_check(&der, &subject, key)?;
        }

        debug!(encoder, len = der.len(), "built CSR");
        Ok(CertificateSigningRequest { der })
    }
}

impl Default for CsrBuilder {
    fn default() -> Self {
        Self::new(CsrEncoding::Auto)
    }
}

impl std::fmt::Debug for CsrBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrBuilder")
            .field("encoding", &self.encoding)
            .finish()
    }
}

/// Decoded contents of a request whose signature verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrSummary {
    pub common_name: Option<String>,
    pub domain_component: Option<String>,
    pub challenge_password: Option<String>,
    pub public_key: Vec<u8>,
}

/// Parses `der` as PKCS#10 and verifies its self-signature.
pub fn inspect(der_bytes: &[u8]) -> Result<CsrSummary> {
    let (_, csr) = x509_parser::certification_request::X509CertificationRequest::from_der(
        der_bytes,
    )
    .map_err(|e| Error::InvalidResponse(format!("not a PKCS#10 request: {e}")))?;

    csr.verify_signature()
        .map_err(|e| Error::InvalidResponse(format!("CSR signature does not verify: {e}")))?;

    let info = &csr.certification_request_info;
    let common_name = info
        .subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);
    let domain_component = info
        .subject
        .iter_attributes()
        .find(|attr| attr.attr_type().to_id_string() == DOMAIN_COMPONENT_ID)
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);

    let mut challenge_password = None;
    for attr in info.attributes() {
        if attr.oid.to_id_string() == CHALLENGE_PASSWORD_ID {
            challenge_password = Some(read_directory_string(attr.value)?);
        }
    }

    Ok(CsrSummary {
        common_name,
        domain_component,
        challenge_password,
        public_key: info.subject_pki.subject_public_key.data.to_vec(),
    })
}

/// Reads a string value, descending through a wrapping SET if present.
fn read_directory_string(raw: &[u8]) -> Result<String> {
    let (_, value) = parse_der(raw)
        .map_err(|e| Error::InvalidResponse(format!("malformed attribute value: {e}")))?;
    let value = match value.as_set() {
        Ok(values) => values
            .first()
            .ok_or_else(|| Error::InvalidResponse("empty attribute value set".to_string()))?,
        Err(_) => &value,
    };

    value
        .as_str()
        .map(str::to_string)
        .map_err(|e| Error::InvalidResponse(format!("unexpected attribute value: {e}")))
}

fn self_check(der_bytes: &[u8], subject: &CsrSubject<'_>, key: &KeyMaterial) -> Result<()> {
    let summary = inspect(der_bytes)
        .map_err(|e| Error::certificate_creation("CSR failed self-check", e))?;

    let matches = summary.common_name.as_deref() == Some(subject.client_id)
        && summary.domain_component.as_deref() == Some(subject.tenant_id)
        && summary.challenge_password.as_deref() == Some(subject.cuid)
        && summary.public_key == key.public_key();
    if !matches {
        return Err(Error::InvariantViolation(
            "CSR contents do not match the requested subject and key".to_string(),
        ));
    }
    Ok(())
}
