//! Managed identity v2 credential engine.
//!
//! This crate obtains and maintains a certificate-bound ("mTLS proof of
//! possession") identity for a workload running under a platform-managed
//! identity, and uses it to acquire OAuth2 access tokens. No user or secret
//! material ever leaves the host: the private key is created or opened
//! locally, a CSR is sent to the local metadata service, and the issued
//! certificate is presented during the TLS handshake with the regional STS.
//!
//! # Components
//!
//! - [`retry`] - Backoff strategies and per-endpoint retry policies
//! - [`transport`] - HTTP transport seam, reqwest implementation and retrying executor
//! - [`key`] - Key material, key stores and the binding certificate provider
//! - [`der`] - Minimal DER writer/reader used by the fallback CSR encoder
//! - [`csr`] - PKCS#10 request construction (native and hand-rolled encoders)
//! - [`certificate`] - X.509 certificate handling and binding certificates
//! - [`imds`] - Platform metadata, credential issuance and region discovery
//! - [`attestation`] - Pluggable key attestation
//! - [`store`] - Certificate-bound credential cache
//! - [`token`] - OAuth2 client-credentials exchange over mTLS
//! - [`manager`] - The end-to-end pipeline
//! - [`config`] - Engine configuration

pub mod attestation;
pub mod certificate;
pub mod config;
pub mod csr;
pub mod der;
pub mod imds;
pub mod key;
pub mod manager;
pub mod retry;
pub mod store;
pub mod token;
pub mod transport;

#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::unwrap_used)]
pub mod testutil;

pub use attestation::{AttestationProvider, NoAttestation};
pub use certificate::{BindingCertificate, Certificate};
pub use config::{ManagedIdentityConfig, TokenType};
pub use csr::{CertificateSigningRequest, CsrBuilder, CsrEncoding};
pub use imds::{ImdsClient, ManagedIdentityCredentialResponse, PlatformIdentity, PlatformMetadata};
pub use key::{
    FileKeyStore, KeyAlgorithm, KeyMaterial, KeyMaterialProvider, KeyOrigin, KeyScope, KeyStore,
    NoKeyStore, PlatformKey,
};
pub use manager::CredentialManager;
pub use retry::{retry_policy_for, RequestType, RetryPolicy, RetryRecorder};
pub use store::{CachedCredential, CredentialStore};
pub use token::{AccessToken, AccessTokenClient};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};

/// Errors that can occur in msi-identity operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport timeout persisted through every retry the policy allowed.
    #[error("request to {endpoint} timed out")]
    RequestTimedOut { endpoint: String },

    /// A retryable HTTP status persisted through every retry the policy allowed.
    #[error("service unavailable: HTTP {status}: {body}")]
    ServiceUnavailable { status: u16, body: String },

    /// A non-retryable HTTP status.
    #[error("service error: HTTP {status}: {code}: {description}")]
    Service {
        status: u16,
        code: String,
        description: String,
    },

    /// A transport failure other than a timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// A response body could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The host does not offer the certificate-bound credential flow.
    #[error("mTLS PoP flow not supported on this host: {0}")]
    MtlsPopUnsupported(String),

    /// Key creation, CSR signing or certificate synthesis failed.
    #[error("certificate creation failed: {message}")]
    CertificateCreationFailed {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// An internal invariant was found broken.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation not supported by this key or implementation.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps a cryptographic failure, preserving the underlying cause.
    pub fn certificate_creation(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::CertificateCreationFailed {
            message: message.into(),
            source: source.into(),
        }
    }
}

/// Result type for msi-identity operations.
pub type Result<T> = std::result::Result<T, Error>;
