//! Test doubles shared by the unit and integration tests.
//!
//! Compiled for this crate's own tests and, through the `testutil` feature,
//! for the suites under `tests/`.

use crate::attestation::AttestationProvider;
use crate::certificate::{BindingCertificate, Certificate};
use crate::csr::inspect;
use crate::imds::ManagedIdentityCredentialResponse;
use crate::key::{KeyAlgorithm, KeyMaterial, KeyScope, KeyStore, PlatformKey};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Outcome, TransportError};
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

type Responder = Box<dyn Fn(&HttpRequest) -> Outcome + Send + Sync>;

/// Transport replaying queued responses in order and recording requests.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Responder>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_handler(&self, handler: impl Fn(&HttpRequest) -> Outcome + Send + Sync + 'static) {
        self.script.lock().push_back(Box::new(handler));
    }

    pub fn push_status(&self, status: u16) {
        self.push_handler(move |_| Ok(HttpResponse::new(status, Vec::new(), Vec::new())));
    }

    pub fn push_json(&self, status: u16, body: &str) {
        let body = body.as_bytes().to_vec();
        self.push_handler(move |_| {
            Ok(HttpResponse::new(
                status,
                vec![("content-type".to_string(), "application/json".to_string())],
                body.clone(),
            ))
        });
    }

    pub fn push_text(&self, status: u16, body: &str) {
        let body = body.as_bytes().to_vec();
        self.push_handler(move |_| Ok(HttpResponse::new(status, Vec::new(), body.clone())));
    }

    pub fn push_error(&self, error: TransportError) {
        self.push_handler(move |_| Err(error.clone()));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Number of requests whose path ends with `suffix`.
    pub fn count_path(&self, suffix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url().path().ends_with(suffix))
            .count()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Outcome {
        self.requests.lock().push(request.clone());
        let responder = self.script.lock().pop_front();
        match responder {
            Some(responder) => responder(&request),
            None => Err(TransportError::Other(format!(
                "no scripted response for {}",
                request.url()
            ))),
        }
    }
}

/// Shared P-256 key; generating one per test is wasteful.
pub fn ec_key() -> Arc<KeyMaterial> {
    static KEY: OnceLock<Arc<KeyMaterial>> = OnceLock::new();
    KEY.get_or_init(|| Arc::new(KeyMaterial::generate(KeyAlgorithm::EcdsaP256).unwrap()))
        .clone()
}

/// Shared RSA-2048 key.
pub fn rsa_key() -> Arc<KeyMaterial> {
    static KEY: OnceLock<Arc<KeyMaterial>> = OnceLock::new();
    KEY.get_or_init(|| Arc::new(KeyMaterial::generate(KeyAlgorithm::Rsa).unwrap()))
        .clone()
}

/// Key posing as an OS-held key with a given isolation property.
pub struct TestPlatformKey {
    inner: Arc<KeyMaterial>,
    isolation_property: Option<u32>,
}

impl TestPlatformKey {
    /// A fresh P-256 key.
    pub fn new(isolation_property: Option<u32>) -> Self {
        let inner = Arc::new(KeyMaterial::generate(KeyAlgorithm::EcdsaP256).unwrap());
        Self {
            inner,
            isolation_property,
        }
    }

    /// The shared RSA key, reachable only through the platform seam.
    pub fn rsa(isolation_property: Option<u32>) -> Self {
        Self {
            inner: rsa_key(),
            isolation_property,
        }
    }
}

impl PlatformKey for TestPlatformKey {
    fn algorithm(&self) -> KeyAlgorithm {
        self.inner.algorithm()
    }

    fn public_key(&self) -> &[u8] {
        self.inner.public_key()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.inner.sign(message)
    }

    fn isolation_property(&self) -> Option<u32> {
        self.isolation_property
    }
}

enum StoredKey {
    Pkcs8(Vec<u8>),
    Platform(Arc<dyn PlatformKey>),
}

/// In-memory [`KeyStore`] counting every lookup.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: HashMap<(KeyScope, String), StoredKey>,
    failing: HashSet<KeyScope>,
    opens: AtomicUsize,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pkcs8(mut self, scope: KeyScope, name: &str, key: &Arc<KeyMaterial>) -> Self {
        let der = key.export_pkcs8_der().unwrap().to_vec();
        self.keys.insert((scope, name.to_string()), StoredKey::Pkcs8(der));
        self
    }

    pub fn with_platform(
        mut self,
        scope: KeyScope,
        name: &str,
        key: Arc<dyn PlatformKey>,
    ) -> Self {
        self.keys.insert((scope, name.to_string()), StoredKey::Platform(key));
        self
    }

    pub fn with_failure(mut self, scope: KeyScope) -> Self {
        self.failing.insert(scope);
        self
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

impl KeyStore for MemoryKeyStore {
    fn open(&self, scope: KeyScope, name: &str) -> Result<Option<KeyMaterial>> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        if self.failing.contains(&scope) {
            return Err(Error::Io(std::io::Error::other("key store unavailable")));
        }

        match self.keys.get(&(scope, name.to_string())) {
            None => Ok(None),
            Some(StoredKey::Pkcs8(der)) => {
                KeyMaterial::from_pkcs8_der(der, scope.origin()).map(Some)
            }
            Some(StoredKey::Platform(key)) => {
                Ok(Some(KeyMaterial::from_platform(key.clone(), scope.origin())))
            }
        }
    }
}

/// Attestation provider handing out a fixed token and recording endpoints.
pub struct StaticAttestation {
    token: String,
    endpoints: Mutex<Vec<String>>,
}

impl StaticAttestation {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().clone()
    }
}

#[async_trait]
impl AttestationProvider for StaticAttestation {
    async fn get_token(
        &self,
        endpoint: &str,
        _key: &KeyMaterial,
        _cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        self.endpoints.lock().push(endpoint.to_string());
        Ok(Some(self.token.clone()))
    }
}

/// Issuing CA for tests.
pub struct TestIssuer {
    ca_key: rcgen::KeyPair,
    ca_cert: rcgen::Certificate,
}

impl TestIssuer {
    pub fn new() -> Self {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Test Issuing CA".to_string());
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self { ca_key, ca_cert }
    }

    /// Issues a DER certificate over `key` for the given window.
    pub fn issue_der(
        &self,
        key: &Arc<KeyMaterial>,
        subject: &str,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Vec<u8> {
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, subject.to_string());
        params.not_before =
            time::OffsetDateTime::from_unix_timestamp(not_before.timestamp()).unwrap();
        params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.timestamp()).unwrap();
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];

        let public = key.to_rcgen_key_pair().unwrap();
        params
            .signed_by(&public, &self.ca_cert, &self.ca_key)
            .unwrap()
            .der()
            .to_vec()
    }

    /// Same as [`issue_der`](Self::issue_der), base64 encoded as the
    /// issuance endpoint returns it.
    pub fn issue_base64(
        &self,
        key: &Arc<KeyMaterial>,
        subject: &str,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> String {
        base64::engine::general_purpose::STANDARD
            .encode(self.issue_der(key, subject, not_before, not_after))
    }
}

/// A binding certificate over `key` issued by a throwaway CA.
pub fn issued_certificate(
    key: Arc<KeyMaterial>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> BindingCertificate {
    let der = TestIssuer::new().issue_der(&key, "client-1", not_before, not_after);
    BindingCertificate::from_chain(vec![Certificate::from_der(der)], key).unwrap()
}

/// Issuance response matching `issued_certificate` defaults.
pub fn sample_response() -> ManagedIdentityCredentialResponse {
    ManagedIdentityCredentialResponse {
        client_id: "client-1".to_string(),
        tenant_id: "tenant-1".to_string(),
        regional_token_url: "https://westus2.login.example".to_string(),
        certificate: String::new(),
        expiry: None,
    }
}

/// Queues an issuance answer over `key`, issued `age` ago for two years.
///
/// The handler checks that the request carries a CSR for `key`.
pub fn push_issuance(
    transport: &ScriptedTransport,
    issuer: Arc<TestIssuer>,
    key: Arc<KeyMaterial>,
    age: chrono::Duration,
) {
    transport.push_handler(move |request| {
        let body: serde_json::Value =
            serde_json::from_slice(request.body().unwrap_or_default()).unwrap();
        let csr = base64::engine::general_purpose::STANDARD
            .decode(body["csr"].as_str().unwrap())
            .unwrap();
        assert_eq!(inspect(&csr).unwrap().public_key, key.public_key());

        let not_before = Utc::now() - age;
        let certificate = issuer.issue_base64(
            &key,
            "client-1",
            not_before,
            not_before + chrono::Duration::days(730),
        );
        let json = serde_json::json!({
            "clientId": "client-1",
            "tenantId": "tenant-1",
            "regionalTokenUrl": "https://westus2.login.example",
            "certificate": certificate,
        });
        Ok(HttpResponse::new(200, Vec::new(), json.to_string().into_bytes()))
    });
}
