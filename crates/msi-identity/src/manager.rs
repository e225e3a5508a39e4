//! The end-to-end credential pipeline.
//!
//! [`CredentialManager`] ties the components together. A token request is
//! served from the cached credential when it is still valid; otherwise one
//! acquisition runs, in this order:
//!
//! 1. platform metadata discovery,
//! 2. binding key resolution,
//! 3. CSR construction,
//! 4. optional key attestation,
//! 5. credential issuance,
//! 6. caching of the issued certificate with its response,
//!
//! and the token is then exchanged over mTLS with the issued certificate.
//!
//! Concurrent callers that miss the cache share a single acquisition: the
//! first becomes the leader and the others wait on its result.
//!
//! # Example
//!
//! ```ignore
//! use msi_identity::{CredentialManager, ManagedIdentityConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let manager = CredentialManager::from_config(ManagedIdentityConfig::from_env())?;
//! let token = manager
//!     .get_token(&["https://management.azure.com"], &CancellationToken::new())
//!     .await?;
//! ```

use crate::attestation::{self, AttestationProvider, NoAttestation};
use crate::certificate::BindingCertificate;
use crate::config::{ManagedIdentityConfig, TokenType};
use crate::csr::CsrBuilder;
use crate::imds::ImdsClient;
use crate::key::{KeyAlgorithm, KeyMaterialProvider, KeyStore};
use crate::retry::RetryRecorder;
use crate::store::{CachedCredential, CredentialStore, Lookup};
use crate::token::{AccessToken, AccessTokenClient};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type InFlight = watch::Receiver<Option<CachedCredential>>;

/// Acquires and maintains the certificate-bound credential of this host.
pub struct CredentialManager {
    config: ManagedIdentityConfig,
    transport: Arc<dyn HttpTransport>,
    imds: ImdsClient,
    provider: KeyMaterialProvider,
    csr: CsrBuilder,
    attestation: Arc<dyn AttestationProvider>,
    store: CredentialStore,
    tokens: AccessTokenClient,
    ephemeral_algorithm: KeyAlgorithm,
    /// Receiver of the acquisition currently in flight, if any.
    in_flight: parking_lot::Mutex<Option<InFlight>>,
    issuances: AtomicU64,
}

enum Role {
    Lead(watch::Sender<Option<CachedCredential>>),
    Wait(InFlight),
}

/// Clears the in-flight slot however the leader finishes.
struct InFlightGuard<'a> {
    slot: &'a parking_lot::Mutex<Option<InFlight>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

impl CredentialManager {
    /// Creates a manager that talks through `transport`.
    pub fn new(config: ManagedIdentityConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        config.validate()?;

        let imds = ImdsClient::new(
            transport.clone(),
            &config.imds_endpoint,
            config.api_version.clone(),
        )?;
        let ephemeral_algorithm = KeyAlgorithm::Rsa;
        let provider = Self::build_provider(&config, config.key_store(), ephemeral_algorithm);

        Ok(Self {
            csr: CsrBuilder::new(config.csr_encoder),
            tokens: AccessTokenClient::new(transport.clone()),
            attestation: Arc::new(NoAttestation),
            store: CredentialStore::new(),
            in_flight: parking_lot::Mutex::new(None),
            issuances: AtomicU64::new(0),
            config,
            transport,
            imds,
            provider,
            ephemeral_algorithm,
        })
    }

    /// Creates a manager over the reqwest transport.
    pub fn from_config(config: ManagedIdentityConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.request_timeout())?);
        Self::new(config, transport)
    }

    fn build_provider(
        config: &ManagedIdentityConfig,
        store: Arc<dyn KeyStore>,
        ephemeral_algorithm: KeyAlgorithm,
    ) -> KeyMaterialProvider {
        KeyMaterialProvider::new(store)
            .with_key_names(&config.machine_key_name, &config.user_key_name)
            .with_ephemeral_algorithm(ephemeral_algorithm)
    }

    /// Looks persisted keys up in `store` instead of the configured directories.
    pub fn with_key_store(mut self, store: Arc<dyn KeyStore>) -> Self {
        self.provider = Self::build_provider(&self.config, store, self.ephemeral_algorithm);
        self
    }

    /// Algorithm of the key generated when no persisted key exists.
    pub fn with_ephemeral_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.ephemeral_algorithm = algorithm;
        self.provider = self.provider.with_ephemeral_algorithm(algorithm);
        self
    }

    pub fn with_attestation(mut self, provider: Arc<dyn AttestationProvider>) -> Self {
        self.attestation = provider;
        self
    }

    /// Observes retries of every network call the manager makes.
    pub fn with_recorder(mut self, recorder: Arc<RetryRecorder>) -> Self {
        self.imds = self.imds.with_recorder(recorder.clone());
        self.tokens = AccessTokenClient::new(self.transport.clone()).with_recorder(recorder);
        self
    }

    pub fn config(&self) -> &ManagedIdentityConfig {
        &self.config
    }

    pub fn key_provider(&self) -> &KeyMaterialProvider {
        &self.provider
    }

    pub fn credential_store(&self) -> &CredentialStore {
        &self.store
    }

    /// Number of completed credential issuances.
    pub fn issuance_count(&self) -> u64 {
        self.issuances.load(Ordering::Relaxed)
    }

    /// Acquires an access token for `scopes` using the configured token type.
    pub async fn get_token(
        &self,
        scopes: &[&str],
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        self.get_token_of_type(scopes, self.config.token_type, cancel)
            .await
    }

    pub async fn get_token_of_type(
        &self,
        scopes: &[&str],
        token_type: TokenType,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        let credential = self.credential(cancel).await?;
        self.tokens
            .get_token(
                credential.certificate(),
                credential.response(),
                scopes,
                token_type,
                cancel,
            )
            .await
    }

    /// Returns a valid credential, acquiring one if needed.
    pub async fn credential(&self, cancel: &CancellationToken) -> Result<CachedCredential> {
        loop {
            let stale = match self.store.lookup_at(Utc::now()) {
                Lookup::Valid(credential) => {
                    debug!(
                        thumbprint = %credential.certificate().thumbprint(),
                        "credential cache hit"
                    );
                    return Ok(credential);
                }
                Lookup::Stale(_) => true,
                Lookup::Empty => {
                    debug!("credential cache miss");
                    false
                }
            };

            let role = {
                let mut slot = self.in_flight.lock();
                match slot.as_ref() {
                    Some(rx) => Role::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        *slot = Some(rx);
                        Role::Lead(tx)
                    }
                }
            };

            match role {
                Role::Lead(tx) => return self.lead(tx, stale, cancel).await,
                Role::Wait(rx) => {
                    if let Some(credential) = Self::wait_for(rx, cancel).await? {
                        return Ok(credential);
                    }
                    // The leader failed or was cancelled; try again ourselves.
                    debug!("in-flight acquisition ended without a credential, retrying");
                }
            }
        }
    }

    /// Discards the cached credential and acquires a new one.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<CachedCredential> {
        info!("forcing credential refresh");
        self.store.clear();
        self.credential(cancel).await
    }

    /// Compute region reported by the metadata service.
    pub async fn region(&self, cancel: &CancellationToken) -> Result<String> {
        self.imds.get_region(cancel).await
    }

    async fn wait_for(
        mut rx: InFlight,
        cancel: &CancellationToken,
    ) -> Result<Option<CachedCredential>> {
        loop {
            if let Some(credential) = rx.borrow_and_update().clone() {
                return Ok(Some(credential));
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn lead(
        &self,
        tx: watch::Sender<Option<CachedCredential>>,
        stale: bool,
        cancel: &CancellationToken,
    ) -> Result<CachedCredential> {
        let _guard = InFlightGuard {
            slot: &self.in_flight,
        };

        // A previous leader may have finished between our lookup and now.
        if let Lookup::Valid(credential) = self.store.lookup_at(Utc::now()) {
            tx.send_replace(Some(credential.clone()));
            return Ok(credential);
        }

        if stale {
            info!("cached credential is stale, re-issuing with a fresh key lookup");
            self.provider.invalidate();
        }

        match self.acquire(cancel).await {
            Ok(credential) => {
                self.store.save(credential.clone());
                self.issuances.fetch_add(1, Ordering::Relaxed);
                tx.send_replace(Some(credential.clone()));
                Ok(credential)
            }
            Err(e) => {
                warn!(error = %e, "credential acquisition failed");
                Err(e)
            }
        }
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<CachedCredential> {
        let metadata = self.imds.get_metadata(cancel).await?;
        let Some(identity) = metadata.identity.as_ref() else {
            return Err(Error::MtlsPopUnsupported(
                "platform metadata does not offer certificate-bound credentials".to_string(),
            ));
        };

        let binding = self.provider.binding_certificate().await?;
        let key = binding.key().clone();
        debug!(origin = ?key.origin(), algorithm = ?key.algorithm(), "binding key resolved");

        let csr = self
            .csr
            .build(&identity.client_id, &identity.tenant_id, &identity.cuid, &key)?;
        let attestation_token =
            attestation::attest(self.attestation.as_ref(), &metadata, &key, cancel).await?;

        let response = self
            .imds
            .issue_credential(&csr, attestation_token.as_deref(), cancel)
            .await?;
        if response.client_id != identity.client_id {
            warn!(
                expected = %identity.client_id,
                issued = %response.client_id,
                "issued credential names a different client id"
            );
        }

        let certificate = BindingCertificate::from_issued(&response.certificate, key)?;
        info!(
            thumbprint = %certificate.thumbprint(),
            not_after = %certificate.not_after(),
            "issued certificate bound"
        );

        Ok(CachedCredential::new(Arc::new(certificate), Arc::new(response)))
    }
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("imds", &self.imds)
            .field("provider", &self.provider)
            .field("csr", &self.csr)
            .field("token_type", &self.config.token_type)
            .field("issuances", &self.issuance_count())
            .finish()
    }
}
