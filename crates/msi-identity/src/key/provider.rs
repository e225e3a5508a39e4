//! Binding key resolution and self-signed certificate synthesis.
//!
//! The provider resolves the key in a fixed order:
//!
//! 1. the machine-scoped key (reclassified `HardwareIsolated` when its
//!    isolation property is non-zero),
//! 2. the user-scoped key,
//! 3. a freshly generated ephemeral key.
//!
//! It then wraps the key in a self-signed certificate valid for two years,
//! which is replaced once 70% of that lifetime has elapsed.

use super::material::{KeyAlgorithm, KeyMaterial, KeyOrigin};
use super::store::{KeyScope, KeyStore};
use crate::certificate::BindingCertificate;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default name of the machine-scoped key.
pub const DEFAULT_MACHINE_KEY_NAME: &str = "msi-mtls-machine-key";

/// Default name of the user-scoped key.
pub const DEFAULT_USER_KEY_NAME: &str = "msi-mtls-user-key";

/// Subject common name of synthesized binding certificates.
pub const BINDING_SUBJECT: &str = "devicecert.mtlsauth.local";

/// Resolves the binding key and keeps a self-signed certificate over it.
///
/// Key lookup and synthesis block (file reads, RSA generation), so they run
/// on tokio's blocking pool.
pub struct KeyMaterialProvider {
    lookup: KeyLookup,
    /// Last synthesized certificate.
    current: RwLock<Option<Arc<BindingCertificate>>>,
    /// Serializes key lookup and certificate synthesis.
    synthesis: Mutex<()>,
    syntheses: AtomicU64,
}

impl KeyMaterialProvider {
    /// Creates a provider over `store` with the default key names.
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            lookup: KeyLookup {
                store,
                machine_key_name: DEFAULT_MACHINE_KEY_NAME.to_string(),
                user_key_name: DEFAULT_USER_KEY_NAME.to_string(),
                ephemeral_algorithm: KeyAlgorithm::Rsa,
            },
            current: RwLock::new(None),
            synthesis: Mutex::new(()),
            syntheses: AtomicU64::new(0),
        }
    }

    /// Sets the names looked up in the machine and user scopes.
    pub fn with_key_names(
        mut self,
        machine_key_name: impl Into<String>,
        user_key_name: impl Into<String>,
    ) -> Self {
        self.lookup.machine_key_name = machine_key_name.into();
        self.lookup.user_key_name = user_key_name.into();
        self
    }

    /// Sets the algorithm of generated ephemeral keys (RSA by default).
    pub fn with_ephemeral_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.lookup.ephemeral_algorithm = algorithm;
        self
    }

    /// Returns a live binding certificate, synthesizing one if needed.
    pub async fn binding_certificate(&self) -> Result<Arc<BindingCertificate>> {
        self.binding_certificate_at(Utc::now()).await
    }

    /// [`binding_certificate`](Self::binding_certificate) evaluated at `now`.
    pub async fn binding_certificate_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Arc<BindingCertificate>> {
        // Fast path: no lock needed for a live certificate.
        if let Some(cert) = self.live_certificate(now) {
            return Ok(cert);
        }

        let _guard = self.synthesis.lock().await;

        // Another caller may have synthesized while we waited.
        if let Some(cert) = self.live_certificate(now) {
            return Ok(cert);
        }

        let lookup = self.lookup.clone();
        let cert = tokio::task::spawn_blocking(move || lookup.synthesize(now))
            .await
            .map_err(|e| Error::certificate_creation("binding key synthesis task failed", e))??;
        let cert = Arc::new(cert);
        let origin = cert.key().origin();

        self.syntheses.fetch_add(1, Ordering::Relaxed);
        info!(
            ?origin,
            thumbprint = %cert.thumbprint(),
            not_after = %cert.not_after(),
            "synthesized binding certificate"
        );

        *self.current.write() = Some(cert.clone());
        Ok(cert)
    }

    fn live_certificate(&self, now: DateTime<Utc>) -> Option<Arc<BindingCertificate>> {
        self.current
            .read()
            .as_ref()
            .filter(|cert| !cert.is_due_for_rotation(now))
            .cloned()
    }

    /// Drops the current certificate so the next call looks the key up again.
    pub fn invalidate(&self) {
        if self.current.write().take().is_some() {
            debug!("binding certificate invalidated");
        }
    }

    /// Number of certificates synthesized so far.
    pub fn synthesis_count(&self) -> u64 {
        self.syntheses.load(Ordering::Relaxed)
    }
}

/// What the provider needs to resolve a key, detached so it can move onto
/// the blocking pool.
#[derive(Clone)]
struct KeyLookup {
    store: Arc<dyn KeyStore>,
    machine_key_name: String,
    user_key_name: String,
    ephemeral_algorithm: KeyAlgorithm,
}

impl KeyLookup {
    fn synthesize(&self, now: DateTime<Utc>) -> Result<BindingCertificate> {
        let key = Arc::new(self.resolve_key()?);
        BindingCertificate::self_signed(key, BINDING_SUBJECT, now)
    }

    fn resolve_key(&self) -> Result<KeyMaterial> {
        if let Some(key) = self.open(KeyScope::Machine, &self.machine_key_name) {
            let key = match key.isolation_property() {
                Some(property) if property != 0 => key.with_origin(KeyOrigin::HardwareIsolated),
                _ => key,
            };
            debug!(origin = ?key.origin(), "using machine key");
            return Ok(key);
        }

        if let Some(key) = self.open(KeyScope::User, &self.user_key_name) {
            debug!(origin = ?key.origin(), "using user key");
            return Ok(key);
        }

        debug!(
            algorithm = ?self.ephemeral_algorithm,
            "no persisted key, generating ephemeral key"
        );
        KeyMaterial::generate(self.ephemeral_algorithm)
    }

    fn open(&self, scope: KeyScope, name: &str) -> Option<KeyMaterial> {
        match self.store.open(scope, name) {
            Ok(key) => key,
            Err(e) => {
                warn!(?scope, name, error = %e, "failed to open persisted key, skipping");
                None
            }
        }
    }
}

impl std::fmt::Debug for KeyMaterialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterialProvider")
            .field("machine_key_name", &self.lookup.machine_key_name)
            .field("user_key_name", &self.lookup.user_key_name)
            .field("ephemeral_algorithm", &self.lookup.ephemeral_algorithm)
            .field("syntheses", &self.synthesis_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::NoKeyStore;
    use crate::testutil::{ec_key, MemoryKeyStore, TestPlatformKey};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn ephemeral_provider() -> KeyMaterialProvider {
        KeyMaterialProvider::new(Arc::new(NoKeyStore))
            .with_ephemeral_algorithm(KeyAlgorithm::EcdsaP256)
    }

    #[tokio::test]
    async fn test_ephemeral_fallback() {
        let provider = ephemeral_provider();
        let cert = provider.binding_certificate_at(now()).await.unwrap();

        assert_eq!(cert.key().origin(), KeyOrigin::Ephemeral);
        assert_eq!(cert.not_after(), now() + chrono::Duration::days(730));
        assert_eq!(provider.synthesis_count(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_rsa_synthesis_leaves_runtime_responsive() {
        let provider = KeyMaterialProvider::new(Arc::new(NoKeyStore));
        let ticks = Arc::new(AtomicU64::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        let cert = provider.binding_certificate_at(now()).await.unwrap();
        ticker.abort();

        assert_eq!(cert.key().algorithm(), KeyAlgorithm::Rsa);
        // On a single-threaded runtime the ticker only advances if RSA
        // generation ran off the runtime thread.
        assert!(ticks.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_rsa_platform_key_is_bound() {
        let store = MemoryKeyStore::new().with_platform(
            KeyScope::Machine,
            DEFAULT_MACHINE_KEY_NAME,
            Arc::new(TestPlatformKey::rsa(Some(1))),
        );
        let provider = KeyMaterialProvider::new(Arc::new(store));

        let cert = provider.binding_certificate_at(now()).await.unwrap();
        assert_eq!(cert.key().origin(), KeyOrigin::HardwareIsolated);
        assert_eq!(cert.key().algorithm(), KeyAlgorithm::Rsa);
        assert_eq!(cert.leaf().public_key().unwrap(), cert.key().public_key());
    }

    #[tokio::test]
    async fn test_machine_key_preferred_over_user_key() {
        let store = MemoryKeyStore::new()
            .with_pkcs8(KeyScope::Machine, DEFAULT_MACHINE_KEY_NAME, &ec_key())
            .with_pkcs8(KeyScope::User, DEFAULT_USER_KEY_NAME, &ec_key());
        let provider = KeyMaterialProvider::new(Arc::new(store));

        let cert = provider.binding_certificate_at(now()).await.unwrap();
        assert_eq!(cert.key().origin(), KeyOrigin::Machine);
        assert_eq!(cert.key().public_key(), ec_key().public_key());
    }

    #[tokio::test]
    async fn test_user_key_when_no_machine_key() {
        let store =
            MemoryKeyStore::new().with_pkcs8(KeyScope::User, DEFAULT_USER_KEY_NAME, &ec_key());
        let provider = KeyMaterialProvider::new(Arc::new(store));

        let cert = provider.binding_certificate_at(now()).await.unwrap();
        assert_eq!(cert.key().origin(), KeyOrigin::Software);
    }

    #[tokio::test]
    async fn test_isolated_machine_key_reclassified() {
        let store = MemoryKeyStore::new().with_platform(
            KeyScope::Machine,
            DEFAULT_MACHINE_KEY_NAME,
            Arc::new(TestPlatformKey::new(Some(1))),
        );
        let provider = KeyMaterialProvider::new(Arc::new(store));

        let cert = provider.binding_certificate_at(now()).await.unwrap();
        assert_eq!(cert.key().origin(), KeyOrigin::HardwareIsolated);
    }

    #[tokio::test]
    async fn test_zero_isolation_property_stays_machine() {
        let store = MemoryKeyStore::new().with_platform(
            KeyScope::Machine,
            DEFAULT_MACHINE_KEY_NAME,
            Arc::new(TestPlatformKey::new(Some(0))),
        );
        let provider = KeyMaterialProvider::new(Arc::new(store));

        let cert = provider.binding_certificate_at(now()).await.unwrap();
        assert_eq!(cert.key().origin(), KeyOrigin::Machine);
    }

    #[tokio::test]
    async fn test_failing_store_falls_through() {
        let store = MemoryKeyStore::new()
            .with_failure(KeyScope::Machine)
            .with_pkcs8(KeyScope::User, DEFAULT_USER_KEY_NAME, &ec_key());
        let provider = KeyMaterialProvider::new(Arc::new(store));

        let cert = provider.binding_certificate_at(now()).await.unwrap();
        assert_eq!(cert.key().origin(), KeyOrigin::Software);
    }

    #[tokio::test]
    async fn test_cached_until_rotation_threshold() {
        let provider = ephemeral_provider();
        let first = provider.binding_certificate_at(now()).await.unwrap();

        let before = now() + chrono::Duration::days(510);
        let again = provider.binding_certificate_at(before).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let after = now() + chrono::Duration::days(512);
        let rotated = provider.binding_certificate_at(after).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &rotated));
        assert_eq!(provider.synthesis_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_lookup() {
        let store = Arc::new(MemoryKeyStore::new());
        let provider = KeyMaterialProvider::new(store.clone())
            .with_ephemeral_algorithm(KeyAlgorithm::EcdsaP256);

        provider.binding_certificate_at(now()).await.unwrap();
        provider.invalidate();
        provider.binding_certificate_at(now()).await.unwrap();

        assert_eq!(provider.synthesis_count(), 2);
        // Machine then user, twice.
        assert_eq!(store.open_count(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_synthesis() {
        let provider = Arc::new(ephemeral_provider());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move { provider.binding_certificate_at(now()).await })
            })
            .collect();

        let mut thumbprints = Vec::new();
        for handle in handles {
            thumbprints.push(handle.await.unwrap().unwrap().thumbprint());
        }

        thumbprints.dedup();
        assert_eq!(thumbprints.len(), 1);
        assert_eq!(provider.synthesis_count(), 1);
    }
}
