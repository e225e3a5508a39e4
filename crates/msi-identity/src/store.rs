//! In-memory cache of the issued credential.
//!
//! The store holds the issued binding certificate and the issuance response
//! as one unit; both are replaced together and read together, so a reader
//! can never pair a certificate with another issuance's metadata.
//!
//! An entry is served while it has more than [`SAFETY_BUFFER`] left before
//! `NotAfter` and less than 70% of its lifetime has elapsed. Staleness is
//! evaluated on read; a stale entry stays in memory until overwritten.

use crate::certificate::BindingCertificate;
use crate::imds::ManagedIdentityCredentialResponse;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Minimum remaining lifetime for a cached certificate to be served.
pub const SAFETY_BUFFER: chrono::Duration = chrono::Duration::minutes(60);

/// An issued certificate together with the response that delivered it.
#[derive(Debug, Clone)]
pub struct CachedCredential {
    certificate: Arc<BindingCertificate>,
    response: Arc<ManagedIdentityCredentialResponse>,
}

impl CachedCredential {
    pub fn new(
        certificate: Arc<BindingCertificate>,
        response: Arc<ManagedIdentityCredentialResponse>,
    ) -> Self {
        Self {
            certificate,
            response,
        }
    }

    pub fn certificate(&self) -> &Arc<BindingCertificate> {
        &self.certificate
    }

    pub fn response(&self) -> &Arc<ManagedIdentityCredentialResponse> {
        &self.response
    }

    /// Whether this entry may be served at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.certificate.is_valid_at(now, SAFETY_BUFFER)
            && !self.certificate.is_due_for_rotation(now)
    }
}

/// Lookup result distinguishing an empty store from a stale entry.
#[derive(Debug, Clone)]
pub enum Lookup {
    Valid(CachedCredential),
    Stale(CachedCredential),
    Empty,
}

/// Single-slot credential cache.
#[derive(Debug, Default)]
pub struct CredentialStore {
    slot: RwLock<Option<CachedCredential>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached pair if it is still valid.
    pub fn try_get_valid(&self) -> Option<CachedCredential> {
        self.try_get_valid_at(Utc::now())
    }

    /// [`try_get_valid`](Self::try_get_valid) evaluated at `now`.
    pub fn try_get_valid_at(&self, now: DateTime<Utc>) -> Option<CachedCredential> {
        match self.lookup_at(now) {
            Lookup::Valid(credential) => Some(credential),
            _ => None,
        }
    }

    /// Classifies the current entry at `now`.
    pub fn lookup_at(&self, now: DateTime<Utc>) -> Lookup {
        let Some(credential) = self.slot.read().clone() else {
            return Lookup::Empty;
        };

        if credential.is_valid_at(now) {
            Lookup::Valid(credential)
        } else {
            debug!(
                thumbprint = %credential.certificate.thumbprint(),
                not_after = %credential.certificate.not_after(),
                "cached credential is stale"
            );
            Lookup::Stale(credential)
        }
    }

    /// Replaces the cached pair.
    pub fn save(&self, credential: CachedCredential) {
        debug!(
            thumbprint = %credential.certificate.thumbprint(),
            not_after = %credential.certificate.not_after(),
            "caching issued credential"
        );
        *self.slot.write() = Some(credential);
    }

    /// Drops the cached pair.
    pub fn clear(&self) {
        self.slot.write().take();
    }

    /// Whether anything, valid or stale, is held.
    pub fn has_entry(&self) -> bool {
        self.slot.read().is_some()
    }
}
