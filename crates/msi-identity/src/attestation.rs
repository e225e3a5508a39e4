//! Key attestation.
//!
//! Before issuance the platform may ask for proof that the binding key lives
//! in isolated hardware. Obtaining that proof is delegated to an
//! [`AttestationProvider`]; the default [`NoAttestation`] offers none, and
//! issuance then proceeds unattested.

use crate::imds::PlatformMetadata;
use crate::key::KeyMaterial;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Source of attestation tokens for binding keys.
#[async_trait]
pub trait AttestationProvider: Send + Sync {
    /// Returns a token attesting `key` from the service at `endpoint`, or
    /// `None` when this provider cannot attest the key.
    async fn get_token(
        &self,
        endpoint: &str,
        key: &KeyMaterial,
        cancel: &CancellationToken,
    ) -> Result<Option<String>>;
}

/// Provider that never attests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAttestation;

#[async_trait]
impl AttestationProvider for NoAttestation {
    async fn get_token(
        &self,
        _endpoint: &str,
        _key: &KeyMaterial,
        _cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Runs the attestation step for `key`.
///
/// Skipped entirely, without consulting `provider`, when the platform does
/// not advertise an attestation endpoint.
pub async fn attest(
    provider: &dyn AttestationProvider,
    metadata: &PlatformMetadata,
    key: &Arc<KeyMaterial>,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let Some(endpoint) = metadata.attestation_endpoint.as_deref() else {
        debug!("no attestation endpoint, issuing unattested");
        return Ok(None);
    };

    let token = provider.get_token(endpoint, key, cancel).await?;
    debug!(
        endpoint,
        origin = ?key.origin(),
        attested = token.is_some(),
        "attestation step finished"
    );
    Ok(token)
}
