//! Retry policy layer.
//!
//! All network calls in the pipeline go through a [`RetryPolicy`] picked by
//! [`retry_policy_for`] from the [`RequestType`] of the call. Policies compute
//! delays from the [`backoff`] strategies and suspend the calling task for
//! that long, observing cancellation.
//!
//! Retry activity can be observed through an injected [`RetryRecorder`];
//! nothing in the policies depends on its values.

pub mod backoff;
pub mod policy;

pub use backoff::{ExponentialBackoff, LinearBackoff};
pub use policy::{
    retry_policy_for, DefaultRetryPolicy, ImdsRetryPolicy, RegionDiscoveryRetryPolicy,
    RetryPolicy,
};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Class of request, selecting the retry policy that governs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// Regional STS token endpoint.
    Sts,
    /// Plain managed identity token endpoint.
    ManagedIdentity,
    /// Local metadata service (credential issuance).
    Imds,
    /// Availability probe of the local metadata service.
    ImdsProbe,
    /// Platform metadata (CSR metadata) probe.
    CsrMetadataProbe,
    /// Regional endpoint discovery.
    RegionDiscovery,
}

/// Observes retries performed by the policies it is injected into.
#[derive(Debug, Default)]
pub struct RetryRecorder {
    retries: AtomicU32,
    delays: Mutex<Vec<Duration>>,
}

impl RetryRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, delay: Duration) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.delays.lock().push(delay);
    }

    /// Number of retries scheduled so far.
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Delays computed for each scheduled retry, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }

    /// Clears all recorded activity.
    pub fn reset(&self) {
        self.retries.store(0, Ordering::Relaxed);
        self.delays.lock().clear();
    }
}
