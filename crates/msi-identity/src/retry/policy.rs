//! Retry policies, one per request class.
//!
//! Every network call in the pipeline runs under a [`RetryPolicy`] chosen by
//! [`retry_policy_for`]. A policy instance is created per logical call: the
//! IMDS policy remembers which schedule it picked on the first failure, so
//! instances must not be shared between calls.

use super::backoff::{ExponentialBackoff, LinearBackoff};
use super::{RequestType, RetryRecorder};
use crate::transport::Outcome;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Linear floor shared by the default (STS and managed identity) policies.
pub const DEFAULT_LINEAR_DELAY: Duration = Duration::from_millis(1000);

/// Maximum retries for the STS policy.
pub const STS_MAX_RETRIES: u32 = 1;

/// Maximum retries for the managed identity default policy.
pub const MANAGED_IDENTITY_MAX_RETRIES: u32 = 3;

/// Maximum retries for IMDS once the exponential schedule is selected.
pub const IMDS_MAX_RETRIES: u32 = 3;

/// Maximum retries for IMDS after a `410 Gone`.
pub const IMDS_GONE_MAX_RETRIES: u32 = 7;

/// Fixed delay between IMDS retries after a `410 Gone`.
pub const IMDS_GONE_DELAY: Duration = Duration::from_millis(10_000);

/// Maximum retries for region discovery.
pub const REGION_DISCOVERY_MAX_RETRIES: u32 = 3;

/// Decides whether, and after how long, a failed attempt is retried.
#[async_trait]
pub trait RetryPolicy: Send {
    /// The request class this policy governs.
    fn request_type(&self) -> RequestType;

    /// Whether the outcome is a retryable condition under this policy.
    fn is_retryable(&self, outcome: &Outcome) -> bool;

    /// Computes the delay before the next attempt, or `None` once retries
    /// are exhausted or the outcome is not retryable.
    fn next_delay(&mut self, outcome: &Outcome, retry_count: u32) -> Option<Duration>;

    /// The recorder observing this policy, if any.
    fn recorder(&self) -> Option<&RetryRecorder>;

    /// Waits out the computed delay and reports whether to retry.
    ///
    /// Returns `Err(Error::Cancelled)` if `cancel` fires while waiting; the
    /// retried call must then not be made.
    async fn pause_for_retry(
        &mut self,
        outcome: &Outcome,
        retry_count: u32,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let Some(delay) = self.next_delay(outcome, retry_count) else {
            return Ok(false);
        };

        if let Some(recorder) = self.recorder() {
            recorder.record(delay);
        }
        debug!(
            request_type = ?self.request_type(),
            retry = retry_count + 1,
            delay_ms = delay.as_millis() as u64,
            "retrying request"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(true),
        }
    }
}

/// Creates a fresh policy for one logical call of the given request class.
pub fn retry_policy_for(
    request_type: RequestType,
    recorder: Option<Arc<RetryRecorder>>,
) -> Box<dyn RetryPolicy> {
    match request_type {
        RequestType::Sts => Box::new(DefaultRetryPolicy::sts(recorder)),
        RequestType::ManagedIdentity => Box::new(DefaultRetryPolicy::managed_identity(recorder)),
        RequestType::Imds => Box::new(ImdsRetryPolicy::new(
            RequestType::Imds,
            is_imds_retryable,
            recorder,
        )),
        RequestType::ImdsProbe => Box::new(ImdsRetryPolicy::new(
            RequestType::ImdsProbe,
            is_imds_probe_retryable,
            recorder,
        )),
        RequestType::CsrMetadataProbe => Box::new(ImdsRetryPolicy::new(
            RequestType::CsrMetadataProbe,
            is_csr_metadata_probe_retryable,
            recorder,
        )),
        RequestType::RegionDiscovery => Box::new(RegionDiscoveryRetryPolicy::new(recorder)),
    }
}

/// Policy for the STS token endpoint and the plain managed identity endpoint.
///
/// Delays follow the linear schedule seeded at [`DEFAULT_LINEAR_DELAY`], so a
/// server supplied `Retry-After` stretches the wait.
pub struct DefaultRetryPolicy {
    request_type: RequestType,
    predicate: fn(&Outcome) -> bool,
    max_retries: u32,
    backoff: LinearBackoff,
    recorder: Option<Arc<RetryRecorder>>,
}

impl DefaultRetryPolicy {
    /// STS flavour: 5xx without `Retry-After`, or a transport failure; one retry.
    pub fn sts(recorder: Option<Arc<RetryRecorder>>) -> Self {
        Self {
            request_type: RequestType::Sts,
            predicate: is_sts_retryable,
            max_retries: STS_MAX_RETRIES,
            backoff: LinearBackoff::new(DEFAULT_LINEAR_DELAY),
            recorder,
        }
    }

    /// Managed identity flavour: 404, 408, 429, 500, 503, 504 or a transport
    /// failure; three retries.
    pub fn managed_identity(recorder: Option<Arc<RetryRecorder>>) -> Self {
        Self {
            request_type: RequestType::ManagedIdentity,
            predicate: is_managed_identity_retryable,
            max_retries: MANAGED_IDENTITY_MAX_RETRIES,
            backoff: LinearBackoff::new(DEFAULT_LINEAR_DELAY),
            recorder,
        }
    }
}

impl std::fmt::Debug for DefaultRetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultRetryPolicy")
            .field("request_type", &self.request_type)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish()
    }
}

#[async_trait]
impl RetryPolicy for DefaultRetryPolicy {
    fn request_type(&self) -> RequestType {
        self.request_type
    }

    fn is_retryable(&self, outcome: &Outcome) -> bool {
        (self.predicate)(outcome)
    }

    fn next_delay(&mut self, outcome: &Outcome, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.max_retries || !self.is_retryable(outcome) {
            return None;
        }
        let retry_after = outcome.as_ref().ok().and_then(|r| r.header("retry-after"));
        Some(self.backoff.delay(retry_after))
    }

    fn recorder(&self) -> Option<&RetryRecorder> {
        self.recorder.as_deref()
    }
}

/// Schedule picked by the IMDS policy on its first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImdsSchedule {
    Gone,
    Exponential,
}

/// Policy for calls to the local metadata service.
///
/// The schedule is fixed by the first failed response of a call: a `410
/// Gone` (the service is restarting) selects a linear 10 second schedule
/// with up to seven retries; anything else selects the exponential schedule
/// with up to three. The probe variants reuse this engine with a narrower
/// predicate.
pub struct ImdsRetryPolicy {
    request_type: RequestType,
    predicate: fn(&Outcome) -> bool,
    schedule: Option<ImdsSchedule>,
    exponential: ExponentialBackoff,
    gone: LinearBackoff,
    recorder: Option<Arc<RetryRecorder>>,
}

impl ImdsRetryPolicy {
    /// Creates an IMDS-engine policy with the given retry predicate.
    pub fn new(
        request_type: RequestType,
        predicate: fn(&Outcome) -> bool,
        recorder: Option<Arc<RetryRecorder>>,
    ) -> Self {
        Self {
            request_type,
            predicate,
            schedule: None,
            exponential: ExponentialBackoff::default(),
            gone: LinearBackoff::new(IMDS_GONE_DELAY),
            recorder,
        }
    }
}

impl std::fmt::Debug for ImdsRetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImdsRetryPolicy")
            .field("request_type", &self.request_type)
            .field("schedule", &self.schedule)
            .finish()
    }
}

#[async_trait]
impl RetryPolicy for ImdsRetryPolicy {
    fn request_type(&self) -> RequestType {
        self.request_type
    }

    fn is_retryable(&self, outcome: &Outcome) -> bool {
        (self.predicate)(outcome)
    }

    fn next_delay(&mut self, outcome: &Outcome, retry_count: u32) -> Option<Duration> {
        if retry_count == 0 || self.schedule.is_none() {
            let gone = matches!(outcome, Ok(r) if r.status() == 410);
            let schedule = if gone {
                ImdsSchedule::Gone
            } else {
                ImdsSchedule::Exponential
            };
            debug!(request_type = ?self.request_type, ?schedule, "selected IMDS retry schedule");
            self.schedule = Some(schedule);
        }

        if !self.is_retryable(outcome) {
            return None;
        }

        match self.schedule {
            Some(ImdsSchedule::Gone) if retry_count < IMDS_GONE_MAX_RETRIES => {
                let retry_after = outcome.as_ref().ok().and_then(|r| r.header("retry-after"));
                Some(self.gone.delay(retry_after))
            }
            Some(ImdsSchedule::Exponential) if retry_count < IMDS_MAX_RETRIES => {
                Some(self.exponential.delay(retry_count))
            }
            _ => None,
        }
    }

    fn recorder(&self) -> Option<&RetryRecorder> {
        self.recorder.as_deref()
    }
}

/// Policy for regional endpoint discovery: three exponential retries.
#[derive(Debug)]
pub struct RegionDiscoveryRetryPolicy {
    backoff: ExponentialBackoff,
    recorder: Option<Arc<RetryRecorder>>,
}

impl RegionDiscoveryRetryPolicy {
    pub fn new(recorder: Option<Arc<RetryRecorder>>) -> Self {
        Self {
            backoff: ExponentialBackoff::default(),
            recorder,
        }
    }
}

#[async_trait]
impl RetryPolicy for RegionDiscoveryRetryPolicy {
    fn request_type(&self) -> RequestType {
        RequestType::RegionDiscovery
    }

    fn is_retryable(&self, outcome: &Outcome) -> bool {
        is_imds_retryable(outcome)
    }

    fn next_delay(&mut self, outcome: &Outcome, retry_count: u32) -> Option<Duration> {
        if retry_count >= REGION_DISCOVERY_MAX_RETRIES || !self.is_retryable(outcome) {
            return None;
        }
        Some(self.backoff.delay(retry_count))
    }

    fn recorder(&self) -> Option<&RetryRecorder> {
        self.recorder.as_deref()
    }
}

fn is_server_error(status: u16) -> bool {
    (500..600).contains(&status)
}

/// STS: a 5xx the server did not attach explicit backoff to, or a transport failure.
pub fn is_sts_retryable(outcome: &Outcome) -> bool {
    match outcome {
        Ok(response) => {
            is_server_error(response.status()) && response.header("retry-after").is_none()
        }
        Err(e) => e.is_retryable(),
    }
}

/// Managed identity default endpoint.
pub fn is_managed_identity_retryable(outcome: &Outcome) -> bool {
    match outcome {
        Ok(response) => matches!(response.status(), 404 | 408 | 429 | 500 | 503 | 504),
        Err(e) => e.is_retryable(),
    }
}

/// Local metadata service calls.
pub fn is_imds_retryable(outcome: &Outcome) -> bool {
    match outcome {
        Ok(response) => {
            matches!(response.status(), 404 | 408 | 410 | 429) || is_server_error(response.status())
        }
        Err(e) => e.is_retryable(),
    }
}

/// Availability probe of the metadata service; a 4xx is an answer.
pub fn is_imds_probe_retryable(outcome: &Outcome) -> bool {
    match outcome {
        Ok(response) => is_server_error(response.status()),
        Err(e) => e.is_retryable(),
    }
}

/// Platform metadata probe. 400, 404 and 410 are answers, not failures.
pub fn is_csr_metadata_probe_retryable(outcome: &Outcome) -> bool {
    match outcome {
        Ok(response) => {
            matches!(response.status(), 408 | 429) || is_server_error(response.status())
        }
        Err(e) => e.is_retryable(),
    }
}
