//! Local metadata service client.
//!
//! Three calls are made against the platform's loopback metadata endpoint,
//! each carrying `Metadata: true` and a fresh `x-ms-client-request-id`:
//!
//! - [`ImdsClient::get_metadata`] - discovers whether the host supports the
//!   certificate-bound flow, and the identity values to bind into the CSR
//! - [`ImdsClient::issue_credential`] - exchanges a CSR for an issued certificate
//! - [`ImdsClient::get_region`] - reads the compute location

use crate::csr::CertificateSigningRequest;
use crate::retry::{retry_policy_for, RequestType, RetryRecorder};
use crate::transport::{send_with_retry, HttpRequest, HttpTransport};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// Default base URL of the metadata service.
pub const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254";

/// API version of the managed identity v2 endpoints.
pub const DEFAULT_API_VERSION: &str = "2025-04-01-preview";

const PLATFORM_METADATA_PATH: &str = "/metadata/identity/getPlatformMetadata";
const ISSUE_CREDENTIAL_PATH: &str = "/metadata/identity/issuecredential";
const REGION_PATH: &str = "/metadata/instance/compute/location";
const REGION_API_VERSION: &str = "2021-02-01";

/// Identity values the platform asks to be bound into the CSR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformIdentity {
    pub client_id: String,
    pub tenant_id: String,
    /// Correlation id carried as the CSR challenge value.
    pub cuid: String,
}

/// Capabilities discovered from the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlatformMetadata {
    /// Present when the host supports the certificate-bound flow.
    pub identity: Option<PlatformIdentity>,
    /// Key attestation endpoint, if the platform offers one.
    pub attestation_endpoint: Option<String>,
}

impl PlatformMetadata {
    /// Metadata of a host that does not offer the flow.
    pub fn unsupported() -> Self {
        Self::default()
    }

    pub fn mtls_supported(&self) -> bool {
        self.identity.is_some()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformMetadataBody {
    #[serde(default, alias = "client_id")]
    client_id: Option<String>,
    #[serde(default, alias = "tenant_id")]
    tenant_id: Option<String>,
    #[serde(default, rename = "cuId", alias = "cuid", alias = "cu_id")]
    cuid: Option<serde_json::Value>,
    #[serde(default, alias = "attestation_endpoint")]
    attestation_endpoint: Option<String>,
}

impl PlatformMetadataBody {
    fn into_metadata(self) -> PlatformMetadata {
        let cuid = self.cuid.and_then(|value| match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s),
            // Objects are bound verbatim in compact form.
            other => Some(other.to_string()),
        });

        let identity = match (self.client_id, self.tenant_id, cuid) {
            (Some(client_id), Some(tenant_id), Some(cuid))
                if !client_id.is_empty() && !tenant_id.is_empty() && !cuid.is_empty() =>
            {
                Some(PlatformIdentity {
                    client_id,
                    tenant_id,
                    cuid,
                })
            }
            _ => None,
        };

        PlatformMetadata {
            identity,
            attestation_endpoint: self.attestation_endpoint.filter(|e| !e.is_empty()),
        }
    }
}

/// Credential minted by the issuance endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedIdentityCredentialResponse {
    #[serde(alias = "client_id")]
    pub client_id: String,
    #[serde(alias = "tenant_id")]
    pub tenant_id: String,
    #[serde(alias = "regional_token_url")]
    pub regional_token_url: String,
    /// Issued certificate: base64 DER or PEM.
    pub certificate: String,
    /// Credential expiry, when the server states one.
    #[serde(default, deserialize_with = "deserialize_expiry")]
    pub expiry: Option<DateTime<Utc>>,
}

impl ManagedIdentityCredentialResponse {
    fn validate(self) -> Result<Self> {
        let missing = [
            ("clientId", &self.client_id),
            ("tenantId", &self.tenant_id),
            ("regionalTokenUrl", &self.regional_token_url),
            ("certificate", &self.certificate),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty());

        if let Some((field, _)) = missing {
            return Err(Error::InvalidResponse(format!(
                "credential response has empty {field}"
            )));
        }
        Url::parse(&self.regional_token_url).map_err(|e| {
            Error::InvalidResponse(format!("invalid regionalTokenUrl: {e}"))
        })?;
        Ok(self)
    }
}

impl std::fmt::Debug for ManagedIdentityCredentialResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedIdentityCredentialResponse")
            .field("client_id", &self.client_id)
            .field("tenant_id", &self.tenant_id)
            .field("regional_token_url", &self.regional_token_url)
            .field("certificate_len", &self.certificate.len())
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Accepts epoch seconds (number or numeric string) or an RFC 3339 string.
fn deserialize_expiry<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let from_epoch = |secs: i64| {
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| D::Error::custom(format!("expiry out of range: {secs}")))
    };

    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| D::Error::custom("expiry is not an integer"))
            .and_then(from_epoch)
            .map(Some),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(secs) => from_epoch(secs).map(Some),
            Err(_) => DateTime::parse_from_rfc3339(s.trim())
                .map(|d| Some(d.with_timezone(&Utc)))
                .map_err(|e| D::Error::custom(format!("invalid expiry {s:?}: {e}"))),
        },
        Some(other) => Err(D::Error::custom(format!("unexpected expiry value: {other}"))),
    }
}

#[derive(Serialize)]
struct IssueCredentialBody<'a> {
    csr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attestation_token: Option<&'a str>,
}

/// Client for the local metadata service.
pub struct ImdsClient {
    transport: Arc<dyn HttpTransport>,
    endpoint: Url,
    api_version: String,
    recorder: Option<Arc<RetryRecorder>>,
}

impl ImdsClient {
    /// Creates a client for the service at `endpoint` (scheme and host).
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        endpoint: &str,
        api_version: impl Into<String>,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid metadata endpoint {endpoint:?}: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "metadata endpoint {endpoint} cannot be a base URL"
            )));
        }

        Ok(Self {
            transport,
            endpoint,
            api_version: api_version.into(),
            recorder: None,
        })
    }

    /// Observes retries of every call made by this client.
    pub fn with_recorder(mut self, recorder: Arc<RetryRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str, api_version: &str, extra: &[(&str, &str)]) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(path);
        url.query_pairs_mut()
            .clear()
            .extend_pairs(extra)
            .append_pair("api-version", api_version);
        url
    }

    fn request(&self, request: HttpRequest) -> HttpRequest {
        request
            .with_header("Metadata", "true")
            .with_header("x-ms-client-request-id", uuid::Uuid::new_v4().to_string())
    }

    /// Discovers platform capabilities.
    ///
    /// A 400, 404 or 410 means the host does not offer the flow and yields
    /// [`PlatformMetadata::unsupported`] rather than an error.
    pub async fn get_metadata(&self, cancel: &CancellationToken) -> Result<PlatformMetadata> {
        let url = self.url(PLATFORM_METADATA_PATH, &self.api_version, &[]);
        let request = self.request(HttpRequest::get(url));
        let policy = retry_policy_for(RequestType::CsrMetadataProbe, self.recorder.clone());

        let response = match send_with_retry(self.transport.as_ref(), request, policy, cancel).await
        {
            Ok(response) => response,
            Err(Error::Service { status, .. }) if matches!(status, 400 | 404 | 410) => {
                info!(status, "metadata service does not offer certificate-bound credentials");
                return Ok(PlatformMetadata::unsupported());
            }
            Err(e) => return Err(e),
        };

        let metadata = response.json::<PlatformMetadataBody>()?.into_metadata();
        debug!(
            mtls_supported = metadata.mtls_supported(),
            attestation = metadata.attestation_endpoint.is_some(),
            "platform metadata discovered"
        );
        Ok(metadata)
    }

    /// Exchanges `csr` (and an optional attestation token) for a credential.
    pub async fn issue_credential(
        &self,
        csr: &CertificateSigningRequest,
        attestation_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ManagedIdentityCredentialResponse> {
        let url = self.url(ISSUE_CREDENTIAL_PATH, &self.api_version, &[]);
        let body = IssueCredentialBody {
            csr: csr.to_base64(),
            attestation_token,
        };
        let request = self.request(HttpRequest::post(url)).with_json(&body)?;
        let policy = retry_policy_for(RequestType::Imds, self.recorder.clone());

        let response = send_with_retry(self.transport.as_ref(), request, policy, cancel).await?;
        let credential = response
            .json::<ManagedIdentityCredentialResponse>()?
            .validate()?;

        info!(
            client_id = %credential.client_id,
            regional_token_url = %credential.regional_token_url,
            "credential issued"
        );
        Ok(credential)
    }

    /// Reads the compute location (e.g. `westus2`).
    pub async fn get_region(&self, cancel: &CancellationToken) -> Result<String> {
        let url = self.url(REGION_PATH, REGION_API_VERSION, &[("format", "text")]);
        let request = self.request(HttpRequest::get(url));
        let policy = retry_policy_for(RequestType::RegionDiscovery, self.recorder.clone());

        let response = send_with_retry(self.transport.as_ref(), request, policy, cancel).await?;
        let region = response.text().trim().to_string();
        if region.is_empty() {
            return Err(Error::InvalidResponse("empty region".to_string()));
        }

        debug!(%region, "region discovered");
        Ok(region)
    }
}

impl std::fmt::Debug for ImdsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImdsClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("api_version", &self.api_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::{CsrBuilder, CsrEncoding};
    use crate::testutil::{ec_key, ScriptedTransport};
    use std::time::Duration;

    fn client(transport: Arc<ScriptedTransport>) -> ImdsClient {
        ImdsClient::new(transport, DEFAULT_IMDS_ENDPOINT, DEFAULT_API_VERSION).unwrap()
    }

    const METADATA: &str = r#"{
        "clientId": "client-1",
        "tenantId": "tenant-1",
        "cuId": {"vmId": "vm-1", "vmssId": "vmss-1"},
        "attestationEndpoint": "https://attest.example"
    }"#;

    const CREDENTIAL: &str = r#"{
        "client_id": "client-1",
        "tenant_id": "tenant-1",
        "regional_token_url": "https://westus2.login.example",
        "certificate": "MIIB",
        "expiry": 1893456000
    }"#;

    #[tokio::test]
    async fn test_get_metadata_parses_object_cuid() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(200, METADATA);

        let metadata = client(transport.clone())
            .get_metadata(&CancellationToken::new())
            .await
            .unwrap();

        let identity = metadata.identity.as_ref().unwrap();
        assert_eq!(identity.client_id, "client-1");
        assert_eq!(identity.tenant_id, "tenant-1");
        assert_eq!(identity.cuid, r#"{"vmId":"vm-1","vmssId":"vmss-1"}"#);
        assert_eq!(metadata.attestation_endpoint.as_deref(), Some("https://attest.example"));

        let request = transport.requests().remove(0);
        assert_eq!(
            request.url().as_str(),
            "http://169.254.169.254/metadata/identity/getPlatformMetadata?api-version=2025-04-01-preview"
        );
        assert_eq!(request.header("metadata"), Some("true"));
        assert!(uuid::Uuid::parse_str(request.header("x-ms-client-request-id").unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_get_metadata_string_cuid() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(
            200,
            r#"{"client_id":"c","tenant_id":"t","cuid":"plain-cuid"}"#,
        );

        let metadata = client(transport)
            .get_metadata(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(metadata.identity.unwrap().cuid, "plain-cuid");
        assert!(metadata.attestation_endpoint.is_none());
    }

    #[tokio::test]
    async fn test_get_metadata_not_found_is_unsupported() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_status(404);

        let metadata = client(transport.clone())
            .get_metadata(&CancellationToken::new())
            .await
            .unwrap();
        assert!(!metadata.mtls_supported());
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_get_metadata_incomplete_is_unsupported() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(200, r#"{"clientId":"c"}"#);

        let metadata = client(transport)
            .get_metadata(&CancellationToken::new())
            .await
            .unwrap();
        assert!(!metadata.mtls_supported());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_metadata_retries_server_errors() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_status(503);
        transport.push_status(503);
        transport.push_json(200, METADATA);

        let recorder = Arc::new(RetryRecorder::new());
        let metadata = client(transport)
            .with_recorder(recorder.clone())
            .get_metadata(&CancellationToken::new())
            .await
            .unwrap();

        assert!(metadata.mtls_supported());
        assert_eq!(
            recorder.delays(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }

    #[tokio::test]
    async fn test_issue_credential_sends_csr() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(200, CREDENTIAL);

        let csr = CsrBuilder::new(CsrEncoding::Der)
            .build("client-1", "tenant-1", "cuid", &ec_key())
            .unwrap();
        let credential = client(transport.clone())
            .issue_credential(&csr, Some("attestation-jwt"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(credential.regional_token_url, "https://westus2.login.example");
        assert_eq!(credential.expiry.unwrap().timestamp(), 1_893_456_000);

        let request = transport.requests().remove(0);
        assert!(request.url().path().ends_with("/issuecredential"));
        let body: serde_json::Value = serde_json::from_slice(request.body().unwrap()).unwrap();
        assert_eq!(body["csr"], csr.to_base64());
        assert_eq!(body["attestation_token"], "attestation-jwt");
    }

    #[tokio::test]
    async fn test_issue_credential_omits_missing_attestation() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(200, CREDENTIAL);

        let csr = CsrBuilder::new(CsrEncoding::Der)
            .build("client-1", "tenant-1", "cuid", &ec_key())
            .unwrap();
        client(transport.clone())
            .issue_credential(&csr, None, &CancellationToken::new())
            .await
            .unwrap();

        let request = transport.requests().remove(0);
        let body: serde_json::Value = serde_json::from_slice(request.body().unwrap()).unwrap();
        assert!(body.get("attestation_token").is_none());
    }

    #[tokio::test]
    async fn test_issue_credential_rejects_incomplete_response() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(
            200,
            r#"{"clientId":"c","tenantId":"t","regionalTokenUrl":"","certificate":"MIIB"}"#,
        );

        let csr = CsrBuilder::new(CsrEncoding::Der)
            .build("c", "t", "cuid", &ec_key())
            .unwrap();
        let err = client(transport)
            .issue_credential(&csr, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[test]
    fn test_expiry_formats() {
        let parse = |json: &str| {
            serde_json::from_str::<ManagedIdentityCredentialResponse>(&format!(
                r#"{{"clientId":"c","tenantId":"t","regionalTokenUrl":"https://r","certificate":"x"{json}}}"#
            ))
        };

        assert!(parse("").unwrap().expiry.is_none());
        assert_eq!(parse(r#","expiry":"1700000000""#).unwrap().expiry.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(
            parse(r#","expiry":"2030-01-01T00:00:00Z""#).unwrap().expiry.unwrap().timestamp(),
            1_893_456_000
        );
        assert!(parse(r#","expiry":"soon""#).is_err());
    }

    #[tokio::test]
    async fn test_get_region() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_text(200, "westus2\n");

        let region = client(transport.clone())
            .get_region(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(region, "westus2");

        let request = transport.requests().remove(0);
        assert_eq!(
            request.url().as_str(),
            "http://169.254.169.254/metadata/instance/compute/location?format=text&api-version=2021-02-01"
        );
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let transport = Arc::new(ScriptedTransport::new());
        assert!(matches!(
            ImdsClient::new(transport, "not a url", DEFAULT_API_VERSION),
            Err(Error::Config(_))
        ));
    }
}
