//! OAuth2 client-credentials exchange against the regional STS.
//!
//! The request is authenticated solely by the TLS client certificate: the
//! issued binding certificate is attached to the request and presented by
//! the transport during the handshake. Tokens are not cached here.

use crate::certificate::BindingCertificate;
use crate::config::TokenType;
use crate::imds::ManagedIdentityCredentialResponse;
use crate::retry::{retry_policy_for, RequestType, RetryRecorder};
use crate::transport::{send_with_retry, HttpRequest, HttpResponse, HttpTransport};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

const DEFAULT_SCOPE_SUFFIX: &str = "/.default";

/// An access token returned by the STS.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    token: String,
    token_type: String,
    expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(
        token: impl Into<String>,
        token_type: impl Into<String>,
        expires_on: DateTime<Utc>,
    ) -> Self {
        Self {
            token: token.into(),
            token_type: token_type.into(),
            expires_on,
        }
    }

    /// The raw token. Never log this.
    pub fn secret(&self) -> &str {
        &self.token
    }

    /// Token type as reported by the server (`Bearer`, `mtls_pop`).
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn expires_on(&self) -> DateTime<Utc> {
        self.expires_on
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_on <= now
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[redacted]")
            .field("token_type", &self.token_type)
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(deserialize_with = "deserialize_seconds")]
    expires_in: i64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Accepts a JSON number or a numeric string.
fn deserialize_seconds<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(i64),
        Text(String),
    }

    match Seconds::deserialize(deserializer)? {
        Seconds::Number(n) => Ok(n),
        Seconds::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid expires_in: {s:?}"))),
    }
}

fn parse_token_response(response: &HttpResponse, now: DateTime<Utc>) -> Result<AccessToken> {
    let body: TokenResponse = response.json()?;
    if body.access_token.is_empty() {
        return Err(Error::InvalidResponse("empty access_token".to_string()));
    }
    if body.expires_in < 0 {
        return Err(Error::InvalidResponse(format!(
            "negative expires_in: {}",
            body.expires_in
        )));
    }

    Ok(AccessToken {
        token: body.access_token,
        token_type: body.token_type,
        expires_on: now + chrono::Duration::seconds(body.expires_in),
    })
}

/// Appends `/.default` to a resource; a scope already ending in it is kept.
pub fn normalize_scope(scope: &str) -> String {
    let scope = scope.trim();
    if scope.ends_with(DEFAULT_SCOPE_SUFFIX) {
        scope.to_string()
    } else {
        format!("{}{DEFAULT_SCOPE_SUFFIX}", scope.trim_end_matches('/'))
    }
}

/// `{regional_token_url}/{tenant_id}/oauth2/v2.0/token`
pub fn token_endpoint(regional_token_url: &str, tenant_id: &str) -> Result<Url> {
    let base = regional_token_url.trim_end_matches('/');
    let endpoint = format!("{base}/{tenant_id}/oauth2/v2.0/token");
    Url::parse(&endpoint)
        .map_err(|e| Error::InvalidResponse(format!("invalid token endpoint {endpoint:?}: {e}")))
}

/// Client for the regional STS token endpoint.
pub struct AccessTokenClient {
    transport: Arc<dyn HttpTransport>,
    recorder: Option<Arc<RetryRecorder>>,
}

impl AccessTokenClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            recorder: None,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<RetryRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Exchanges the issued credential for an access token covering `scopes`.
    pub async fn get_token(
        &self,
        certificate: &Arc<BindingCertificate>,
        credential: &ManagedIdentityCredentialResponse,
        scopes: &[&str],
        token_type: TokenType,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        if scopes.is_empty() {
            return Err(Error::Config("at least one scope is required".to_string()));
        }

        let url = token_endpoint(&credential.regional_token_url, &credential.tenant_id)?;
        let scope = scopes
            .iter()
            .map(|s| normalize_scope(s))
            .collect::<Vec<_>>()
            .join(" ");

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("scope", scope.as_str()),
            ("client_id", credential.client_id.as_str()),
        ];
        if let Some(value) = token_type.form_value() {
            form.push(("token_type", value));
        }

        let request = HttpRequest::post(url)
            .with_header("x-ms-client-request-id", uuid::Uuid::new_v4().to_string())
            .with_form(&form)
            .with_client_certificate(certificate.clone());

        debug!(
            %scope,
            ?token_type,
            thumbprint = %certificate.thumbprint(),
            "requesting access token"
        );
        let policy = retry_policy_for(RequestType::Sts, self.recorder.clone());
        let response = send_with_retry(self.transport.as_ref(), request, policy, cancel).await?;
        let token = parse_token_response(&response, Utc::now())?;

        info!(
            token_type = token.token_type(),
            expires_on = %token.expires_on(),
            "access token acquired"
        );
        Ok(token)
    }
}

impl std::fmt::Debug for AccessTokenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenClient").finish_non_exhaustive()
    }
}
