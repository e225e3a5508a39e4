//! Engine configuration.

use crate::csr::CsrEncoding;
use crate::imds::{DEFAULT_API_VERSION, DEFAULT_IMDS_ENDPOINT};
use crate::key::provider::{DEFAULT_MACHINE_KEY_NAME, DEFAULT_USER_KEY_NAME};
use crate::key::{FileKeyStore, KeyStore, NoKeyStore};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Environment variable overriding the metadata service endpoint.
pub const IMDS_ENDPOINT_ENV: &str = "AZURE_POD_IDENTITY_AUTHORITY_HOST";

/// Kind of access token requested from the STS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Plain bearer token.
    Bearer,
    /// Token bound to the client certificate.
    #[default]
    MtlsPop,
}

impl TokenType {
    /// Value of the `token_type` form parameter, if one is sent.
    pub fn form_value(&self) -> Option<&'static str> {
        match self {
            Self::Bearer => None,
            Self::MtlsPop => Some("mtls_pop"),
        }
    }
}

/// Managed identity engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedIdentityConfig {
    /// Base URL of the local metadata service
    #[serde(default = "default_imds_endpoint")]
    pub imds_endpoint: String,

    /// API version of the identity endpoints
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Per-request transport timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_machine_key_name")]
    pub machine_key_name: String,

    #[serde(default = "default_user_key_name")]
    pub user_key_name: String,

    /// Directory holding machine-scoped PKCS#8 keys
    #[serde(default)]
    pub machine_key_dir: Option<PathBuf>,

    /// Directory holding user-scoped PKCS#8 keys
    #[serde(default)]
    pub user_key_dir: Option<PathBuf>,

    #[serde(default)]
    pub csr_encoder: CsrEncoding,

    #[serde(default)]
    pub token_type: TokenType,
}

impl Default for ManagedIdentityConfig {
    fn default() -> Self {
        Self {
            imds_endpoint: default_imds_endpoint(),
            api_version: default_api_version(),
            request_timeout_secs: default_request_timeout(),
            machine_key_name: default_machine_key_name(),
            user_key_name: default_user_key_name(),
            machine_key_dir: None,
            user_key_dir: None,
            csr_encoder: CsrEncoding::default(),
            token_type: TokenType::default(),
        }
    }
}

fn default_imds_endpoint() -> String {
    DEFAULT_IMDS_ENDPOINT.to_string()
}
fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_machine_key_name() -> String {
    DEFAULT_MACHINE_KEY_NAME.to_string()
}
fn default_user_key_name() -> String {
    DEFAULT_USER_KEY_NAME.to_string()
}

impl ManagedIdentityConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Parses a TOML document; absent fields take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Applies overrides read through `lookup`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(endpoint) = lookup(IMDS_ENDPOINT_ENV).filter(|v| !v.trim().is_empty()) {
            self.imds_endpoint = endpoint.trim().to_string();
        }
        self
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.imds_endpoint).map_err(|e| {
            Error::Config(format!("invalid imds_endpoint {:?}: {e}", self.imds_endpoint))
        })?;
        if self.api_version.trim().is_empty() {
            return Err(Error::Config("api_version must not be empty".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Key store over the configured directories.
    pub fn key_store(&self) -> Arc<dyn KeyStore> {
        if self.machine_key_dir.is_none() && self.user_key_dir.is_none() {
            return Arc::new(NoKeyStore);
        }
        Arc::new(FileKeyStore::new(
            self.machine_key_dir.clone(),
            self.user_key_dir.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ManagedIdentityConfig::default();
        assert_eq!(config.imds_endpoint, "http://169.254.169.254");
        assert_eq!(config.api_version, "2025-04-01-preview");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.machine_key_name, "msi-mtls-machine-key");
        assert_eq!(config.user_key_name, "msi-mtls-user-key");
        assert!(config.machine_key_dir.is_none());
        assert_eq!(config.csr_encoder, CsrEncoding::Auto);
        assert_eq!(config.token_type, TokenType::MtlsPop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ManagedIdentityConfig::from_toml_str(
            r#"
            request_timeout_secs = 5
            csr_encoder = "der"
            token_type = "bearer"
            user_key_dir = "/var/lib/msi"
            "#,
        )
        .unwrap();

        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.csr_encoder, CsrEncoding::Der);
        assert_eq!(config.token_type, TokenType::Bearer);
        assert_eq!(config.user_key_dir, Some(PathBuf::from("/var/lib/msi")));
        assert_eq!(config.api_version, "2025-04-01-preview");
    }

    #[test]
    fn test_invalid_toml_values() {
        assert!(matches!(
            ManagedIdentityConfig::from_toml_str("token_type = \"jwt\""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ManagedIdentityConfig::from_toml_str("request_timeout_secs = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ManagedIdentityConfig::from_toml_str("imds_endpoint = \"nope\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_env_override() {
        let config = ManagedIdentityConfig::default().with_env_overrides(|name| {
            (name == IMDS_ENDPOINT_ENV).then(|| " http://127.0.0.1:40342 ".to_string())
        });
        assert_eq!(config.imds_endpoint, "http://127.0.0.1:40342");

        let config = ManagedIdentityConfig::default().with_env_overrides(|_| Some(String::new()));
        assert_eq!(config.imds_endpoint, DEFAULT_IMDS_ENDPOINT);
    }

    #[test]
    fn test_load_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "api_version = \"2024-01-01\"").unwrap();

        let config = ManagedIdentityConfig::load(file.path()).unwrap();
        assert_eq!(config.api_version, "2024-01-01");

        let missing = ManagedIdentityConfig::load(Path::new("/nonexistent/msi.toml")).unwrap();
        assert_eq!(missing.api_version, DEFAULT_API_VERSION);
    }

    #[test]
    fn test_token_type_form_value() {
        assert_eq!(TokenType::MtlsPop.form_value(), Some("mtls_pop"));
        assert_eq!(TokenType::Bearer.form_value(), None);
    }
}
