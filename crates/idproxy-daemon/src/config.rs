//! Proxy configuration.
//!
//! Everything has a default, so the proxy runs without any config file. When
//! one is wanted it is read from `--config <path>` (or `IDPROXY_CONFIG`), else
//! from `$XDG_CONFIG_HOME/idproxy/config.toml` if that file exists. The `PORT`
//! environment variable, set by Cloud Run, overrides `port`.
//!
//! ## Example Configuration
//!
//! ```toml
//! listen_addr = "0.0.0.0"
//! port = 8080
//! shutdown_grace_secs = 15
//! health_path = "/_hc"
//!
//! [upstream]
//! scheme = "https"
//! timeout_secs = 60
//! relay = "body_only"        # or "full"
//! error_body = "status_text" # or "unauthorized"
//!
//! [credentials]
//! source = "metadata"        # or "static"
//! metadata_host = "metadata.google.internal"
//! refresh_margin_secs = 300
//! cache_capacity = 1024
//! token_env = "IDPROXY_STATIC_TOKEN"
//! ```

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use idproxy::credentials::{MetadataServerProvider, StaticTokenProvider};
use idproxy::{CredentialProvider, ErrorBody, ForwardOptions, RelayMode};
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

/// Environment variable that overrides the listening port.
pub const PORT_ENV: &str = "PORT";

/// Proxy configuration loaded from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address to bind (default: 0.0.0.0)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,

    /// Port to bind (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds in-flight requests get after SIGINT/SIGTERM (default: 15)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Liveness endpoint path (default: `/_hc`)
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Outbound request settings
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Identity token source
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

/// Outbound request settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Scheme prefixed to request paths (default: https)
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Deadline for each destination exchange in seconds (default: none)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// How much of the destination response is relayed (default: `body_only`)
    #[serde(default)]
    pub relay: RelayMode,

    /// Failure body text (default: `status_text`)
    #[serde(default)]
    pub error_body: ErrorBody,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            timeout_secs: None,
            relay: RelayMode::default(),
            error_body: ErrorBody::default(),
        }
    }
}

/// Where identity tokens come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Instance metadata server.
    #[default]
    Metadata,
    /// One fixed token read from the environment.
    Static,
}

/// Identity token source settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Token source (default: metadata)
    #[serde(default)]
    pub source: CredentialSource,

    /// Metadata server host; falls back to `GCE_METADATA_HOST`, then
    /// `metadata.google.internal`
    #[serde(default)]
    pub metadata_host: Option<String>,

    /// Seconds before expiry a cached token is refreshed (default: 300)
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,

    /// Most audiences whose tokens are cached (default: 1024)
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Environment variable holding the static token
    /// (default: `IDPROXY_STATIC_TOKEN`)
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            source: CredentialSource::default(),
            metadata_host: None,
            refresh_margin_secs: default_refresh_margin(),
            cache_capacity: default_cache_capacity(),
            token_env: default_token_env(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace(),
            health_path: default_health_path(),
            upstream: UpstreamConfig::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

const fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    8080
}

const fn default_shutdown_grace() -> u64 {
    15
}

fn default_health_path() -> String {
    "/_hc".to_string()
}

fn default_scheme() -> String {
    idproxy::DEFAULT_SCHEME.to_string()
}

const fn default_refresh_margin() -> u64 {
    300 // 5 minutes
}

const fn default_cache_capacity() -> usize {
    idproxy::credentials::DEFAULT_CACHE_CAPACITY
}

fn default_token_env() -> String {
    "IDPROXY_STATIC_TOKEN".to_string()
}

impl ProxyConfig {
    /// Loads configuration from `path`, or from the default location if it
    /// exists, or falls back to defaults. Applies environment overrides and
    /// validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - An explicit path doesn't exist or can't be read
    /// - Deserialization fails
    /// - An environment override is malformed
    /// - Validation fails
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable or malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DaemonError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("Failed to read config file: {e}")))?;

        Ok(toml::from_str(&contents)?)
    }

    /// Returns the default configuration file path.
    ///
    /// Uses `XDG_CONFIG_HOME` if set, otherwise `~/.config`.
    pub fn config_path() -> Option<PathBuf> {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .map(|dir| dir.join("idproxy").join("config.toml"))
    }

    /// Applies environment overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `PORT` is set but not a valid port number.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup(PORT_ENV).filter(|p| !p.trim().is_empty()) {
            self.port = port.trim().parse().map_err(|_| {
                DaemonError::Config(format!("{PORT_ENV} must be a port number, got '{port}'"))
            })?;
        }
        Ok(())
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The health path doesn't start with `/` or isn't a literal route
    /// - The upstream scheme isn't `http` or `https`
    /// - The shutdown grace period or upstream timeout is zero
    pub fn validate(&self) -> Result<()> {
        if !self.health_path.starts_with('/') {
            return Err(DaemonError::Config(format!(
                "health_path must start with '/', got '{}'",
                self.health_path
            )));
        }

        let is_pattern = self.health_path.contains(['{', '}'])
            || self
                .health_path
                .split('/')
                .any(|segment| segment.starts_with([':', '*']));
        if is_pattern {
            return Err(DaemonError::Config(format!(
                "health_path must be a literal path without captures or wildcards, got '{}'",
                self.health_path
            )));
        }

        if !matches!(self.upstream.scheme.as_str(), "http" | "https") {
            return Err(DaemonError::Config(format!(
                "upstream.scheme must be 'http' or 'https', got '{}'",
                self.upstream.scheme
            )));
        }

        if self.shutdown_grace_secs == 0 {
            return Err(DaemonError::Config(
                "shutdown_grace_secs must be greater than zero".to_string(),
            ));
        }

        if self.upstream.timeout_secs == Some(0) {
            return Err(DaemonError::Config(
                "upstream.timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Address the listener binds to.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.port)
    }

    /// Grace period for in-flight requests on shutdown.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Pipeline options derived from the `[upstream]` table.
    #[must_use]
    pub fn forward_options(&self) -> ForwardOptions {
        ForwardOptions {
            scheme: self.upstream.scheme.clone(),
            relay: self.upstream.relay,
            error_body: self.upstream.error_body,
            upstream_timeout: self.upstream.timeout_secs.map(Duration::from_secs),
        }
    }
}

impl CredentialsConfig {
    /// Builds the configured provider. Transports it hands out forward with
    /// `client`.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be created, e.g. the static
    /// token variable is unset.
    pub fn build_provider(&self, client: reqwest::Client) -> Result<Arc<dyn CredentialProvider>> {
        let provider: Arc<dyn CredentialProvider> = match self.source {
            CredentialSource::Metadata => {
                let provider = match &self.metadata_host {
                    Some(host) => {
                        MetadataServerProvider::with_base_url(client, format!("http://{host}"))?
                    }
                    None => MetadataServerProvider::new(client)?,
                };
                Arc::new(
                    provider
                        .with_refresh_margin(Duration::from_secs(self.refresh_margin_secs))
                        .with_cache_capacity(self.cache_capacity),
                )
            }
            CredentialSource::Static => {
                Arc::new(StaticTokenProvider::from_env(client, &self.token_env)?)
            }
        };
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use std::io::Write;

    use super::*;

    fn sample_config_toml() -> &'static str {
        r#"
listen_addr = "127.0.0.1"
port = 9090
shutdown_grace_secs = 30
health_path = "/healthz"

[upstream]
scheme = "http"
timeout_secs = 45
relay = "full"
error_body = "unauthorized"

[credentials]
source = "static"
metadata_host = "169.254.169.254"
refresh_margin_secs = 60
cache_capacity = 16
token_env = "MY_TOKEN"
        "#
    }

    #[test]
    fn test_parse_config() {
        let config: ProxyConfig = toml::from_str(sample_config_toml()).unwrap();

        assert_eq!(config.socket_addr(), "127.0.0.1:9090".parse().unwrap());
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(config.health_path, "/healthz");
        assert_eq!(config.upstream.relay, RelayMode::Full);
        assert_eq!(config.upstream.error_body, ErrorBody::Unauthorized);
        assert_eq!(config.credentials.source, CredentialSource::Static);
        assert_eq!(config.credentials.metadata_host.as_deref(), Some("169.254.169.254"));
        assert_eq!(config.credentials.token_env, "MY_TOKEN");
        assert_eq!(config.credentials.cache_capacity, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();

        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.socket_addr(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.shutdown_grace(), Duration::from_secs(15));
        assert_eq!(config.health_path, "/_hc");
        assert_eq!(config.upstream.scheme, "https");
        assert_eq!(config.upstream.timeout_secs, None);
        assert_eq!(config.upstream.relay, RelayMode::BodyOnly);
        assert_eq!(config.upstream.error_body, ErrorBody::StatusText);
        assert_eq!(config.credentials.source, CredentialSource::Metadata);
        assert_eq!(config.credentials.refresh_margin_secs, 300);
        assert_eq!(config.credentials.cache_capacity, 1024);
        assert_eq!(config.credentials.token_env, "IDPROXY_STATIC_TOKEN");
    }

    #[test]
    fn test_forward_options() {
        let config: ProxyConfig = toml::from_str(sample_config_toml()).unwrap();
        let options = config.forward_options();

        assert_eq!(options.scheme, "http");
        assert_eq!(options.relay, RelayMode::Full);
        assert_eq!(options.error_body, ErrorBody::Unauthorized);
        assert_eq!(options.upstream_timeout, Some(Duration::from_secs(45)));

        let options = ProxyConfig::default().forward_options();
        assert_eq!(options.upstream_timeout, None);
    }

    #[test]
    fn test_port_env_override() {
        let mut config = ProxyConfig::default();
        config
            .apply_env(|key| (key == PORT_ENV).then(|| "3000".to_string()))
            .unwrap();
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_port_env_rejects_garbage() {
        let mut config = ProxyConfig::default();
        let err = config
            .apply_env(|key| (key == PORT_ENV).then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("eighty"));
    }

    #[test]
    fn test_blank_port_env_ignored() {
        let mut config = ProxyConfig::default();
        config.apply_env(|_| Some(String::new())).unwrap();
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_validate_health_path() {
        let config = ProxyConfig {
            health_path: "_hc".to_string(),
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_health_path_rejects_route_patterns() {
        for path in ["/_hc/{", "/_hc/}", "/{id}", "/_hc/:id", "/_hc/*rest"] {
            let config = ProxyConfig {
                health_path: path.to_string(),
                ..ProxyConfig::default()
            };
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("literal"), "path {path}");
        }

        for path in ["/_hc", "/healthz", "/internal/live", "/a:b"] {
            let config = ProxyConfig {
                health_path: path.to_string(),
                ..ProxyConfig::default()
            };
            assert!(config.validate().is_ok(), "path {path}");
        }
    }

    #[test]
    fn test_validate_scheme() {
        let mut config = ProxyConfig::default();
        config.upstream.scheme = "ftp".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_durations() {
        let config = ProxyConfig {
            shutdown_grace_secs: 0,
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.upstream.timeout_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_relay_mode_rejected() {
        let result = toml::from_str::<ProxyConfig>("[upstream]\nrelay = \"headers\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_config_toml().as_bytes()).unwrap();

        let config = ProxyConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9090);
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = ProxyConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_build_static_provider_requires_token() {
        let credentials = CredentialsConfig {
            source: CredentialSource::Static,
            token_env: "IDPROXY_TEST_DEFINITELY_UNSET".to_string(),
            ..CredentialsConfig::default()
        };
        assert!(credentials.build_provider(reqwest::Client::new()).is_err());
    }

    #[test]
    fn test_build_metadata_provider() {
        let credentials = CredentialsConfig {
            metadata_host: Some("127.0.0.1:1".to_string()),
            ..CredentialsConfig::default()
        };
        assert!(credentials.build_provider(reqwest::Client::new()).is_ok());
    }
}
