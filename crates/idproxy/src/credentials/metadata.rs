//! Identity tokens from the instance metadata server.
//!
//! On Cloud Run, GCE and GKE the metadata server mints Google-signed identity
//! tokens for the workload's service account:
//!
//! ```text
//! GET http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/identity
//!     ?audience=https://svc.example.com/v1/items&format=full
//! Metadata-Flavor: Google
//! ```
//!
//! Tokens are kept per audience until shortly before they expire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use secrecy::SecretString;
use tracing::{debug, instrument};

use super::CredentialProvider;
use super::token;
use crate::error::CredentialError;
use crate::transport::AuthenticatedTransport;

/// Environment variable that overrides the metadata server host.
pub const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

/// Metadata server host used when nothing overrides it.
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

const IDENTITY_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/identity";

/// Timeout for one metadata round-trip. The server is link-local.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Tokens are refreshed this long before they expire by default.
const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Longest metadata error body kept in [`CredentialError::MetadataStatus`].
const MAX_ERROR_BODY: usize = 256;

/// Most audiences kept in the token cache by default.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Clone)]
struct CachedToken {
    token: Arc<SecretString>,
    expires_at: DateTime<Utc>,
}

/// Provider backed by the metadata server's identity endpoint.
///
/// The `transport_client` passed to [`new`](Self::new) is the one the
/// returned transports forward with; metadata calls use a separate client
/// with a short timeout.
pub struct MetadataServerProvider {
    metadata_client: Client,
    transport_client: Client,
    base_url: String,
    refresh_margin: chrono::Duration,
    cache: DashMap<String, CachedToken>,
    cache_capacity: usize,
}

impl MetadataServerProvider {
    /// Creates a provider for the metadata host named by `GCE_METADATA_HOST`,
    /// or `metadata.google.internal` if unset.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Unavailable`] if the metadata HTTP client
    /// cannot be built.
    pub fn new(transport_client: Client) -> Result<Self, CredentialError> {
        let host = std::env::var(METADATA_HOST_ENV)
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string());
        Self::with_base_url(transport_client, format!("http://{host}"))
    }

    /// Creates a provider that talks to the metadata server at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Unavailable`] if the metadata HTTP client
    /// cannot be built.
    pub fn with_base_url(
        transport_client: Client,
        base_url: impl Into<String>,
    ) -> Result<Self, CredentialError> {
        let metadata_client = Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|e| CredentialError::Unavailable(format!("metadata client: {e}")))?;

        Ok(Self {
            metadata_client,
            transport_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            refresh_margin: chrono::Duration::from_std(DEFAULT_REFRESH_MARGIN)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            cache: DashMap::new(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        })
    }

    /// Sets how long before expiry a cached token stops being reused.
    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin =
            chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        self
    }

    /// Sets how many audiences the token cache holds. Zero disables caching.
    #[must_use]
    pub const fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// The metadata server base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn cached(&self, audience: &str) -> Option<Arc<SecretString>> {
        let entry = self.cache.get(audience)?;
        if self.is_fresh(&entry, Utc::now()) {
            return Some(Arc::clone(&entry.token));
        }
        drop(entry);

        self.cache.remove(audience);
        None
    }

    fn is_fresh(&self, entry: &CachedToken, now: DateTime<Utc>) -> bool {
        entry.expires_at - self.refresh_margin > now
    }

    /// Stores `entry`, making room first if the cache is full. Stale entries
    /// go before live ones, then the entry closest to expiry.
    fn store(&self, audience: &str, entry: CachedToken) {
        if self.cache_capacity == 0 {
            return;
        }

        if !self.cache.contains_key(audience) && self.cache.len() >= self.cache_capacity {
            let now = Utc::now();
            self.cache.retain(|_, cached| self.is_fresh(cached, now));

            while self.cache.len() >= self.cache_capacity {
                let oldest = self
                    .cache
                    .iter()
                    .min_by_key(|cached| cached.expires_at)
                    .map(|cached| cached.key().clone());
                match oldest {
                    Some(key) => {
                        self.cache.remove(&key);
                    }
                    None => break,
                }
            }
        }

        self.cache.insert(audience.to_string(), entry);
    }

    async fn fetch(&self, audience: &str) -> Result<String, CredentialError> {
        let url = format!("{}{IDENTITY_PATH}", self.base_url);

        let response = self
            .metadata_client
            .get(url)
            .query(&[("audience", audience), ("format", "full")])
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(CredentialError::MetadataUnreachable)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(CredentialError::MetadataUnreachable)?;

        if !status.is_success() {
            let mut body = body.trim().to_string();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(CredentialError::MetadataStatus {
                status: status.as_u16(),
                body,
            });
        }

        let token = body.trim();
        if token.is_empty() {
            return Err(CredentialError::InvalidToken(
                "metadata server returned an empty token".to_string(),
            ));
        }

        Ok(token.to_string())
    }
}

#[async_trait]
impl CredentialProvider for MetadataServerProvider {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn acquire(&self, audience: &str) -> Result<AuthenticatedTransport, CredentialError> {
        if let Some(token) = self.cached(audience) {
            debug!("Using cached identity token");
            return AuthenticatedTransport::new(self.transport_client.clone(), audience, &token);
        }

        let raw = self.fetch(audience).await?;
        let expires_at = token::expiry(&raw);
        let token = Arc::new(SecretString::new(raw.into()));
        let transport =
            AuthenticatedTransport::new(self.transport_client.clone(), audience, &token)?;

        if let Some(expires_at) = expires_at {
            debug!(%expires_at, "Caching identity token");
            self.store(audience, CachedToken { token, expires_at });
        } else {
            debug!("Identity token has no readable expiry, not caching");
        }

        Ok(transport)
    }
}

impl std::fmt::Debug for MetadataServerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataServerProvider")
            .field("base_url", &self.base_url)
            .field("refresh_margin", &self.refresh_margin)
            .field("cached_audiences", &self.cache.len())
            .field("cache_capacity", &self.cache_capacity)
            .finish_non_exhaustive()
    }
}
