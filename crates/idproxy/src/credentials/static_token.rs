//! Fixed-token provider.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::SecretString;

use super::CredentialProvider;
use crate::error::CredentialError;
use crate::transport::AuthenticatedTransport;

/// Provider that attaches the same token for every audience.
///
/// Meant for running the proxy outside Google Cloud, where a developer pastes
/// a token minted with `gcloud auth print-identity-token` into the
/// environment.
pub struct StaticTokenProvider {
    client: Client,
    token: SecretString,
}

impl StaticTokenProvider {
    /// Creates a provider that forwards with `client` and always sends `token`.
    #[must_use]
    pub const fn new(client: Client, token: SecretString) -> Self {
        Self { client, token }
    }

    /// Reads the token from the environment variable `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Unavailable`] if the variable is unset or
    /// empty.
    pub fn from_env(client: Client, name: &str) -> Result<Self, CredentialError> {
        let token = std::env::var(name)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                CredentialError::Unavailable(format!("environment variable {name} is not set"))
            })?;

        Ok(Self::new(client, SecretString::new(token.into())))
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn acquire(&self, audience: &str) -> Result<AuthenticatedTransport, CredentialError> {
        AuthenticatedTransport::new(self.client.clone(), audience, &self.token)
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}
