//! Audience-bound request executor.

use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Client, Request, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::CredentialError;

/// HTTP executor that attaches one identity token to every request it sends.
///
/// Produced by a [`CredentialProvider`](crate::CredentialProvider) for a single
/// audience and dropped when the forward that asked for it completes. The
/// underlying [`Client`] is shared, so building one per request is cheap.
#[derive(Clone)]
pub struct AuthenticatedTransport {
    client: Client,
    audience: String,
    authorization: HeaderValue,
}

impl AuthenticatedTransport {
    /// Wraps `client` so it sends `Authorization: Bearer <token>`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::InvalidToken`] if the token is empty or
    /// contains bytes that are not allowed in a header value.
    pub fn new(
        client: Client,
        audience: impl Into<String>,
        token: &SecretString,
    ) -> Result<Self, CredentialError> {
        let token = token.expose_secret();
        if token.is_empty() {
            return Err(CredentialError::InvalidToken("token is empty".to_string()));
        }

        let mut authorization = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| {
                CredentialError::InvalidToken("token is not a valid header value".to_string())
            })?;
        authorization.set_sensitive(true);

        Ok(Self {
            client,
            audience: audience.into(),
            authorization,
        })
    }

    /// The audience the carried token is scoped to.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Starts a request against `url` on the underlying client.
    ///
    /// The credential is not attached until [`execute`](Self::execute).
    pub fn request(&self, method: reqwest::Method, url: Url) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Sends `request` with the identity token attached.
    ///
    /// Any `Authorization` header already on the request is replaced.
    ///
    /// # Errors
    ///
    /// Returns the client error if the request cannot be sent or the
    /// response headers cannot be read.
    pub async fn execute(&self, mut request: Request) -> reqwest::Result<Response> {
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.authorization.clone());
        self.client.execute(request).await
    }
}

impl std::fmt::Debug for AuthenticatedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedTransport")
            .field("audience", &self.audience)
            .field("authorization", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}
