//! Credential providers.
//!
//! A provider turns an audience URL into an [`AuthenticatedTransport`]. How the
//! token behind it is minted, cached or refreshed is up to the provider; the
//! forwarding pipeline only calls [`CredentialProvider::acquire`] once per
//! request and maps any error to `401 Unauthorized`.
//!
//! Two providers ship with the crate:
//!
//! - [`MetadataServerProvider`] fetches Google-signed identity tokens from the
//!   instance metadata server (Cloud Run, GCE, GKE).
//! - [`StaticTokenProvider`] attaches one fixed token to every request, for
//!   local development.

use async_trait::async_trait;

use crate::error::CredentialError;
use crate::transport::AuthenticatedTransport;

mod metadata;
mod static_token;
mod token;

pub use metadata::{
    DEFAULT_CACHE_CAPACITY, DEFAULT_METADATA_HOST, METADATA_HOST_ENV, MetadataServerProvider,
};
pub use static_token::StaticTokenProvider;

/// Source of audience-scoped authenticated transports.
///
/// Implementations must be thread-safe; one provider is shared by every
/// in-flight forward.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Produces a transport whose requests carry a token for `audience`.
    ///
    /// # Errors
    ///
    /// Returns a [`CredentialError`] if no token can be obtained for the
    /// audience.
    async fn acquire(&self, audience: &str) -> Result<AuthenticatedTransport, CredentialError>;
}
