//! Error types for the forwarding pipeline.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors a [`CredentialProvider`](crate::CredentialProvider) can return.
///
/// Every variant is surfaced to the caller as `401 Unauthorized`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// No credential source is available for this process.
    #[error("Credentials unavailable: {0}")]
    Unavailable(String),

    /// The metadata server could not be reached.
    #[error("Metadata server unreachable: {0}")]
    MetadataUnreachable(#[source] reqwest::Error),

    /// The metadata server answered with a non-success status.
    #[error("Metadata server returned {status}: {body}")]
    MetadataStatus {
        /// HTTP status returned by the metadata server.
        status: u16,
        /// Leading part of the response body.
        body: String,
    },

    /// The minted token cannot be used as a bearer credential.
    #[error("Invalid identity token: {0}")]
    InvalidToken(String),

    /// Acquisition was abandoned because the process is shutting down.
    #[error("Credential acquisition cancelled by shutdown")]
    Cancelled,
}

/// Failure classes of a single forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No authenticated transport could be produced for the audience.
    CredentialAcquisition,
    /// The outbound request could not be built.
    RequestConstruction,
    /// The destination could not be reached or the exchange failed.
    UpstreamExecution,
    /// The destination answered but its body could not be relayed.
    Relay,
}

impl FailureKind {
    /// Short label used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CredentialAcquisition => "credential_acquisition",
            Self::RequestConstruction => "request_construction",
            Self::UpstreamExecution => "upstream_execution",
            Self::Relay => "relay",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that end a forward before a response could be relayed.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The request path does not name a usable destination.
    #[error("Invalid destination {audience}: {reason}")]
    InvalidDestination {
        /// The audience string derived from the path.
        audience: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The credential provider failed.
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// The outbound request could not be built.
    #[error("Failed to build outbound request: {0}")]
    RequestConstruction(#[source] reqwest::Error),

    /// Sending the outbound request failed.
    #[error("Upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),

    /// Reading the destination's body failed before anything was committed.
    #[error("Failed to relay upstream body: {0}")]
    Relay(#[source] reqwest::Error),

    /// The relayed response could not be assembled.
    #[error("Failed to build relayed response: {0}")]
    ResponseBuild(#[from] axum::http::Error),
}

impl ForwardError {
    /// Failure class of this error.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidDestination { .. } | Self::Credentials(_) => {
                FailureKind::CredentialAcquisition
            }
            Self::RequestConstruction(_) => FailureKind::RequestConstruction,
            Self::Upstream(_) => FailureKind::UpstreamExecution,
            Self::Relay(_) | Self::ResponseBuild(_) => FailureKind::Relay,
        }
    }

    /// Status code reported to the caller.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self.kind() {
            FailureKind::CredentialAcquisition => StatusCode::UNAUTHORIZED,
            FailureKind::RequestConstruction
            | FailureKind::UpstreamExecution
            | FailureKind::Relay => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
