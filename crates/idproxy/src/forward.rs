//! The forwarding pipeline.
//!
//! One call to [`Forwarder::forward`] handles one inbound request end to end:
//!
//! 1. derive the [`Destination`] from the request path
//! 2. acquire an [`AuthenticatedTransport`] for its audience
//! 3. rebuild the request (method, headers, streamed body) against it
//! 4. execute it with the identity token attached
//! 5. stream the answer back
//!
//! Any failure ends the request with a fixed status and a generic body; no
//! step is retried.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::extract::Request;
use axum::http::header::{self, HeaderValue};
use axum::http::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::credentials::CredentialProvider;
use crate::destination::{DEFAULT_SCHEME, Destination};
use crate::error::{CredentialError, FailureKind, ForwardError};
use crate::relay;
use crate::shutdown::Shutdown;
use crate::transport::AuthenticatedTransport;

/// How much of the destination's response reaches the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// Status is always `200 OK`; only the body is relayed.
    #[default]
    BodyOnly,
    /// Status and end-to-end headers are relayed along with the body.
    Full,
}

/// Text rendered in failure responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorBody {
    /// The reason phrase of the status actually returned.
    #[default]
    StatusText,
    /// Always `Unauthorized`, whatever the status. Kept for callers that
    /// match on the body text of older deployments.
    Unauthorized,
}

/// Tunables for the pipeline.
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Scheme prefixed to the request path. `https` outside of tests.
    pub scheme: String,
    /// What part of the destination response is relayed.
    pub relay: RelayMode,
    /// Failure body style.
    pub error_body: ErrorBody,
    /// Deadline for the destination exchange. `None` waits indefinitely.
    pub upstream_timeout: Option<Duration>,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            relay: RelayMode::default(),
            error_body: ErrorBody::default(),
            upstream_timeout: None,
        }
    }
}

/// Stateless request forwarder. Cheap to clone.
#[derive(Clone)]
pub struct Forwarder {
    credentials: Arc<dyn CredentialProvider>,
    options: Arc<ForwardOptions>,
}

impl Forwarder {
    /// Creates a forwarder that authenticates through `credentials`.
    pub fn new(credentials: Arc<dyn CredentialProvider>, options: ForwardOptions) -> Self {
        Self {
            credentials,
            options: Arc::new(options),
        }
    }

    /// The options this forwarder was built with.
    #[must_use]
    pub fn options(&self) -> &ForwardOptions {
        &self.options
    }

    /// Forwards `request` and returns the response for the caller.
    ///
    /// `shutdown` cancels a credential acquisition that is still pending when
    /// the process starts shutting down. Requests past that point run to
    /// completion.
    pub async fn forward(&self, request: Request, shutdown: Shutdown) -> Response<Body> {
        let span = info_span!(
            "forward",
            request_id = %Uuid::new_v4(),
            method = %request.method(),
            path = %request.uri().path(),
        );

        async move {
            match self.try_forward(request, shutdown).await {
                Ok(response) => {
                    debug!(status = %response.status(), "Relaying upstream response");
                    response
                }
                Err(e) => {
                    let kind = e.kind();
                    let status = e.status();
                    match kind {
                        FailureKind::CredentialAcquisition => {
                            warn!(kind = %kind, status = status.as_u16(), error = %e, "Forward rejected");
                        }
                        _ => {
                            error!(kind = %kind, status = status.as_u16(), error = %e, "Forward failed");
                        }
                    }
                    failure_response(status, self.options.error_body)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_forward(
        &self,
        request: Request,
        shutdown: Shutdown,
    ) -> Result<Response<Body>, ForwardError> {
        let destination = Destination::with_scheme(&self.options.scheme, request.uri().path())?;
        let transport = self.acquire(&destination, shutdown).await?;

        info!(destination = %destination, "Forwarding request");

        let outbound = self.build_outbound(request, &destination, &transport)?;
        let upstream = transport
            .execute(outbound)
            .await
            .map_err(ForwardError::Upstream)?;

        debug!(upstream_status = %upstream.status(), "Upstream responded");
        relay::relay(upstream, self.options.relay).await
    }

    async fn acquire(
        &self,
        destination: &Destination,
        mut shutdown: Shutdown,
    ) -> Result<AuthenticatedTransport, ForwardError> {
        tokio::select! {
            result = self.credentials.acquire(destination.audience()) => Ok(result?),
            () = shutdown.wait() => Err(CredentialError::Cancelled.into()),
        }
    }

    fn build_outbound(
        &self,
        request: Request,
        destination: &Destination,
        transport: &AuthenticatedTransport,
    ) -> Result<reqwest::Request, ForwardError> {
        let (parts, body) = request.into_parts();

        // Host names the proxy; the client derives it from the destination.
        let mut headers = parts.headers;
        headers.remove(header::HOST);

        let mut builder = transport
            .request(parts.method, destination.url().clone())
            .headers(headers);

        if !body.is_end_stream() {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        if let Some(timeout) = self.options.upstream_timeout {
            builder = builder.timeout(timeout);
        }

        builder.build().map_err(ForwardError::RequestConstruction)
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Builds the generic failure response for `status`.
///
/// Mirrors a plain-text HTTP error: one line, no details about the cause.
#[must_use]
pub fn failure_response(status: StatusCode, style: ErrorBody) -> Response<Body> {
    let text = match style {
        ErrorBody::StatusText => status.canonical_reason().unwrap_or("Error"),
        ErrorBody::Unauthorized => "Unauthorized",
    };

    let mut response = Response::new(Body::from(format!("{text}\n")));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}
