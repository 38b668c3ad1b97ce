//! Streaming the destination's response back to the caller.

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::{Response, StatusCode};
use futures::{StreamExt, TryStreamExt, stream};
use tracing::warn;

use crate::error::ForwardError;
use crate::forward::RelayMode;

/// Connection-scoped headers that describe the proxy-to-destination hop.
const HOP_BY_HOP_HEADERS: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(name) || name.as_str() == "keep-alive"
}

/// Copies the destination's headers, minus hop-by-hop ones.
pub(crate) fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

/// Turns the destination response into the caller's response.
///
/// Nothing is committed to the caller until the first body chunk (or the end
/// of an empty body) has arrived, so a destination that fails straight away
/// still produces an error response. Later failures can only be logged: the
/// status line is already on the wire by then.
pub(crate) async fn relay(
    upstream: reqwest::Response,
    mode: RelayMode,
) -> Result<Response<Body>, ForwardError> {
    let status = upstream.status();
    let headers = match mode {
        RelayMode::BodyOnly => HeaderMap::new(),
        RelayMode::Full => end_to_end_headers(upstream.headers()),
    };

    let mut chunks = upstream.bytes_stream();
    let first = chunks.next().await.transpose().map_err(ForwardError::Relay)?;

    let body = stream::iter(first.map(Ok))
        .chain(chunks)
        .inspect_err(|e| warn!(error = %e, "Upstream body broke after response was committed"));

    let mut builder = Response::builder().status(match mode {
        RelayMode::BodyOnly => StatusCode::OK,
        RelayMode::Full => status,
    });
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }

    Ok(builder.body(Body::from_stream(body))?)
}
