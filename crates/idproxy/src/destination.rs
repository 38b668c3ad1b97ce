//! Destination derivation from the inbound request path.
//!
//! The proxy has no routing table. A caller that wants to reach
//! `https://svc.example.com/v1/items` sends its request to
//! `/svc.example.com/v1/items` on the proxy, and the path is turned back into
//! the absolute URL by prefixing the scheme.

use url::Url;

use crate::error::ForwardError;

/// Scheme used for every destination in production.
pub const DEFAULT_SCHEME: &str = "https";

/// Absolute destination of one forwarded request.
///
/// Holds both the exact audience string handed to the credential provider
/// and the parsed URL the outbound request is sent to. The parsed form may be
/// normalized by the URL parser (lowercased host, default port dropped); the
/// audience never is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    audience: String,
    url: Url,
}

impl Destination {
    /// Derives an `https` destination from a raw request path.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::InvalidDestination`] if the path does not form
    /// an absolute URL with a host.
    pub fn from_path(path: &str) -> Result<Self, ForwardError> {
        Self::with_scheme(DEFAULT_SCHEME, path)
    }

    /// Derives a destination using `scheme` instead of `https`.
    ///
    /// The path is used exactly as received: its single leading `/` is
    /// dropped and nothing else is decoded, normalized or appended.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::InvalidDestination`] if the path does not form
    /// an absolute URL with a host, or if it has `.`/`..` segments that URL
    /// parsing would resolve away from the audience.
    pub fn with_scheme(scheme: &str, path: &str) -> Result<Self, ForwardError> {
        let target = path.strip_prefix('/').unwrap_or(path);
        let audience = format!("{scheme}://{target}");

        if has_dot_segment(target) {
            return Err(ForwardError::InvalidDestination {
                audience,
                reason: "path contains dot segments".to_string(),
            });
        }

        let url = Url::parse(&audience).map_err(|e| ForwardError::InvalidDestination {
            audience: audience.clone(),
            reason: e.to_string(),
        })?;

        if url.host_str().is_none_or(str::is_empty) {
            return Err(ForwardError::InvalidDestination {
                audience,
                reason: "destination has no host".to_string(),
            });
        }

        Ok(Self { audience, url })
    }

    /// The audience the identity token must be scoped to.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// The URL the outbound request is sent to.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

/// Whether the path after the authority has a `.` or `..` segment, literal or
/// percent-encoded. Backslashes count as separators for http(s) URLs.
fn has_dot_segment(target: &str) -> bool {
    let Some(start) = target.find(['/', '\\']) else {
        return false;
    };

    target[start..].split(['/', '\\']).any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.audience)
    }
}
