//! Identity token inspection.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// The only claim the cache cares about.
#[derive(Debug, Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

/// Reads the `exp` claim from a compact JWT without verifying it.
///
/// The signature is not checked; the value only decides how long the token
/// may be reused.
/// Returns `None` for anything that is not a three-segment JWT with a numeric
/// `exp`.
pub(crate) fn expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claim: ExpiryClaim = serde_json::from_slice(&bytes).ok()?;

    DateTime::from_timestamp(claim.exp, 0)
}

#[cfg(test)]
pub(crate) fn fake_jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::json!({"aud": "https://svc.example.com", "exp": exp}).to_string(),
    );
    format!("{header}.{payload}.c2lnbmF0dXJl")
}
