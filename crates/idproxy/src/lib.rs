//! # idproxy
//!
//! Authenticating forward proxy core.
//!
//! Every inbound request carries its real destination in the request path.
//! The [`Forwarder`] turns that path into an absolute URL, asks a
//! [`CredentialProvider`] for a transport that carries an identity token scoped
//! to that URL, replays the request against it and streams the answer back.
//!
//! ```text
//! GET /svc.example.com/v1/items
//!        │
//!        ▼
//!   [Forwarder] ── acquire("https://svc.example.com/v1/items") ──▶ [CredentialProvider]
//!        │                                                              │
//!        │ ◀──────────────── AuthenticatedTransport ────────────────────┘
//!        ▼
//! GET https://svc.example.com/v1/items
//! Authorization: Bearer <identity token>
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use idproxy::credentials::MetadataServerProvider;
//! use idproxy::{ForwardOptions, Forwarder};
//!
//! # fn example() -> Result<(), idproxy::CredentialError> {
//! let provider = MetadataServerProvider::new(reqwest::Client::new())?;
//! let forwarder = Forwarder::new(Arc::new(provider), ForwardOptions::default());
//! # let _ = forwarder;
//! # Ok(())
//! # }
//! ```

pub mod credentials;
pub mod destination;
pub mod error;
pub mod forward;
mod relay;
pub mod shutdown;
pub mod transport;

pub use credentials::CredentialProvider;
pub use destination::{DEFAULT_SCHEME, Destination};
pub use error::{CredentialError, FailureKind, ForwardError};
pub use forward::{ErrorBody, ForwardOptions, Forwarder, RelayMode};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use transport::AuthenticatedTransport;
