//! Error types for the proxy daemon.

use thiserror::Error;

/// Errors that can stop the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// I/O error (listener, config file, signal registration).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The credential provider could not be set up.
    #[error("Credential provider error: {0}")]
    Credentials(#[from] idproxy::CredentialError),

    /// The outbound HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The server stopped with an error.
    #[error("Server error: {0}")]
    Server(String),
}

/// Result type alias using `DaemonError`.
pub type Result<T> = std::result::Result<T, DaemonError>;
