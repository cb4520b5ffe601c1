//! Error types for the Secret Server SDK.
//!
//! Each variant carries enough context to tell a configuration mistake apart
//! from a transient network failure or a backend-side auth rejection.
//! Credential material is never included in error messages.

/// All errors that can occur when using the SDK.
#[derive(Debug, thiserror::Error)]
pub enum TssError {
    /// Invalid or contradictory configuration (e.g. both or neither of
    /// `server_url` and `tenant` set).
    #[error("configuration error: {0}")]
    Config(String),

    /// Neither the Secret Server nor the platform health probe reported a
    /// healthy deployment at the configured base URL.
    #[error("no healthy deployment detected at {base_url}")]
    InvalidDeployment {
        /// The base URL that was probed.
        base_url: String,
    },

    /// A token grant was rejected or returned a malformed response.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The NTLM handshake violated the expected protocol shape.
    #[error("NTLM protocol error during {stage}: {reason}")]
    Protocol {
        /// Handshake leg that failed: `probe`, `negotiate`, or `authenticate`.
        stage: &'static str,
        /// What was wrong with the server's response.
        reason: String,
    },

    /// Platform vault discovery returned no default, active vault.
    #[error("no configured vault found")]
    NoVaultFound,

    /// Windows-integrated authentication was requested on a platform without
    /// the underlying OS security capability.
    #[error("integrated authentication is not supported on this platform")]
    UnsupportedCapability,

    /// The API returned a non-success HTTP status.
    #[error("API error {status_code}: {message}")]
    Api {
        /// HTTP status code.
        status_code: u16,
        /// Error message extracted from the response body.
        message: String,
    },

    /// Network or HTTP client error.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
