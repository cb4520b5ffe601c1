//! Rust SDK for Delinea Secret Server.
//!
//! Reaches a Secret Server backend deployed in any of three topologies —
//! self-hosted server, multi-tenant cloud, or an identity-platform-fronted
//! vault — without the caller knowing which one is in play. Deployment mode
//! is detected via health probes, bearer tokens are acquired through the
//! matching OAuth-style grant flow and cached with an early-refresh margin,
//! and an alternate client surface supports Windows-integrated NTLM
//! authentication.
//!
//! # Example
//!
//! ```rust,no_run
//! use tss_sdk::{Configuration, Server, UserCredential};
//!
//! # async fn example() -> Result<(), tss_sdk::TssError> {
//! let server = Server::new(Configuration {
//!     credentials: UserCredential {
//!         username: std::env::var("TSS_USERNAME").unwrap_or_default(),
//!         password: std::env::var("TSS_PASSWORD").unwrap_or_default(),
//!         ..Default::default()
//!     },
//!     tenant: std::env::var("TSS_TENANT").unwrap_or_default(),
//!     ..Default::default()
//! })?;
//!
//! let secret = server.secret(1).await?;
//! if let Some(pw) = secret.field("password") {
//!     println!("the password is {pw}");
//! }
//! # Ok(())
//! # }
//! ```

mod auth;
mod client;
mod error;
mod secret;
mod server;
mod template;

pub use auth::cache::{CachedToken, TokenCache};
pub use auth::grant::{Vault, VaultConnection};
pub use auth::health::{DeploymentMode, ProbeOutcome};
pub use auth::ntlm::{ChallengeResponseProvider, UnsupportedProvider};
pub use client::{Client, ClientAuth};
pub use error::TssError;
pub use secret::{Secret, SecretField, SshKeyArgs};
pub use server::Server;
pub use template::{SecretTemplate, SecretTemplateField};

use std::time::Duration;

pub(crate) const DEFAULT_API_PATH_URI: &str = "api/v1";
pub(crate) const DEFAULT_TOKEN_PATH_URI: &str = "oauth2/token";
pub(crate) const DEFAULT_TLD: &str = "com";
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the base URL of a multi-tenant cloud deployment.
pub(crate) fn cloud_base_url(tenant: &str, tld: &str) -> String {
    format!("https://{tenant}.secretservercloud.{tld}/")
}

/// Credentials the SDK uses to authenticate to the REST API.
///
/// Exactly one of `username` + `password` or a pre-issued static `token`
/// drives token acquisition; a static token bypasses every other mechanism.
#[derive(Debug, Clone, Default)]
pub struct UserCredential {
    /// Optional directory domain for the password grant.
    pub domain: String,
    /// Username, or the client id for a platform client-credentials grant.
    pub username: String,
    /// Password, or the client secret for a platform client-credentials grant.
    pub password: String,
    /// Pre-issued static bearer token. When non-empty, no grant is performed.
    pub token: String,
}

/// Optional TLS settings applied to the underlying HTTP client.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Additional PEM-encoded root certificate to trust.
    pub root_certificate_pem: Option<Vec<u8>>,
    /// Disable certificate verification. Test environments only.
    pub danger_accept_invalid_certs: bool,
}

/// Configuration settings for the SDK.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Credentials used for token acquisition.
    pub credentials: UserCredential,
    /// Base URL of a self-hosted Secret Server or platform deployment.
    /// Mutually exclusive with `tenant`.
    pub server_url: String,
    /// Tenant name of a Secret Server Cloud deployment. Mutually exclusive
    /// with `server_url`.
    pub tenant: String,
    /// Top-level domain for the cloud URL template. Default: `com`.
    pub tld: String,
    /// REST API path. Default: `/api/v1`.
    pub api_path_uri: String,
    /// Token endpoint path. Default: `/oauth2/token`.
    pub token_path_uri: String,
    /// Optional TLS client settings.
    pub tls: Option<TlsConfig>,
    /// Request timeout applied to every network call. Default: 30 seconds.
    pub timeout: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            credentials: UserCredential::default(),
            server_url: String::new(),
            tenant: String::new(),
            tld: DEFAULT_TLD.to_owned(),
            api_path_uri: DEFAULT_API_PATH_URI.to_owned(),
            token_path_uri: DEFAULT_TOKEN_PATH_URI.to_owned(),
            tls: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}
