//! Lightweight single-resource client.
//!
//! A smaller surface than [`Server`](crate::Server) for callers that already
//! know which backend they are talking to: no deployment-mode detection, a
//! fixed token endpoint, and a single-slot token reuse cache. Supports
//! password-grant and Windows-integrated authentication.

use std::time::Duration;

use reqwest::{Method, Url};
use tracing::debug;

use crate::auth::cache::{cache_key, TokenCache};
use crate::auth::grant::parse_grant_response;
use crate::auth::ntlm::{self, ChallengeResponseProvider};
use crate::error::TssError;
use crate::secret::Secret;
use crate::server::api_error;
use crate::{UserCredential, DEFAULT_API_PATH_URI, DEFAULT_TOKEN_PATH_URI};

const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

type ProviderFactory =
    Box<dyn Fn(&UserCredential) -> Result<Box<dyn ChallengeResponseProvider>, TssError> + Send + Sync>;

/// How a [`Client`] authenticates its requests.
pub enum ClientAuth {
    /// Resource-owner password grant against the backend's fixed
    /// `oauth2/token` endpoint. The granted token is reused until its
    /// early-refresh deadline.
    PasswordGrant {
        username: String,
        password: String,
    },
    /// Per-request Windows-integrated challenge-response handshake using the
    /// given credentials.
    Ntlm(UserCredential),
}

/// A client bound to a single, known backend.
pub struct Client {
    base_url: String,
    http: reqwest::Client,
    auth: ClientAuth,
    /// Single-slot reuse cache: only this client's base URL is ever keyed.
    token: TokenCache,
    provider_factory: ProviderFactory,
}

impl Client {
    /// Create a client for the backend at `base_url`.
    ///
    /// # Errors
    ///
    /// [`TssError::Config`] when `base_url` is empty, [`TssError::Network`]
    /// when the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, auth: ClientAuth) -> Result<Self, TssError> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(TssError::Config("a base URL is required".to_owned()));
        }

        let http = reqwest::Client::builder()
            .timeout(DEFAULT_CLIENT_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url,
            http,
            auth,
            token: TokenCache::new(),
            provider_factory: Box::new(|credentials| ntlm::platform_provider(credentials)),
        })
    }

    /// Replace the challenge-response provider used for
    /// [`ClientAuth::Ntlm`] requests. The factory is invoked once per
    /// request; providers are never reused across handshakes.
    #[must_use]
    pub fn with_challenge_response_provider<F>(mut self, factory: F) -> Self
    where
        F: Fn(&UserCredential) -> Result<Box<dyn ChallengeResponseProvider>, TssError>
            + Send
            + Sync
            + 'static,
    {
        self.provider_factory = Box::new(factory);
        self
    }

    /// Fetch the secret with the given id, substituting file attachment
    /// contents for the dummy field values.
    ///
    /// # Errors
    ///
    /// [`TssError::Auth`] on a rejected grant, [`TssError::Protocol`] /
    /// [`TssError::UnsupportedCapability`] on handshake failures,
    /// [`TssError::Api`] / [`TssError::Json`] on a failed or malformed
    /// response.
    pub async fn secret(&self, id: i64) -> Result<Secret, TssError> {
        debug!(id, "fetching secret");
        let body = self.get_text(&self.resource_url(&format!("secrets/{id}"))).await?;
        let mut secret: Secret = serde_json::from_str(&body)?;

        for field in &mut secret.fields {
            if field.is_file && field.file_attachment_id != 0 && !field.filename.is_empty() {
                let url = self.resource_url(&format!("secrets/{id}/fields/{}", field.slug));
                field.item_value = self.get_text(&url).await?;
            }
        }

        Ok(secret)
    }

    fn resource_url(&self, path: &str) -> String {
        format!(
            "{}/{DEFAULT_API_PATH_URI}/{path}",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn get_text(&self, url: &str) -> Result<String, TssError> {
        debug!(%url, "calling API");
        let response = match &self.auth {
            ClientAuth::PasswordGrant { username, password } => {
                let token = self.bearer_token(username, password).await?;
                self.http.get(url).bearer_auth(token).send().await?
            }
            ClientAuth::Ntlm(credentials) => {
                let mut provider = (self.provider_factory)(credentials)?;
                let parsed = Url::parse(url)
                    .map_err(|err| TssError::Config(format!("invalid request URL: {err}")))?;
                ntlm::handshake(&self.http, provider.as_mut(), Method::GET, parsed, None).await?
            }
        };

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        Ok(body)
    }

    /// Reuse the cached token or run a fresh password grant.
    async fn bearer_token(&self, username: &str, password: &str) -> Result<String, TssError> {
        let key = cache_key(&self.base_url);
        if let Some(entry) = self.token.get(&key).await {
            return Ok(entry.access_token);
        }

        let lock = self.token.acquisition_lock(&key).await;
        let _guard = lock.lock().await;
        if let Some(entry) = self.token.get(&key).await {
            return Ok(entry.access_token);
        }

        let url = format!(
            "{}/{DEFAULT_TOKEN_PATH_URI}",
            self.base_url.trim_end_matches('/')
        );
        debug!(%url, "requesting password grant");
        let form = [
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ];
        let response = self.http.post(&url).form(&form).send().await?;
        let grant = parse_grant_response(response).await?;

        let entry = self.token.set(&key, &grant.access_token, grant.expires_in).await;
        Ok(entry.access_token)
    }
}
