//! The [`Server`] client: configuration validation, URL construction, and
//! authenticated dispatch.
//!
//! All resource traffic flows through `access_resource`, which resolves a
//! bearer token (see [`crate::auth::grant`]), attaches it, and watches for
//! 401/403 responses — those clear the token cache so the *next* acquisition
//! performs a fresh grant. No in-call retry is attempted.

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::auth::cache::{cache_key, TokenCache};
use crate::auth::grant::AccessToken;
use crate::error::TssError;
use crate::secret::SecretField;
use crate::{
    cloud_base_url, Configuration, DEFAULT_API_PATH_URI, DEFAULT_TLD, DEFAULT_TOKEN_PATH_URI,
};

/// Resource segment for secrets.
pub(crate) const SECRETS_RESOURCE: &str = "secrets";

/// Resource segment for secret templates.
pub(crate) const TEMPLATES_RESOURCE: &str = "secret-templates";

/// Provides access to secrets stored in Delinea Secret Server.
pub struct Server {
    pub(crate) config: Configuration,
    pub(crate) http: reqwest::Client,
    pub(crate) token_cache: Arc<TokenCache>,
    /// Vault URL pinned by the platform grant flow. Resource requests use it
    /// in place of the configured base URL for the rest of the session.
    pub(crate) pinned_vault_url: RwLock<Option<String>>,
}

impl Server {
    /// Create a client with a private token cache.
    ///
    /// # Errors
    ///
    /// Returns [`TssError::Config`] unless exactly one of `server_url` and
    /// `tenant` is set, or [`TssError::Network`] when the HTTP client cannot
    /// be built from the TLS settings.
    pub fn new(config: Configuration) -> Result<Self, TssError> {
        Self::with_token_cache(config, Arc::new(TokenCache::new()))
    }

    /// Create a client sharing an injected token cache.
    ///
    /// # Errors
    ///
    /// Same as [`Server::new`].
    pub fn with_token_cache(
        mut config: Configuration,
        token_cache: Arc<TokenCache>,
    ) -> Result<Self, TssError> {
        let has_url = !config.server_url.is_empty();
        let has_tenant = !config.tenant.is_empty();
        if has_url == has_tenant {
            return Err(TssError::Config(
                "either server_url of Secret Server/Platform or tenant of Secret Server Cloud \
                 must be set"
                    .to_owned(),
            ));
        }

        if config.tld.is_empty() {
            config.tld = DEFAULT_TLD.to_owned();
        }
        if config.api_path_uri.is_empty() {
            config.api_path_uri = DEFAULT_API_PATH_URI.to_owned();
        }
        config.api_path_uri = config.api_path_uri.trim_matches('/').to_owned();
        if config.token_path_uri.is_empty() {
            config.token_path_uri = DEFAULT_TOKEN_PATH_URI.to_owned();
        }
        config.token_path_uri = config.token_path_uri.trim_matches('/').to_owned();

        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(tls) = &config.tls {
            if let Some(pem) = &tls.root_certificate_pem {
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
            }
            if tls.danger_accept_invalid_certs {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }
        let http = builder.build()?;

        Ok(Self {
            config,
            http,
            token_cache,
            pinned_vault_url: RwLock::new(None),
        })
    }

    /// Drop any cached token for the configured backend so the next
    /// acquisition performs a fresh grant. This is what the dispatcher does
    /// when an authenticated call returns 401/403; it is public so callers
    /// and tests can force the same invalidation without a live server.
    pub async fn clear_token_cache(&self) {
        self.token_cache
            .clear(&cache_key(&self.configured_base_url()))
            .await;
    }

    /// The configured backend identity: the server URL, or the cloud URL
    /// built from tenant and TLD. Also the token cache key.
    pub(crate) fn configured_base_url(&self) -> String {
        if self.config.server_url.is_empty() {
            cloud_base_url(&self.config.tenant, &self.config.tld)
        } else {
            self.config.server_url.clone()
        }
    }

    /// Base URL for resource requests: the pinned platform vault when one
    /// has been resolved, the configured identity otherwise.
    pub(crate) async fn effective_base_url(&self) -> String {
        {
            let pinned = self.pinned_vault_url.read().await;
            if let Some(url) = pinned.as_ref() {
                return url.clone();
            }
        }
        self.configured_base_url()
    }

    pub(crate) fn token_url(&self, base_url: &str) -> String {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            self.config.token_path_uri
        )
    }

    fn url_for(&self, base_url: &str, resource: &str, path: &str) -> String {
        let url = format!(
            "{}/{}/{}/{}",
            base_url.trim_end_matches('/'),
            self.config.api_path_uri,
            resource.trim_matches('/'),
            path.trim_matches('/'),
        );
        url.trim_end_matches('/').to_owned()
    }

    fn search_url(&self, base_url: &str, resource: &str, search_text: &str, field: &str) -> String {
        let mut url = format!(
            "{}/{}/{}?paging.filter.searchText={}&paging.filter.searchField={}\
             &paging.filter.doNotCalculateTotal=true&paging.take=30&paging.skip=0",
            base_url.trim_end_matches('/'),
            self.config.api_path_uri,
            resource.trim_matches('/'),
            urlencoding::encode(search_text),
            urlencoding::encode(field),
        );
        if field.is_empty() {
            url.push_str(
                "&paging.filter.extendedFields=Machine&paging.filter.extendedFields=Notes\
                 &paging.filter.extendedFields=Username",
            );
        } else {
            url.push_str("&paging.filter.isExactMatch=true");
        }
        url
    }

    /// Perform an authenticated call against a known resource and return the
    /// raw response body.
    pub(crate) async fn access_resource(
        &self,
        method: Method,
        resource: &str,
        path: &str,
        input: Option<&Value>,
    ) -> Result<String, TssError> {
        if !matches!(resource, SECRETS_RESOURCE | TEMPLATES_RESOURCE) {
            return Err(TssError::Config(format!("unknown resource '{resource}'")));
        }

        let access = self.acquire_token().await?;
        let base_url = self.effective_base_url().await;
        let url = self.url_for(&base_url, resource, path);
        debug!(%method, %url, "calling API");

        let mut request = self.http.request(method, &url).bearer_auth(&access.token);
        if let Some(input) = input {
            request = request.json(input);
        }

        let response = request.send().await?;
        self.handle_response(response, &access).await
    }

    /// Perform an authenticated search against a known resource.
    pub(crate) async fn search_resources(
        &self,
        resource: &str,
        search_text: &str,
        field: &str,
    ) -> Result<String, TssError> {
        if resource != SECRETS_RESOURCE {
            return Err(TssError::Config(format!("unknown resource '{resource}'")));
        }

        let access = self.acquire_token().await?;
        let base_url = self.effective_base_url().await;
        let url = self.search_url(&base_url, resource, search_text, field);
        debug!(%url, "searching API");

        let response = self.http.get(&url).bearer_auth(&access.token).send().await?;
        self.handle_response(response, &access).await
    }

    /// Upload the contents of a file field as a multipart form.
    pub(crate) async fn upload_file(
        &self,
        secret_id: i64,
        field: &SecretField,
    ) -> Result<(), TssError> {
        let filename = ensure_filename(&field.filename);
        debug!(slug = %field.slug, %filename, "uploading a file to the field");

        let access = self.acquire_token().await?;
        let base_url = self.effective_base_url().await;
        let url = self.url_for(
            &base_url,
            SECRETS_RESOURCE,
            &format!("{secret_id}/fields/{}", field.slug),
        );

        let part = reqwest::multipart::Part::text(field.item_value.clone()).file_name(filename);
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .put(&url)
            .bearer_auth(&access.token)
            .multipart(form)
            .send()
            .await?;
        self.handle_response(response, &access).await.map(|_| ())
    }

    /// Common response handling: 401/403 invalidate the cached token (for
    /// the next acquisition, not this call), other failures become
    /// [`TssError::Api`].
    async fn handle_response(
        &self,
        response: reqwest::Response,
        access: &AccessToken,
    ) -> Result<String, TssError> {
        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.invalidate_token(access).await;
        }
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        Ok(body)
    }

    async fn invalidate_token(&self, access: &AccessToken) {
        // Static credential tokens never live in the cache.
        let Some(issued_at) = access.issued_at else {
            return;
        };
        let key = cache_key(&self.configured_base_url());
        self.token_cache
            .clear_if_issued_at_or_before(&key, issued_at)
            .await;
        warn!("token cache cleared after unauthorized or access denied response");
    }
}

/// Build an [`TssError::Api`] from a failed response, preferring a `message`
/// field in the body when one exists.
pub(crate) fn api_error(status: StatusCode, body: &str) -> TssError {
    #[derive(serde::Deserialize)]
    struct ApiErrorBody {
        #[serde(default)]
        message: String,
    }

    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .map(|b| b.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("error response from API (status_code: {})", status.as_u16()));

    TssError::Api {
        status_code: status.as_u16(),
        message,
    }
}

/// Attachment uploads need a plausible filename: empty names become
/// `File.txt`, names without an extension get `.txt` appended.
pub(crate) fn ensure_filename(name: &str) -> String {
    if name.is_empty() {
        return "File.txt".to_owned();
    }
    let has_extension = name.rsplit_once('.').is_some_and(|(stem, ext)| {
        !stem.is_empty()
            && !ext.is_empty()
            && ext.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    });
    if has_extension {
        name.to_owned()
    } else {
        format!("{name}.txt")
    }
}
