//! Token acquisition: grant flows and platform vault resolution.
//!
//! `acquire_token` is the single entry point. A static token bypasses
//! everything; otherwise the cache is consulted, the deployment mode is
//! derived from live health probes, and the matching grant flow runs. The
//! whole miss → probe → grant → cache sequence holds the per-key acquisition
//! lock so concurrent misses collapse into one grant request.

use std::time::Instant;

use serde::Deserialize;
use tracing::debug;

use crate::auth::cache::{cache_key, CachedToken};
use crate::auth::health::{self, DeploymentMode};
use crate::error::TssError;
use crate::server::api_error;
use crate::Server;

/// Fixed scope of the platform client-credentials grant.
const PLATFORM_SCOPE: &str = "xpmheadless";

/// Platform identity token endpoint, relative to the base URL.
const PLATFORM_TOKEN_PATH: &str = "identity/api/oauth2/token/xpmplatform";

/// Vault listing endpoint, relative to the base URL.
const VAULT_BROKER_PATH: &str = "vaultbroker/api/vaults";

/// Wire shape of a successful grant response. The backend also sends
/// `refresh_token` and `token_type`; neither drives anything here, so they
/// are left to serde's unknown-field handling.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
    pub(crate) expires_in: u64,
}

#[derive(Deserialize)]
struct TokenErrorBody {
    #[serde(default)]
    error: String,
}

/// A vault behind an identity-platform deployment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Vault {
    /// Vault identifier.
    pub vault_id: String,
    /// Display name.
    pub name: String,
    /// Vault type.
    #[serde(rename = "type")]
    pub vault_type: String,
    /// Whether this vault is the tenant default.
    pub is_default: bool,
    /// Whether this vault is the global default.
    pub is_global_default: bool,
    /// Whether this vault is active.
    pub is_active: bool,
    /// Connection details for the vault.
    pub connection: VaultConnection,
}

/// Connection details of a [`Vault`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultConnection {
    /// Base URL of the vault's Secret Server.
    pub url: String,
    /// OAuth profile associated with the connection.
    pub o_auth_profile_id: String,
}

#[derive(Deserialize)]
struct VaultsResponse {
    #[serde(default)]
    vaults: Vec<Vault>,
}

/// A resolved bearer token handed to the dispatcher.
pub(crate) struct AccessToken {
    pub(crate) token: String,
    /// Issue instant for compare-and-clear. `None` for static tokens, which
    /// never live in the cache.
    pub(crate) issued_at: Option<Instant>,
}

impl From<CachedToken> for AccessToken {
    fn from(entry: CachedToken) -> Self {
        Self {
            token: entry.access_token,
            issued_at: Some(entry.issued_at),
        }
    }
}

/// Selection rule: the first vault that is both default and active wins.
/// No other fallback.
fn select_default_vault(vaults: &[Vault]) -> Option<&Vault> {
    vaults.iter().find(|v| v.is_default && v.is_active)
}

impl Server {
    /// Resolve a bearer token for the configured backend.
    ///
    /// A static credential token is returned as-is without any network call.
    /// Otherwise the token cache is consulted, and on a miss the deployment
    /// mode is derived from health probes and the matching grant flow runs.
    ///
    /// # Errors
    ///
    /// - [`TssError::InvalidDeployment`] when neither health probe reports
    ///   healthy.
    /// - [`TssError::Auth`] when a grant is rejected or malformed.
    /// - [`TssError::NoVaultFound`] when platform discovery yields no
    ///   default, active vault.
    /// - [`TssError::Network`] on transport failures of the grant endpoints.
    pub(crate) async fn acquire_token(&self) -> Result<AccessToken, TssError> {
        if !self.config.credentials.token.is_empty() {
            return Ok(AccessToken {
                token: self.config.credentials.token.clone(),
                issued_at: None,
            });
        }

        let base_url = self.configured_base_url();
        let key = cache_key(&base_url);

        if let Some(entry) = self.token_cache.get(&key).await {
            return Ok(entry.into());
        }

        let lock = self.token_cache.acquisition_lock(&key).await;
        let _guard = lock.lock().await;

        // Another caller may have finished its grant while we waited.
        if let Some(entry) = self.token_cache.get(&key).await {
            return Ok(entry.into());
        }

        match health::detect(&self.http, &base_url).await {
            DeploymentMode::OnPremOrCloud => {
                self.password_grant(&base_url, &key).await.map(Into::into)
            }
            DeploymentMode::Platform => {
                self.platform_grant(&base_url, &key).await.map(Into::into)
            }
            DeploymentMode::Unknown => Err(TssError::InvalidDeployment { base_url }),
        }
    }

    /// Resource-owner password grant against the token endpoint.
    async fn password_grant(&self, base_url: &str, key: &str) -> Result<CachedToken, TssError> {
        let url = self.token_url(base_url);
        debug!(%url, "requesting password grant");

        let creds = &self.config.credentials;
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "password"),
            ("username", &creds.username),
            ("password", &creds.password),
        ];
        if !creds.domain.is_empty() {
            form.push(("domain", &creds.domain));
        }

        let response = self.http.post(&url).form(&form).send().await?;
        let grant = parse_grant_response(response).await?;
        Ok(self
            .token_cache
            .set(key, &grant.access_token, grant.expires_in)
            .await)
    }

    /// Client-credentials grant against the platform identity endpoint,
    /// followed by vault resolution and URL pinning.
    async fn platform_grant(&self, base_url: &str, key: &str) -> Result<CachedToken, TssError> {
        let url = format!("{}/{PLATFORM_TOKEN_PATH}", base_url.trim_end_matches('/'));
        debug!(%url, "requesting platform client-credentials grant");

        let creds = &self.config.credentials;
        let form: [(&str, &str); 4] = [
            ("grant_type", "client_credentials"),
            ("client_id", &creds.username),
            ("client_secret", &creds.password),
            ("scope", PLATFORM_SCOPE),
        ];

        let response = self.http.post(&url).form(&form).send().await?;
        let grant = parse_grant_response(response).await?;

        // The vault is re-resolved on every fresh grant. Intentional
        // re-validation: the active vault can move between grants. The token
        // is cached only once a vault is pinned, so a failed resolution
        // leaves the next acquisition on the full grant-and-resolve path.
        let vault_url = self.resolve_vault(&grant.access_token, base_url).await?;
        debug!(%vault_url, "pinned platform vault");
        *self.pinned_vault_url.write().await = Some(vault_url);

        Ok(self
            .token_cache
            .set(key, &grant.access_token, grant.expires_in)
            .await)
    }

    /// Discover the active vault behind a platform deployment.
    async fn resolve_vault(&self, token: &str, base_url: &str) -> Result<String, TssError> {
        let url = format!("{}/{VAULT_BROKER_PATH}", base_url.trim_end_matches('/'));
        debug!(%url, "listing vaults");

        let response = self.http.get(&url).bearer_auth(token).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }

        let listing: VaultsResponse = serde_json::from_str(&body)?;
        select_default_vault(&listing.vaults)
            .map(|v| v.connection.url.clone())
            .filter(|u| !u.is_empty())
            .ok_or(TssError::NoVaultFound)
    }
}

/// Parse a grant response: non-200 bodies are mined for an `error` field,
/// malformed success bodies surface as auth errors.
pub(crate) async fn parse_grant_response(
    response: reqwest::Response,
) -> Result<TokenResponse, TssError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<TokenErrorBody>(&body)
            .ok()
            .map(|b| b.error)
            .filter(|e| !e.is_empty())
            .map_or_else(
                || "received a non-200 response during the token grant".to_owned(),
                |e| format!("error getting token: {e}"),
            );
        return Err(TssError::Auth(message));
    }

    serde_json::from_str(&body)
        .map_err(|err| TssError::Auth(format!("malformed grant response: {err}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn vault(is_default: bool, is_active: bool, url: &str) -> Vault {
        Vault {
            is_default,
            is_active,
            connection: VaultConnection {
                url: url.to_owned(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn first_default_active_vault_wins() {
        let vaults = [
            vault(true, false, "https://inactive.example.com"),
            vault(true, true, "https://second.example.com"),
            vault(true, true, "https://third.example.com"),
        ];
        let selected = select_default_vault(&vaults);
        assert_eq!(
            selected.map(|v| v.connection.url.as_str()),
            Some("https://second.example.com")
        );
    }

    #[test]
    fn no_matching_vault_selects_nothing() {
        let vaults = [
            vault(false, true, "https://a.example.com"),
            vault(true, false, "https://b.example.com"),
        ];
        assert!(select_default_vault(&vaults).is_none());
        assert!(select_default_vault(&[]).is_none());
    }

    #[test]
    fn vault_listing_deserializes() {
        let body = r#"{
            "vaults": [{
                "vaultId": "8f9bc736",
                "name": "Default Vault",
                "type": "SecretServer",
                "isDefault": true,
                "isGlobalDefault": false,
                "isActive": true,
                "connection": {
                    "url": "https://vault.example.com",
                    "oAuthProfileId": "profile-1"
                }
            }]
        }"#;
        let listing: VaultsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(listing.vaults.len(), 1);
        let v = &listing.vaults[0];
        assert_eq!(v.vault_id, "8f9bc736");
        assert!(v.is_default && v.is_active);
        assert_eq!(v.connection.url, "https://vault.example.com");
        assert_eq!(v.connection.o_auth_profile_id, "profile-1");
    }

    #[test]
    fn grant_response_requires_access_token() {
        let ok: Result<TokenResponse, _> =
            serde_json::from_str(r#"{"access_token":"abc","expires_in":1200}"#);
        assert!(ok.is_ok());

        let missing: Result<TokenResponse, _> = serde_json::from_str(r#"{"expires_in":1200}"#);
        assert!(missing.is_err());
    }
}
