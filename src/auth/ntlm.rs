//! Windows-integrated NTLM authentication.
//!
//! A three-message handshake negotiated per request: probe, negotiate,
//! authenticate. The handshake is strictly sequential and never resumed
//! across requests — any failure discards all partial state and the next
//! call starts from scratch.
//!
//! The message cryptography itself is delegated to a
//! [`ChallengeResponseProvider`]. On Windows the provider is backed by the
//! OS security interface; everywhere else the explicit
//! [`UnsupportedProvider`] turns any attempt into a typed error instead of
//! aborting the process.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode, Url};
use tracing::debug;

use crate::error::TssError;
use crate::UserCredential;

/// REST path prefix served by the token-authenticated surface.
const REST_PATH_PREFIX: &str = "/api/v1";

/// Path prefix of the NTLM-protected service surface.
const WINAUTH_PATH_PREFIX: &str = "/winauthwebservices/api/v1";

/// Local capability computing the NTLM message legs.
///
/// Implementations hold ephemeral per-request state (credentials handle and
/// security context); a provider instance must not be reused across requests.
pub trait ChallengeResponseProvider: Send {
    /// Whether the underlying security capability is available.
    fn is_supported(&self) -> bool {
        true
    }

    /// Produce the Type-1 negotiate message.
    ///
    /// # Errors
    ///
    /// Returns an error when the local security context cannot be set up.
    fn negotiate(&mut self) -> Result<Vec<u8>, TssError>;

    /// Produce the Type-3 authenticate message from the server's Type-2
    /// challenge.
    ///
    /// # Errors
    ///
    /// Returns an error when the challenge is rejected by the local security
    /// context.
    fn challenge_response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, TssError>;
}

/// Provider used on platforms without the OS security capability. Every
/// operation fails with [`TssError::UnsupportedCapability`].
pub struct UnsupportedProvider;

impl ChallengeResponseProvider for UnsupportedProvider {
    fn is_supported(&self) -> bool {
        false
    }

    fn negotiate(&mut self) -> Result<Vec<u8>, TssError> {
        Err(TssError::UnsupportedCapability)
    }

    fn challenge_response(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, TssError> {
        Err(TssError::UnsupportedCapability)
    }
}

/// Select the platform's challenge-response provider.
#[cfg(windows)]
pub(crate) fn platform_provider(
    credentials: &UserCredential,
) -> Result<Box<dyn ChallengeResponseProvider>, TssError> {
    Ok(Box::new(crate::auth::sspi::SspiProvider::new(
        &credentials.domain,
        &credentials.username,
        &credentials.password,
    )?))
}

/// Select the platform's challenge-response provider.
#[cfg(not(windows))]
pub(crate) fn platform_provider(
    _credentials: &UserCredential,
) -> Result<Box<dyn ChallengeResponseProvider>, TssError> {
    Ok(Box::new(UnsupportedProvider))
}

/// Rewrite a REST-API path to the NTLM-protected service path.
///
/// The NTLM surface lives under its own prefix; the rewrite happens once,
/// before the probe leg.
pub(crate) fn rewrite_winauth_path(url: &mut Url) {
    let path = url.path().to_owned();
    if let Some(rest) = path.strip_prefix(REST_PATH_PREFIX) {
        url.set_path(&format!("{WINAUTH_PATH_PREFIX}{rest}"));
    }
}

fn protocol_error(stage: &'static str, reason: impl Into<String>) -> TssError {
    TssError::Protocol {
        stage,
        reason: reason.into(),
    }
}

/// Run the three-leg handshake and return the response to the replayed
/// original request.
///
/// # Errors
///
/// - [`TssError::UnsupportedCapability`] before any network call when the
///   provider lacks the OS capability.
/// - [`TssError::Protocol`] on any shape violation: wrong probe status,
///   missing or duplicated `WWW-Authenticate` headers, bad prefix, or a
///   challenge that is not valid base64.
/// - [`TssError::Network`] on transport failures.
pub(crate) async fn handshake(
    http: &reqwest::Client,
    provider: &mut dyn ChallengeResponseProvider,
    method: Method,
    url: Url,
    body: Option<serde_json::Value>,
) -> Result<reqwest::Response, TssError> {
    if !provider.is_supported() {
        return Err(TssError::UnsupportedCapability);
    }

    let mut url = url;
    rewrite_winauth_path(&mut url);

    // Leg 1: unauthenticated probe. The server must demand NTLM.
    debug!(%url, "NTLM probe");
    let probe = http.get(url.clone()).send().await?;
    if probe.status() != StatusCode::UNAUTHORIZED {
        return Err(protocol_error(
            "probe",
            format!("expected 401, got {}", probe.status()),
        ));
    }
    let demands_ntlm = probe
        .headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .any(|v| v.to_str().is_ok_and(|s| s.trim() == "NTLM"));
    if !demands_ntlm {
        return Err(protocol_error(
            "probe",
            "server did not offer NTLM authentication",
        ));
    }

    // Leg 2: negotiate. Send the Type-1 message, require a single
    // well-formed challenge header back.
    let negotiate = provider.negotiate()?;
    debug!(%url, "NTLM negotiate");
    let response = http
        .get(url.clone())
        .header(AUTHORIZATION, format!("NTLM {}", BASE64.encode(&negotiate)))
        .send()
        .await?;
    let challenge = extract_challenge(&response)?;

    // Leg 3: authenticate. The Type-3 message goes on the original request,
    // which is replayed through the underlying transport.
    let authenticate = provider.challenge_response(&challenge)?;
    debug!(%url, "NTLM authenticate");
    let mut request = http.request(method, url).header(
        AUTHORIZATION,
        format!("NTLM {}", BASE64.encode(&authenticate)),
    );
    if let Some(body) = body {
        request = request.json(&body);
    }
    Ok(request.send().await?)
}

/// Pull the Type-2 challenge out of the negotiate response. Exactly one
/// `WWW-Authenticate` header of the form `NTLM <base64>` is required.
fn extract_challenge(response: &reqwest::Response) -> Result<Vec<u8>, TssError> {
    let mut values = response.headers().get_all(WWW_AUTHENTICATE).iter();
    let (first, extra) = (values.next(), values.next());
    if extra.is_some() {
        return Err(protocol_error(
            "negotiate",
            "expected exactly one WWW-Authenticate header, got several",
        ));
    }
    let Some(value) = first else {
        return Err(protocol_error(
            "negotiate",
            "response carries no WWW-Authenticate header",
        ));
    };
    let value = value
        .to_str()
        .map_err(|_| protocol_error("negotiate", "WWW-Authenticate header is not valid text"))?;
    if value.len() < 6 || !value.starts_with("NTLM ") {
        return Err(protocol_error(
            "negotiate",
            format!("malformed NTLM challenge header: {value:?}"),
        ));
    }
    BASE64
        .decode(&value[5..])
        .map_err(|err| protocol_error("negotiate", format!("challenge is not valid base64: {err}")))
}
