//! Deployment-mode detection via health probing.
//!
//! A base URL may point at a self-hosted/cloud Secret Server or at an
//! identity-platform deployment. Each variant exposes its own unauthenticated
//! health endpoint; probing both tells the SDK which grant flow applies. The
//! mode is re-derived from live probes whenever a fresh grant is needed —
//! it is never cached.

use serde::Deserialize;
use tracing::debug;

/// Which backend variant answered its health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// A self-hosted Secret Server or Secret Server Cloud deployment.
    OnPremOrCloud,
    /// An identity-platform deployment fronting one or more vaults.
    Platform,
    /// Neither probe reported healthy. Terminal for the current acquisition.
    Unknown,
}

/// Outcome of a single health probe.
///
/// Legacy health endpoints answer with free text instead of JSON; the
/// substring fallback is kept for compatibility but surfaced as its own
/// variant so the distinction stays visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The endpoint returned JSON with `"healthy": true`.
    HealthyStructured,
    /// The endpoint returned non-JSON text containing the literal `Healthy`.
    HealthyLegacyText,
    /// The endpoint answered but did not report healthy.
    Unhealthy,
    /// The probe could not reach the endpoint.
    Unreachable,
}

impl ProbeOutcome {
    /// Whether this outcome counts as a healthy deployment.
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::HealthyStructured | Self::HealthyLegacyText)
    }
}

/// Health endpoint of on-prem/cloud Secret Server.
const SECRET_SERVER_HEALTH_PATH: &str = "healthcheck.aspx";

/// Health endpoint of the identity platform.
const PLATFORM_HEALTH_PATH: &str = "health";

#[derive(Deserialize)]
struct HealthBody {
    #[serde(default)]
    healthy: bool,
}

/// Classify a health response body.
///
/// JSON takes precedence; a body that fails to parse as JSON falls back to a
/// case-sensitive substring check for the literal text `Healthy`.
fn classify(body: &str) -> ProbeOutcome {
    match serde_json::from_str::<HealthBody>(body) {
        Ok(parsed) if parsed.healthy => ProbeOutcome::HealthyStructured,
        Ok(_) => ProbeOutcome::Unhealthy,
        Err(_) if body.contains("Healthy") => ProbeOutcome::HealthyLegacyText,
        Err(_) => ProbeOutcome::Unhealthy,
    }
}

/// Probe a single health endpoint. Network errors fold into
/// [`ProbeOutcome::Unreachable`] instead of propagating.
async fn probe(http: &reqwest::Client, url: &str) -> ProbeOutcome {
    debug!(url, "probing health endpoint");
    let Ok(response) = http.get(url).send().await else {
        return ProbeOutcome::Unreachable;
    };
    let Ok(body) = response.text().await else {
        return ProbeOutcome::Unreachable;
    };
    classify(&body)
}

/// Detect the deployment mode behind `base_url` with two independent probes.
///
/// The on-prem/cloud probe wins when both variants report healthy.
pub(crate) async fn detect(http: &reqwest::Client, base_url: &str) -> DeploymentMode {
    let base = base_url.trim_end_matches('/');

    let outcome = probe(http, &format!("{base}/{SECRET_SERVER_HEALTH_PATH}")).await;
    debug!(?outcome, "secret server health probe");
    if outcome.is_healthy() {
        return DeploymentMode::OnPremOrCloud;
    }

    let outcome = probe(http, &format!("{base}/{PLATFORM_HEALTH_PATH}")).await;
    debug!(?outcome, "platform health probe");
    if outcome.is_healthy() {
        return DeploymentMode::Platform;
    }

    DeploymentMode::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_healthy_body() {
        let body = r#"{"healthy":true,"databaseHealthy":true}"#;
        assert_eq!(classify(body), ProbeOutcome::HealthyStructured);
    }

    #[test]
    fn structured_unhealthy_body() {
        assert_eq!(classify(r#"{"healthy":false}"#), ProbeOutcome::Unhealthy);
        // JSON that parses but carries no healthy field is not healthy.
        assert_eq!(classify("{}"), ProbeOutcome::Unhealthy);
    }

    #[test]
    fn legacy_text_fallback_is_case_sensitive() {
        assert_eq!(classify("Healthy"), ProbeOutcome::HealthyLegacyText);
        assert_eq!(
            classify("<html>Status: Healthy</html>"),
            ProbeOutcome::HealthyLegacyText
        );
        assert_eq!(classify("healthy"), ProbeOutcome::Unhealthy);
        assert_eq!(classify("<html>down</html>"), ProbeOutcome::Unhealthy);
    }

    #[test]
    fn healthy_outcomes() {
        assert!(ProbeOutcome::HealthyStructured.is_healthy());
        assert!(ProbeOutcome::HealthyLegacyText.is_healthy());
        assert!(!ProbeOutcome::Unhealthy.is_healthy());
        assert!(!ProbeOutcome::Unreachable.is_healthy());
    }
}
