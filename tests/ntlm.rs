//! Windows-integrated handshake tests with a scripted challenge-response
//! provider and a mock NTLM endpoint.

#![allow(clippy::unwrap_used)]

use axum::body::Body;
use axum::extract::Path;
use axum::http::{HeaderMap, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tokio::net::TcpListener;

use tss_sdk::{
    ChallengeResponseProvider, Client, ClientAuth, TssError, UnsupportedProvider, UserCredential,
};

const NEGOTIATE: &[u8] = b"negotiate-token";
const CHALLENGE: &[u8] = b"challenge-token";
const AUTHENTICATE: &[u8] = b"authenticate-token";

/// Deterministic provider standing in for the OS security interface.
struct ScriptedProvider;

impl ChallengeResponseProvider for ScriptedProvider {
    fn negotiate(&mut self) -> Result<Vec<u8>, TssError> {
        Ok(NEGOTIATE.to_vec())
    }

    fn challenge_response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, TssError> {
        assert_eq!(challenge, CHALLENGE);
        Ok(AUTHENTICATE.to_vec())
    }
}

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

fn ntlm_client(base: &str) -> Client {
    Client::new(base, ClientAuth::Ntlm(UserCredential::default()))
        .unwrap()
        .with_challenge_response_provider(|_| Ok(Box::new(ScriptedProvider)))
}

fn ntlm_payload(headers: &HeaderMap) -> Option<Vec<u8>> {
    let value = headers.get("authorization")?.to_str().ok()?;
    BASE64.decode(value.strip_prefix("NTLM ")?).ok()
}

/// A well-behaved NTLM endpoint: demands NTLM on the probe, answers the
/// negotiate message with a challenge, and serves the authenticated request.
async fn winauth_secret(Path(id): Path<i64>, headers: HeaderMap) -> Response<Body> {
    match ntlm_payload(&headers).as_deref() {
        None => Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header("WWW-Authenticate", "NTLM")
            .body(Body::empty())
            .unwrap(),
        Some(NEGOTIATE) => Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(
                "WWW-Authenticate",
                format!("NTLM {}", BASE64.encode(CHALLENGE)),
            )
            .body(Body::empty())
            .unwrap(),
        Some(AUTHENTICATE) => Json(json!({
            "ID": id,
            "Name": "win",
            "Items": [{"FieldName": "Password", "Slug": "password", "ItemValue": "s3cret"}],
        }))
        .into_response(),
        Some(_) => (StatusCode::FORBIDDEN, "").into_response(),
    }
}

#[tokio::test]
async fn the_three_leg_handshake_fetches_the_secret() {
    let app = Router::new().route(
        "/winauthwebservices/api/v1/secrets/{id}",
        get(winauth_secret),
    );
    let base = spawn(app).await;

    let secret = ntlm_client(&base).secret(12).await.unwrap();
    assert_eq!(secret.id, 12);
    assert_eq!(secret.field("password"), Some("s3cret"));
}

#[tokio::test]
async fn a_successful_probe_status_is_a_protocol_violation() {
    let app = Router::new().route(
        "/winauthwebservices/api/v1/secrets/{id}",
        get(|| async { Json(json!({"ID": 1})) }),
    );
    let base = spawn(app).await;

    let err = ntlm_client(&base).secret(1).await.unwrap_err();
    assert!(matches!(err, TssError::Protocol { stage: "probe", .. }));
}

#[tokio::test]
async fn a_probe_that_does_not_offer_ntlm_is_rejected() {
    let app = Router::new().route(
        "/winauthwebservices/api/v1/secrets/{id}",
        get(|| async {
            Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header("WWW-Authenticate", "Basic realm=\"tss\"")
                .body(Body::empty())
                .unwrap()
        }),
    );
    let base = spawn(app).await;

    let err = ntlm_client(&base).secret(1).await.unwrap_err();
    assert!(matches!(err, TssError::Protocol { stage: "probe", .. }));
}

#[tokio::test]
async fn a_missing_challenge_header_is_a_protocol_violation() {
    let app = Router::new().route(
        "/winauthwebservices/api/v1/secrets/{id}",
        get(|headers: HeaderMap| async move {
            if ntlm_payload(&headers).is_none() {
                Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .header("WWW-Authenticate", "NTLM")
                    .body(Body::empty())
                    .unwrap()
            } else {
                // Negotiate leg: 401 with no challenge at all.
                Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .body(Body::empty())
                    .unwrap()
            }
        }),
    );
    let base = spawn(app).await;

    let err = ntlm_client(&base).secret(1).await.unwrap_err();
    assert!(matches!(err, TssError::Protocol { stage: "negotiate", .. }));
}

#[tokio::test]
async fn duplicated_challenge_headers_are_a_protocol_violation() {
    let app = Router::new().route(
        "/winauthwebservices/api/v1/secrets/{id}",
        get(|headers: HeaderMap| async move {
            if ntlm_payload(&headers).is_none() {
                Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .header("WWW-Authenticate", "NTLM")
                    .body(Body::empty())
                    .unwrap()
            } else {
                Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .header("WWW-Authenticate", "NTLM QUFBQQ==")
                    .header("WWW-Authenticate", "NTLM QkJCQg==")
                    .body(Body::empty())
                    .unwrap()
            }
        }),
    );
    let base = spawn(app).await;

    let err = ntlm_client(&base).secret(1).await.unwrap_err();
    assert!(matches!(err, TssError::Protocol { stage: "negotiate", .. }));
}

#[tokio::test]
async fn a_malformed_challenge_header_is_a_protocol_violation() {
    for bad_header in ["NTLM", "Basic QUFBQQ==", "NTLM !!!not-base64!!!"] {
        let header = bad_header.to_owned();
        let app = Router::new().route(
            "/winauthwebservices/api/v1/secrets/{id}",
            get(move |headers: HeaderMap| {
                let header = header.clone();
                async move {
                    if ntlm_payload(&headers).is_none() {
                        Response::builder()
                            .status(StatusCode::UNAUTHORIZED)
                            .header("WWW-Authenticate", "NTLM")
                            .body(Body::empty())
                            .unwrap()
                    } else {
                        Response::builder()
                            .status(StatusCode::UNAUTHORIZED)
                            .header("WWW-Authenticate", header)
                            .body(Body::empty())
                            .unwrap()
                    }
                }
            }),
        );
        let base = spawn(app).await;

        let err = ntlm_client(&base).secret(1).await.unwrap_err();
        assert!(
            matches!(err, TssError::Protocol { stage: "negotiate", .. }),
            "header {bad_header:?} produced {err:?}"
        );
    }
}

#[tokio::test]
async fn an_unsupported_provider_fails_before_any_network_call() {
    // The base URL points nowhere routable; a network attempt would surface
    // as a transport error instead of the capability error.
    let client = Client::new(
        "http://127.0.0.1:9",
        ClientAuth::Ntlm(UserCredential::default()),
    )
    .unwrap()
    .with_challenge_response_provider(|_| Ok(Box::new(UnsupportedProvider)));

    let err = client.secret(1).await.unwrap_err();
    assert!(matches!(err, TssError::UnsupportedCapability));
}
