mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use common::*;
use mcp_auth_proxy::{
    gate::Rejection, AuthError, AuthGate, ClientTransportKind, JwksCache, MetadataPublisher,
    ProxyState, StdioServerParameters, TokenVerifier,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn verifier(server: &MockServer) -> TokenVerifier {
    let cache = JwksCache::new(Duration::from_secs(600), Duration::from_secs(5)).unwrap();
    TokenVerifier::new(issuer_config(server), Arc::new(cache))
}

#[tokio::test]
async fn valid_token_yields_principal() {
    let server = issuer_with(&[jwk_a()]).await;
    let verifier = verifier(&server);

    let principal = verifier.verify(&token("alice")).await.unwrap();
    assert_eq!(principal.subject, "alice");
    assert_eq!(principal.issuer, ISSUER);
    assert!(principal.has_scope("mcp:read"));
    assert!(!principal.is_expired());
}

#[tokio::test]
async fn expired_and_future_tokens_are_rejected() {
    let server = issuer_with(&[jwk_a()]).await;
    let verifier = verifier(&server);

    let mut expired = claims("alice");
    expired.insert("exp".into(), json!(mcp_auth_proxy::utils::unix_now() - 3600));
    assert_eq!(
        verifier.verify(&sign(KEY_A_ID, KEY_A_PEM, &expired)).await,
        Err(AuthError::Expired)
    );

    let mut early = claims("alice");
    early.insert("nbf".into(), json!(mcp_auth_proxy::utils::unix_now() + 3600));
    assert_eq!(
        verifier.verify(&sign(KEY_A_ID, KEY_A_PEM, &early)).await,
        Err(AuthError::NotYetValid)
    );
}

#[tokio::test]
async fn audience_and_issuer_must_match() {
    let server = issuer_with(&[jwk_a()]).await;
    let verifier = verifier(&server);

    let mut other_audience = claims("alice");
    other_audience.insert("aud".into(), json!("https://elsewhere.example.com"));
    assert_eq!(
        verifier
            .verify(&sign(KEY_A_ID, KEY_A_PEM, &other_audience))
            .await,
        Err(AuthError::AudienceMismatch)
    );

    let mut other_issuer = claims("alice");
    other_issuer.insert("iss".into(), json!("https://evil.example.com"));
    assert_eq!(
        verifier.verify(&sign(KEY_A_ID, KEY_A_PEM, &other_issuer)).await,
        Err(AuthError::IssuerMismatch)
    );
}

#[tokio::test]
async fn unsigned_and_symmetric_tokens_are_refused_before_key_lookup() {
    let server = issuer_with(&[jwk_a()]).await;
    let verifier = verifier(&server);

    let payload = URL_SAFE_NO_PAD.encode(Value::Object(claims("alice")).to_string());
    let none_header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
    let unsigned = format!("{none_header}.{payload}.");
    assert!(matches!(
        verifier.verify(&unsigned).await,
        Err(AuthError::SignatureInvalid(_))
    ));

    let hs256 = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims("alice"),
        &jsonwebtoken::EncodingKey::from_secret(b"shared-secret"),
    )
    .unwrap();
    assert!(matches!(
        verifier.verify(&hs256).await,
        Err(AuthError::SignatureInvalid(_))
    ));

    assert_eq!(verifier.cache().fetch_count(), 0);
}

#[tokio::test]
async fn tampered_and_malformed_tokens() {
    let server = issuer_with(&[jwk_a()]).await;
    let verifier = verifier(&server);

    // Signed by key B but claiming to be key A.
    let forged = sign(KEY_A_ID, KEY_B_PEM, &claims("mallory"));
    assert!(matches!(
        verifier.verify(&forged).await,
        Err(AuthError::SignatureInvalid(_))
    ));

    assert!(matches!(
        verifier.verify("not-a-jwt").await,
        Err(AuthError::MalformedToken(_))
    ));
}

#[tokio::test]
async fn unknown_key_id_after_one_refresh() {
    let server = issuer_with(&[jwk_a()]).await;
    let verifier = verifier(&server);

    let result = verifier
        .verify(&sign(KEY_B_ID, KEY_B_PEM, &claims("bob")))
        .await;
    assert_eq!(result, Err(AuthError::UnknownKey(Some(KEY_B_ID.to_string()))));
    assert_eq!(verifier.cache().fetch_count(), 2);
}

#[tokio::test]
async fn repeated_unknown_key_ids_do_not_hammer_the_issuer() {
    let server = issuer_with(&[jwk_a()]).await;
    let verifier = verifier(&server);

    let unknown = sign(KEY_B_ID, KEY_B_PEM, &claims("bob"));
    for _ in 0..5 {
        assert_eq!(
            verifier.verify(&unknown).await,
            Err(AuthError::UnknownKey(Some(KEY_B_ID.to_string())))
        );
    }
    // The initial fetch plus a single forced refresh.
    assert_eq!(verifier.cache().fetch_count(), 2);
}

#[tokio::test]
async fn rotated_key_is_fetched_once_for_concurrent_requests() {
    let server = issuer_with(&[jwk_a()]).await;
    let verifier = Arc::new(verifier(&server));

    verifier.verify(&token("alice")).await.unwrap();
    assert_eq!(verifier.cache().fetch_count(), 1);

    // The issuer rotates in key B.
    server.reset().await;
    mount_jwks(&server, &[jwk_a(), jwk_b()]).await;

    let rotated = sign(KEY_B_ID, KEY_B_PEM, &claims("bob"));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let verifier = verifier.clone();
            let rotated = rotated.clone();
            tokio::spawn(async move { verifier.verify(&rotated).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().subject, "bob");
    }

    assert_eq!(verifier.cache().fetch_count(), 2);
}

#[tokio::test]
async fn unreachable_issuer_is_an_upstream_fault() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let verifier = verifier(&server);

    let err = verifier.verify(&token("alice")).await.unwrap_err();
    assert!(matches!(err, AuthError::IssuerUnreachable(_)));
    assert!(err.is_upstream_fault());
}

#[tokio::test]
async fn gate_parses_bearer_credentials() {
    let server = issuer_with(&[jwk_a()]).await;
    let gate = AuthGate::new(Arc::new(verifier(&server)), "https://mcp.example.com/meta");

    assert_eq!(
        gate.authorize_credentials(None).await,
        Err(Rejection::MissingHeader)
    );
    assert!(matches!(
        gate.authorize_credentials(Some("Basic Zm9vOmJhcg==")).await,
        Err(Rejection::MalformedHeader(_))
    ));
    let principal = gate
        .authorize_credentials(Some(&format!("bearer {}", token("carol"))))
        .await
        .unwrap();
    assert_eq!(principal.subject, "carol");

    let challenge = gate.challenge(&Rejection::Invalid(AuthError::Expired));
    assert!(challenge.starts_with("Bearer resource_metadata=\"https://mcp.example.com/meta\""));
    assert!(challenge.contains("error=\"invalid_token\""));
}

#[tokio::test]
async fn challenge_points_at_the_published_metadata() {
    let server = issuer_with(&[jwk_a()]).await;
    let config = proxy_config(
        &server,
        ClientTransportKind::Sse,
        mcp_auth_proxy::BackendTarget::Stdio(StdioServerParameters::new("cat")),
    );
    let state = ProxyState::new(config).unwrap();
    let app = mcp_auth_proxy::router(&state);

    let mut expired = claims("alice");
    expired.insert("exp".into(), json!(mcp_auth_proxy::utils::unix_now() - 3600));
    let response = app
        .clone()
        .oneshot(
            Request::get("/sse")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", sign(KEY_A_ID, KEY_A_PEM, &expired)),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let metadata_url = challenge
        .split("resource_metadata=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap()
        .to_string();
    assert_eq!(
        metadata_url,
        "https://mcp.example.com/.well-known/oauth-protected-resource/mcp"
    );

    // The advertised URL resolves on this router.
    let metadata_path = url::Url::parse(&metadata_url).unwrap().path().to_string();
    let response = app
        .clone()
        .oneshot(Request::get(metadata_path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let document: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(document["resource"], json!(RESOURCE));
    assert_eq!(document["authorization_servers"], json!([ISSUER]));

    let publisher = MetadataPublisher::new(&state.config().resource, &state.config().issuer).unwrap();
    assert_eq!(body, publisher.body());

    // Health stays outside the gate.
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rejected_requests_never_reach_the_backend() {
    let server = issuer_with(&[jwk_a()]).await;
    let config = proxy_config(
        &server,
        ClientTransportKind::StreamableHttp,
        mcp_auth_proxy::BackendTarget::Stdio(StdioServerParameters::new("cat")),
    );
    let state = ProxyState::new(config).unwrap();
    let app = mcp_auth_proxy::router(&state);

    let mut expired = claims("alice");
    expired.insert("exp".into(), json!(mcp_auth_proxy::utils::unix_now() - 3600));
    let response = app
        .oneshot(
            Request::post("/mcp")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", sign(KEY_A_ID, KEY_A_PEM, &expired)),
                )
                .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(state.mux().session_count(), 0);
}

#[tokio::test]
async fn token_expired_within_clock_skew_gets_a_challenge() {
    let server = issuer_with(&[jwk_a()]).await;
    let config = proxy_config(
        &server,
        ClientTransportKind::Sse,
        mcp_auth_proxy::BackendTarget::Stdio(StdioServerParameters::new("cat")),
    );
    let state = ProxyState::new(config).unwrap();
    let app = mcp_auth_proxy::router(&state);

    // Inside the default skew, so the signature check alone would pass it.
    let mut just_expired = claims("alice");
    just_expired.insert("exp".into(), json!(mcp_auth_proxy::utils::unix_now() - 10));
    let response = app
        .oneshot(
            Request::get("/sse")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", sign(KEY_A_ID, KEY_A_PEM, &just_expired)),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .expect("rejection should carry a challenge")
        .to_str()
        .unwrap();
    assert!(challenge.contains("error=\"invalid_token\""));
    assert!(challenge.contains("Token has expired"));
    assert_eq!(state.mux().session_count(), 0);
}
