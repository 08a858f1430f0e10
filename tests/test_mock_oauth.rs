//! End-to-end tests for the mock OAuth server over real HTTP.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use muster_test::mock::oauth::{
    GRANT_TOKEN_EXCHANGE, MockOAuthServer, OAuthServerConfig, TOKEN_TYPE_ID_TOKEN, TokenResponse,
    pkce_challenge,
};

use common::free_port;

fn base_config(name: &str) -> OAuthServerConfig {
    OAuthServerConfig {
        name: name.to_string(),
        scopes: vec!["openid".to_string()],
        require_pkce: false,
        auto_approve: true,
        token_lifetime: Duration::from_secs(3600),
        client_id: "muster-test-client".to_string(),
        client_secret: "muster-test-secret".to_string(),
        simulate_error: None,
        use_mock_clock: false,
        trusted_issuers: BTreeMap::new(),
        tls: false,
    }
}

async fn start(config: OAuthServerConfig) -> MockOAuthServer {
    let port = free_port();
    MockOAuthServer::start(config, port)
        .await
        .expect("mock OAuth server starts")
}

fn no_redirect_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

fn query_param(url: &str, key: &str) -> Option<String> {
    url::Url::parse(url).ok().and_then(|u| {
        u.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    })
}

#[tokio::test]
async fn discovery_document_advertises_grants_and_pkce() {
    let server = start(base_config("idp")).await;
    let body: serde_json::Value = reqwest::get(format!(
        "{}/.well-known/openid-configuration",
        server.issuer()
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();

    assert_eq!(body["issuer"], server.issuer());
    let grants = body["grant_types_supported"].as_array().unwrap();
    assert!(grants.iter().any(|g| g == "authorization_code"));
    assert!(grants.iter().any(|g| g == GRANT_TOKEN_EXCHANGE));
    assert_eq!(body["code_challenge_methods_supported"][0], "S256");
    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn jwks_exposes_the_signing_key() {
    let server = start(base_config("idp")).await;
    let body: serde_json::Value =
        reqwest::get(format!("{}/.well-known/jwks.json", server.issuer()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    let key = &body["keys"][0];
    assert_eq!(key["kty"], "RSA");
    assert_eq!(key["alg"], "RS256");
    let (kid, n, _) = server.jwk_components();
    assert_eq!(key["kid"], kid);
    assert_eq!(key["n"], n);
    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn authorization_code_flow_with_pkce() {
    let mut config = base_config("idp");
    config.require_pkce = true;
    let server = start(config).await;
    let verifier = "integration-test-verifier-0123456789";
    let challenge = pkce_challenge(verifier);

    // Authorize: auto-approve redirects straight back with code + state.
    let authorize = format!(
        "{}/authorize?client_id=muster-test-client&redirect_uri=http://localhost/cb&scope=openid&state=xyzzy&code_challenge={challenge}&code_challenge_method=S256",
        server.issuer()
    );
    let response = no_redirect_client().get(&authorize).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FOUND);
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(query_param(&location, "state").as_deref(), Some("xyzzy"));
    let code = query_param(&location, "code").expect("code in redirect");

    // Redeem with the right verifier.
    let tokens: TokenResponse = reqwest::Client::new()
        .post(format!("{}/token", server.issuer()))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("code_verifier", verifier),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tokens.token_type, "Bearer");
    assert!(tokens.id_token.is_some());
    assert!(tokens.refresh_token.is_some());

    // The code is single-use.
    let reuse = reqwest::Client::new()
        .post(format!("{}/token", server.issuer()))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("code_verifier", verifier),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(reuse.status(), reqwest::StatusCode::BAD_REQUEST);

    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn wrong_pkce_verifier_is_rejected() {
    let server = start(base_config("idp")).await;
    let challenge = pkce_challenge("right-verifier");
    let code = server.generate_auth_code(
        "muster-test-client",
        "http://localhost/cb",
        "openid",
        Some(&challenge),
        Some("S256"),
    );

    let response = reqwest::Client::new()
        .post(format!("{}/token", server.issuer()))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("code_verifier", "wrong-verifier"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid_grant");
    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn authorize_without_challenge_fails_when_pkce_required() {
    let mut config = base_config("idp");
    config.require_pkce = true;
    let server = start(config).await;
    let authorize = format!(
        "{}/authorize?client_id=muster-test-client&redirect_uri=http://localhost/cb&scope=openid",
        server.issuer()
    );
    let response = no_redirect_client().get(&authorize).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn consent_page_is_served_without_auto_approve() {
    let mut config = base_config("idp");
    config.auto_approve = false;
    let server = start(config).await;
    let authorize = format!(
        "{}/authorize?client_id=muster-test-client&redirect_uri=http://localhost/cb&scope=openid&state=s1",
        server.issuer()
    );
    let response = no_redirect_client().get(&authorize).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.contains("Submit"));
    assert!(body.contains("code="));
    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn refresh_grant_rotates_tokens() {
    let server = start(base_config("idp")).await;
    let code =
        server.generate_auth_code("muster-test-client", "http://localhost/cb", "openid", None, None);
    let first = server.simulate_callback(&code).unwrap();
    let refresh = first.refresh_token.clone().unwrap();

    let second: TokenResponse = reqwest::Client::new()
        .post(format!("{}/token", server.issuer()))
        .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_ne!(second.access_token, first.access_token);

    // The consumed refresh token no longer works.
    let reuse = reqwest::Client::new()
        .post(format!("{}/token", server.issuer()))
        .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(reuse.status(), reqwest::StatusCode::BAD_REQUEST);
    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn simulate_error_poisons_the_token_endpoint() {
    let mut config = base_config("idp");
    config.simulate_error = Some("temporarily_unavailable".to_string());
    let server = start(config).await;
    let code =
        server.generate_auth_code("muster-test-client", "http://localhost/cb", "openid", None, None);

    let response = reqwest::Client::new()
        .post(format!("{}/token", server.issuer()))
        .form(&[("grant_type", "authorization_code"), ("code", code.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "temporarily_unavailable");
    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn token_exchange_between_two_mocks_over_http() {
    let upstream = start(base_config("upstream")).await;

    let mut config = base_config("local");
    config
        .trusted_issuers
        .insert("upstream-conn".to_string(), upstream.issuer().to_string());
    let local = start(config).await;

    // Wire trust the way the instance manager does.
    let (_, n, e) = upstream.jwk_components();
    local.add_trusted_issuer_key("upstream-conn", upstream.issuer(), &n, &e);

    let code = upstream.generate_auth_code(
        "muster-test-client",
        "http://localhost/cb",
        "openid",
        None,
        None,
    );
    let upstream_tokens = upstream.simulate_callback(&code).unwrap();
    let id_token = upstream_tokens.id_token.unwrap();

    let exchanged: TokenResponse = reqwest::Client::new()
        .post(format!("{}/token", local.issuer()))
        .form(&[
            ("grant_type", GRANT_TOKEN_EXCHANGE),
            ("subject_token", id_token.as_str()),
            ("subject_token_type", TOKEN_TYPE_ID_TOKEN),
            ("audience", "upstream-conn"),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(local.validate_access_token(&exchanged.access_token, "openid").is_ok());

    // Unknown audience is invalid_grant.
    let bad = reqwest::Client::new()
        .post(format!("{}/token", local.issuer()))
        .form(&[
            ("grant_type", GRANT_TOKEN_EXCHANGE),
            ("subject_token", id_token.as_str()),
            ("subject_token_type", TOKEN_TYPE_ID_TOKEN),
            ("audience", "nobody"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);

    local.stop(Duration::from_secs(2)).await;
    upstream.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn tls_discovery_verifies_against_the_exposed_ca() {
    let mut config = base_config("idp-tls");
    config.tls = true;
    let server = start(config).await;
    assert!(server.issuer().starts_with("https://"));

    let ca = server.ca_cert_pem().expect("CA PEM exposed");
    let client = reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(ca.as_bytes()).unwrap())
        .build()
        .unwrap();
    let response = client
        .get(format!(
            "{}/.well-known/openid-configuration",
            server.issuer()
        ))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn userinfo_requires_a_valid_bearer() {
    let server = start(base_config("idp")).await;
    let code =
        server.generate_auth_code("muster-test-client", "http://localhost/cb", "openid", None, None);
    let tokens = server.simulate_callback(&code).unwrap();

    let ok: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/userinfo", server.issuer()))
        .bearer_auth(&tokens.access_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok["sub"], "test-user");

    let unauthorized = reqwest::Client::new()
        .get(format!("{}/userinfo", server.issuer()))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), reqwest::StatusCode::UNAUTHORIZED);
    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn mock_clock_expires_tokens_without_waiting() {
    let mut config = base_config("idp");
    config.use_mock_clock = true;
    config.token_lifetime = Duration::from_secs(3600);
    let server = start(config).await;

    let code =
        server.generate_auth_code("muster-test-client", "http://localhost/cb", "openid", None, None);
    let tokens = server.simulate_callback(&code).unwrap();
    assert!(server.validate_access_token(&tokens.access_token, "openid").is_ok());

    server.clock().advance(Duration::from_secs(7200)).unwrap();
    let err = server
        .validate_access_token(&tokens.access_token, "openid")
        .unwrap_err();
    assert!(err.contains("expired"));
    server.stop(Duration::from_secs(2)).await;
}
