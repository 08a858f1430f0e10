//! Mock OAuth 2.0 / OIDC authorization server.
//!
//! Serves the OIDC discovery document, a JWKS with the server's RSA
//! public key, `/authorize` (auto-approve or canned consent page),
//! `/token` with the authorization-code (PKCE), refresh-token, and
//! RFC 8693 token-exchange grants, and `/userinfo`. All `exp` claims are
//! computed from the server's [`Clock`], so tests can age tokens via the
//! mock clock. Auth codes are single-use; PKCE is verified iff the code
//! was issued with a challenge.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Form, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::OAuthError;
use crate::mock::clock::Clock;
use crate::mock::tls::TlsMaterial;
use crate::scenario::schema::OAuthServerSpec;

/// RFC 8693 token-exchange grant type.
pub const GRANT_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// RFC 8693 id-token subject token type.
pub const TOKEN_TYPE_ID_TOKEN: &str = "urn:ietf:params:oauth:token-type:id_token";

/// Subject every mock-issued identity carries.
const DEFAULT_SUBJECT: &str = "test-user";

/// Runtime configuration of one mock OAuth server.
#[derive(Debug, Clone)]
pub struct OAuthServerConfig {
    /// Declared server name.
    pub name: String,
    /// Accepted scopes.
    pub scopes: Vec<String>,
    /// Enforce PKCE on `/authorize`.
    pub require_pkce: bool,
    /// Redirect immediately from `/authorize`.
    pub auto_approve: bool,
    /// Lifetime of minted access and id tokens.
    pub token_lifetime: Duration,
    /// Accepted OAuth client id.
    pub client_id: String,
    /// Accepted OAuth client secret.
    pub client_secret: String,
    /// When set, `/token` always fails with this OAuth error code.
    pub simulate_error: Option<String>,
    /// Wire a mock clock instead of wall time.
    pub use_mock_clock: bool,
    /// RFC 8693 trust table: connector id → issuer URL.
    pub trusted_issuers: BTreeMap<String, String>,
    /// Serve over TLS with in-memory self-signed material.
    pub tls: bool,
}

impl OAuthServerConfig {
    /// Builds the runtime config from a scenario declaration.
    #[must_use]
    pub fn from_spec(spec: &OAuthServerSpec) -> Self {
        Self {
            name: spec.name.clone(),
            scopes: spec.scopes.clone(),
            require_pkce: spec.require_pkce,
            auto_approve: spec.auto_approve,
            token_lifetime: spec.token_lifetime,
            client_id: spec.client_id.clone(),
            client_secret: spec.client_secret.clone(),
            simulate_error: spec.simulate_error.clone(),
            use_mock_clock: spec.use_mock_clock,
            trusted_issuers: spec.trusted_issuers.clone(),
            tls: spec.tls,
        }
    }
}

/// Token endpoint success payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Opaque bearer access token.
    pub access_token: String,
    /// Always `Bearer`.
    pub token_type: String,
    /// Seconds until expiry, per the server's clock.
    pub expires_in: u64,
    /// Refresh token, when the grant yields one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Signed id token (JWT), when the grant yields one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Granted scope.
    pub scope: String,
}

/// A minted access token as tracked in the server's token table.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    /// Granted scope (space separated).
    pub scope: String,
    /// Client the token was issued to.
    pub client_id: String,
    /// Subject the token is bound to.
    pub subject: String,
    /// Expiry instant per the server's clock.
    pub expires_at: DateTime<Utc>,
}

/// Claims of mock-issued id tokens.
#[derive(Debug, Serialize, Deserialize)]
struct IdClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Clone)]
struct AuthCodeRecord {
    client_id: String,
    redirect_uri: String,
    scope: String,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    subject: String,
}

#[derive(Debug, Clone)]
struct TrustedKey {
    issuer: String,
    n: String,
    e: String,
}

struct KeyMaterial {
    kid: String,
    private_pem: String,
    n: String,
    e: String,
}

/// Shared state behind the axum handlers and the test-only helpers.
struct OAuthState {
    config: OAuthServerConfig,
    issuer: String,
    port: u16,
    clock: Clock,
    keys: KeyMaterial,
    codes: Mutex<HashMap<String, AuthCodeRecord>>,
    tokens: Mutex<HashMap<String, TokenRecord>>,
    refresh_tokens: Mutex<HashMap<String, TokenRecord>>,
    trusted_keys: Mutex<HashMap<String, TrustedKey>>,
    tls: Option<TlsMaterial>,
}

/// A running mock OAuth server.
///
/// Shared as `Arc` between the owning instance and any protected mock
/// tool servers that validate bearer tokens against it.
pub struct MockOAuthServer {
    state: Arc<OAuthState>,
    handle: axum_server::Handle<std::net::SocketAddr>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MockOAuthServer {
    /// Starts the server on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError`] when key material cannot be generated or the
    /// port cannot be bound.
    pub async fn start(config: OAuthServerConfig, port: u16) -> Result<Self, OAuthError> {
        let state = Arc::new(OAuthState::new(config, port)?);
        let router = build_router(Arc::clone(&state));
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let handle = axum_server::Handle::new();

        let task = if let Some(tls) = &state.tls {
            let rustls = tls.rustls_config().await?;
            let server_handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = axum_server::bind_rustls(addr, rustls)
                    .handle(server_handle)
                    .serve(router.into_make_service())
                    .await
                {
                    warn!(error = %e, "mock OAuth TLS server exited");
                }
            })
        } else {
            let server_handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = axum_server::bind(addr)
                    .handle(server_handle)
                    .serve(router.into_make_service())
                    .await
                {
                    warn!(error = %e, "mock OAuth server exited");
                }
            })
        };

        info!(name = %state.config.name, issuer = %state.issuer, "mock OAuth server started");
        Ok(Self {
            state,
            handle,
            task: Mutex::new(Some(task)),
        })
    }

    /// Declared server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.config.name
    }

    /// Issuer URL (scheme + host + bound port).
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.state.issuer
    }

    /// Bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.state.port
    }

    /// OAuth client id this server accepts.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.state.config.client_id
    }

    /// The server's clock.
    #[must_use]
    pub fn clock(&self) -> Clock {
        self.state.clock.clone()
    }

    /// CA certificate PEM when running with TLS.
    #[must_use]
    pub fn ca_cert_pem(&self) -> Option<String> {
        self.state.tls.as_ref().map(|t| t.ca_cert_pem.clone())
    }

    /// Trusted-issuer table as `(connector id, issuer URL)` pairs.
    #[must_use]
    pub fn trusted_issuer_pairs(&self) -> Vec<(String, String)> {
        self.state
            .config
            .trusted_issuers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Public JWK components `(kid, n, e)` of the signing key.
    #[must_use]
    pub fn jwk_components(&self) -> (String, String, String) {
        (
            self.state.keys.kid.clone(),
            self.state.keys.n.clone(),
            self.state.keys.e.clone(),
        )
    }

    /// Issues an authorization code exactly as `/authorize` would.
    #[must_use]
    pub fn generate_auth_code(
        &self,
        client_id: &str,
        redirect_uri: &str,
        scope: &str,
        code_challenge: Option<&str>,
        code_challenge_method: Option<&str>,
    ) -> String {
        self.state.issue_code(
            client_id,
            redirect_uri,
            scope,
            code_challenge,
            code_challenge_method,
        )
    }

    /// Redeems an auth code directly, bypassing HTTP and PKCE.
    ///
    /// This is the direct-injection fallback used when the aggregator's
    /// login flow is unavailable.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Token`] for unknown or already-used codes.
    pub fn simulate_callback(&self, code: &str) -> Result<TokenResponse, OAuthError> {
        self.state
            .redeem_code(code, None, false)
            .map_err(|e| OAuthError::Token(e.description))
    }

    /// Inserts a token directly into the token table.
    pub fn add_token(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        scope: &str,
        client_id: &str,
        expires_at: DateTime<Utc>,
    ) {
        let record = TokenRecord {
            scope: scope.to_string(),
            client_id: client_id.to_string(),
            subject: DEFAULT_SUBJECT.to_string(),
            expires_at,
        };
        self.state
            .tokens
            .lock()
            .expect("token table poisoned")
            .insert(access_token.to_string(), record.clone());
        if let Some(refresh) = refresh_token {
            self.state
                .refresh_tokens
                .lock()
                .expect("refresh table poisoned")
                .insert(refresh.to_string(), record);
        }
    }

    /// Registers the signing key of a trusted issuer for token exchange.
    ///
    /// The instance manager wires peer mocks this way so exchange never
    /// depends on network JWKS fetches.
    pub fn add_trusted_issuer_key(&self, connector_id: &str, issuer: &str, n: &str, e: &str) {
        self.state
            .trusted_keys
            .lock()
            .expect("trusted key table poisoned")
            .insert(
                connector_id.to_string(),
                TrustedKey {
                    issuer: issuer.to_string(),
                    n: n.to_string(),
                    e: e.to_string(),
                },
            );
    }

    /// Validates a bearer token against the token table, clock, and scope.
    ///
    /// # Errors
    ///
    /// Returns a human-readable rejection reason (unknown, expired,
    /// insufficient scope).
    pub fn validate_access_token(
        &self,
        token: &str,
        required_scope: &str,
    ) -> Result<TokenRecord, String> {
        self.state.validate_access_token(token, required_scope)
    }

    /// Stops the server, waiting up to `timeout` for in-flight requests.
    ///
    /// Safe to call once; later calls are no-ops.
    ///
    /// # Panics
    ///
    /// Panics if the task mutex is poisoned.
    pub async fn stop(&self, timeout: Duration) {
        self.handle.graceful_shutdown(Some(timeout));
        let task = self.task.lock().expect("task mutex poisoned").take();
        if let Some(task) = task
            && tokio::time::timeout(timeout + Duration::from_secs(1), task)
                .await
                .is_err()
        {
            warn!(name = %self.state.config.name, "mock OAuth server did not stop in time");
        }
    }
}

impl std::fmt::Debug for MockOAuthServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockOAuthServer")
            .field("name", &self.state.config.name)
            .field("issuer", &self.state.issuer)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// State
// ============================================================================

/// An OAuth error payload plus HTTP status.
#[derive(Debug)]
struct OAuthFailure {
    status: StatusCode,
    code: &'static str,
    description: String,
}

impl OAuthFailure {
    fn invalid_grant(description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_grant",
            description: description.into(),
        }
    }

    fn invalid_request(description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_request",
            description: description.into(),
        }
    }

    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"error": self.code, "error_description": self.description})),
        )
            .into_response()
    }
}

impl OAuthState {
    fn new(config: OAuthServerConfig, port: u16) -> Result<Self, OAuthError> {
        let keys = generate_key_material()?;
        let clock = if config.use_mock_clock {
            Clock::mock()
        } else {
            Clock::System
        };
        let tls = if config.tls {
            Some(TlsMaterial::generate(&config.name)?)
        } else {
            None
        };
        let scheme = if config.tls { "https" } else { "http" };
        let issuer = format!("{scheme}://localhost:{port}");

        Ok(Self {
            config,
            issuer,
            port,
            clock,
            keys,
            codes: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            refresh_tokens: Mutex::new(HashMap::new()),
            trusted_keys: Mutex::new(HashMap::new()),
            tls,
        })
    }

    fn issue_code(
        &self,
        client_id: &str,
        redirect_uri: &str,
        scope: &str,
        code_challenge: Option<&str>,
        code_challenge_method: Option<&str>,
    ) -> String {
        let code = random_token("code");
        let record = AuthCodeRecord {
            client_id: client_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            scope: scope.to_string(),
            code_challenge: code_challenge.map(str::to_string),
            code_challenge_method: code_challenge_method.map(str::to_string),
            subject: DEFAULT_SUBJECT.to_string(),
        };
        self.codes
            .lock()
            .expect("code table poisoned")
            .insert(code.clone(), record);
        debug!(client_id, redirect_uri, "auth code issued");
        code
    }

    /// Redeems an auth code. Codes are single-use: the record is removed
    /// before any further checks, so a failed PKCE attempt also consumes it.
    fn redeem_code(
        &self,
        code: &str,
        verifier: Option<&str>,
        enforce_pkce: bool,
    ) -> Result<TokenResponse, OAuthFailure> {
        let record = self
            .codes
            .lock()
            .expect("code table poisoned")
            .remove(code)
            .ok_or_else(|| OAuthFailure::invalid_grant("unknown or already used code"))?;

        if enforce_pkce && let Some(challenge) = &record.code_challenge {
            let method = record.code_challenge_method.as_deref().unwrap_or("S256");
            if method != "S256" {
                return Err(OAuthFailure::invalid_request(format!(
                    "unsupported code_challenge_method: {method}"
                )));
            }
            let verifier = verifier
                .ok_or_else(|| OAuthFailure::invalid_grant("code_verifier required"))?;
            if !pkce_matches(challenge, verifier) {
                return Err(OAuthFailure::invalid_grant("code_verifier mismatch"));
            }
        }

        Ok(self.mint_tokens(&record.client_id, &record.scope, &record.subject, true))
    }

    fn mint_tokens(
        &self,
        client_id: &str,
        scope: &str,
        subject: &str,
        with_identity: bool,
    ) -> TokenResponse {
        let now = self.clock.now();
        let expires_at = now + chrono::TimeDelta::from_std(self.config.token_lifetime)
            .unwrap_or(chrono::TimeDelta::MAX);
        let access_token = random_token("tok");
        let record = TokenRecord {
            scope: scope.to_string(),
            client_id: client_id.to_string(),
            subject: subject.to_string(),
            expires_at,
        };
        self.tokens
            .lock()
            .expect("token table poisoned")
            .insert(access_token.clone(), record.clone());

        let (refresh_token, id_token) = if with_identity {
            let refresh = random_token("ref");
            self.refresh_tokens
                .lock()
                .expect("refresh table poisoned")
                .insert(refresh.clone(), record);
            (Some(refresh), self.sign_id_token(client_id, subject, now, expires_at))
        } else {
            (None, None)
        };

        TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.token_lifetime.as_secs(),
            refresh_token,
            id_token,
            scope: scope.to_string(),
        }
    }

    fn sign_id_token(
        &self,
        audience: &str,
        subject: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Option<String> {
        let claims = IdClaims {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            aud: audience.to_string(),
            exp: expires_at.timestamp(),
            iat: issued_at.timestamp(),
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.keys.kid.clone());
        let key = EncodingKey::from_rsa_pem(self.keys.private_pem.as_bytes()).ok()?;
        match jsonwebtoken::encode(&header, &claims, &key) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = %e, "id token signing failed");
                None
            }
        }
    }

    fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, OAuthFailure> {
        let record = self
            .refresh_tokens
            .lock()
            .expect("refresh table poisoned")
            .remove(refresh_token)
            .ok_or_else(|| OAuthFailure::invalid_grant("unknown refresh token"))?;
        // Rotation: the old refresh token is gone; a fresh pair is minted.
        Ok(self.mint_tokens(&record.client_id, &record.scope, &record.subject, true))
    }

    fn exchange(
        &self,
        subject_token: &str,
        subject_token_type: &str,
        audience: &str,
    ) -> Result<TokenResponse, OAuthFailure> {
        if subject_token_type != TOKEN_TYPE_ID_TOKEN {
            return Err(OAuthFailure::invalid_request(format!(
                "unsupported subject_token_type: {subject_token_type}"
            )));
        }
        let issuer_url = self
            .config
            .trusted_issuers
            .get(audience)
            .cloned()
            .ok_or_else(|| {
                OAuthFailure::invalid_grant(format!("audience not trusted: {audience}"))
            })?;

        let key = self
            .trusted_keys
            .lock()
            .expect("trusted key table poisoned")
            .get(audience)
            .cloned()
            .ok_or_else(|| {
                OAuthFailure::invalid_grant(format!("no signing key known for {issuer_url}"))
            })?;

        let decoding = DecodingKey::from_rsa_components(&key.n, &key.e)
            .map_err(|e| OAuthFailure::invalid_grant(format!("bad trusted key: {e}")))?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&key.issuer]);
        // Expiry is checked against this server's (possibly mock) clock,
        // not jsonwebtoken's wall clock.
        validation.validate_exp = false;
        validation.validate_aud = false;

        let decoded = jsonwebtoken::decode::<IdClaims>(subject_token, &decoding, &validation)
            .map_err(|e| OAuthFailure::invalid_grant(format!("subject token invalid: {e}")))?;

        if decoded.claims.exp < self.clock.now().timestamp() {
            return Err(OAuthFailure::invalid_grant("subject token expired"));
        }

        let scope = self.config.scopes.join(" ");
        Ok(self.mint_tokens(&self.config.client_id, &scope, &decoded.claims.sub, false))
    }

    fn validate_access_token(
        &self,
        token: &str,
        required_scope: &str,
    ) -> Result<TokenRecord, String> {
        let record = self
            .tokens
            .lock()
            .expect("token table poisoned")
            .get(token)
            .cloned()
            .ok_or_else(|| "unknown token".to_string())?;
        if record.expires_at <= self.clock.now() {
            return Err("token expired".to_string());
        }
        if !required_scope.is_empty()
            && !record.scope.split_whitespace().any(|s| s == required_scope)
        {
            return Err(format!("insufficient scope, requires {required_scope}"));
        }
        Ok(record)
    }
}

// ============================================================================
// Router
// ============================================================================

fn build_router(state: Arc<OAuthState>) -> Router {
    Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(handle_discovery),
        )
        .route("/.well-known/jwks.json", get(handle_jwks))
        .route("/authorize", get(handle_authorize))
        .route("/token", post(handle_token))
        .route("/userinfo", get(handle_userinfo))
        .with_state(state)
}

async fn handle_discovery(State(state): State<Arc<OAuthState>>) -> Json<serde_json::Value> {
    let issuer = &state.issuer;
    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
        "userinfo_endpoint": format!("{issuer}/userinfo"),
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "response_types_supported": ["code"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "scopes_supported": state.config.scopes,
        "grant_types_supported": [
            "authorization_code",
            "refresh_token",
            GRANT_TOKEN_EXCHANGE,
        ],
        "code_challenge_methods_supported": ["S256"],
    }))
}

async fn handle_jwks(State(state): State<Arc<OAuthState>>) -> Json<serde_json::Value> {
    Json(json!({
        "keys": [{
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": state.keys.kid,
            "n": state.keys.n,
            "e": state.keys.e,
        }]
    }))
}

async fn handle_authorize(
    State(state): State<Arc<OAuthState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(redirect_uri) = params.get("redirect_uri") else {
        return (StatusCode::BAD_REQUEST, "missing redirect_uri").into_response();
    };
    let client_id = params.get("client_id").cloned().unwrap_or_default();
    if client_id != state.config.client_id {
        return (StatusCode::BAD_REQUEST, "unknown client_id").into_response();
    }
    let challenge = params.get("code_challenge").map(String::as_str);
    if state.config.require_pkce && challenge.is_none() {
        return (StatusCode::BAD_REQUEST, "code_challenge required").into_response();
    }

    let scope = params.get("scope").cloned().unwrap_or_default();
    let code = state.issue_code(
        &client_id,
        redirect_uri,
        &scope,
        challenge,
        params.get("code_challenge_method").map(String::as_str),
    );

    let mut location = format!("{redirect_uri}?code={}", urlencoding::encode(&code));
    if let Some(csrf) = params.get("state") {
        location.push_str(&format!("&state={}", urlencoding::encode(csrf)));
    }

    if state.config.auto_approve {
        return (StatusCode::FOUND, [(header::LOCATION, location)]).into_response();
    }

    Html(format!(
        "<html><body><h1>Consent required</h1>\
         <p>{client_id} requests access to: {scope}</p>\
         <a href=\"{location}\">Submit</a></body></html>"
    ))
    .into_response()
}

async fn handle_token(
    State(state): State<Arc<OAuthState>>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    if let Some(code) = &state.config.simulate_error {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": code, "error_description": "simulated error"})),
        )
            .into_response();
    }

    let grant_type = params.get("grant_type").cloned().unwrap_or_default();
    let result = match grant_type.as_str() {
        "authorization_code" => {
            let Some(code) = params.get("code") else {
                return OAuthFailure::invalid_request("missing code").into_response();
            };
            state.redeem_code(code, params.get("code_verifier").map(String::as_str), true)
        }
        "refresh_token" => {
            let Some(refresh) = params.get("refresh_token") else {
                return OAuthFailure::invalid_request("missing refresh_token").into_response();
            };
            state.refresh(refresh)
        }
        GRANT_TOKEN_EXCHANGE => {
            let subject_token = params.get("subject_token").cloned().unwrap_or_default();
            let subject_token_type = params
                .get("subject_token_type")
                .cloned()
                .unwrap_or_default();
            let audience = params.get("audience").cloned().unwrap_or_default();
            state.exchange(&subject_token, &subject_token_type, &audience)
        }
        other => Err(OAuthFailure {
            status: StatusCode::BAD_REQUEST,
            code: "unsupported_grant_type",
            description: format!("unsupported grant_type: {other}"),
        }),
    };

    match result {
        Ok(tokens) => Json(tokens).into_response(),
        Err(failure) => failure.into_response(),
    }
}

async fn handle_userinfo(
    State(state): State<Arc<OAuthState>>,
    headers: HeaderMap,
) -> Response {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(token) = bearer else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };
    match state.validate_access_token(token, "") {
        Ok(record) => Json(json!({"sub": record.subject})).into_response(),
        Err(reason) => (StatusCode::UNAUTHORIZED, reason).into_response(),
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn generate_key_material() -> Result<KeyMaterial, OAuthError> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| OAuthError::KeyGeneration(e.to_string()))?;
    let public = RsaPublicKey::from(&private);
    let private_pem = private
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(|e| OAuthError::KeyGeneration(e.to_string()))?
        .to_string();

    Ok(KeyMaterial {
        kid: random_token("kid"),
        private_pem,
        n: URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
    })
}

/// Verifies an S256 PKCE challenge against a verifier.
#[must_use]
pub fn pkce_matches(challenge: &str, verifier: &str) -> bool {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest) == challenge
}

/// Computes the S256 challenge for a verifier (client side of PKCE).
#[must_use]
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn random_token(prefix: &str) -> String {
    let bytes: [u8; 16] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}_{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(name: &str) -> OAuthServerConfig {
        OAuthServerConfig {
            name: name.to_string(),
            scopes: vec!["openid".to_string()],
            require_pkce: false,
            auto_approve: true,
            token_lifetime: Duration::from_secs(3600),
            client_id: "muster-test-client".to_string(),
            client_secret: "muster-test-secret".to_string(),
            simulate_error: None,
            use_mock_clock: true,
            trusted_issuers: BTreeMap::new(),
            tls: false,
        }
    }

    #[test]
    fn pkce_round_trip() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = pkce_challenge(verifier);
        assert!(pkce_matches(&challenge, verifier));
        assert!(!pkce_matches(&challenge, "wrong-verifier"));
    }

    #[test]
    fn auth_codes_are_single_use() {
        let state = OAuthState::new(test_config("idp"), 19999).unwrap();
        let code = state.issue_code("muster-test-client", "http://cb", "openid", None, None);
        assert!(state.redeem_code(&code, None, true).is_ok());
        assert!(state.redeem_code(&code, None, true).is_err());
    }

    #[test]
    fn pkce_enforced_iff_challenge_present() {
        let state = OAuthState::new(test_config("idp"), 19998).unwrap();

        let plain = state.issue_code("c", "http://cb", "openid", None, None);
        assert!(state.redeem_code(&plain, None, true).is_ok());

        let challenge = pkce_challenge("my-verifier");
        let code = state.issue_code("c", "http://cb", "openid", Some(&challenge), Some("S256"));
        let err = state.redeem_code(&code, Some("wrong"), true).unwrap_err();
        assert_eq!(err.code, "invalid_grant");

        let code = state.issue_code("c", "http://cb", "openid", Some(&challenge), Some("S256"));
        assert!(state.redeem_code(&code, Some("my-verifier"), true).is_ok());
    }

    #[test]
    fn expiry_follows_the_mock_clock() {
        let state = OAuthState::new(test_config("idp"), 19997).unwrap();
        let tokens = state.mint_tokens("c", "openid", DEFAULT_SUBJECT, true);
        assert!(state.validate_access_token(&tokens.access_token, "openid").is_ok());

        state.clock.advance(Duration::from_secs(7200)).unwrap();
        let err = state
            .validate_access_token(&tokens.access_token, "openid")
            .unwrap_err();
        assert!(err.contains("expired"));

        // Tokens minted after the advance carry the shifted exp.
        let fresh = state.mint_tokens("c", "openid", DEFAULT_SUBJECT, true);
        assert!(state.validate_access_token(&fresh.access_token, "openid").is_ok());
    }

    #[test]
    fn scope_check_rejects_missing_scope() {
        let state = OAuthState::new(test_config("idp"), 19996).unwrap();
        let tokens = state.mint_tokens("c", "profile", DEFAULT_SUBJECT, false);
        let err = state
            .validate_access_token(&tokens.access_token, "openid")
            .unwrap_err();
        assert!(err.contains("scope"));
    }

    #[test]
    fn refresh_rotates_the_refresh_token() {
        let state = OAuthState::new(test_config("idp"), 19995).unwrap();
        let first = state.mint_tokens("c", "openid", DEFAULT_SUBJECT, true);
        let refresh = first.refresh_token.unwrap();
        let second = state.refresh(&refresh).unwrap();
        assert_ne!(second.access_token, first.access_token);
        // Old refresh token is consumed.
        assert!(state.refresh(&refresh).is_err());
    }

    #[test]
    fn exchange_requires_a_trusted_audience() {
        let state = OAuthState::new(test_config("idp"), 19994).unwrap();
        let err = state
            .exchange("token", TOKEN_TYPE_ID_TOKEN, "unknown-connector")
            .unwrap_err();
        assert_eq!(err.code, "invalid_grant");
        assert!(err.description.contains("not trusted"));
    }

    #[test]
    fn exchange_accepts_a_trusted_id_token() {
        // Upstream issuer signs an id token; the local server trusts it by
        // connector id and mints a local access token for its subject.
        let upstream = OAuthState::new(test_config("upstream"), 19993).unwrap();
        let mut config = test_config("local");
        config
            .trusted_issuers
            .insert("conn".to_string(), upstream.issuer.clone());
        let local = OAuthState::new(config, 19992).unwrap();
        local
            .trusted_keys
            .lock()
            .unwrap()
            .insert(
                "conn".to_string(),
                TrustedKey {
                    issuer: upstream.issuer.clone(),
                    n: upstream.keys.n.clone(),
                    e: upstream.keys.e.clone(),
                },
            );

        let now = upstream.clock.now();
        let id_token = upstream
            .sign_id_token("aud", "alice", now, now + chrono::TimeDelta::hours(1))
            .unwrap();

        let tokens = local
            .exchange(&id_token, TOKEN_TYPE_ID_TOKEN, "conn")
            .unwrap();
        let record = local
            .validate_access_token(&tokens.access_token, "openid")
            .unwrap();
        assert_eq!(record.subject, "alice");
    }

    #[test]
    fn exchange_rejects_a_forged_id_token() {
        let upstream = OAuthState::new(test_config("upstream"), 19991).unwrap();
        let imposter = OAuthState::new(test_config("imposter"), 19990).unwrap();
        let mut config = test_config("local");
        config
            .trusted_issuers
            .insert("conn".to_string(), upstream.issuer.clone());
        let local = OAuthState::new(config, 19989).unwrap();
        // Trusted key is the genuine upstream's.
        local.trusted_keys.lock().unwrap().insert(
            "conn".to_string(),
            TrustedKey {
                issuer: upstream.issuer.clone(),
                n: upstream.keys.n.clone(),
                e: upstream.keys.e.clone(),
            },
        );

        // Imposter signs with its own key; signature check must fail.
        let now = imposter.clock.now();
        let forged = imposter
            .sign_id_token("aud", "mallory", now, now + chrono::TimeDelta::hours(1))
            .unwrap();
        assert!(local.exchange(&forged, TOKEN_TYPE_ID_TOKEN, "conn").is_err());
    }

    #[test]
    fn exchange_rejects_an_expired_subject_token_by_mock_clock() {
        let upstream = OAuthState::new(test_config("upstream"), 19988).unwrap();
        let mut config = test_config("local");
        config
            .trusted_issuers
            .insert("conn".to_string(), upstream.issuer.clone());
        let local = OAuthState::new(config, 19987).unwrap();
        local.trusted_keys.lock().unwrap().insert(
            "conn".to_string(),
            TrustedKey {
                issuer: upstream.issuer.clone(),
                n: upstream.keys.n.clone(),
                e: upstream.keys.e.clone(),
            },
        );

        let now = upstream.clock.now();
        let id_token = upstream
            .sign_id_token("aud", "alice", now, now + chrono::TimeDelta::minutes(5))
            .unwrap();

        local.clock.advance(Duration::from_secs(3600)).unwrap();
        let err = local
            .exchange(&id_token, TOKEN_TYPE_ID_TOKEN, "conn")
            .unwrap_err();
        assert!(err.description.contains("expired"));
    }
}
