//! OIDC provider adapter.
//!
//! Everything the gate delegates to the identity provider lives here: the
//! resolved deployment, discovery, JWKS-backed token verification, the
//! authorization-code exchange, the login challenge and the provider-driven
//! pre-auth callbacks (single-logout, version probe).
//!
//! JWKS keys are cached in-memory with a 1-hour TTL and refreshed on cache
//! miss.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::claims::IdentityClaims;
use crate::config::Config;
use crate::session::{SessionEntry, SessionTokenStore};

// ── Deployment ───────────────────────────────────────────────

/// Resolved identity-provider deployment for this gateway.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub issuer_url: String,
    pub client_id: String,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub jwks_uri: Option<String>,
    pub end_session_endpoint: Option<String>,
}

impl Deployment {
    /// Builds the deployment from configuration alone. `None` when the
    /// provider is not configured.
    pub fn resolve(config: &Config) -> Option<Self> {
        if !config.deployment_configured() {
            return None;
        }
        Some(Self {
            issuer_url: config.issuer_url.clone()?,
            client_id: config.client_id.clone()?,
            authorization_endpoint: config.authorization_endpoint.clone(),
            token_endpoint: config.token_endpoint.clone(),
            jwks_uri: config.jwks_uri.clone(),
            end_session_endpoint: config.end_session_endpoint.clone(),
        })
    }

    /// Fills missing endpoints from the provider's discovery document.
    /// Explicitly configured endpoints win over discovered ones.
    pub async fn discover(config: &Config) -> anyhow::Result<Self> {
        let mut deployment = Self::resolve(config)
            .ok_or_else(|| anyhow::anyhow!("deployment not configured"))?;
        let discovery = fetch_discovery(&deployment.issuer_url).await?;
        deployment.authorization_endpoint = deployment
            .authorization_endpoint
            .or(Some(discovery.authorization_endpoint));
        deployment.token_endpoint = deployment.token_endpoint.or(Some(discovery.token_endpoint));
        deployment.jwks_uri = deployment.jwks_uri.or(Some(discovery.jwks_uri));
        deployment.end_session_endpoint = deployment
            .end_session_endpoint
            .or(discovery.end_session_endpoint);
        Ok(deployment)
    }
}

/// OpenID Connect discovery document (subset of fields we need).
#[derive(Debug, Deserialize)]
pub struct OidcDiscovery {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

pub async fn fetch_discovery(issuer_url: &str) -> anyhow::Result<OidcDiscovery> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer_url.trim_end_matches('/')
    );
    tracing::debug!(url = %url, "OIDC discovery");
    let resp = reqwest::get(&url).await?;
    let discovery: OidcDiscovery = resp.json().await?;
    Ok(discovery)
}

/// Cluster node registration with the provider. Fire-and-forget; not a
/// correctness dependency.
pub fn try_register_node(deployment: &Deployment) {
    tracing::debug!(issuer = %deployment.issuer_url, "node registration with provider");
}

// ── JWKS cache ───────────────────────────────────────────────

/// JSON Web Key Set.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// A single JSON Web Key (RSA fields only; that is what providers sign
/// ID tokens with).
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: Option<String>,
    pub alg: Option<String>,
    pub n: Option<String>,
    pub e: Option<String>,
}

struct CachedJwks {
    jwks: Jwks,
    fetched_at: DateTime<Utc>,
}

static JWKS_CACHE: Lazy<DashMap<String, CachedJwks>> = Lazy::new(DashMap::new);

const JWKS_CACHE_TTL_SECS: i64 = 3600;

/// Fetch JWKS keys for a provider, with caching.
pub async fn get_jwks(jwks_uri: &str) -> anyhow::Result<Jwks> {
    if let Some(cached) = JWKS_CACHE.get(jwks_uri) {
        let age = Utc::now() - cached.fetched_at;
        if age < Duration::seconds(JWKS_CACHE_TTL_SECS) {
            return Ok(cached.jwks.clone());
        }
    }

    tracing::debug!(jwks_uri = %jwks_uri, "fetching JWKS keys");
    let resp = reqwest::get(jwks_uri).await?;
    let jwks: Jwks = resp.json().await?;

    JWKS_CACHE.insert(
        jwks_uri.to_string(),
        CachedJwks {
            jwks: jwks.clone(),
            fetched_at: Utc::now(),
        },
    );

    Ok(jwks)
}

// ── Token decode / verification ──────────────────────────────

/// A verified identity token, ready to cache in the session store.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub raw: String,
    pub claims: IdentityClaims,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<VerifiedToken> for SessionEntry {
    fn from(token: VerifiedToken) -> Self {
        SessionEntry {
            raw_token: token.raw,
            claims: token.claims,
            expires_at: token.expires_at,
            identifier: None,
        }
    }
}

/// Key ID from the JWT header, for JWKS lookup.
pub fn extract_kid(token: &str) -> Option<String> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header_bytes = engine.decode(parts[0]).ok()?;
    let header: serde_json::Value = serde_json::from_slice(&header_bytes).ok()?;
    header.get("kid").and_then(|v| v.as_str()).map(String::from)
}

/// Decodes the token payload and checks expiry. Signature verification is
/// done separately against the deployment's JWKS when one is configured.
pub fn decode_token(token: &str) -> anyhow::Result<VerifiedToken> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        anyhow::bail!("invalid JWT format: expected 3 parts");
    }

    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let payload_bytes = engine
        .decode(parts[1])
        .map_err(|e| anyhow::anyhow!("JWT payload decode error: {e}"))?;
    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes)?;

    let expires_at = payload
        .get("exp")
        .and_then(|v| v.as_i64())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    if let Some(at) = expires_at {
        if at < Utc::now() {
            anyhow::bail!("token expired");
        }
    }

    Ok(VerifiedToken {
        raw: token.to_string(),
        claims: IdentityClaims::from_payload(payload)?,
        expires_at,
    })
}

/// Verifies a token against the deployment. With a JWKS URI the signature
/// is checked via `jsonwebtoken`; without one the token is trusted as
/// already verified upstream and only decoded.
pub async fn verify_token(deployment: &Deployment, token: &str) -> anyhow::Result<VerifiedToken> {
    let Some(jwks_uri) = deployment.jwks_uri.as_deref() else {
        return decode_token(token);
    };

    let jwks = get_jwks(jwks_uri).await?;
    let kid = extract_kid(token).ok_or_else(|| anyhow::anyhow!("token header missing kid"))?;
    let jwk = jwks
        .keys
        .iter()
        .find(|k| k.kid.as_deref() == Some(kid.as_str()))
        .ok_or_else(|| anyhow::anyhow!("no JWKS key matching kid '{kid}'"))?;
    let (n, e) = match (&jwk.n, &jwk.e) {
        (Some(n), Some(e)) if jwk.kty == "RSA" => (n, e),
        _ => anyhow::bail!("JWKS key '{kid}' is not a usable RSA key"),
    };

    let key = jsonwebtoken::DecodingKey::from_rsa_components(n, e)?;
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
    validation.set_audience(&[deployment.client_id.as_str()]);
    let data = jsonwebtoken::decode::<serde_json::Value>(token, &key, &validation)?;

    let expires_at = data
        .claims
        .get("exp")
        .and_then(|v| v.as_i64())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    Ok(VerifiedToken {
        raw: token.to_string(),
        claims: IdentityClaims::from_payload(data.claims)?,
        expires_at,
    })
}

// ── Authorization-code exchange ──────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Redeems the callback `code` at the token endpoint.
pub async fn exchange_code(
    deployment: &Deployment,
    code: &str,
    redirect_uri: &str,
) -> anyhow::Result<TokenResponse> {
    let token_endpoint = deployment
        .token_endpoint
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("no token endpoint configured"))?;

    let client = reqwest::Client::new();
    let resp = client
        .post(token_endpoint)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", deployment.client_id.as_str()),
        ])
        .send()
        .await?;
    if !resp.status().is_success() {
        anyhow::bail!("token endpoint returned {}", resp.status());
    }
    Ok(resp.json().await?)
}

// ── Authentication ───────────────────────────────────────────

/// Outcome of delegated request authentication.
#[derive(Debug)]
pub enum AuthOutcome {
    Authenticated(SessionEntry),
    /// No credentials present; the gate decides between redirect, challenge
    /// and denial.
    NotAttempted,
    /// Credentials were present but did not verify.
    Failed,
}

/// Attempts to authenticate a request: cached session token first, then a
/// bearer token, then the authorization-code callback leg. Fresh tokens are
/// returned uncached; the caller caches the entry once claims
/// synchronization succeeds, so a failed sync leaves nothing behind.
pub async fn authenticate(
    deployment: &Deployment,
    sessions: &SessionTokenStore,
    session_id: &str,
    bearer: Option<&str>,
    code: Option<&str>,
    redirect_uri: &str,
) -> AuthOutcome {
    if let Some(entry) = sessions.check_current_token(session_id) {
        return AuthOutcome::Authenticated(entry);
    }

    if let Some(token) = bearer {
        return match verify_token(deployment, token).await {
            Ok(verified) => AuthOutcome::Authenticated(verified.into()),
            Err(e) => {
                tracing::debug!("bearer token rejected: {e:#}");
                AuthOutcome::Failed
            }
        };
    }

    if let Some(code) = code {
        let token = match exchange_code(deployment, code, redirect_uri).await {
            Ok(resp) => resp.id_token.or(resp.access_token),
            Err(e) => {
                tracing::debug!("code exchange failed: {e:#}");
                return AuthOutcome::Failed;
            }
        };
        let Some(token) = token else {
            tracing::debug!("token endpoint response carried no token");
            return AuthOutcome::Failed;
        };
        return match verify_token(deployment, &token).await {
            Ok(verified) => AuthOutcome::Authenticated(verified.into()),
            Err(e) => {
                tracing::debug!("exchanged token rejected: {e:#}");
                AuthOutcome::Failed
            }
        };
    }

    AuthOutcome::NotAttempted
}

// ── Challenge ────────────────────────────────────────────────

/// Redirect-URI selection for the OAuth callback: an externally supplied
/// value takes precedence over the URL computed from the current request.
#[derive(Debug, Clone)]
pub enum RedirectUriResolver {
    Fixed(String),
    Computed,
}

impl RedirectUriResolver {
    pub fn from_override(value: Option<String>) -> Self {
        match value {
            Some(uri) => Self::Fixed(uri),
            None => Self::Computed,
        }
    }

    pub fn resolve(&self, request_url: &str) -> String {
        match self {
            Self::Fixed(uri) => uri.clone(),
            Self::Computed => request_url.to_string(),
        }
    }
}

/// The provider-specific login challenge: a redirect to the authorization
/// endpoint.
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub location: Url,
}

impl AuthChallenge {
    /// `None` when the deployment has no authorization endpoint to send the
    /// browser to.
    pub fn build(deployment: &Deployment, redirect_uri: &str) -> Option<Self> {
        let endpoint = deployment.authorization_endpoint.as_deref()?;
        let mut location = Url::parse(endpoint).ok()?;
        location
            .query_pairs_mut()
            .append_pair("client_id", &deployment.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", "openid")
            .append_pair("state", &uuid::Uuid::new_v4().to_string());
        Some(Self { location })
    }

    pub fn into_response(self) -> Response {
        (
            StatusCode::FOUND,
            [(header::LOCATION, self.location.to_string())],
        )
            .into_response()
    }
}

// ── Pre-auth actions ─────────────────────────────────────────

const LOGOUT_PATH: &str = "k_logout";
const VERSION_PATH: &str = "k_version";

/// Provider-pushed single-logout notification body.
#[derive(Debug, Default, Deserialize)]
pub struct LogoutAction {
    #[serde(default, rename = "adapterSessionIds")]
    pub adapter_session_ids: Option<Vec<String>>,
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
struct VersionInfo {
    name: &'static str,
    version: &'static str,
}

/// Handles provider-internal callbacks before any session establishment.
/// Returns the terminal response when the request was one of them.
pub fn handle_pre_auth(path: &str, body: &[u8], sessions: &SessionTokenStore) -> Option<Response> {
    let last = path.trim_end_matches('/').rsplit('/').next()?;
    match last {
        LOGOUT_PATH => {
            let action: LogoutAction = serde_json::from_slice(body).unwrap_or_default();
            if action.all || action.adapter_session_ids.is_none() {
                sessions.clear_all();
            } else if let Some(ids) = action.adapter_session_ids {
                for id in ids {
                    sessions.remove(&id);
                }
            }
            Some(StatusCode::OK.into_response())
        }
        VERSION_PATH => Some(
            axum::Json(VersionInfo {
                name: env!("CARGO_PKG_NAME"),
                version: env!("CARGO_PKG_VERSION"),
            })
            .into_response(),
        ),
        _ => None,
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode_token(header: &str, payload: &str) -> String {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{}.{}.signature",
            engine.encode(header),
            engine.encode(payload)
        )
    }

    fn test_deployment() -> Deployment {
        Deployment {
            issuer_url: "https://auth.example.com/realms/main".into(),
            client_id: "ssogate".into(),
            authorization_endpoint: Some("https://auth.example.com/authorize".into()),
            token_endpoint: None,
            jwks_uri: None,
            end_session_endpoint: None,
        }
    }

    #[test]
    fn extract_kid_from_header() {
        let token = encode_token(r#"{"alg":"RS256","kid":"key-1"}"#, r#"{"sub":"jdoe"}"#);
        assert_eq!(extract_kid(&token), Some("key-1".to_string()));

        let no_kid = encode_token(r#"{"alg":"RS256"}"#, r#"{"sub":"jdoe"}"#);
        assert_eq!(extract_kid(&no_kid), None);
        assert_eq!(extract_kid("not-a-jwt"), None);
    }

    #[test]
    fn decode_token_reads_claims_and_expiry() {
        let token = encode_token(
            r#"{"alg":"RS256"}"#,
            r#"{"sub":"jdoe","given_name":"Jane","exp":9999999999}"#,
        );
        let verified = decode_token(&token).unwrap();
        assert_eq!(verified.claims.subject, "jdoe");
        assert_eq!(verified.claims.given_name.as_deref(), Some("Jane"));
        assert!(verified.expires_at.is_some());
    }

    #[test]
    fn decode_token_rejects_expired() {
        let token = encode_token(r#"{"alg":"RS256"}"#, r#"{"sub":"jdoe","exp":1000000000}"#);
        let err = decode_token(&token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn decode_token_rejects_malformed() {
        assert!(decode_token("only.two").is_err());
        assert!(decode_token("nope").is_err());
    }

    #[test]
    fn redirect_uri_override_wins() {
        let fixed = RedirectUriResolver::from_override(Some("https://app.example.com/cb".into()));
        assert_eq!(
            fixed.resolve("http://localhost:8443/app"),
            "https://app.example.com/cb"
        );

        let computed = RedirectUriResolver::from_override(None);
        assert_eq!(
            computed.resolve("http://localhost:8443/app"),
            "http://localhost:8443/app"
        );
    }

    #[test]
    fn challenge_targets_authorization_endpoint() {
        let challenge =
            AuthChallenge::build(&test_deployment(), "http://localhost:8443/app").unwrap();
        let url = challenge.location.to_string();
        assert!(url.starts_with("https://auth.example.com/authorize?"));
        assert!(url.contains("client_id=ssogate"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("scope=openid"));

        let mut bare = test_deployment();
        bare.authorization_endpoint = None;
        assert!(AuthChallenge::build(&bare, "http://localhost:8443/app").is_none());
    }

    fn session_entry(raw_token: &str) -> SessionEntry {
        SessionEntry {
            raw_token: raw_token.into(),
            claims: IdentityClaims::from_payload(json!({"sub": "jdoe"})).unwrap(),
            expires_at: None,
            identifier: Some("jdoe".into()),
        }
    }

    #[test]
    fn pre_auth_logout_removes_listed_sessions() {
        let sessions = SessionTokenStore::new();
        let entry = session_entry("t");
        sessions.insert("s1", entry.clone());
        sessions.insert("s2", entry.clone());
        sessions.insert("s3", entry);

        let body = br#"{"adapterSessionIds":["s1","s2"]}"#;
        let resp = handle_pre_auth("/app/k_logout", body, &sessions).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(sessions.get("s1").is_none());
        assert!(sessions.get("s2").is_none());
        assert!(sessions.get("s3").is_some());
    }

    #[test]
    fn pre_auth_logout_all_clears_index() {
        let sessions = SessionTokenStore::new();
        let entry = session_entry("t");
        sessions.insert("s1", entry.clone());
        sessions.insert("s2", entry);

        handle_pre_auth("/k_logout", br#"{"all":true}"#, &sessions).unwrap();
        assert!(sessions.is_empty());
    }

    #[test]
    fn pre_auth_ignores_ordinary_paths() {
        let sessions = SessionTokenStore::new();
        assert!(handle_pre_auth("/app/index.html", b"", &sessions).is_none());
        assert!(handle_pre_auth("/", b"", &sessions).is_none());
    }

    #[test]
    fn pre_auth_answers_version_probe() {
        let sessions = SessionTokenStore::new();
        let resp = handle_pre_auth("/app/k_version", b"", &sessions).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn authenticate_prefers_cached_session_token() {
        let sessions = SessionTokenStore::new();
        sessions.insert("s1", session_entry("cached"));

        let outcome = authenticate(&test_deployment(), &sessions, "s1", None, None, "uri").await;
        match outcome {
            AuthOutcome::Authenticated(entry) => assert_eq!(entry.raw_token, "cached"),
            other => panic!("expected Authenticated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn authenticate_returns_fresh_bearer_entry_uncached() {
        let sessions = SessionTokenStore::new();
        let token = encode_token(r#"{"alg":"RS256"}"#, r#"{"sub":"jdoe","exp":9999999999}"#);

        let outcome = authenticate(
            &test_deployment(),
            &sessions,
            "s1",
            Some(token.as_str()),
            None,
            "uri",
        )
        .await;
        match outcome {
            AuthOutcome::Authenticated(entry) => {
                assert_eq!(entry.claims.subject, "jdoe");
                // synchronization has not run yet for this entry
                assert_eq!(entry.identifier, None);
            }
            other => panic!("expected Authenticated, got {other:?}"),
        }
        // nothing cached until the caller's claims sync succeeds
        assert!(sessions.get("s1").is_none());
    }

    #[tokio::test]
    async fn authenticate_without_credentials_is_not_attempted() {
        let sessions = SessionTokenStore::new();
        let outcome = authenticate(&test_deployment(), &sessions, "s1", None, None, "uri").await;
        assert!(matches!(outcome, AuthOutcome::NotAttempted));
    }

    #[tokio::test]
    async fn authenticate_rejects_bad_bearer() {
        let sessions = SessionTokenStore::new();
        let outcome = authenticate(
            &test_deployment(),
            &sessions,
            "s1",
            Some("garbage"),
            None,
            "uri",
        )
        .await;
        assert!(matches!(outcome, AuthOutcome::Failed));
        assert!(sessions.get("s1").is_none());
    }
}
