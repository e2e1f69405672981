//! The per-request authentication gate.
//!
//! Every inbound request is classified into a terminal outcome: pre-auth
//! callbacks and denials are answered directly, unauthenticated requests get
//! a challenge or a top-frame redirect, and authenticated requests are
//! forwarded downstream only after claims synchronization succeeds. The
//! ordering matters: no application code runs before the local identity is
//! fully reconciled, and single-logout always wins over establishing new
//! sessions.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::adapter::{
    self, AuthChallenge, AuthOutcome, Deployment, RedirectUriResolver,
};
use crate::config::to_boolean;
use crate::errors::AuthError;
use crate::session::{SessionEntry, SessionTokenStore};
use crate::sync::ClaimsSynchronizer;

/// Session cookie carrying the gateway's session id.
pub const SESSION_COOKIE: &str = "SSOGATE_SESSION";

/// Header / parameter flag marking a partial-page (AJAX) request.
const AJAX_HEADER: &str = "Wicket-Ajax";
const AJAX_PARAM: &str = "wicket-ajax";

const PRE_AUTH_BODY_LIMIT: usize = 64 * 1024;

/// Terminal classification of one request. Logged per request; no state
/// survives beyond the session token store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    NoDeployment,
    PreAuthHandled,
    Authenticated,
    ChallengeIssued,
    RedirectIssued,
    Denied,
}

/// Identity attached to admitted requests, readable by downstream handlers
/// via request extensions.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub identifier: String,
}

/// Shared state of the authentication gate.
pub struct GateState {
    pub deployment: Option<Deployment>,
    pub sessions: Arc<SessionTokenStore>,
    pub synchronizer: Arc<ClaimsSynchronizer>,
    pub redirect_uri: RedirectUriResolver,
    /// External scheme of this gateway as seen by browsers.
    pub public_scheme: String,
    /// Context path the protected application is mounted at.
    pub context_path: String,
}

/// Axum middleware running the authentication state machine.
pub async fn authenticate_request(
    State(state): State<Arc<GateState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(deployment) = state.deployment.as_ref() else {
        tracing::debug!(outcome = ?GateOutcome::NoDeployment, "gate");
        return AuthError::NoDeployment.into_response();
    };

    // Provider-internal callbacks run before anything else.
    let path = req.uri().path().to_string();
    if is_pre_auth_path(&path) {
        let (_, body) = req.into_parts();
        let bytes = to_bytes(body, PRE_AUTH_BODY_LIMIT)
            .await
            .unwrap_or_default();
        if let Some(resp) = adapter::handle_pre_auth(&path, &bytes, &state.sessions) {
            tracing::debug!(outcome = ?GateOutcome::PreAuthHandled, %path, "gate");
            return resp;
        }
        return AuthError::Denied.into_response();
    }

    adapter::try_register_node(deployment);

    let (session_id, fresh_session) = session_id_from(req.headers());
    let query = parse_query(req.uri().query());
    let has_query = req.uri().query().is_some();
    let bearer = bearer_from(req.headers());
    let ajax = ajax_flag(req.headers(), &query);
    let request_url = request_url(&state, req.headers());
    let redirect_uri = state.redirect_uri.resolve(&request_url);
    let code = query.get("code").map(String::as_str);

    let outcome = adapter::authenticate(
        deployment,
        &state.sessions,
        &session_id,
        bearer.as_deref(),
        code,
        &redirect_uri,
    )
    .await;

    match outcome {
        AuthOutcome::Authenticated(entry) => {
            if let Some(resp) = handle_authenticated_actions(&path, &entry) {
                tracing::debug!(outcome = ?GateOutcome::Authenticated, %path, "gate: action handled");
                return resp;
            }
            // Sessions synchronize once, at establishment. A populated
            // identifier means the sync already ran for this session.
            if let Some(identifier) = entry.identifier.clone() {
                tracing::debug!(outcome = ?GateOutcome::Authenticated, %identifier, "gate");
                let mut req = req;
                req.extensions_mut().insert(ResolvedIdentity { identifier });
                let mut resp = next.run(req).await;
                if fresh_session {
                    set_session_cookie(&mut resp, &session_id);
                }
                return resp;
            }
            // An authenticated but unsynchronizable identity is never
            // admitted, and its token is never cached.
            match state.synchronizer.login(&entry.claims).await {
                Some(identifier) => {
                    tracing::debug!(outcome = ?GateOutcome::Authenticated, %identifier, "gate: session established");
                    let mut entry = entry;
                    entry.identifier = Some(identifier.clone());
                    state.sessions.insert(&session_id, entry);
                    let mut req = req;
                    req.extensions_mut().insert(ResolvedIdentity { identifier });
                    let mut resp = next.run(req).await;
                    if fresh_session {
                        set_session_cookie(&mut resp, &session_id);
                    }
                    resp
                }
                None => {
                    tracing::debug!(outcome = ?GateOutcome::Denied, "gate: synchronization failed");
                    AuthError::SyncFailed.into_response()
                }
            }
        }
        AuthOutcome::NotAttempted | AuthOutcome::Failed => {
            if has_query {
                // Callback leg or an embedded frame: break out to top level.
                tracing::debug!(outcome = ?GateOutcome::RedirectIssued, ajax, "gate");
                return top_frame_redirect(&request_url, ajax);
            }
            if let Some(challenge) = AuthChallenge::build(deployment, &redirect_uri) {
                tracing::debug!(outcome = ?GateOutcome::ChallengeIssued, "gate");
                let mut resp = challenge.into_response();
                if fresh_session {
                    set_session_cookie(&mut resp, &session_id);
                }
                return resp;
            }
            tracing::debug!(outcome = ?GateOutcome::Denied, "gate");
            AuthError::Denied.into_response()
        }
    }
}

fn is_pre_auth_path(path: &str) -> bool {
    let last = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    matches!(last, "k_logout" | "k_version")
}

/// Authenticated-actions hooks that fully handle the response themselves.
fn handle_authenticated_actions(path: &str, entry: &SessionEntry) -> Option<Response> {
    let last = path.trim_end_matches('/').rsplit('/').next()?;
    if last == "k_query_bearer_token" {
        return Some(entry.raw_token.clone().into_response());
    }
    None
}

/// Session id from the session cookie, or a fresh one. The bool reports
/// whether the id is new and needs a Set-Cookie on the way out.
fn session_id_from(headers: &HeaderMap) -> (String, bool) {
    let from_cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == SESSION_COOKIE).then(|| value.to_string())
            })
        });
    match from_cookie {
        Some(id) if !id.is_empty() => (id, false),
        _ => (Uuid::new_v4().to_string(), true),
    }
}

fn set_session_cookie(resp: &mut Response, session_id: &str) {
    let cookie = format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly");
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        resp.headers_mut().append(header::SET_COOKIE, value);
    }
}

fn bearer_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from)
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    match query {
        Some(q) => url::form_urlencoded::parse(q.as_bytes())
            .into_owned()
            .collect(),
        None => HashMap::new(),
    }
}

fn ajax_flag(headers: &HeaderMap, query: &HashMap<String, String>) -> bool {
    let header_flag = headers
        .get(AJAX_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(to_boolean)
        .unwrap_or(false);
    let param_flag = query.get(AJAX_PARAM).map(|v| to_boolean(v)).unwrap_or(false);
    header_flag || param_flag
}

/// scheme://host:port + context path of the current request, the target of
/// top-frame redirects and the computed OAuth callback URL.
fn request_url(state: &GateState, headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{}://{}{}", state.public_scheme, host, state.context_path)
}

// ── Top-frame redirect responses ─────────────────────────────

/// Escapes a string for safe embedding in a script literal, preventing
/// script injection via reflected URL components.
pub fn escape_ecmascript(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04X}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Body instructing the client to navigate `top.location`, in the shape the
/// requesting side expects: an XML partial-response fragment for AJAX
/// requests, a minimal HTML document otherwise.
pub fn top_frame_redirect(uri: &str, ajax: bool) -> Response {
    let escaped = escape_ecmascript(uri);
    if ajax {
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <ajax-response><evaluate>\
             \n/*<![CDATA[*/\n\
             \x20 top.location = \"{escaped}\";\
             \n/*]]>*/\n\
             </evaluate></ajax-response>"
        );
        tracing::debug!("responding ajax: {body}");
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/xml")],
            Body::from(body),
        )
            .into_response()
    } else {
        let body = format!(
            "<html> <head>\
             <script type=\"text/javascript\" >\
             function test4top() {{\n\
             \x20 if(top!=self) {{\n\
             \x20   top.location = \"{escaped}\";\
             \x20 }}\n\
             }}\n\
             </script>\n</head>\
             <body  onload=\"test4top()\"></body>\
             </html> "
        );
        tracing::debug!("responding html: {body}");
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html")],
            Body::from(body),
        )
            .into_response()
    }
}

// ── Tests ────────────────────────────────────────────────────
