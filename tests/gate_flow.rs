//! Integration tests for the request-classification state machine:
//! the full middleware path from inbound request to terminal response.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Extension;
use axum::http::{header, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use base64::Engine;
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;

use ssogate::adapter::{Deployment, RedirectUriResolver};
use ssogate::claims::IdentityClaims;
use ssogate::config::SyncPermissions;
use ssogate::gate::{self, GateState, ResolvedIdentity};
use ssogate::session::{SessionEntry, SessionTokenStore};
use ssogate::store::memory::{MemoryDirectory, MemoryStore};
use ssogate::sync::ClaimsSynchronizer;

fn test_deployment() -> Deployment {
    Deployment {
        issuer_url: "https://auth.example.com/realms/main".into(),
        client_id: "ssogate".into(),
        authorization_endpoint: Some("https://auth.example.com/authorize".into()),
        token_endpoint: None,
        jwks_uri: None,
        end_session_endpoint: Some("https://auth.example.com/logout".into()),
    }
}

struct Harness {
    app: Router,
    sessions: Arc<SessionTokenStore>,
    store: MemoryStore,
}

fn harness(deployment: Option<Deployment>, permissions: SyncPermissions) -> Harness {
    harness_with_context(deployment, permissions, "/app")
}

fn harness_with_context(
    deployment: Option<Deployment>,
    permissions: SyncPermissions,
    context_path: &str,
) -> Harness {
    let sessions = Arc::new(SessionTokenStore::new());
    let store = MemoryStore::new();
    let directory = Arc::new(MemoryDirectory::new());
    let synchronizer = Arc::new(ClaimsSynchronizer::new(
        Arc::new(store.clone()),
        directory.clone(),
        directory.clone(),
        directory,
        permissions,
    ));
    let state = Arc::new(GateState {
        deployment,
        sessions: Arc::clone(&sessions),
        synchronizer,
        redirect_uri: RedirectUriResolver::Computed,
        public_scheme: "http".into(),
        context_path: context_path.into(),
    });

    let app = Router::new()
        .route("/", get(whoami))
        .route("/*rest", get(whoami))
        .layer(axum::middleware::from_fn_with_state(
            state,
            gate::authenticate_request,
        ));
    Harness {
        app,
        sessions,
        store,
    }
}

async fn whoami(Extension(identity): Extension<ResolvedIdentity>) -> String {
    format!("authenticated as {}", identity.identifier)
}

fn permissions_all() -> SyncPermissions {
    SyncPermissions {
        permit_role_update: true,
        permit_company_update: true,
        permit_attribute_update: true,
        permit_create_person: true,
    }
}

fn unsigned_token(payload: serde_json::Value) -> String {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    format!(
        "{}.{}.signature",
        engine.encode(r#"{"alg":"RS256"}"#),
        engine.encode(payload.to_string())
    )
}

async fn body_string(resp: axum::response::Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn no_deployment_is_403() {
    let h = harness(None, permissions_all());
    let resp = h
        .app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unauthenticated_with_query_gets_html_top_frame_redirect() {
    // contextPath containing a quote must render escaped inside the script
    let h = harness_with_context(Some(test_deployment()), permissions_all(), "/c\"p");
    let resp = h
        .app
        .oneshot(
            Request::get("/?state=abc")
                .header(header::HOST, "gw.example.com:8443")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_string(resp).await;
    assert!(body.contains("test4top()"));
    assert!(body.contains(r#"top.location = "http:\/\/gw.example.com:8443\/c\"p""#));
}

#[tokio::test]
async fn unauthenticated_ajax_gets_xml_fragment() {
    let h = harness(Some(test_deployment()), permissions_all());
    let resp = h
        .app
        .oneshot(
            Request::get("/?state=abc")
                .header(header::HOST, "gw.example.com:8443")
                .header("Wicket-Ajax", "true")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_string(resp).await;
    assert!(body.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
    assert!(body.contains("<ajax-response><evaluate>"));
    assert!(body.contains(r#"top.location = "http:\/\/gw.example.com:8443\/app""#));
}

#[tokio::test]
async fn ajax_param_selects_xml_variant_too() {
    let h = harness(Some(test_deployment()), permissions_all());
    let resp = h
        .app
        .oneshot(
            Request::get("/?wicket-ajax=true")
                .header(header::HOST, "gw.example.com:8443")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_string(resp).await;
    assert!(body.contains("<ajax-response>"));
}

#[tokio::test]
async fn unauthenticated_without_query_is_challenged() {
    let h = harness(Some(test_deployment()), permissions_all());
    let resp = h
        .app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FOUND);
    let location = resp
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(location.starts_with("https://auth.example.com/authorize?"));
    assert!(location.contains("client_id=ssogate"));
}

#[tokio::test]
async fn no_challenge_available_is_403() {
    let mut deployment = test_deployment();
    deployment.authorization_endpoint = None;
    let h = harness(Some(deployment), permissions_all());
    let resp = h
        .app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn bearer_token_admits_request_with_resolved_identity() {
    let h = harness(Some(test_deployment()), permissions_all());
    let token = unsigned_token(json!({"sub": "jdoe", "exp": 9999999999i64}));
    let resp = h
        .app
        .oneshot(
            Request::get("/")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    // fresh session gets a cookie on the way out
    assert!(resp.headers().get(header::SET_COOKIE).is_some());
    let body = body_string(resp).await;
    assert_eq!(body, "authenticated as jdoe");
    assert!(h.store.snapshot_of("jdoe").is_some());
}

#[tokio::test]
async fn cached_session_skips_token_exchange() {
    let h = harness(Some(test_deployment()), permissions_all());
    h.sessions.insert(
        "s1",
        SessionEntry {
            raw_token: "cached".into(),
            claims: IdentityClaims::from_payload(json!({"sub": "jdoe"})).unwrap(),
            expires_at: None,
            identifier: Some("jdoe".into()),
        },
    );

    let resp = h
        .app
        .oneshot(
            Request::get("/")
                .header(header::COOKIE, "SSOGATE_SESSION=s1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "authenticated as jdoe");
}

#[tokio::test]
async fn unsynchronizable_identity_is_denied() {
    // create-person disabled and no pre-existing record: sync must fail
    let mut permissions = permissions_all();
    permissions.permit_create_person = false;
    let h = harness(Some(test_deployment()), permissions);
    let token = unsigned_token(json!({"sub": "stranger", "exp": 9999999999i64}));
    let resp = h
        .app
        .oneshot(
            Request::get("/")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(h.store.is_empty());
    // the rejected token must not linger in the session index
    assert!(h.sessions.is_empty());
}

#[tokio::test]
async fn established_session_survives_store_outage() {
    let h = harness(Some(test_deployment()), permissions_all());
    let token = unsigned_token(json!({"sub": "jdoe", "exp": 9999999999i64}));

    // first request establishes the session and runs the sync
    let resp = h
        .app
        .clone()
        .oneshot(
            Request::get("/")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let cookie = resp
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    assert!(h.store.snapshot_of("jdoe").is_some());

    // requests two..n in the same session must not reopen the transaction,
    // so a broken store no longer affects them
    h.store.fail_commits(true);
    let resp = h
        .app
        .oneshot(
            Request::get("/")
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "authenticated as jdoe");
}

#[tokio::test]
async fn single_logout_invalidate_listed_sessions() {
    let h = harness(Some(test_deployment()), permissions_all());
    let entry = SessionEntry {
        raw_token: "t".into(),
        claims: IdentityClaims::from_payload(json!({"sub": "jdoe"})).unwrap(),
        expires_at: None,
        identifier: Some("jdoe".into()),
    };
    h.sessions.insert("s1", entry.clone());
    h.sessions.insert("s2", entry.clone());
    h.sessions.insert("s3", entry);

    let resp = h
        .app
        .oneshot(
            Request::get("/k_logout")
                .body(Body::from(r#"{"adapterSessionIds":["s1","s2"]}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(h.sessions.get("s1").is_none());
    assert!(h.sessions.get("s2").is_none());
    assert!(h.sessions.get("s3").is_some());
}

#[tokio::test]
async fn single_logout_all_clears_index() {
    let h = harness(Some(test_deployment()), permissions_all());
    let entry = SessionEntry {
        raw_token: "t".into(),
        claims: IdentityClaims::from_payload(json!({"sub": "jdoe"})).unwrap(),
        expires_at: None,
        identifier: Some("jdoe".into()),
    };
    h.sessions.insert("s1", entry.clone());
    h.sessions.insert("s2", entry);

    let resp = h
        .app
        .oneshot(
            Request::get("/k_logout")
                .body(Body::from(r#"{"all":true}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(h.sessions.is_empty());
}

#[tokio::test]
async fn version_probe_is_answered_before_authentication() {
    let h = harness(Some(test_deployment()), permissions_all());
    let resp = h
        .app
        .oneshot(Request::get("/k_version").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_string(resp).await;
    assert!(body.contains("ssogate"));
}

#[tokio::test]
async fn query_bearer_token_action_returns_raw_token() {
    let h = harness(Some(test_deployment()), permissions_all());
    h.sessions.insert(
        "s1",
        SessionEntry {
            raw_token: "the-raw-token".into(),
            claims: IdentityClaims::from_payload(json!({"sub": "jdoe"})).unwrap(),
            expires_at: None,
            identifier: Some("jdoe".into()),
        },
    );
    let resp = h
        .app
        .oneshot(
            Request::get("/k_query_bearer_token")
                .header(header::COOKIE, "SSOGATE_SESSION=s1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "the-raw-token");
}
