use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Extension, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssogate::adapter::{Deployment, RedirectUriResolver};
use ssogate::gate::{self, GateState, ResolvedIdentity};
use ssogate::session::SessionTokenStore;
use ssogate::store::memory::{MemoryDirectory, MemoryStore};
use ssogate::sync::ClaimsSynchronizer;
use ssogate::{config, logout};

/// Shared application state for handlers outside the gate.
struct AppState {
    sessions: Arc<SessionTokenStore>,
    deployment: Option<Deployment>,
    config: config::Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ssogate=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;

    // Prefer discovery; fall back to explicitly configured endpoints.
    let deployment = if cfg.deployment_configured() {
        match Deployment::discover(&cfg).await {
            Ok(deployment) => Some(deployment),
            Err(e) => {
                tracing::warn!("OIDC discovery failed, using configured endpoints: {e:#}");
                Deployment::resolve(&cfg)
            }
        }
    } else {
        None
    };

    let sessions = Arc::new(SessionTokenStore::new());
    {
        // Abandoned sessions are never looked up again, so expired entries
        // need an active sweep.
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                interval.tick().await;
                sessions.evict_expired();
            }
        });
    }
    let store = MemoryStore::new();
    let directory = Arc::new(MemoryDirectory::new());
    let synchronizer = Arc::new(ClaimsSynchronizer::new(
        Arc::new(store),
        directory.clone(),
        directory.clone(),
        directory,
        cfg.permissions,
    ));

    let gate_state = Arc::new(GateState {
        deployment: deployment.clone(),
        sessions: Arc::clone(&sessions),
        synchronizer,
        redirect_uri: RedirectUriResolver::from_override(cfg.redirect_uri_override.clone()),
        public_scheme: cfg.public_scheme.clone(),
        context_path: cfg.context_path.clone(),
    });

    let app_state = Arc::new(AppState {
        sessions,
        deployment,
        config: cfg.clone(),
    });

    let app = Router::new()
        .route("/", get(whoami))
        .route("/logout", get(logout_handler))
        .with_state(app_state)
        .layer(axum::middleware::from_fn_with_state(
            gate_state,
            gate::authenticate_request,
        ))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    tracing::info!("ssogate listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("binding listener")?;
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}

/// Downstream demo handler: shows the identity the gate resolved.
async fn whoami(Extension(identity): Extension<ResolvedIdentity>) -> impl IntoResponse {
    format!("authenticated as {}", identity.identifier)
}

/// End-user logout: returns the provider logout URL for this session.
async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    let session_id = headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == gate::SESSION_COOKIE).then(|| value.to_string())
            })
        });

    let url = session_id
        .and_then(|id| state.sessions.get(&id))
        .zip(state.deployment.as_ref())
        .and_then(|(entry, deployment)| logout::logout_url(&entry, deployment, &state.config));

    match url {
        Some(url) => url.into_response(),
        None => axum::http::StatusCode::FORBIDDEN.into_response(),
    }
}
