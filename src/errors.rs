use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures surfaced by the authentication gate.
///
/// The request pipeline only ever observes "admitted with identity" or a
/// denial; everything here maps to a terminal HTTP response.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("identity provider deployment not configured")]
    NoDeployment,

    #[error("request denied")]
    Denied,

    #[error("claims synchronization failed")]
    SyncFailed,

    #[error("adapter error: {0}")]
    Adapter(#[from] anyhow::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            AuthError::NoDeployment => {
                tracing::error!("deployment not configured");
                StatusCode::FORBIDDEN.into_response()
            }
            // Denials carry no body: the caller learns nothing about why.
            AuthError::Denied | AuthError::SyncFailed => StatusCode::FORBIDDEN.into_response(),
            AuthError::Adapter(e) => {
                tracing::error!("adapter error: {e:#}");
                StatusCode::FORBIDDEN.into_response()
            }
        }
    }
}

/// Failures inside one claims-synchronization transaction.
///
/// None of these escape `login`; they are converted to an absent result plus
/// a log entry at the gate boundary.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no local identity for subject '{0}' and creation not permitted")]
    PersonNotFound(String),

    #[error("identity vanished after synchronization: '{0}'")]
    IdentityVanished(String),

    #[error("identity store error: {0}")]
    Store(#[from] anyhow::Error),
}
