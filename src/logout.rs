//! Logout URL construction.
//!
//! Invoked by an end-user logout action, independently of the gate. Builds
//! the provider's end-session URL with the session's raw ID token as
//! `id_token_hint`; a configured post-logout redirect is added when the
//! lookup succeeds, and skipped (logged, non-fatal) when it does not.

use url::Url;

use crate::adapter::Deployment;
use crate::config::Config;
use crate::session::SessionEntry;

/// Source of the externally configured post-logout redirect URI. The lookup
/// may fail without failing the logout URL as a whole.
pub trait PostLogoutRedirectSource: Send + Sync {
    fn post_logout_redirect_uri(&self) -> anyhow::Result<Option<String>>;
}

impl PostLogoutRedirectSource for Config {
    fn post_logout_redirect_uri(&self) -> anyhow::Result<Option<String>> {
        Ok(self.post_logout_redirect_uri.clone())
    }
}

/// Builds the identity provider's logout URL for a session.
///
/// `None` when the deployment carries no end-session endpoint.
pub fn logout_url(
    entry: &SessionEntry,
    deployment: &Deployment,
    redirect_source: &dyn PostLogoutRedirectSource,
) -> Option<String> {
    let endpoint = deployment.end_session_endpoint.as_deref()?;
    let mut url = match Url::parse(endpoint) {
        Ok(url) => url,
        Err(e) => {
            tracing::error!("invalid end-session endpoint '{endpoint}': {e}");
            return None;
        }
    };

    replace_query_param(&mut url, "id_token_hint", &entry.raw_token);

    match redirect_source.post_logout_redirect_uri() {
        Ok(Some(redirect_uri)) => {
            replace_query_param(&mut url, "post_logout_redirect_uri", &redirect_uri);
        }
        Ok(None) => {}
        Err(e) => {
            // Degraded but valid: the logout URL still works without the
            // redirect parameter.
            tracing::error!("post-logout redirect lookup failed: {e:#}");
        }
    }

    Some(url.to_string())
}

/// Sets a query parameter, replacing any value the endpoint template
/// already carries for it.
fn replace_query_param(url: &mut Url, key: &str, value: &str) {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.set_query(None);
    let mut pairs = url.query_pairs_mut();
    for (k, v) in &kept {
        pairs.append_pair(k, v);
    }
    pairs.append_pair(key, value);
}

// ── Tests ────────────────────────────────────────────────────
