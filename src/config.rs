use serde::Deserialize;

/// The four switches gating claims synchronization. Absence of a permission
/// is a silent skip of that portion, never an error.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SyncPermissions {
    pub permit_role_update: bool,
    pub permit_company_update: bool,
    pub permit_attribute_update: bool,
    pub permit_create_person: bool,
}

impl Default for SyncPermissions {
    fn default() -> Self {
        Self {
            permit_role_update: false,
            permit_company_update: false,
            permit_attribute_update: false,
            permit_create_person: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    /// OIDC issuer, used for discovery (e.g. "https://auth.example.com/realms/main").
    pub issuer_url: Option<String>,
    pub client_id: Option<String>,
    /// Explicit endpoints; when unset they come from discovery.
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub jwks_uri: Option<String>,
    pub end_session_endpoint: Option<String>,
    /// Externally supplied OAuth callback URL. When present it takes
    /// precedence over the URL computed from the current request.
    pub redirect_uri_override: Option<String>,
    pub post_logout_redirect_uri: Option<String>,
    /// External scheme of this gateway as seen by browsers.
    pub public_scheme: String,
    /// Servlet-style context path the protected application is mounted at.
    pub context_path: String,
    pub permissions: SyncPermissions,
}

impl Config {
    /// A deployment is configured once issuer and client id are both known.
    pub fn deployment_configured(&self) -> bool {
        self.issuer_url.is_some() && self.client_id.is_some()
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let flag = |name: &str| {
        std::env::var(name)
            .map(|v| to_boolean(&v))
            .unwrap_or(false)
    };

    Ok(Config {
        port: std::env::var("SSOGATE_PORT")
            .unwrap_or_else(|_| "8443".into())
            .parse()
            .unwrap_or(8443),
        issuer_url: std::env::var("SSOGATE_ISSUER_URL").ok(),
        client_id: std::env::var("SSOGATE_CLIENT_ID").ok(),
        authorization_endpoint: std::env::var("SSOGATE_AUTH_ENDPOINT").ok(),
        token_endpoint: std::env::var("SSOGATE_TOKEN_ENDPOINT").ok(),
        jwks_uri: std::env::var("SSOGATE_JWKS_URI").ok(),
        end_session_endpoint: std::env::var("SSOGATE_END_SESSION_ENDPOINT").ok(),
        redirect_uri_override: std::env::var("REDIRECT_URI").ok(),
        post_logout_redirect_uri: std::env::var("SSOGATE_POST_LOGOUT_REDIRECT_URI").ok(),
        public_scheme: std::env::var("SSOGATE_PUBLIC_SCHEME").unwrap_or_else(|_| "http".into()),
        context_path: std::env::var("SSOGATE_CONTEXT_PATH").unwrap_or_default(),
        permissions: SyncPermissions {
            permit_role_update: flag("SSOGATE_PERMIT_ROLE_UPDATE"),
            permit_company_update: flag("SSOGATE_PERMIT_COMPANY_UPDATE"),
            permit_attribute_update: flag("SSOGATE_PERMIT_ATTRIBUTE_UPDATE"),
            permit_create_person: flag("SSOGATE_PERMIT_CREATE_PERSON"),
        },
    })
}

/// Lenient boolean parsing for flags arriving as headers, parameters or env
/// values: "true", "yes" and "on" count, case-insensitively.
pub fn to_boolean(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}
