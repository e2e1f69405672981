//! Identity claims decoded from a verified ID token.
//!
//! Claims arrive as an open-ended key/value map. Rather than reflecting on
//! arbitrary keys, the extension claims this gateway understands are a closed
//! set of documented constants with typed accessors; anything else in
//! `other_claims` is carried but ignored.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use uuid::Uuid;

/// List-valued role claim. Each entry is a role UUID or a role name.
pub const ROLES_CLAIM: &str = "roles";
/// `|`-delimited company/tenant claim.
pub const COMPANIES_CLAIM: &str = "companies";
/// BCP-47 locale tag claim (e.g. "es-PE").
pub const LOCALE_CLAIM: &str = "locale";
/// Time-zone identifier claim (e.g. "America/Lima").
pub const TIME_ZONE_CLAIM: &str = "timeZone";
/// Language code claim, resolved through the language directory.
pub const LANGUAGE_CLAIM: &str = "language";

/// Claims carried by a verified identity token.
///
/// Constructed fresh per request from the token payload; never persisted.
#[derive(Debug, Clone)]
pub struct IdentityClaims {
    /// Stable subject identifier: a UUID or a provider-specific login name.
    pub subject: String,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    /// Fallback display name used when `subject` is an opaque UUID.
    pub preferred_username: Option<String>,
    /// Remaining claims, including the extension keys above.
    pub other_claims: Map<String, Value>,
}

impl IdentityClaims {
    /// Builds claims from a decoded token payload.
    ///
    /// The standard profile claims are lifted out; everything else stays in
    /// `other_claims`.
    pub fn from_payload(payload: Value) -> anyhow::Result<Self> {
        let Value::Object(mut map) = payload else {
            anyhow::bail!("token payload is not a JSON object");
        };

        let subject = map
            .remove("sub")
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| anyhow::anyhow!("token missing 'sub' claim"))?;

        let take_str = |map: &mut Map<String, Value>, key: &str| {
            map.remove(key).and_then(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
        };

        let given_name = take_str(&mut map, "given_name");
        let family_name = take_str(&mut map, "family_name");
        let preferred_username = take_str(&mut map, "preferred_username");

        Ok(Self {
            subject,
            given_name,
            family_name,
            preferred_username,
            other_claims: map,
        })
    }

    /// True when the subject is an opaque UUID rather than a login name.
    pub fn subject_is_uuid(&self) -> bool {
        is_uuid(&self.subject)
    }

    /// Role claim entries, if the roles extension claim is present.
    pub fn roles(&self) -> Option<Vec<String>> {
        self.other_claims.get(ROLES_CLAIM).and_then(|v| {
            v.as_array().map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.as_str().map(String::from))
                    .collect()
            })
        })
    }

    /// Company claim entries, split on `|`. Empty segments are dropped.
    pub fn companies(&self) -> Option<Vec<String>> {
        self.string_claim(COMPANIES_CLAIM).map(|raw| {
            raw.split('|')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
    }

    pub fn locale(&self) -> Option<&str> {
        self.string_claim(LOCALE_CLAIM)
    }

    pub fn time_zone(&self) -> Option<&str> {
        self.string_claim(TIME_ZONE_CLAIM)
    }

    pub fn language(&self) -> Option<&str> {
        self.string_claim(LANGUAGE_CLAIM)
    }

    fn string_claim(&self, key: &str) -> Option<&str> {
        self.other_claims
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Checks whether a subject / claim entry is a UUID.
pub fn is_uuid(value: &str) -> bool {
    Uuid::parse_str(value).is_ok()
}

static LANGUAGE_TAG: Lazy<Regex> = Lazy::new(|| {
    // Primary language subtag plus optional script/region/variant subtags.
    Regex::new(r"^[A-Za-z]{2,8}(-[A-Za-z0-9]{1,8})*$").expect("valid language tag pattern")
});

/// Validates a locale claim as a plausible BCP-47 language tag.
pub fn is_language_tag(tag: &str) -> bool {
    LANGUAGE_TAG.is_match(tag)
}

/// Validates a time-zone claim against the IANA database.
pub fn is_time_zone(id: &str) -> bool {
    id.parse::<chrono_tz::Tz>().is_ok()
}

// ── Tests ────────────────────────────────────────────────────
