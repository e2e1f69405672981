//! Per-session token cache.
//!
//! Repeated requests in the same session skip the full protocol exchange by
//! reading the cached verified token here. The index is shared across
//! request threads and the single-logout callback; a removal racing an
//! in-flight request simply leaves that request with a stale cached token,
//! and the next authentication round re-validates.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::claims::IdentityClaims;

/// Cached verified token for one session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// Raw ID token string, needed verbatim for `id_token_hint` at logout.
    pub raw_token: String,
    pub claims: IdentityClaims,
    pub expires_at: Option<DateTime<Utc>>,
    /// Local identifier resolved by claims synchronization when the session
    /// was established. Present means the sync already ran for this session;
    /// later requests attach it without opening another transaction.
    pub identifier: Option<String>,
}

impl SessionEntry {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() >= at,
            None => false,
        }
    }
}

/// Server-wide index from session id to its cached token.
///
/// At most one entry per session id. Request threads read and write their
/// own session's entry; the asynchronous single-logout callback removes
/// entries concurrently.
#[derive(Default)]
pub struct SessionTokenStore {
    index: DashMap<String, SessionEntry>,
}

impl SessionTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the cached token for a session, evicting it when expired.
    /// Returns the still-valid entry, if any.
    pub fn check_current_token(&self, session_id: &str) -> Option<SessionEntry> {
        if let Some(entry) = self.index.get(session_id) {
            if !entry.is_expired() {
                return Some(entry.clone());
            }
            drop(entry);
            tracing::debug!(session_id, "evicting expired session token");
            self.index.remove(session_id);
        }
        None
    }

    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        self.index.get(session_id).map(|e| e.clone())
    }

    pub fn insert(&self, session_id: &str, entry: SessionEntry) {
        self.index.insert(session_id.to_string(), entry);
    }

    /// Single-logout for one session.
    pub fn remove(&self, session_id: &str) {
        tracing::debug!(session_id, "removing session token");
        self.index.remove(session_id);
    }

    /// Single-logout for every session ("logout all").
    pub fn clear_all(&self) {
        tracing::debug!(sessions = self.index.len(), "clearing all session tokens");
        self.index.clear();
    }

    /// Drops every expired entry. Run periodically so sessions that are
    /// never revisited do not accumulate in the index.
    pub fn evict_expired(&self) -> usize {
        let before = self.index.len();
        self.index.retain(|_, entry| !entry.is_expired());
        let evicted = before - self.index.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted expired session tokens");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────
