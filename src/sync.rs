//! Claims synchronization.
//!
//! Runs at most once per successful authentication: reconciles the verified
//! token's claims into the local identity store under one transaction. The
//! store is never left partially updated; either the final existence check
//! passes and the transaction commits, or everything rolls back.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::claims::{is_language_tag, is_time_zone, IdentityClaims};
use crate::config::SyncPermissions;
use crate::errors::SyncError;
use crate::store::{
    AttrName, CompanyRef, CompanyResolver, IdentityStore, LanguageResolver, LocalIdentity,
    RoleRef, RoleResolver,
};

/// Reconciles identity claims into the local identity store.
pub struct ClaimsSynchronizer {
    store: Arc<dyn IdentityStore>,
    roles: Arc<dyn RoleResolver>,
    companies: Arc<dyn CompanyResolver>,
    languages: Arc<dyn LanguageResolver>,
    permissions: SyncPermissions,
}

impl ClaimsSynchronizer {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        roles: Arc<dyn RoleResolver>,
        companies: Arc<dyn CompanyResolver>,
        languages: Arc<dyn LanguageResolver>,
        permissions: SyncPermissions,
    ) -> Self {
        Self {
            store,
            roles,
            companies,
            languages,
            permissions,
        }
    }

    /// Entry point invoked once per session establishment attempt.
    ///
    /// Wraps [`synchronize`](Self::synchronize) in one transaction and
    /// contains every failure: the caller only observes the resolved
    /// identifier or absence.
    pub async fn login(&self, claims: &IdentityClaims) -> Option<String> {
        let tx = match self.store.begin_transaction().await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::error!("could not begin transaction: {e:#}");
                return None;
            }
        };

        match self.synchronize(claims).await {
            Ok(identifier) => match tx.commit().await {
                Ok(()) => Some(identifier),
                Err(e) => {
                    tracing::error!("could not commit synchronization: {e:#}");
                    self.log_transaction_state(tx.as_ref());
                    if let Err(e) = tx.rollback().await {
                        tracing::error!("rollback failed: {e:#}");
                    }
                    None
                }
            },
            Err(e) => {
                tracing::error!("could not synchronize identity: {e}");
                self.log_transaction_state(tx.as_ref());
                if let Err(e) = tx.rollback().await {
                    tracing::error!("rollback failed: {e:#}");
                }
                None
            }
        }
    }

    fn log_transaction_state(&self, tx: &dyn crate::store::Transaction) {
        if tx.is_marked_rollback() {
            tracing::error!("transaction is marked to roll back");
        } else {
            tracing::error!("transaction manager in undefined status");
        }
    }

    /// The reconciliation itself, inside the ambient transaction.
    pub async fn synchronize(&self, claims: &IdentityClaims) -> Result<String, SyncError> {
        let identity = self.resolve_or_create(claims).await?;
        let identifier = identity.identifier.clone();

        self.sync_attributes(&identity, claims).await?;
        self.sync_roles(&identifier, claims).await?;
        self.sync_companies(&identifier, claims).await?;

        self.store.reset(&identifier).await?;

        // Final existence check; anything less than a resolvable identity
        // fails the whole transaction.
        if self.find_identity(&claims.subject).await?.is_none() {
            return Err(SyncError::IdentityVanished(claims.subject.clone()));
        }
        Ok(identifier)
    }

    /// Step 1: look up by subject (UUID first, then plain login name);
    /// create when permitted, fail otherwise.
    async fn resolve_or_create(
        &self,
        claims: &IdentityClaims,
    ) -> Result<LocalIdentity, SyncError> {
        if let Some(identity) = self.find_identity(&claims.subject).await? {
            return Ok(identity);
        }
        if !self.permissions.permit_create_person {
            return Err(SyncError::PersonNotFound(claims.subject.clone()));
        }

        let identity = if claims.subject_is_uuid() {
            // Opaque UUID subject: the preferred username becomes login and
            // display name, the UUID is kept as an external reference.
            let login = claims
                .preferred_username
                .clone()
                .unwrap_or_else(|| claims.subject.clone());
            let external_uuid = Uuid::parse_str(&claims.subject).ok();
            self.store.create(&login, &login, external_uuid).await?
        } else {
            self.store
                .create(&claims.subject, &claims.subject, None)
                .await?
        };
        tracing::info!(identifier = %identity.identifier, "created local identity for first login");
        Ok(identity)
    }

    async fn find_identity(&self, subject: &str) -> Result<Option<LocalIdentity>, SyncError> {
        if let Ok(uuid) = Uuid::parse_str(subject) {
            if let Some(identity) = self.store.find_by_uuid(uuid).await? {
                return Ok(Some(identity));
            }
        }
        Ok(self.store.find_by_login(subject).await?)
    }

    /// Step 2: profile attribute reconciliation. Each field updates only on
    /// a real difference; one commit-attributes call when anything changed.
    async fn sync_attributes(
        &self,
        identity: &LocalIdentity,
        claims: &IdentityClaims,
    ) -> Result<(), SyncError> {
        if !self.permissions.permit_attribute_update {
            return Ok(());
        }
        let id = &identity.identifier;
        let mut dirty = false;

        if let Some(given) = claims.given_name.as_deref() {
            if identity.first_name != given {
                self.store
                    .update_attribute(id, AttrName::FirstName, given)
                    .await?;
                dirty = true;
            }
        }
        if let Some(family) = claims.family_name.as_deref() {
            if identity.last_name != family {
                self.store
                    .update_attribute(id, AttrName::LastName, family)
                    .await?;
                dirty = true;
            }
        }
        if let Some(tag) = claims.locale() {
            if identity.locale.as_deref() != Some(tag) && is_language_tag(tag) {
                self.store.update_attribute(id, AttrName::Locale, tag).await?;
                dirty = true;
            }
        }
        if let Some(tz) = claims.time_zone() {
            if identity.time_zone.as_deref() != Some(tz) && is_time_zone(tz) {
                self.store
                    .update_attribute(id, AttrName::TimeZone, tz)
                    .await?;
                dirty = true;
            }
        }
        if let Some(lang) = claims.language() {
            if identity.language.as_deref() != Some(lang) {
                // Unknown language codes are a silent skip, not an error.
                if let Some(language) = self.languages.resolve(lang).await? {
                    self.store
                        .update_attribute(id, AttrName::Language, &language.code)
                        .await?;
                    dirty = true;
                } else {
                    tracing::warn!(code = lang, "language claim did not resolve");
                }
            }
        }

        if dirty {
            self.store.commit_attributes(id).await?;
        }
        Ok(())
    }

    /// Step 3: wholesale replace of the role set. Entries that do not
    /// resolve are dropped, with a warning count.
    async fn sync_roles(
        &self,
        identifier: &str,
        claims: &IdentityClaims,
    ) -> Result<(), SyncError> {
        if !self.permissions.permit_role_update {
            return Ok(());
        }
        let Some(entries) = claims.roles() else {
            return Ok(());
        };

        let mut roles: HashSet<RoleRef> = HashSet::new();
        let mut unresolved = 0usize;
        for entry in &entries {
            match self.roles.resolve(entry).await? {
                Some(role) => {
                    roles.insert(role);
                }
                None => unresolved += 1,
            }
        }
        if unresolved > 0 {
            tracing::warn!(unresolved, total = entries.len(), "dropped unresolved role claims");
        }
        self.store.set_roles(identifier, roles).await?;
        Ok(())
    }

    /// Step 4: wholesale replace of the company set.
    async fn sync_companies(
        &self,
        identifier: &str,
        claims: &IdentityClaims,
    ) -> Result<(), SyncError> {
        if !self.permissions.permit_company_update {
            return Ok(());
        }
        let Some(entries) = claims.companies() else {
            return Ok(());
        };

        let mut companies: HashSet<CompanyRef> = HashSet::new();
        let mut unresolved = 0usize;
        for entry in &entries {
            match self.companies.resolve(entry).await? {
                Some(company) => {
                    companies.insert(company);
                }
                None => unresolved += 1,
            }
        }
        if unresolved > 0 {
            tracing::warn!(
                unresolved,
                total = entries.len(),
                "dropped unresolved company claims"
            );
        }
        self.store.set_companies(identifier, companies).await?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────
