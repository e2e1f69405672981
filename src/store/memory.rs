//! In-memory identity store and directory.
//!
//! Backs the demo wiring and the test suites. Transactions snapshot the
//! whole record set at begin and restore it on rollback, which is enough to
//! give the synchronizer real commit/rollback semantics without a database.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::{
    AttrName, CompanyRef, CompanyResolver, IdentityStore, LanguageRef, LanguageResolver,
    LocalIdentity, RoleRef, RoleResolver, Transaction,
};
use crate::claims::is_uuid;

#[derive(Default)]
struct Inner {
    records: DashMap<String, LocalIdentity>,
    uuid_index: DashMap<Uuid, String>,
    /// Attribute changes staged by `update_attribute`, applied by
    /// `commit_attributes`.
    staged: DashMap<String, Vec<(AttrName, String)>>,
}

/// In-memory [`IdentityStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    fail_commits: Arc<AtomicBool>,
    commit_attribute_calls: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a pre-existing identity, bypassing transaction discipline.
    pub fn seed(&self, identity: LocalIdentity) {
        if let Some(uuid) = identity.external_uuid {
            self.inner.uuid_index.insert(uuid, identity.identifier.clone());
        }
        self.inner
            .records
            .insert(identity.identifier.clone(), identity);
    }

    /// Makes every subsequent transaction commit fail.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of `commit_attributes` calls observed so far.
    pub fn commit_attribute_calls(&self) -> usize {
        self.commit_attribute_calls.load(Ordering::SeqCst)
    }

    /// Current record for an identifier, for assertions.
    pub fn snapshot_of(&self, identifier: &str) -> Option<LocalIdentity> {
        self.inner.records.get(identifier).map(|r| r.clone())
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    fail_commits: Arc<AtomicBool>,
    records_before: Vec<(String, LocalIdentity)>,
    uuids_before: Vec<(Uuid, String)>,
    active: AtomicBool,
    marked_rollback: AtomicBool,
}

impl MemoryTransaction {
    fn restore(&self) {
        self.inner.records.clear();
        for (k, v) in &self.records_before {
            self.inner.records.insert(k.clone(), v.clone());
        }
        self.inner.uuid_index.clear();
        for (k, v) in &self.uuids_before {
            self.inner.uuid_index.insert(*k, v.clone());
        }
        self.inner.staged.clear();
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(&self) -> anyhow::Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            self.marked_rollback.store(true, Ordering::SeqCst);
            anyhow::bail!("commit failed");
        }
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        self.restore();
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn is_marked_rollback(&self) -> bool {
        self.marked_rollback.load(Ordering::SeqCst)
    }

    fn mark_rollback(&self) {
        self.marked_rollback.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn begin_transaction(&self) -> anyhow::Result<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            fail_commits: Arc::clone(&self.fail_commits),
            records_before: self
                .inner
                .records
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            uuids_before: self
                .inner
                .uuid_index
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
            active: AtomicBool::new(true),
            marked_rollback: AtomicBool::new(false),
        }))
    }

    async fn find_by_login(&self, login: &str) -> anyhow::Result<Option<LocalIdentity>> {
        Ok(self.inner.records.get(login).map(|r| r.clone()))
    }

    async fn find_by_uuid(&self, uuid: Uuid) -> anyhow::Result<Option<LocalIdentity>> {
        let Some(login) = self.inner.uuid_index.get(&uuid).map(|r| r.clone()) else {
            return Ok(None);
        };
        self.find_by_login(&login).await
    }

    async fn create(
        &self,
        login: &str,
        display_name: &str,
        external_uuid: Option<Uuid>,
    ) -> anyhow::Result<LocalIdentity> {
        if self.inner.records.contains_key(login) {
            anyhow::bail!("identity '{login}' already exists");
        }
        let identity = LocalIdentity {
            identifier: login.to_string(),
            first_name: display_name.to_string(),
            last_name: String::new(),
            external_uuid,
            locale: None,
            time_zone: None,
            language: None,
            roles: HashSet::new(),
            companies: HashSet::new(),
        };
        if let Some(uuid) = external_uuid {
            self.inner.uuid_index.insert(uuid, login.to_string());
        }
        self.inner.records.insert(login.to_string(), identity.clone());
        Ok(identity)
    }

    async fn update_attribute(
        &self,
        identifier: &str,
        attr: AttrName,
        value: &str,
    ) -> anyhow::Result<()> {
        if !self.inner.records.contains_key(identifier) {
            anyhow::bail!("no identity '{identifier}'");
        }
        self.inner
            .staged
            .entry(identifier.to_string())
            .or_default()
            .push((attr, value.to_string()));
        Ok(())
    }

    async fn commit_attributes(&self, identifier: &str) -> anyhow::Result<()> {
        self.commit_attribute_calls.fetch_add(1, Ordering::SeqCst);
        let Some((_, staged)) = self.inner.staged.remove(identifier) else {
            return Ok(());
        };
        let mut record = self
            .inner
            .records
            .get_mut(identifier)
            .ok_or_else(|| anyhow::anyhow!("no identity '{identifier}'"))?;
        for (attr, value) in staged {
            match attr {
                AttrName::FirstName => record.first_name = value,
                AttrName::LastName => record.last_name = value,
                AttrName::Locale => record.locale = Some(value),
                AttrName::TimeZone => record.time_zone = Some(value),
                AttrName::Language => record.language = Some(value),
            }
        }
        Ok(())
    }

    async fn set_roles(&self, identifier: &str, roles: HashSet<RoleRef>) -> anyhow::Result<()> {
        let mut record = self
            .inner
            .records
            .get_mut(identifier)
            .ok_or_else(|| anyhow::anyhow!("no identity '{identifier}'"))?;
        record.roles = roles;
        Ok(())
    }

    async fn set_companies(
        &self,
        identifier: &str,
        companies: HashSet<CompanyRef>,
    ) -> anyhow::Result<()> {
        let mut record = self
            .inner
            .records
            .get_mut(identifier)
            .ok_or_else(|| anyhow::anyhow!("no identity '{identifier}'"))?;
        record.companies = companies;
        Ok(())
    }

    async fn reset(&self, identifier: &str) -> anyhow::Result<()> {
        // No per-identity cache layer here; dropping staged leftovers is the
        // closest equivalent.
        self.inner.staged.remove(identifier);
        Ok(())
    }
}

/// In-memory role/company/language directory.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    roles: Arc<DashMap<Uuid, RoleRef>>,
    companies: Arc<DashMap<Uuid, CompanyRef>>,
    languages: Arc<DashMap<Uuid, LanguageRef>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_role(&self, name: &str) -> RoleRef {
        let role = RoleRef {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        self.roles.insert(role.id, role.clone());
        role
    }

    pub fn add_company(&self, name: &str) -> CompanyRef {
        let company = CompanyRef {
            id: Uuid::new_v4(),
            name: name.to_string(),
        };
        self.companies.insert(company.id, company.clone());
        company
    }

    pub fn add_language(&self, code: &str) -> LanguageRef {
        let language = LanguageRef {
            id: Uuid::new_v4(),
            code: code.to_string(),
        };
        self.languages.insert(language.id, language.clone());
        language
    }
}

#[async_trait]
impl RoleResolver for MemoryDirectory {
    async fn resolve(&self, uuid_or_name: &str) -> anyhow::Result<Option<RoleRef>> {
        if is_uuid(uuid_or_name) {
            let id = Uuid::parse_str(uuid_or_name)?;
            return Ok(self.roles.get(&id).map(|r| r.clone()));
        }
        Ok(self
            .roles
            .iter()
            .find(|r| r.name == uuid_or_name)
            .map(|r| r.clone()))
    }
}

#[async_trait]
impl CompanyResolver for MemoryDirectory {
    async fn resolve(&self, uuid_or_name: &str) -> anyhow::Result<Option<CompanyRef>> {
        if is_uuid(uuid_or_name) {
            let id = Uuid::parse_str(uuid_or_name)?;
            return Ok(self.companies.get(&id).map(|c| c.clone()));
        }
        Ok(self
            .companies
            .iter()
            .find(|c| c.name == uuid_or_name)
            .map(|c| c.clone()))
    }
}

#[async_trait]
impl LanguageResolver for MemoryDirectory {
    async fn resolve(&self, code: &str) -> anyhow::Result<Option<LanguageRef>> {
        Ok(self
            .languages
            .iter()
            .find(|l| l.code == code)
            .map(|l| l.clone()))
    }
}

// ── Tests ────────────────────────────────────────────────────
