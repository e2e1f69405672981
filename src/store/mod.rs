//! Identity store boundary.
//!
//! The persistent store of local user records, roles and companies lives
//! behind these traits; the gateway only relies on the call contract here.
//! Lookups that can miss return `Option`, reserving errors for true faults
//! (store unavailable, transaction failure).

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use uuid::Uuid;

/// A resolved role reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleRef {
    pub id: Uuid,
    pub name: String,
}

/// A resolved company/tenant reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompanyRef {
    pub id: Uuid,
    pub name: String,
}

/// A resolved language reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LanguageRef {
    pub id: Uuid,
    pub code: String,
}

/// Profile attributes mutable through `update_attribute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrName {
    FirstName,
    LastName,
    Locale,
    TimeZone,
    Language,
}

/// A persistent local user record.
///
/// Exists for a given subject only when creation was permitted and a login
/// completed successfully at least once, or it pre-existed. Mutated
/// exclusively by the claims synchronizer inside one transaction per login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Stable key; matches the claim subject once synchronized.
    pub identifier: String,
    pub first_name: String,
    pub last_name: String,
    /// Provider UUID kept as an external reference when the subject was
    /// an opaque UUID at creation time.
    pub external_uuid: Option<Uuid>,
    pub locale: Option<String>,
    pub time_zone: Option<String>,
    pub language: Option<String>,
    pub roles: HashSet<RoleRef>,
    pub companies: HashSet<CompanyRef>,
}

/// One login's ambient transaction.
///
/// Begun by the gate, committed only when synchronization fully succeeds,
/// rolled back otherwise. Partial updates never survive a rollback.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn commit(&self) -> anyhow::Result<()>;
    async fn rollback(&self) -> anyhow::Result<()>;
    fn is_active(&self) -> bool;
    fn is_marked_rollback(&self) -> bool;
    fn mark_rollback(&self);
}

/// Call contract of the external identity store.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn begin_transaction(&self) -> anyhow::Result<Box<dyn Transaction>>;

    async fn find_by_login(&self, login: &str) -> anyhow::Result<Option<LocalIdentity>>;

    async fn find_by_uuid(&self, uuid: Uuid) -> anyhow::Result<Option<LocalIdentity>>;

    async fn create(
        &self,
        login: &str,
        display_name: &str,
        external_uuid: Option<Uuid>,
    ) -> anyhow::Result<LocalIdentity>;

    /// Stages one attribute change; becomes durable via `commit_attributes`.
    async fn update_attribute(
        &self,
        identifier: &str,
        attr: AttrName,
        value: &str,
    ) -> anyhow::Result<()>;

    async fn commit_attributes(&self, identifier: &str) -> anyhow::Result<()>;

    /// Wholesale replace of the identity's role set.
    async fn set_roles(&self, identifier: &str, roles: HashSet<RoleRef>) -> anyhow::Result<()>;

    /// Wholesale replace of the identity's company set.
    async fn set_companies(
        &self,
        identifier: &str,
        companies: HashSet<CompanyRef>,
    ) -> anyhow::Result<()>;

    /// Invalidates any cached in-memory representation of this identity so
    /// later reads in the same request see fresh data.
    async fn reset(&self, identifier: &str) -> anyhow::Result<()>;
}

/// Role directory lookup: UUID or name to reference, absent when unknown.
#[async_trait]
pub trait RoleResolver: Send + Sync {
    async fn resolve(&self, uuid_or_name: &str) -> anyhow::Result<Option<RoleRef>>;
}

/// Company directory lookup.
#[async_trait]
pub trait CompanyResolver: Send + Sync {
    async fn resolve(&self, uuid_or_name: &str) -> anyhow::Result<Option<CompanyRef>>;
}

/// Language directory lookup by language code.
#[async_trait]
pub trait LanguageResolver: Send + Sync {
    async fn resolve(&self, code: &str) -> anyhow::Result<Option<LanguageRef>>;
}
