use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::cvr::{Client, ClientGroup, ClientView, CvrEntry};
use crate::entity::{Entity, EntityId, TenantId, Version};
use super::snapshot::TenantSnapshot;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Optimistic-lock check failed at commit; nothing was written.
    #[error("Commit conflict: {0}")]
    Conflict(String),
    #[error("Data corruption detected for '{id}': {reason}")]
    Corruption { id: String, reason: String },
}

/// One entity write, with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityWrite {
    /// Row must not exist.
    Insert(Entity),
    Update { row: Entity, expected_version: Version },
    /// Hard delete.
    Delete { table: String, id: EntityId, expected_version: Version },
}

impl EntityWrite {
    pub fn table(&self) -> &str {
        match self {
            EntityWrite::Insert(row) | EntityWrite::Update { row, .. } => &row.table,
            EntityWrite::Delete { table, .. } => table,
        }
    }
}

/// Upsert of a client group; `previous` is what the writer read (None = must not exist).
#[derive(Debug, Clone, PartialEq)]
pub struct ClientGroupWrite {
    pub record: ClientGroup,
    pub previous: Option<ClientGroup>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientWrite {
    pub record: Client,
    pub previous: Option<Client>,
}

/// Everything one transaction writes, committed atomically or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub entities: Vec<EntityWrite>,
    pub client_groups: Vec<ClientGroupWrite>,
    pub clients: Vec<ClientWrite>,
    /// Insert-only.
    pub client_views: Vec<ClientView>,
    /// Upserts, applied in order.
    pub cvr: Vec<CvrEntry>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
            && self.client_groups.is_empty()
            && self.clients.is_empty()
            && self.client_views.is_empty()
            && self.cvr.is_empty()
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Consistent read of everything the tenant owns.
    async fn snapshot(&self, tenant_id: &TenantId) -> Result<Arc<TenantSnapshot>, StoreError>;

    /// Apply `changes` atomically. Any stale expectation rejects the whole
    /// set with [`StoreError::Conflict`].
    async fn commit(&self, tenant_id: &TenantId, changes: ChangeSet) -> Result<(), StoreError>;

    /// Delete up to `limit` client groups, across tenants, whose last pull
    /// or push is more than `lifetime` ago, together with their clients,
    /// client views and CVR entries. Returns how many groups went.
    async fn delete_expired(&self, lifetime: Duration, limit: usize) -> Result<usize, StoreError>;
}

/// Groups last used before this epoch millis are expired.
pub(crate) fn expiry_cutoff(lifetime: Duration) -> i64 {
    let lifetime = i64::try_from(lifetime.as_millis()).unwrap_or(i64::MAX);
    crate::entity::now_millis().saturating_sub(lifetime)
}
