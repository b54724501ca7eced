use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::entity::TenantId;
use super::snapshot::TenantSnapshot;
use super::traits::{expiry_cutoff, ChangeSet, EntityStore, StoreError};

/// Process-local store: one copy-on-write snapshot per tenant.
///
/// Commits for a tenant serialize on its map entry; readers holding an older
/// `Arc` keep their consistent view untouched.
pub struct InMemoryStore {
    tenants: DashMap<TenantId, Arc<TenantSnapshot>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
        }
    }

    /// Number of tenants with any committed state
    #[must_use]
    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    /// Drop everything
    pub fn clear(&self) {
        self.tenants.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn snapshot(&self, tenant_id: &TenantId) -> Result<Arc<TenantSnapshot>, StoreError> {
        Ok(self
            .tenants
            .get(tenant_id)
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_else(|| Arc::new(TenantSnapshot::empty(tenant_id.clone()))))
    }

    async fn commit(&self, tenant_id: &TenantId, changes: ChangeSet) -> Result<(), StoreError> {
        let mut entry = self
            .tenants
            .entry(tenant_id.clone())
            .or_insert_with(|| Arc::new(TenantSnapshot::empty(tenant_id.clone())));

        entry.check(&changes)?;
        Arc::make_mut(entry.value_mut()).apply(changes);
        Ok(())
    }

    async fn delete_expired(&self, lifetime: Duration, limit: usize) -> Result<usize, StoreError> {
        let cutoff = expiry_cutoff(lifetime);
        let mut deleted = 0;

        for mut entry in self.tenants.iter_mut() {
            if deleted >= limit {
                break;
            }
            let expired: Vec<String> = entry
                .client_groups()
                .filter(|group| group.updated_at < cutoff)
                .map(|group| group.id.clone())
                .take(limit - deleted)
                .collect();
            if expired.is_empty() {
                continue;
            }

            let snapshot = Arc::make_mut(entry.value_mut());
            for group_id in &expired {
                if snapshot.remove_client_group(group_id) {
                    deleted += 1;
                }
            }
            debug!(tenant_id = %entry.key(), groups = expired.len(), "Expired client groups");
        }

        Ok(deleted)
    }
}
