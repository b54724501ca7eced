// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Authoritative entity storage.
//!
//! Reads go through a [`TenantSnapshot`], an immutable consistent copy of one
//! tenant. Writes go through a [`Transaction`] layered over a snapshot and are
//! committed as one [`ChangeSet`]. Every entity write carries the version it
//! was read at, so a commit that raced another fails with
//! [`StoreError::Conflict`] and [`transact`] re-runs the body on a fresh
//! snapshot.

pub mod memory;
pub mod snapshot;
pub mod sql;
pub mod traits;
pub mod transaction;

use std::collections::BTreeSet;

pub use memory::InMemoryStore;
pub use snapshot::TenantSnapshot;
pub use sql::SqlStore;
pub use traits::{ChangeSet, ClientGroupWrite, ClientWrite, EntityStore, EntityWrite, StoreError};
pub use transaction::Transaction;

use crate::entity::{Entity, EntityId, TenantId};
use crate::error::SyncError;
use crate::metrics;
use crate::resilience::retry::{retry_if, RetryConfig};

/// Read access shared by snapshots and transactions.
pub trait EntityReader: Send + Sync {
    fn tenant_id(&self) -> &TenantId;

    fn find(&self, table: &str, id: &EntityId) -> Option<&Entity>;

    /// All rows of `table`, soft-deleted included, in no particular order.
    fn rows<'a>(&'a self, table: &str) -> Box<dyn Iterator<Item = &'a Entity> + 'a>;
}

/// Run `body` in a transaction and commit it, re-running on commit conflicts.
///
/// Returns the body's result and the tables it wrote to. A body that leaves
/// the transaction empty commits nothing.
pub async fn transact<T, F>(
    store: &dyn EntityStore,
    tenant_id: &TenantId,
    config: &RetryConfig,
    body: F,
) -> Result<(T, BTreeSet<String>), SyncError>
where
    F: Fn(&mut Transaction) -> Result<T, SyncError>,
{
    retry_if("transaction", config, SyncError::is_retryable, || async {
        let snapshot = store.snapshot(tenant_id).await?;
        let mut tx = Transaction::begin(snapshot);
        let output = body(&mut tx)?;
        let touched = tx.touched_tables();

        let changes = tx.into_change_set();
        if !changes.is_empty() {
            store.commit(tenant_id, changes).await.map_err(|e| {
                if matches!(e, StoreError::Conflict(_)) {
                    metrics::record_transaction_conflict(tenant_id.as_str());
                }
                e
            })?;
        }
        Ok((output, touched))
    })
    .await
}
