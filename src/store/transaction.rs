// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-your-writes overlay over a [`TenantSnapshot`].
//!
//! Mutators and policies both read through the transaction, so a policy
//! evaluated after the mutator sees the post-mutation state. Nothing touches
//! the store until [`Transaction::into_change_set`] is committed.
//!
//! A row written several times in one transaction is bumped once: its new
//! version is always the committed version plus one.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cvr::{Client, ClientGroup, ClientView, CvrEntry};
use crate::entity::{next_updated_at, now_millis, Entity, EntityId, EntityPatch, TenantId, Version};
use crate::error::SyncError;
use super::snapshot::TenantSnapshot;
use super::traits::{ChangeSet, ClientGroupWrite, ClientWrite, EntityWrite};
use super::EntityReader;

pub struct Transaction {
    base: Arc<TenantSnapshot>,
    /// table -> id -> new state (None = hard deleted)
    entities: BTreeMap<String, BTreeMap<EntityId, Option<Entity>>>,
    client_groups: BTreeMap<String, ClientGroup>,
    clients: BTreeMap<String, Client>,
    client_views: Vec<ClientView>,
    cvr: Vec<CvrEntry>,
}

impl Transaction {
    pub fn begin(base: Arc<TenantSnapshot>) -> Self {
        Self {
            base,
            entities: BTreeMap::new(),
            client_groups: BTreeMap::new(),
            clients: BTreeMap::new(),
            client_views: Vec::new(),
            cvr: Vec::new(),
        }
    }

    /// The committed state this transaction started from.
    pub fn snapshot(&self) -> &TenantSnapshot {
        &self.base
    }

    pub fn create(&mut self, table: &str, id: EntityId, data: Map<String, Value>) -> Result<Entity, SyncError> {
        if self.find(table, &id).is_some() {
            return Err(SyncError::Conflict {
                table: table.to_string(),
                id: id.to_string(),
                reason: "already exists".into(),
            });
        }

        let now = now_millis();
        let row = Entity {
            version: self.next_version(table, &id),
            id,
            tenant_id: self.base.tenant_id().clone(),
            table: table.to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            data,
        };
        self.stage(row.clone());
        Ok(row)
    }

    pub fn update_by_id(&mut self, table: &str, id: &EntityId, patch: EntityPatch) -> Result<Entity, SyncError> {
        let mut row = self.find_by_id(table, id)?;

        if let Some(expected) = patch.expect_updated_at {
            if row.updated_at != expected {
                return Err(SyncError::Conflict {
                    table: table.to_string(),
                    id: id.to_string(),
                    reason: format!(
                        "stale updatedAt {}, current is {}",
                        expected, row.updated_at
                    ),
                });
            }
        }

        row.data.extend(patch.fields);
        if let Some(deleted_at) = patch.deleted_at {
            row.deleted_at = deleted_at;
        }
        row.updated_at = next_updated_at(row.updated_at);
        row.version = self.next_version(table, id);

        self.stage(row.clone());
        Ok(row)
    }

    /// Hard delete. Returns the row as it was.
    pub fn delete_by_id(&mut self, table: &str, id: &EntityId) -> Result<Entity, SyncError> {
        let row = self.find_by_id(table, id)?;
        self.entities
            .entry(table.to_string())
            .or_default()
            .insert(id.clone(), None);
        Ok(row)
    }

    pub fn find_by_id(&self, table: &str, id: &EntityId) -> Result<Entity, SyncError> {
        self.find(table, id)
            .cloned()
            .ok_or_else(|| SyncError::not_found(table, id))
    }

    /// Tables with at least one staged entity write.
    pub fn touched_tables(&self) -> BTreeSet<String> {
        self.entities.keys().cloned().collect()
    }

    /// Drop staged entity writes, keeping sync bookkeeping.
    pub fn discard_entity_writes(&mut self) {
        self.entities.clear();
    }

    pub fn client_group(&self, id: &str) -> Option<ClientGroup> {
        self.client_groups
            .get(id)
            .or_else(|| self.base.client_group(id))
            .cloned()
    }

    pub fn put_client_group(&mut self, record: ClientGroup) {
        self.client_groups.insert(record.id.clone(), record);
    }

    pub fn client(&self, id: &str) -> Option<Client> {
        self.clients.get(id).or_else(|| self.base.client(id)).cloned()
    }

    pub fn put_client(&mut self, record: Client) {
        self.clients.insert(record.id.clone(), record);
    }

    pub fn put_client_view(&mut self, view: ClientView) {
        self.client_views.push(view);
    }

    pub fn put_cvr(&mut self, entries: impl IntoIterator<Item = CvrEntry>) {
        self.cvr.extend(entries);
    }

    pub fn into_change_set(self) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for (table, rows) in self.entities {
            for (id, state) in rows {
                let committed = self.base.find(&table, &id).map(|row| row.version);
                let write = match (committed, state) {
                    (None, Some(row)) => EntityWrite::Insert(row),
                    (Some(expected_version), Some(row)) => EntityWrite::Update { row, expected_version },
                    (Some(expected_version), None) => EntityWrite::Delete {
                        table: table.clone(),
                        id,
                        expected_version,
                    },
                    (None, None) => continue,
                };
                changes.entities.push(write);
            }
        }

        for (id, record) in self.client_groups {
            let previous = self.base.client_group(&id).cloned();
            changes.client_groups.push(ClientGroupWrite { record, previous });
        }
        for (id, record) in self.clients {
            let previous = self.base.client(&id).cloned();
            changes.clients.push(ClientWrite { record, previous });
        }
        changes.client_views = self.client_views;
        changes.cvr = self.cvr;
        changes
    }

    fn stage(&mut self, row: Entity) {
        self.entities
            .entry(row.table.clone())
            .or_default()
            .insert(row.id.clone(), Some(row));
    }

    fn next_version(&self, table: &str, id: &EntityId) -> Version {
        self.base
            .find(table, id)
            .map(|row| row.version)
            .or_else(|| self.base.retired_version(table, id))
            .map_or(1, |v| v + 1)
    }
}

impl EntityReader for Transaction {
    fn tenant_id(&self) -> &TenantId {
        self.base.tenant_id()
    }

    fn find(&self, table: &str, id: &EntityId) -> Option<&Entity> {
        match self.entities.get(table).and_then(|rows| rows.get(id)) {
            Some(staged) => staged.as_ref(),
            None => self.base.find(table, id),
        }
    }

    fn rows<'a>(&'a self, table: &str) -> Box<dyn Iterator<Item = &'a Entity> + 'a> {
        let staged = self.entities.get(table);
        let committed = self
            .base
            .rows(table)
            .filter(move |row| staged.map_or(true, |rows| !rows.contains_key(&row.id)));
        let fresh = staged
            .into_iter()
            .flat_map(|rows| rows.values().filter_map(Option::as_ref));
        Box::new(committed.chain(fresh))
    }
}
