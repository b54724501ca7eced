// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consistent per-tenant copy of rows and sync bookkeeping.
//!
//! The in-memory backend keeps one of these per tenant and swaps it
//! copy-on-write at commit; the SQL backend builds one per read. Either way a
//! pull or a transaction sees a single point in time.

use std::collections::{BTreeMap, HashMap};

use crate::cvr::{Client, ClientGroup, ClientView, CvrEntry};
use crate::entity::{Entity, EntityId, TenantId, Version};
use super::traits::{ChangeSet, EntityWrite, StoreError};
use super::EntityReader;

type ViewKey = (String, EntityId);

#[derive(Debug, Clone)]
pub struct TenantSnapshot {
    tenant_id: TenantId,
    pub(crate) tables: HashMap<String, BTreeMap<EntityId, Entity>>,
    /// Last version of hard-deleted rows, so a re-created id keeps counting up.
    pub(crate) retired: HashMap<ViewKey, Version>,
    pub(crate) client_groups: HashMap<String, ClientGroup>,
    pub(crate) clients: HashMap<String, Client>,
    pub(crate) client_views: HashMap<(String, u64), ClientView>,
    /// client group -> (view, entity) -> latest entry
    pub(crate) cvr: HashMap<String, BTreeMap<ViewKey, CvrEntry>>,
}

impl TenantSnapshot {
    pub fn empty(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            tables: HashMap::new(),
            retired: HashMap::new(),
            client_groups: HashMap::new(),
            clients: HashMap::new(),
            client_views: HashMap::new(),
            cvr: HashMap::new(),
        }
    }

    pub fn client_group(&self, id: &str) -> Option<&ClientGroup> {
        self.client_groups.get(id)
    }

    pub fn client_groups(&self) -> impl Iterator<Item = &ClientGroup> {
        self.client_groups.values()
    }

    pub fn client(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn clients_of_group<'a>(&'a self, group_id: &'a str) -> impl Iterator<Item = &'a Client> + 'a {
        self.clients
            .values()
            .filter(move |c| c.client_group_id == group_id)
    }

    pub fn client_view(&self, group_id: &str, version: u64) -> Option<&ClientView> {
        self.client_views.get(&(group_id.to_string(), version))
    }

    /// Entries of one group for one view, ordered by entity id.
    pub fn cvr_entries<'a>(&'a self, group_id: &str, view: &'a str) -> impl Iterator<Item = &'a CvrEntry> + 'a {
        self.cvr
            .get(group_id)
            .into_iter()
            .flat_map(move |entries| {
                entries
                    .range((view.to_string(), EntityId::default())..)
                    .take_while(move |((name, _), _)| name == view)
                    .map(|(_, entry)| entry)
            })
    }

    /// Every entry of a group across all views.
    pub fn group_cvr(&self, group_id: &str) -> impl Iterator<Item = &CvrEntry> {
        self.cvr.get(group_id).into_iter().flat_map(|entries| entries.values())
    }

    /// True when some group other than `group_id` was sent exactly this version.
    pub fn sibling_holds(&self, group_id: &str, view: &str, id: &EntityId, version: Version) -> bool {
        let key = (view.to_string(), id.clone());
        self.cvr.iter().any(|(group, entries)| {
            group != group_id
                && entries
                    .get(&key)
                    .is_some_and(|e| e.entity_version == Some(version))
        })
    }

    pub fn retired_version(&self, table: &str, id: &EntityId) -> Option<Version> {
        self.retired.get(&(table.to_string(), id.clone())).copied()
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    /// Drop a client group with its clients, client views and CVR entries.
    pub(crate) fn remove_client_group(&mut self, group_id: &str) -> bool {
        if self.client_groups.remove(group_id).is_none() {
            return false;
        }
        self.clients.retain(|_, client| client.client_group_id != group_id);
        self.client_views.retain(|(group, _), _| group != group_id);
        self.cvr.remove(group_id);
        true
    }

    /// Validate every expectation in `changes` against this state.
    pub(crate) fn check(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        for write in &changes.entities {
            match write {
                EntityWrite::Insert(row) => {
                    self.check_tenant(row)?;
                    if self.find(&row.table, &row.id).is_some() {
                        return Err(StoreError::Conflict(format!(
                            "{} '{}' already exists",
                            row.table, row.id
                        )));
                    }
                }
                EntityWrite::Update { row, expected_version } => {
                    self.check_tenant(row)?;
                    self.check_version(&row.table, &row.id, *expected_version)?;
                }
                EntityWrite::Delete { table, id, expected_version } => {
                    self.check_version(table, id, *expected_version)?;
                }
            }
        }

        for write in &changes.client_groups {
            if self.client_groups.get(&write.record.id) != write.previous.as_ref() {
                return Err(StoreError::Conflict(format!(
                    "client group '{}' changed concurrently",
                    write.record.id
                )));
            }
        }

        for write in &changes.clients {
            if self.clients.get(&write.record.id) != write.previous.as_ref() {
                return Err(StoreError::Conflict(format!(
                    "client '{}' changed concurrently",
                    write.record.id
                )));
            }
        }

        for view in &changes.client_views {
            if self.client_view(&view.client_group_id, view.version).is_some() {
                return Err(StoreError::Conflict(format!(
                    "client view {} of group '{}' already exists",
                    view.version, view.client_group_id
                )));
            }
        }

        Ok(())
    }

    /// Apply a change set that already passed [`Self::check`].
    pub(crate) fn apply(&mut self, changes: ChangeSet) {
        for write in changes.entities {
            match write {
                EntityWrite::Insert(row) | EntityWrite::Update { row, .. } => {
                    self.tables
                        .entry(row.table.clone())
                        .or_default()
                        .insert(row.id.clone(), row);
                }
                EntityWrite::Delete { table, id, expected_version } => {
                    if let Some(rows) = self.tables.get_mut(&table) {
                        rows.remove(&id);
                    }
                    self.retired.insert((table, id), expected_version);
                }
            }
        }

        for write in changes.client_groups {
            self.client_groups.insert(write.record.id.clone(), write.record);
        }
        for write in changes.clients {
            self.clients.insert(write.record.id.clone(), write.record);
        }
        for view in changes.client_views {
            self.client_views
                .insert((view.client_group_id.clone(), view.version), view);
        }
        for entry in changes.cvr {
            self.cvr
                .entry(entry.client_group_id.clone())
                .or_default()
                .insert((entry.view.clone(), entry.entity_id.clone()), entry);
        }
    }

    fn check_tenant(&self, row: &Entity) -> Result<(), StoreError> {
        if row.tenant_id == self.tenant_id {
            Ok(())
        } else {
            Err(StoreError::Corruption {
                id: row.id.to_string(),
                reason: format!("row of tenant '{}' written to '{}'", row.tenant_id, self.tenant_id),
            })
        }
    }

    fn check_version(&self, table: &str, id: &EntityId, expected: Version) -> Result<(), StoreError> {
        match self.find(table, id) {
            Some(current) if current.version == expected => Ok(()),
            Some(current) => Err(StoreError::Conflict(format!(
                "{} '{}' is at version {}, expected {}",
                table, id, current.version, expected
            ))),
            None => Err(StoreError::Conflict(format!("{} '{}' no longer exists", table, id))),
        }
    }
}

impl EntityReader for TenantSnapshot {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    fn find(&self, table: &str, id: &EntityId) -> Option<&Entity> {
        self.tables.get(table)?.get(id)
    }

    fn rows<'a>(&'a self, table: &str) -> Box<dyn Iterator<Item = &'a Entity> + 'a> {
        Box::new(self.tables.get(table).into_iter().flat_map(|rows| rows.values()))
    }
}
