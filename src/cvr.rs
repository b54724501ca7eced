// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client view bookkeeping.
//!
//! A *client group* is one replica (a browser profile, a device). Each of its
//! clients (tabs) pushes mutations with consecutive ids. Every completed pull
//! advances the group's client view version (CVV) and records, per view and
//! entity, which version was delivered. Only pulls write CVR entries.

use serde::{Deserialize, Serialize};

use crate::entity::{now_millis, EntityId, TenantId, Version};
use crate::error::SyncError;
use crate::policy::{PolicyKind, Principal};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientGroup {
    pub id: String,
    pub tenant_id: TenantId,
    /// Owner. Only this user may pull or push for the group.
    pub user_id: String,
    /// Bumped once per processed mutation of any client in the group.
    pub client_version: u64,
    /// CVV of the latest completed pull; 0 before the first.
    pub client_view_version: u64,
    /// Epoch millis of the last pull or push. Groups idle past the
    /// configured lifetime are collected.
    #[serde(default)]
    pub updated_at: i64,
}

impl ClientGroup {
    pub fn new(id: impl Into<String>, principal: &Principal) -> Self {
        Self {
            id: id.into(),
            tenant_id: principal.tenant_id.clone(),
            user_id: principal.user_id.clone(),
            client_version: 0,
            client_view_version: 0,
            updated_at: now_millis(),
        }
    }

    /// Mark the group as used now.
    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at);
    }

    pub fn ensure_owner(&self, principal: &Principal) -> Result<(), SyncError> {
        if self.user_id == principal.user_id && self.tenant_id == principal.tenant_id {
            Ok(())
        } else {
            Err(SyncError::denied(
                PolicyKind::Relationship,
                "client group is owned by another user",
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub tenant_id: TenantId,
    pub client_group_id: String,
    /// Highest processed mutation id. Push is idempotent against it.
    pub last_mutation_id: u64,
    /// Group `client_version` at which `last_mutation_id` last moved.
    pub version: u64,
}

impl Client {
    pub fn new(id: impl Into<String>, group: &ClientGroup) -> Self {
        Self {
            id: id.into(),
            tenant_id: group.tenant_id.clone(),
            client_group_id: group.id.clone(),
            last_mutation_id: 0,
            version: 0,
        }
    }
}

/// One completed pull. The cookie handed back to the client names it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientView {
    pub tenant_id: TenantId,
    pub client_group_id: String,
    pub version: u64,
    /// Group `client_version` when the view was taken.
    pub client_version: u64,
    /// False when the row budget deferred rows; the next pull must not
    /// short-circuit on this cookie.
    #[serde(default = "default_complete")]
    pub complete: bool,
}

fn default_complete() -> bool {
    true
}

/// What a client group was last sent for one entity of one view.
/// `entity_version: None` records a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CvrEntry {
    pub tenant_id: TenantId,
    pub client_group_id: String,
    pub view: String,
    pub entity_id: EntityId,
    pub client_view_version: u64,
    pub entity_version: Option<Version>,
}

impl CvrEntry {
    pub fn sent(group: &ClientGroup, view: &str, id: EntityId, cvv: u64, version: Version) -> Self {
        Self {
            tenant_id: group.tenant_id.clone(),
            client_group_id: group.id.clone(),
            view: view.to_string(),
            entity_id: id,
            client_view_version: cvv,
            entity_version: Some(version),
        }
    }

    pub fn deleted(group: &ClientGroup, view: &str, id: EntityId, cvv: u64) -> Self {
        Self {
            entity_version: None,
            ..Self::sent(group, view, id, cvv, 0)
        }
    }
}
