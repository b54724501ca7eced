// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synced views.
//!
//! A view is a named projection of one table through a [`Visibility`]
//! predicate, recomputed on every read and never materialized. Views are
//! what clients subscribe to: each declares a `"<name>:read"` permission,
//! and patch keys are `"<name>/<id>"`.
//!
//! ```text
//! products            -> all rows
//! active_products     -> deleted_at IS NULL
//! published_products  -> active AND status = 'published' AND room is published
//! editable_rooms      -> active AND an active room_editors row links the actor
//! ```

use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::entity::{Entity, EntityId};
use crate::error::SyncError;
use crate::policy::Principal;
use crate::store::EntityReader;

pub type VisibilityFn = Arc<dyn Fn(&Entity, &Principal, &dyn EntityReader) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum Visibility {
    All,
    /// Not soft-deleted.
    Active,
    FieldEquals { field: String, value: Value },
    /// The row referenced by `foreign_key` exists in `parent_table` and is itself visible.
    ParentVisible {
        parent_table: String,
        foreign_key: String,
        parent: Box<Visibility>,
    },
    /// An active row of `table` points at this row through `foreign_key`
    /// and at the actor through `actor_field`.
    AuthorizedBy {
        table: String,
        foreign_key: String,
        actor_field: String,
    },
    And(Vec<Visibility>),
    Or(Vec<Visibility>),
    Custom(VisibilityFn),
}

impl Visibility {
    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Visibility::FieldEquals { field: field.into(), value: value.into() }
    }

    pub fn parent_visible(parent_table: impl Into<String>, foreign_key: impl Into<String>, parent: Visibility) -> Self {
        Visibility::ParentVisible {
            parent_table: parent_table.into(),
            foreign_key: foreign_key.into(),
            parent: Box::new(parent),
        }
    }

    pub fn authorized_by(table: impl Into<String>, foreign_key: impl Into<String>, actor_field: impl Into<String>) -> Self {
        Visibility::AuthorizedBy {
            table: table.into(),
            foreign_key: foreign_key.into(),
            actor_field: actor_field.into(),
        }
    }

    pub fn custom<F>(check: F) -> Self
    where
        F: Fn(&Entity, &Principal, &dyn EntityReader) -> bool + Send + Sync + 'static,
    {
        Visibility::Custom(Arc::new(check))
    }

    pub fn admits(&self, row: &Entity, principal: &Principal, reader: &dyn EntityReader) -> bool {
        match self {
            Visibility::All => true,
            Visibility::Active => row.is_active(),
            Visibility::FieldEquals { field, value } => row.field(field) == Some(value),
            Visibility::ParentVisible { parent_table, foreign_key, parent } => row
                .field_str(foreign_key)
                .and_then(|id| reader.find(parent_table, &EntityId::new(id)))
                .is_some_and(|p| parent.admits(p, principal, reader)),
            Visibility::AuthorizedBy { table, foreign_key, actor_field } => {
                reader.rows(table).any(|grant| {
                    grant.is_active()
                        && grant.field_str(foreign_key) == Some(row.id.as_str())
                        && grant.field_str(actor_field) == Some(principal.user_id.as_str())
                })
            }
            Visibility::And(parts) => parts.iter().all(|v| v.admits(row, principal, reader)),
            Visibility::Or(parts) => parts.iter().any(|v| v.admits(row, principal, reader)),
            Visibility::Custom(check) => check(row, principal, reader),
        }
    }
}

impl fmt::Debug for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::All => write!(f, "All"),
            Visibility::Active => write!(f, "Active"),
            Visibility::FieldEquals { field, value } => write!(f, "{} = {}", field, value),
            Visibility::ParentVisible { parent_table, foreign_key, parent } => {
                write!(f, "{} -> {}({:?})", foreign_key, parent_table, parent)
            }
            Visibility::AuthorizedBy { table, foreign_key, actor_field } => {
                write!(f, "authorized by {}({}, {})", table, foreign_key, actor_field)
            }
            Visibility::And(parts) => f.debug_tuple("And").field(parts).finish(),
            Visibility::Or(parts) => f.debug_tuple("Or").field(parts).finish(),
            Visibility::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewDescriptor {
    name: String,
    table: String,
    permission: String,
    visibility: Visibility,
}

impl ViewDescriptor {
    pub fn new(name: impl Into<String>, table: impl Into<String>, visibility: Visibility) -> Self {
        let name = name.into();
        Self {
            permission: format!("{}:read", name),
            name,
            table: table.into(),
            visibility,
        }
    }

    /// The raw table as a view of itself.
    pub fn for_table(table: impl Into<String>) -> Self {
        let table = table.into();
        Self::new(table.clone(), table, Visibility::All)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn permission(&self) -> &str {
        &self.permission
    }

    pub fn visibility(&self) -> &Visibility {
        &self.visibility
    }

    /// Patch key: `"<view>/<id>"`.
    pub fn key(&self, id: &EntityId) -> String {
        format!("{}/{}", self.name, id)
    }

    pub fn is_visible(&self, row: &Entity, principal: &Principal, reader: &dyn EntityReader) -> bool {
        row.table == self.table && self.visibility.admits(row, principal, reader)
    }

    /// Visible rows ordered by id.
    pub fn find_all<'a>(&self, reader: &'a dyn EntityReader, principal: &Principal) -> Vec<&'a Entity> {
        let mut rows: Vec<&Entity> = reader
            .rows(&self.table)
            .filter(|row| self.visibility.admits(row, principal, reader))
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub fn find_by_id<'a>(&self, reader: &'a dyn EntityReader, principal: &Principal, id: &EntityId) -> Option<&'a Entity> {
        reader
            .find(&self.table, id)
            .filter(|row| self.visibility.admits(row, principal, reader))
    }
}

/// Synced views in declaration order. Built once at startup.
#[derive(Debug, Clone, Default)]
pub struct ViewRegistry {
    views: Vec<ViewDescriptor>,
    names: HashSet<String>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, view: ViewDescriptor) -> Result<&mut Self, SyncError> {
        if !self.names.insert(view.name.clone()) {
            return Err(SyncError::Registry(format!("view '{}' is already registered", view.name)));
        }
        self.views.push(view);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&ViewDescriptor> {
        self.views.iter().find(|v| v.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ViewDescriptor> {
        self.views.iter()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// The actor's Pull Permission set: names of views it may read.
    pub fn pull_permissions(&self, principal: &Principal) -> Vec<&str> {
        self.views
            .iter()
            .filter(|v| principal.has_permission(&v.permission))
            .map(|v| v.name.as_str())
            .collect()
    }

    /// Read permissions of every view over any of `tables`.
    pub fn permissions_for_tables<'a>(&self, tables: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let tables: HashSet<&str> = tables.into_iter().collect();
        self.views
            .iter()
            .filter(|v| tables.contains(v.table.as_str()))
            .map(|v| v.permission.clone())
            .collect()
    }
}
