//! Tenant-scoped entity rows.
//!
//! Every row carries a `version` that moves forward on each committed
//! mutation; the diff engine compares versions, never content.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic per-row counter. A row's version identifies its content.
pub type Version = u64;

/// Isolation boundary. Every read and write is scoped by one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique within a tenant and table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// One row of one table, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub tenant_id: TenantId,
    pub table: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub version: Version,
    /// Entity-specific fields. Always a JSON object.
    pub data: Map<String, Value>,
}

impl Entity {
    /// Not soft-deleted.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Entity-specific field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// Flat wire object: data fields plus the common columns.
    pub fn to_dto(&self) -> Value {
        let mut dto = self.data.clone();
        dto.insert("id".into(), Value::String(self.id.to_string()));
        dto.insert("tenantId".into(), Value::String(self.tenant_id.to_string()));
        dto.insert("createdAt".into(), Value::from(self.created_at));
        dto.insert("updatedAt".into(), Value::from(self.updated_at));
        dto.insert(
            "deletedAt".into(),
            self.deleted_at.map(Value::from).unwrap_or(Value::Null),
        );
        dto.insert("version".into(), Value::from(self.version));
        Value::Object(dto)
    }
}

/// Partial update for [`crate::store::Transaction::update_by_id`].
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use tenant_sync::EntityPatch;
///
/// let patch = EntityPatch::new()
///     .set("status", json!("published"))
///     .expect_updated_at(1_700_000_000_000);
/// assert_eq!(patch.expected_updated_at(), Some(1_700_000_000_000));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPatch {
    pub(crate) fields: Map<String, Value>,
    pub(crate) deleted_at: Option<Option<i64>>,
    pub(crate) expect_updated_at: Option<i64>,
}

impl EntityPatch {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    /// Mark the row soft-deleted at `at`.
    #[must_use]
    pub fn soft_delete(mut self, at: i64) -> Self {
        self.deleted_at = Some(Some(at));
        self
    }

    /// Clear the soft-delete marker.
    #[must_use]
    pub fn restore(mut self) -> Self {
        self.deleted_at = Some(None);
        self
    }

    /// Optimistic-concurrency token: the `updated_at` the caller last saw.
    #[must_use]
    pub fn expect_updated_at(mut self, updated_at: i64) -> Self {
        self.expect_updated_at = Some(updated_at);
        self
    }

    pub fn expected_updated_at(&self) -> Option<i64> {
        self.expect_updated_at
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.deleted_at.is_none()
    }
}

/// Current time as epoch millis.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// `updated_at` for an edit: strictly after the previous value, so every
/// edit invalidates outstanding concurrency tokens even within one millisecond.
pub(crate) fn next_updated_at(previous: i64) -> i64 {
    now_millis().max(previous + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product() -> Entity {
        let mut data = Map::new();
        data.insert("name".into(), json!("Poster"));
        data.insert("status".into(), json!("draft"));
        Entity {
            id: EntityId::new("p1"),
            tenant_id: TenantId::new("t1"),
            table: "products".into(),
            created_at: 10,
            updated_at: 20,
            deleted_at: None,
            version: 3,
            data,
        }
    }

    #[test]
    fn test_dto_flattens_data_and_columns() {
        let dto = product().to_dto();
        assert_eq!(dto["id"], json!("p1"));
        assert_eq!(dto["tenantId"], json!("t1"));
        assert_eq!(dto["name"], json!("Poster"));
        assert_eq!(dto["version"], json!(3));
        assert_eq!(dto["deletedAt"], Value::Null);
    }

    #[test]
    fn test_is_active_follows_soft_delete_marker() {
        let mut row = product();
        assert!(row.is_active());
        row.deleted_at = Some(30);
        assert!(!row.is_active());
    }

    #[test]
    fn test_next_updated_at_always_advances() {
        let far_future = now_millis() + 60_000;
        assert_eq!(next_updated_at(far_future), far_future + 1);
        assert!(next_updated_at(0) >= now_millis() - 1_000);
    }

    #[test]
    fn test_patch_builder() {
        let patch = EntityPatch::new().set("status", json!("published")).soft_delete(5);
        assert!(!patch.is_empty());
        assert_eq!(patch.deleted_at, Some(Some(5)));
        assert!(EntityPatch::new().is_empty());
        assert_eq!(EntityPatch::new().restore().deleted_at, Some(None));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(EntityId::generate(), EntityId::generate());
    }
}
