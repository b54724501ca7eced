// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend (SQLite or MySQL through the sqlx `Any` driver).
//!
//! Schema:
//! ```sql
//! CREATE TABLE entities (
//!   tenant_id, table_name, id,        -- primary key
//!   created_at, updated_at, deleted_at,
//!   version BIGINT NOT NULL,          -- optimistic lock column
//!   data LONGTEXT NOT NULL            -- entity fields as a JSON object
//! );
//! CREATE TABLE entity_tombstones (tenant_id, table_name, id, version);
//! CREATE TABLE client_groups (tenant_id, id, user_id, client_version, client_view_version, updated_at);
//! CREATE TABLE clients (tenant_id, id, client_group_id, last_mutation_id, version);
//! CREATE TABLE client_views (tenant_id, client_group_id, version, client_version, complete);
//! CREATE TABLE cvr_entries (tenant_id, client_group_id, view_name, entity_id,
//!                           client_view_version, entity_version);
//! ```
//!
//! ## Concurrency
//!
//! Entity updates and deletes are guarded with `WHERE version = ?` and checked
//! through `rows_affected`; inserts rely on the primary key. Any mismatch,
//! duplicate key, deadlock or busy database surfaces as
//! [`StoreError::Conflict`] and the whole transaction rolls back.
//!
//! ## sqlx Any Driver Quirks
//!
//! JSON lives in TEXT/LONGTEXT because the `Any` driver has no JSON mapping,
//! and MySQL LONGTEXT comes back as bytes, so text columns are read as
//! `String` first and `Vec<u8>` second.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing::debug;

use crate::config::SyncConfig;
use crate::cvr::{Client, ClientGroup, ClientView, CvrEntry};
use crate::entity::{Entity, EntityId, TenantId};
use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};
use super::snapshot::TenantSnapshot;
use super::traits::{expiry_cutoff, ChangeSet, ClientGroupWrite, ClientWrite, EntityStore, EntityWrite, StoreError};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

// MySQL max_allowed_packet is typically 16MB; keep multi-row upserts well under it
const CHUNK_SIZE: usize = 500;

type SqlTx<'c> = sqlx::Transaction<'c, Any>;

#[derive(Debug)]
pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        Self::connect(connection_string, 20).await
    }

    /// Connect using `sql_url` and `sql_max_connections` from config.
    pub async fn from_config(config: &SyncConfig) -> Result<Self, StoreError> {
        let url = config
            .sql_url
            .as_deref()
            .ok_or_else(|| StoreError::Backend("sql_url is not configured".into()))?;
        Self::connect(url, config.sql_max_connections).await
    }

    pub async fn connect(connection_string: &str, max_connections: u32) -> Result<Self, StoreError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        // Each connection to an in-memory SQLite database is its own database
        let in_memory = is_sqlite && connection_string.contains(":memory:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            let mut options = AnyPoolOptions::new()
                .acquire_timeout(Duration::from_secs(10));
            options = if in_memory {
                options
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
            } else {
                options
                    .max_connections(max_connections)
                    .idle_timeout(Duration::from_secs(300))
            };
            options
                .connect(connection_string)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// Concurrent readers during writes, one fsync per commit.
    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"CREATE TABLE IF NOT EXISTS entities (
                    tenant_id TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    id TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    deleted_at INTEGER,
                    version INTEGER NOT NULL,
                    data TEXT NOT NULL,
                    PRIMARY KEY (tenant_id, table_name, id)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS entity_tombstones (
                    tenant_id TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    id TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    PRIMARY KEY (tenant_id, table_name, id)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS client_groups (
                    tenant_id TEXT NOT NULL,
                    id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    client_version INTEGER NOT NULL,
                    client_view_version INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (tenant_id, id)
                )"#,
                "CREATE INDEX IF NOT EXISTS idx_client_groups_updated ON client_groups (updated_at)",
                r#"CREATE TABLE IF NOT EXISTS clients (
                    tenant_id TEXT NOT NULL,
                    id TEXT NOT NULL,
                    client_group_id TEXT NOT NULL,
                    last_mutation_id INTEGER NOT NULL,
                    version INTEGER NOT NULL,
                    PRIMARY KEY (tenant_id, id)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS client_views (
                    tenant_id TEXT NOT NULL,
                    client_group_id TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    client_version INTEGER NOT NULL,
                    complete INTEGER NOT NULL DEFAULT 1,
                    PRIMARY KEY (tenant_id, client_group_id, version)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS cvr_entries (
                    tenant_id TEXT NOT NULL,
                    client_group_id TEXT NOT NULL,
                    view_name TEXT NOT NULL,
                    entity_id TEXT NOT NULL,
                    client_view_version INTEGER NOT NULL,
                    entity_version INTEGER,
                    PRIMARY KEY (tenant_id, client_group_id, view_name, entity_id)
                )"#,
            ]
        } else {
            &[
                r#"CREATE TABLE IF NOT EXISTS entities (
                    tenant_id VARCHAR(64) NOT NULL,
                    table_name VARCHAR(64) NOT NULL,
                    id VARCHAR(128) NOT NULL,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    deleted_at BIGINT NULL,
                    version BIGINT NOT NULL,
                    data LONGTEXT NOT NULL,
                    PRIMARY KEY (tenant_id, table_name, id)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS entity_tombstones (
                    tenant_id VARCHAR(64) NOT NULL,
                    table_name VARCHAR(64) NOT NULL,
                    id VARCHAR(128) NOT NULL,
                    version BIGINT NOT NULL,
                    PRIMARY KEY (tenant_id, table_name, id)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS client_groups (
                    tenant_id VARCHAR(64) NOT NULL,
                    id VARCHAR(128) NOT NULL,
                    user_id VARCHAR(128) NOT NULL,
                    client_version BIGINT NOT NULL,
                    client_view_version BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL DEFAULT 0,
                    PRIMARY KEY (tenant_id, id),
                    INDEX idx_client_groups_updated (updated_at)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS clients (
                    tenant_id VARCHAR(64) NOT NULL,
                    id VARCHAR(128) NOT NULL,
                    client_group_id VARCHAR(128) NOT NULL,
                    last_mutation_id BIGINT NOT NULL,
                    version BIGINT NOT NULL,
                    PRIMARY KEY (tenant_id, id),
                    INDEX idx_clients_group (tenant_id, client_group_id)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS client_views (
                    tenant_id VARCHAR(64) NOT NULL,
                    client_group_id VARCHAR(128) NOT NULL,
                    version BIGINT NOT NULL,
                    client_version BIGINT NOT NULL,
                    complete TINYINT NOT NULL DEFAULT 1,
                    PRIMARY KEY (tenant_id, client_group_id, version)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS cvr_entries (
                    tenant_id VARCHAR(64) NOT NULL,
                    client_group_id VARCHAR(128) NOT NULL,
                    view_name VARCHAR(64) NOT NULL,
                    entity_id VARCHAR(128) NOT NULL,
                    client_view_version BIGINT NOT NULL,
                    entity_version BIGINT NULL,
                    PRIMARY KEY (tenant_id, client_group_id, view_name, entity_id)
                )"#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    fn upsert_suffix(&self, key: &str, columns: &[&str]) -> String {
        let assignments: Vec<String> = if self.is_sqlite {
            columns.iter().map(|c| format!("{c} = excluded.{c}")).collect()
        } else {
            columns.iter().map(|c| format!("{c} = VALUES({c})")).collect()
        };
        if self.is_sqlite {
            format!("ON CONFLICT({}) DO UPDATE SET {}", key, assignments.join(", "))
        } else {
            format!("ON DUPLICATE KEY UPDATE {}", assignments.join(", "))
        }
    }

    async fn write_entity(&self, tx: &mut SqlTx<'_>, tenant_id: &TenantId, write: &EntityWrite) -> Result<(), StoreError> {
        match write {
            EntityWrite::Insert(row) => {
                sqlx::query(
                    "INSERT INTO entities (tenant_id, table_name, id, created_at, updated_at, deleted_at, version, data) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(tenant_id.as_str())
                .bind(&row.table)
                .bind(row.id.as_str())
                .bind(row.created_at)
                .bind(row.updated_at)
                .bind(row.deleted_at)
                .bind(row.version as i64)
                .bind(encode_data(row)?)
                .execute(&mut **tx)
                .await
                .map_err(classify)?;
            }
            EntityWrite::Update { row, expected_version } => {
                let result = sqlx::query(
                    "UPDATE entities SET updated_at = ?, deleted_at = ?, version = ?, data = ? \
                     WHERE tenant_id = ? AND table_name = ? AND id = ? AND version = ?",
                )
                .bind(row.updated_at)
                .bind(row.deleted_at)
                .bind(row.version as i64)
                .bind(encode_data(row)?)
                .bind(tenant_id.as_str())
                .bind(&row.table)
                .bind(row.id.as_str())
                .bind(*expected_version as i64)
                .execute(&mut **tx)
                .await
                .map_err(classify)?;

                if result.rows_affected() != 1 {
                    return Err(StoreError::Conflict(format!(
                        "{} '{}' moved past version {}",
                        row.table, row.id, expected_version
                    )));
                }
            }
            EntityWrite::Delete { table, id, expected_version } => {
                let result = sqlx::query(
                    "DELETE FROM entities WHERE tenant_id = ? AND table_name = ? AND id = ? AND version = ?",
                )
                .bind(tenant_id.as_str())
                .bind(table)
                .bind(id.as_str())
                .bind(*expected_version as i64)
                .execute(&mut **tx)
                .await
                .map_err(classify)?;

                if result.rows_affected() != 1 {
                    return Err(StoreError::Conflict(format!(
                        "{} '{}' moved past version {}",
                        table, id, expected_version
                    )));
                }

                let sql = format!(
                    "INSERT INTO entity_tombstones (tenant_id, table_name, id, version) VALUES (?, ?, ?, ?) {}",
                    self.upsert_suffix("tenant_id, table_name, id", &["version"])
                );
                sqlx::query(&sql)
                    .bind(tenant_id.as_str())
                    .bind(table)
                    .bind(id.as_str())
                    .bind(*expected_version as i64)
                    .execute(&mut **tx)
                    .await
                    .map_err(classify)?;
            }
        }
        Ok(())
    }

    async fn write_client_group(&self, tx: &mut SqlTx<'_>, write: &ClientGroupWrite) -> Result<(), StoreError> {
        let record = &write.record;
        match &write.previous {
            None => {
                sqlx::query(
                    "INSERT INTO client_groups (tenant_id, id, user_id, client_version, client_view_version, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(record.tenant_id.as_str())
                .bind(&record.id)
                .bind(&record.user_id)
                .bind(record.client_version as i64)
                .bind(record.client_view_version as i64)
                .bind(record.updated_at)
                .execute(&mut **tx)
                .await
                .map_err(classify)?;
            }
            Some(previous) => {
                let result = sqlx::query(
                    "UPDATE client_groups SET user_id = ?, client_version = ?, client_view_version = ?, updated_at = ? \
                     WHERE tenant_id = ? AND id = ? AND user_id = ? AND client_version = ? AND client_view_version = ?",
                )
                .bind(&record.user_id)
                .bind(record.client_version as i64)
                .bind(record.client_view_version as i64)
                .bind(record.updated_at)
                .bind(record.tenant_id.as_str())
                .bind(&record.id)
                .bind(&previous.user_id)
                .bind(previous.client_version as i64)
                .bind(previous.client_view_version as i64)
                .execute(&mut **tx)
                .await
                .map_err(classify)?;

                if result.rows_affected() != 1 {
                    return Err(StoreError::Conflict(format!(
                        "client group '{}' changed concurrently",
                        record.id
                    )));
                }
            }
        }
        Ok(())
    }

    async fn write_client(&self, tx: &mut SqlTx<'_>, write: &ClientWrite) -> Result<(), StoreError> {
        let record = &write.record;
        match &write.previous {
            None => {
                sqlx::query(
                    "INSERT INTO clients (tenant_id, id, client_group_id, last_mutation_id, version) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(record.tenant_id.as_str())
                .bind(&record.id)
                .bind(&record.client_group_id)
                .bind(record.last_mutation_id as i64)
                .bind(record.version as i64)
                .execute(&mut **tx)
                .await
                .map_err(classify)?;
            }
            Some(previous) => {
                let result = sqlx::query(
                    "UPDATE clients SET last_mutation_id = ?, version = ? \
                     WHERE tenant_id = ? AND id = ? AND last_mutation_id = ? AND version = ?",
                )
                .bind(record.last_mutation_id as i64)
                .bind(record.version as i64)
                .bind(record.tenant_id.as_str())
                .bind(&record.id)
                .bind(previous.last_mutation_id as i64)
                .bind(previous.version as i64)
                .execute(&mut **tx)
                .await
                .map_err(classify)?;

                if result.rows_affected() != 1 {
                    return Err(StoreError::Conflict(format!(
                        "client '{}' changed concurrently",
                        record.id
                    )));
                }
            }
        }
        Ok(())
    }

    async fn insert_client_view(&self, tx: &mut SqlTx<'_>, view: &ClientView) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO client_views (tenant_id, client_group_id, version, client_version, complete) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(view.tenant_id.as_str())
        .bind(&view.client_group_id)
        .bind(view.version as i64)
        .bind(view.client_version as i64)
        .bind(i64::from(view.complete))
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    /// Multi-row upsert of CVR entries, chunked.
    async fn upsert_cvr(&self, tx: &mut SqlTx<'_>, entries: &[CvrEntry]) -> Result<(), StoreError> {
        let suffix = self.upsert_suffix(
            "tenant_id, client_group_id, view_name, entity_id",
            &["client_view_version", "entity_version"],
        );

        for chunk in entries.chunks(CHUNK_SIZE) {
            let placeholders: Vec<&str> = chunk.iter().map(|_| "(?, ?, ?, ?, ?, ?)").collect();
            let sql = format!(
                "INSERT INTO cvr_entries (tenant_id, client_group_id, view_name, entity_id, client_view_version, entity_version) \
                 VALUES {} {}",
                placeholders.join(", "),
                suffix
            );

            let mut query = sqlx::query(&sql);
            for entry in chunk {
                query = query
                    .bind(entry.tenant_id.as_str())
                    .bind(&entry.client_group_id)
                    .bind(&entry.view)
                    .bind(entry.entity_id.as_str())
                    .bind(entry.client_view_version as i64)
                    .bind(entry.entity_version.map(|v| v as i64));
            }
            query.execute(&mut **tx).await.map_err(classify)?;
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for SqlStore {
    async fn snapshot(&self, tenant_id: &TenantId) -> Result<Arc<TenantSnapshot>, StoreError> {
        let tenant = tenant_id.as_str();
        let mut snapshot = TenantSnapshot::empty(tenant_id.clone());
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let rows = sqlx::query(
            "SELECT table_name, id, created_at, updated_at, deleted_at, version, data FROM entities WHERE tenant_id = ?",
        )
        .bind(tenant)
        .fetch_all(&mut *tx)
        .await
        .map_err(classify)?;
        for row in &rows {
            let entity = decode_entity(tenant_id, row)?;
            snapshot
                .tables
                .entry(entity.table.clone())
                .or_default()
                .insert(entity.id.clone(), entity);
        }

        let rows = sqlx::query("SELECT table_name, id, version FROM entity_tombstones WHERE tenant_id = ?")
            .bind(tenant)
            .fetch_all(&mut *tx)
            .await
            .map_err(classify)?;
        for row in &rows {
            snapshot.retired.insert(
                (text(row, "table_name")?, EntityId::new(text(row, "id")?)),
                int(row, "version")? as u64,
            );
        }

        let rows = sqlx::query(
            "SELECT id, user_id, client_version, client_view_version, updated_at FROM client_groups WHERE tenant_id = ?",
        )
        .bind(tenant)
        .fetch_all(&mut *tx)
        .await
        .map_err(classify)?;
        for row in &rows {
            let group = ClientGroup {
                id: text(row, "id")?,
                tenant_id: tenant_id.clone(),
                user_id: text(row, "user_id")?,
                client_version: int(row, "client_version")? as u64,
                client_view_version: int(row, "client_view_version")? as u64,
                updated_at: int(row, "updated_at")?,
            };
            snapshot.client_groups.insert(group.id.clone(), group);
        }

        let rows = sqlx::query(
            "SELECT id, client_group_id, last_mutation_id, version FROM clients WHERE tenant_id = ?",
        )
        .bind(tenant)
        .fetch_all(&mut *tx)
        .await
        .map_err(classify)?;
        for row in &rows {
            let client = Client {
                id: text(row, "id")?,
                tenant_id: tenant_id.clone(),
                client_group_id: text(row, "client_group_id")?,
                last_mutation_id: int(row, "last_mutation_id")? as u64,
                version: int(row, "version")? as u64,
            };
            snapshot.clients.insert(client.id.clone(), client);
        }

        let rows = sqlx::query(
            "SELECT client_group_id, version, client_version, complete FROM client_views WHERE tenant_id = ?",
        )
        .bind(tenant)
        .fetch_all(&mut *tx)
        .await
        .map_err(classify)?;
        for row in &rows {
            let view = ClientView {
                tenant_id: tenant_id.clone(),
                client_group_id: text(row, "client_group_id")?,
                version: int(row, "version")? as u64,
                client_version: int(row, "client_version")? as u64,
                complete: int(row, "complete")? != 0,
            };
            snapshot
                .client_views
                .insert((view.client_group_id.clone(), view.version), view);
        }

        let rows = sqlx::query(
            "SELECT client_group_id, view_name, entity_id, client_view_version, entity_version \
             FROM cvr_entries WHERE tenant_id = ?",
        )
        .bind(tenant)
        .fetch_all(&mut *tx)
        .await
        .map_err(classify)?;
        for row in &rows {
            let entry = CvrEntry {
                tenant_id: tenant_id.clone(),
                client_group_id: text(row, "client_group_id")?,
                view: text(row, "view_name")?,
                entity_id: EntityId::new(text(row, "entity_id")?),
                client_view_version: int(row, "client_view_version")? as u64,
                entity_version: opt_int(row, "entity_version")?.map(|v| v as u64),
            };
            snapshot
                .cvr
                .entry(entry.client_group_id.clone())
                .or_default()
                .insert((entry.view.clone(), entry.entity_id.clone()), entry);
        }

        tx.commit().await.map_err(classify)?;

        debug!(tenant_id = %tenant_id, rows = snapshot.row_count(), "Loaded tenant snapshot");
        Ok(Arc::new(snapshot))
    }

    async fn commit(&self, tenant_id: &TenantId, changes: ChangeSet) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        for write in &changes.entities {
            self.write_entity(&mut tx, tenant_id, write).await?;
        }
        for write in &changes.client_groups {
            self.write_client_group(&mut tx, write).await?;
        }
        for write in &changes.clients {
            self.write_client(&mut tx, write).await?;
        }
        for view in &changes.client_views {
            self.insert_client_view(&mut tx, view).await?;
        }
        if !changes.cvr.is_empty() {
            self.upsert_cvr(&mut tx, &changes.cvr).await?;
        }

        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn delete_expired(&self, lifetime: Duration, limit: usize) -> Result<usize, StoreError> {
        if limit == 0 {
            return Ok(0);
        }
        let cutoff = expiry_cutoff(lifetime);
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let candidates = sqlx::query(
            "SELECT tenant_id, id FROM client_groups WHERE updated_at < ? ORDER BY updated_at LIMIT ?",
        )
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(classify)?;

        let mut deleted = 0;
        for row in &candidates {
            let tenant = text(row, "tenant_id")?;
            let group_id = text(row, "id")?;

            // Re-check the age so a group touched since the select survives
            let result = sqlx::query("DELETE FROM client_groups WHERE tenant_id = ? AND id = ? AND updated_at < ?")
                .bind(&tenant)
                .bind(&group_id)
                .bind(cutoff)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
            if result.rows_affected() != 1 {
                continue;
            }

            for sql in [
                "DELETE FROM clients WHERE tenant_id = ? AND client_group_id = ?",
                "DELETE FROM client_views WHERE tenant_id = ? AND client_group_id = ?",
                "DELETE FROM cvr_entries WHERE tenant_id = ? AND client_group_id = ?",
            ] {
                sqlx::query(sql)
                    .bind(&tenant)
                    .bind(&group_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(classify)?;
            }
            deleted += 1;
        }

        tx.commit().await.map_err(classify)?;
        if deleted > 0 {
            debug!(groups = deleted, "Expired client groups");
        }
        Ok(deleted)
    }
}

/// Map driver errors onto the store taxonomy. Lost races become conflicts so
/// the caller re-runs the transaction.
fn classify(err: sqlx::Error) -> StoreError {
    if let Some(db) = err.as_database_error() {
        // Unique violation, SQLite BUSY / LOCKED / BUSY_SNAPSHOT, MySQL deadlock SQLSTATE
        if db.is_unique_violation() || matches!(db.code().as_deref(), Some("5" | "6" | "517" | "40001")) {
            metrics::record_store_error("sql", "conflict");
            return StoreError::Conflict(db.message().to_string());
        }
    }
    metrics::record_store_error("sql", "backend");
    StoreError::Backend(err.to_string())
}

fn encode_data(row: &Entity) -> Result<String, StoreError> {
    serde_json::to_string(&row.data).map_err(|e| StoreError::Corruption {
        id: row.id.to_string(),
        reason: e.to_string(),
    })
}

fn decode_entity(tenant_id: &TenantId, row: &AnyRow) -> Result<Entity, StoreError> {
    let id = text(row, "id")?;
    let raw = text(row, "data")?;
    let data: Map<String, Value> = serde_json::from_str(&raw).map_err(|e| StoreError::Corruption {
        id: id.clone(),
        reason: format!("data is not a JSON object: {}", e),
    })?;

    Ok(Entity {
        id: EntityId::new(id),
        tenant_id: tenant_id.clone(),
        table: text(row, "table_name")?,
        created_at: int(row, "created_at")?,
        updated_at: int(row, "updated_at")?,
        deleted_at: opt_int(row, "deleted_at")?,
        version: int(row, "version")? as u64,
        data,
    })
}

// Try String first (SQLite TEXT, MySQL VARCHAR), then bytes (MySQL LONGTEXT)
fn text(row: &AnyRow, column: &str) -> Result<String, StoreError> {
    row.try_get::<String, _>(column).or_else(|_| {
        row.try_get::<Vec<u8>, _>(column)
            .map_err(|e| StoreError::Backend(format!("column {}: {}", column, e)))
            .and_then(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|e| StoreError::Backend(format!("column {}: {}", column, e)))
            })
    })
}

fn int(row: &AnyRow, column: &str) -> Result<i64, StoreError> {
    row.try_get::<i64, _>(column)
        .map_err(|e| StoreError::Backend(format!("column {}: {}", column, e)))
}

fn opt_int(row: &AnyRow, column: &str) -> Result<Option<i64>, StoreError> {
    row.try_get::<Option<i64>, _>(column)
        .map_err(|e| StoreError::Backend(format!("column {}: {}", column, e)))
}
