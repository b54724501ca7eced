//! # Tenant Sync
//!
//! Multi-tenant sync and authorization kernel: keeps offline-capable client
//! replicas of tenant-scoped rows consistent with an authoritative store,
//! with every read and write gated by composable, data-dependent policies.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SyncServer (pull / push)                 │
//! │  • Deadlines, per-client-group push ordering               │
//! │  • Pull permission set from the principal's grants         │
//! └─────────────────────────────────────────────────────────────┘
//!            │ pull                              │ push
//!            ▼                                   ▼
//! ┌──────────────────────────┐     ┌──────────────────────────┐
//! │        Diff Engine       │     │        Dispatcher        │
//! │  • one generic diff per  │     │  • decode + validate     │
//! │    view, bounded fan-out │     │  • execute, then policy  │
//! │  • row budget, fast-fwd  │     │    on post-state         │
//! │  • writes CVR entries    │     │  • per-mutation fallback │
//! └──────────────────────────┘     └──────────────────────────┘
//!            │                                   │
//!            ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Entity Store                        │
//! │  • Tenant snapshots, transactions with version bumps       │
//! │  • Optimistic commit, retried on conflict                  │
//! │  • In-memory or SQL (SQLite / MySQL via sqlx)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenant_sync::procedures::ProcedureRegistry;
//! use tenant_sync::store::InMemoryStore;
//! use tenant_sync::sync::{BroadcastNotifier, PullRequest, PullResponse};
//! use tenant_sync::{Principal, Role, RoleAcls, SyncConfig, SyncServer, TenantId, ViewDescriptor, ViewRegistry, Visibility};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), tenant_sync::SyncError> {
//! let config = SyncConfig::default();
//!
//! let mut views = ViewRegistry::new();
//! views
//!     .register(ViewDescriptor::for_table("rooms"))?
//!     .register(ViewDescriptor::new("active_rooms", "rooms", Visibility::Active))?;
//!
//! let server = SyncServer::new(
//!     Arc::new(InMemoryStore::new()),
//!     views,
//!     ProcedureRegistry::new(),
//!     Arc::new(BroadcastNotifier::from_config(&config)),
//!     config,
//! )?;
//!
//! let acls = RoleAcls::new().grant(Role::Customer, ["active_rooms:read"]);
//! let alice = Principal::new(TenantId::new("acme"), "alice", Role::Customer, &acls);
//!
//! if let PullResponse::Ok(result) = server.pull(&alice, PullRequest::new("group-1", None)).await? {
//!     println!("cookie {} with {} ops", result.cookie.order, result.patch.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`store`]: snapshots, transactions, in-memory and SQL backends
//! - [`view`]: view descriptors and visibility predicates
//! - [`cvr`]: client groups, clients, client views, CVR entries
//! - [`diff`]: the generic diff engine and row budget
//! - [`policy`]: principals, role grants, policy combinators
//! - [`procedures`]: procedure trait, sealed registry, dispatcher
//! - [`sync`]: wire types, pull, push, pokes
//! - [`resilience`]: retry with backoff

pub mod config;
pub mod cvr;
pub mod diff;
pub mod entity;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod procedures;
pub mod resilience;
pub mod store;
pub mod sync;
pub mod view;

pub use config::SyncConfig;
pub use cvr::{Client, ClientGroup, ClientView, CvrEntry};
pub use entity::{Entity, EntityId, EntityPatch, TenantId, Version};
pub use error::{Denial, SyncError};
pub use metrics::LatencyTimer;
pub use policy::{Policy, PolicyKind, Principal, Role, RoleAcls};
pub use procedures::{DispatchArgs, Dispatcher, Fallback, MutationContext, Procedure, ProcedureKind, ProcedureRegistry};
pub use resilience::retry::RetryConfig;
pub use store::{EntityReader, EntityStore, InMemoryStore, SqlStore, StoreError, TenantSnapshot, Transaction};
pub use sync::SyncServer;
pub use view::{ViewDescriptor, ViewRegistry, Visibility};
