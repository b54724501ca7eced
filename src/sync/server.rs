// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, info, warn};

use super::poke::Notifier;
use super::protocol::{ProtocolError, PullRequest, PullResponse, PushRequest, PushResponse};
use crate::config::SyncConfig;
use crate::entity::TenantId;
use crate::error::SyncError;
use crate::metrics::{self, LatencyTimer};
use crate::policy::Principal;
use crate::procedures::{DispatchArgs, Dispatcher, ProcedureRegistry};
use crate::store::EntityStore;
use crate::view::ViewRegistry;

type PushKey = (TenantId, String);

/// Pull/push coordinator for every tenant of one store.
///
/// Cheap to share behind an `Arc`. Pushes serialize per client group; pulls
/// and pushes of different groups run concurrently and meet only at the
/// store's optimistic commit.
pub struct SyncServer {
    pub(super) store: Arc<dyn EntityStore>,
    pub(super) views: Arc<ViewRegistry>,
    pub(super) dispatcher: Dispatcher,
    pub(super) notifier: Arc<dyn Notifier>,
    /// Runtime-adjustable; read and copied, never held across an await.
    pub(super) config: RwLock<SyncConfig>,
    /// One entry per client group with a push in flight or waiting.
    pub(super) push_locks: DashMap<PushKey, Arc<Mutex<()>>>,
    /// Bounds view diffs across all in-flight pulls.
    pub(super) diff_permits: Arc<Semaphore>,
}

impl SyncServer {
    /// Seals `procedures` and builds the server.
    pub fn new(
        store: Arc<dyn EntityStore>,
        views: ViewRegistry,
        mut procedures: ProcedureRegistry,
        notifier: Arc<dyn Notifier>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        procedures.seal();
        let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::new(procedures), config.transaction_retry())?;

        info!(
            views = views.len(),
            procedures = dispatcher.registry().len(),
            pull_concurrency = config.pull_concurrency,
            max_rows_per_pull = config.max_rows_per_pull,
            "Sync server ready"
        );

        Ok(Self {
            store,
            views: Arc::new(views),
            dispatcher,
            notifier,
            diff_permits: Arc::new(Semaphore::new(config.pull_concurrency.max(1))),
            config: RwLock::new(config),
            push_locks: DashMap::new(),
        })
    }

    pub fn views(&self) -> &ViewRegistry {
        &self.views
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn config(&self) -> SyncConfig {
        self.config.read().clone()
    }

    /// Replace timeouts, row budget and retry limits for subsequent requests.
    /// Pool size and diff concurrency are fixed at construction.
    pub fn update_config(&self, config: SyncConfig) {
        info!(
            request_timeout_ms = config.request_timeout_ms,
            max_rows_per_pull = config.max_rows_per_pull,
            "Sync config updated"
        );
        *self.config.write() = config;
    }

    /// Serve one pull. Protocol refusals come back as a
    /// [`PullResponse::Error`]; everything else failing is an `Err`.
    #[tracing::instrument(skip(self, principal, request), fields(
        tenant_id = %principal.tenant_id,
        client_group_id = %request.client_group_id,
    ))]
    pub async fn pull(&self, principal: &Principal, request: PullRequest) -> Result<PullResponse, SyncError> {
        let result = self.bounded("pull", self.pull_inner(principal, &request)).await;
        match result {
            Ok(result) => Ok(PullResponse::Ok(result)),
            Err(err) => match ProtocolError::from_error(&err) {
                Some(protocol) => {
                    info!(error = %err, "Pull refused");
                    Ok(PullResponse::Error(protocol))
                }
                None => Err(err),
            },
        }
    }

    /// Apply a batch of mutations from one client group, in order.
    ///
    /// Business failures are reported per mutation in the response and do
    /// not stop the batch. Anything else stops it; mutations committed
    /// before the failure stay committed.
    #[tracing::instrument(skip(self, principal, request), fields(
        tenant_id = %principal.tenant_id,
        client_group_id = %request.client_group_id,
        mutations = request.mutations.len(),
    ))]
    pub async fn push(&self, principal: &Principal, request: PushRequest) -> Result<PushResponse, SyncError> {
        let result = self.bounded("push", self.push_inner(principal, &request)).await;
        match result {
            Ok(result) => Ok(PushResponse::Ok(result)),
            Err(err) => match ProtocolError::from_error(&err) {
                Some(protocol) => {
                    info!(error = %err, "Push refused");
                    Ok(PushResponse::Error(protocol))
                }
                None => Err(err),
            },
        }
    }

    /// Run a procedure directly, outside the push protocol.
    pub async fn dispatch(&self, principal: &Principal, name: &str, args: DispatchArgs) -> Result<Value, SyncError> {
        self.bounded("dispatch", self.dispatcher.dispatch(principal, name, args))
            .await
    }

    /// Delete client groups idle longer than the configured lifetime, in
    /// batches of `gc_batch_size`, until none is left. Returns the total.
    #[tracing::instrument(skip(self))]
    pub async fn collect_expired_client_groups(&self) -> Result<usize, SyncError> {
        let (lifetime, batch) = {
            let config = self.config.read();
            (config.client_group_lifetime(), config.gc_batch_size.max(1))
        };

        let mut total = 0;
        loop {
            let deleted = self.store.delete_expired(lifetime, batch).await?;
            total += deleted;
            if deleted < batch {
                break;
            }
        }

        if total > 0 {
            info!(groups = total, "Expired client groups collected");
        }
        Ok(total)
    }

    /// Apply the request deadline and record outcome metrics.
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        let deadline = self.config.read().request_timeout();
        let _timer = LatencyTimer::new(operation);

        let result = match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, deadline_ms = deadline.as_millis() as u64, "Request deadline exceeded");
                metrics::record_timeout(operation);
                Err(SyncError::Timeout(deadline))
            }
        };

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::record_request(operation, status);
        result
    }

    /// Wait for exclusive push access to one client group.
    pub(super) async fn lock_push(&self, tenant_id: &TenantId, client_group_id: &str) -> PushLockGuard<'_> {
        let key = (tenant_id.clone(), client_group_id.to_string());
        let lock = self.push_locks.entry(key.clone()).or_default().clone();
        metrics::set_push_lock_entries(self.push_locks.len());

        PushLockGuard {
            guard: Some(lock.lock_owned().await),
            locks: &self.push_locks,
            key,
        }
    }
}

/// Held for the duration of one push. On drop the group's lock entry is
/// removed unless another push already holds or waits on it.
pub(super) struct PushLockGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<PushKey, Arc<Mutex<()>>>,
    key: PushKey,
}

impl Drop for PushLockGuard<'_> {
    fn drop(&mut self) {
        // Release first so the map holds the last reference
        drop(self.guard.take());
        if self
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
        {
            debug!(client_group_id = %self.key.1, "Push lock released");
        }
        metrics::set_push_lock_entries(self.locks.len());
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("views", &self.views.len())
            .field("procedures", &self.dispatcher.registry().len())
            .field("push_locks", &self.push_locks.len())
            .finish()
    }
}
