//! Pull: diff every view the actor may read against what the client group
//! holds, record what was sent, return the patch.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::protocol::{Cookie, PatchOperation, PullRequest, PullResult, PULL_VERSION, SYNC_STATE_KEY};
use super::server::SyncServer;
use crate::cvr::{ClientGroup, ClientView, CvrEntry};
use crate::diff::{apply_row_budget, diff_view, DiffRequest, ViewDiff};
use crate::entity::EntityId;
use crate::error::SyncError;
use crate::metrics;
use crate::policy::Principal;
use crate::resilience::retry::retry_if;
use crate::store::{StoreError, TenantSnapshot, Transaction};
use crate::view::ViewRegistry;

impl SyncServer {
    pub(super) async fn pull_inner(&self, principal: &Principal, request: &PullRequest) -> Result<PullResult, SyncError> {
        if request.pull_version != PULL_VERSION {
            return Err(SyncError::VersionNotSupported { version_type: "pull".into() });
        }

        let (max_rows, retry) = {
            let config = self.config.read();
            (config.max_rows_per_pull, config.transaction_retry())
        };

        retry_if("pull", &retry, SyncError::is_retryable, || {
            self.pull_once(principal, request, max_rows)
        })
        .await
    }

    async fn pull_once(
        &self,
        principal: &Principal,
        request: &PullRequest,
        max_rows: usize,
    ) -> Result<PullResult, SyncError> {
        let tenant_id = &principal.tenant_id;
        let group_id = request.client_group_id.as_str();
        let snapshot = self.store.snapshot(tenant_id).await?;

        let previous = match request.cookie {
            Some(cookie) => Some(
                snapshot
                    .client_view(group_id, cookie.order)
                    .cloned()
                    .ok_or(SyncError::ClientStateNotFound)?,
            ),
            None => None,
        };

        let mut group = match snapshot.client_group(group_id) {
            Some(group) => {
                group.ensure_owner(principal)?;
                group.clone()
            }
            None => ClientGroup::new(group_id, principal),
        };

        let checkpoint = previous.as_ref().map_or(0, |view| view.version);
        let cookie_order = request.cookie.map_or(0, |cookie| cookie.order);
        let next_cvv = cookie_order.max(group.client_view_version) + 1;

        let mut diffs = self.diff_views(&snapshot, principal, group_id, checkpoint).await?;
        let complete = apply_row_budget(&mut diffs, max_rows);

        let previous_client_version = previous.as_ref().map_or(0, |view| view.client_version);
        let last_mutation_id_changes: BTreeMap<String, u64> = snapshot
            .clients_of_group(group_id)
            .filter(|client| client.version > previous_client_version)
            .map(|client| (client.id.clone(), client.last_mutation_id))
            .collect();

        // A partial view must be superseded even when nothing is left to
        // send, or the client never sees COMPLETE
        let settled = previous.as_ref().is_some_and(|view| view.complete);
        if let Some(cookie) = request.cookie {
            if settled && last_mutation_id_changes.is_empty() && diffs.iter().all(ViewDiff::is_empty) {
                debug!(cookie = cookie.order, "Nothing changed since cookie");
                return Ok(PullResult {
                    cookie,
                    last_mutation_id_changes,
                    patch: Vec::new(),
                });
            }
        }

        group.client_view_version = next_cvv;
        group.touch();
        let entries = cvr_entries(&snapshot, &group, &diffs, next_cvv, previous.is_none());
        let client_view = ClientView {
            tenant_id: tenant_id.clone(),
            client_group_id: group.id.clone(),
            version: next_cvv,
            client_version: group.client_version,
            complete,
        };

        let mut tx = Transaction::begin(Arc::clone(&snapshot));
        tx.put_client_group(group);
        tx.put_client_view(client_view);
        tx.put_cvr(entries);
        self.store
            .commit(tenant_id, tx.into_change_set())
            .await
            .map_err(|e| {
                if matches!(e, StoreError::Conflict(_)) {
                    metrics::record_transaction_conflict(tenant_id.as_str());
                }
                e
            })?;

        let patch = build_patch(&self.views, &diffs, previous.is_none(), complete)?;

        for diff in &diffs {
            metrics::record_view_rows(
                &diff.view,
                diff.creates.len(),
                diff.updates.len(),
                diff.deletes.len(),
                diff.fast_forward.len(),
            );
        }
        metrics::record_patch_size(patch.len());
        if !complete {
            metrics::record_partial_pull();
        }

        info!(
            cvv = next_cvv,
            ops = patch.len(),
            complete,
            clients_changed = last_mutation_id_changes.len(),
            "Pull served"
        );

        Ok(PullResult {
            cookie: Cookie { order: next_cvv },
            last_mutation_id_changes,
            patch,
        })
    }

    /// Diff every view that is readable now or may still be held, in
    /// registry order, with bounded concurrency over one snapshot.
    async fn diff_views(
        &self,
        snapshot: &Arc<TenantSnapshot>,
        principal: &Principal,
        group_id: &str,
        checkpoint: u64,
    ) -> Result<Vec<ViewDiff>, SyncError> {
        let readable: HashSet<&str> = self.views.pull_permissions(principal).into_iter().collect();

        let mut join_set: JoinSet<(usize, ViewDiff)> = JoinSet::new();
        let mut slots: Vec<Option<ViewDiff>> = Vec::new();

        for (index, view) in self.views.iter().enumerate() {
            slots.push(None);
            let request = DiffRequest {
                client_group_id: group_id.to_string(),
                checkpoint,
                readable: readable.contains(view.name()),
                exclude_ids: HashSet::<EntityId>::new(),
            };
            // Nothing visible and nothing held
            if !request.readable && checkpoint == 0 {
                continue;
            }

            let permit = Arc::clone(&self.diff_permits)
                .acquire_owned()
                .await
                .map_err(|_| SyncError::Internal("diff semaphore closed".into()))?;
            let snapshot = Arc::clone(snapshot);
            let view = view.clone();
            let principal = principal.clone();

            join_set.spawn(async move {
                let _permit = permit;
                (index, diff_view(&snapshot, &view, &principal, &request))
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (index, diff) = joined.map_err(|e| SyncError::Internal(format!("view diff task failed: {}", e)))?;
            slots[index] = Some(diff);
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

/// CVR entries recording this pull. A fresh pull first tombstones
/// everything the group was ever sent, since the client starts from empty.
fn cvr_entries(
    snapshot: &TenantSnapshot,
    group: &ClientGroup,
    diffs: &[ViewDiff],
    cvv: u64,
    fresh: bool,
) -> Vec<CvrEntry> {
    let mut entries: BTreeMap<(String, EntityId), CvrEntry> = BTreeMap::new();

    if fresh {
        for held in snapshot.group_cvr(&group.id).filter(|e| e.entity_version.is_some()) {
            entries.insert(
                (held.view.clone(), held.entity_id.clone()),
                CvrEntry::deleted(group, &held.view, held.entity_id.clone(), cvv),
            );
        }
    }

    for diff in diffs {
        for id in &diff.deletes {
            entries.insert(
                (diff.view.clone(), id.clone()),
                CvrEntry::deleted(group, &diff.view, id.clone(), cvv),
            );
        }
        for row in diff.puts() {
            entries.insert(
                (diff.view.clone(), row.id.clone()),
                CvrEntry::sent(group, &diff.view, row.id.clone(), cvv, row.version),
            );
        }
    }

    entries.into_values().collect()
}

fn build_patch(
    views: &ViewRegistry,
    diffs: &[ViewDiff],
    fresh: bool,
    complete: bool,
) -> Result<Vec<PatchOperation>, SyncError> {
    let mut patch = Vec::new();
    if fresh {
        patch.push(PatchOperation::Clear);
    }

    for diff in diffs {
        let view = views
            .get(&diff.view)
            .ok_or_else(|| SyncError::Internal(format!("diff for unregistered view '{}'", diff.view)))?;
        for id in &diff.deletes {
            patch.push(PatchOperation::Del { key: view.key(id) });
        }
        for row in diff.puts() {
            patch.push(PatchOperation::Put {
                key: view.key(&row.id),
                value: row.to_dto(),
            });
        }
    }

    let state = if complete { "COMPLETE" } else { "PARTIAL" };
    patch.push(PatchOperation::Put {
        key: SYNC_STATE_KEY.to_string(),
        value: state.into(),
    });
    Ok(patch)
}
