// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push: apply a client group's mutations in order, one transaction each.

use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::poke::Poke;
use super::protocol::{Mutation, MutationError, PushRequest, PushResult, PUSH_VERSION};
use super::server::SyncServer;
use crate::cvr::{Client, ClientGroup};
use crate::error::SyncError;
use crate::metrics;
use crate::policy::{PolicyKind, Principal};
use crate::procedures::{DispatchArgs, ProcedureKind};
use crate::resilience::retry::RetryConfig;
use crate::store::transact;

enum Outcome {
    Applied,
    /// Already processed; nothing written.
    Skipped,
    /// Ran and failed; effects discarded, mutation id consumed.
    Failed(SyncError),
    /// Never ran (bad args, unknown name); mutation id consumed.
    Rejected,
}

impl SyncServer {
    pub(super) async fn push_inner(&self, principal: &Principal, request: &PushRequest) -> Result<PushResult, SyncError> {
        if request.push_version != PUSH_VERSION {
            return Err(SyncError::VersionNotSupported { version_type: "push".into() });
        }

        let _lock = self.lock_push(&principal.tenant_id, &request.client_group_id).await;
        let retry = self.config.read().transaction_retry();

        let mut result = PushResult::default();
        let mut touched = BTreeSet::new();

        for mutation in &request.mutations {
            let (tables, error) = self
                .apply_mutation(principal, &request.client_group_id, mutation, &retry)
                .await?;
            touched.extend(tables);
            if let Some(err) = error {
                result.errors.push(MutationError {
                    client_id: mutation.client_id.clone(),
                    mutation_id: mutation.id,
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
            }
        }

        info!(
            mutations = request.mutations.len(),
            failed = result.errors.len(),
            tables = touched.len(),
            "Push processed"
        );

        if !touched.is_empty() {
            self.send_poke(principal, &request.client_group_id, &touched).await;
        }
        Ok(result)
    }

    /// Process one mutation in its own transaction. Returns the tables it
    /// wrote and, when it failed in a way the client should hear about, why.
    async fn apply_mutation(
        &self,
        principal: &Principal,
        group_id: &str,
        mutation: &Mutation,
        retry: &RetryConfig,
    ) -> Result<(BTreeSet<String>, Option<SyncError>), SyncError> {
        let start = Instant::now();
        let prepared = match self
            .dispatcher
            .prepare(&mutation.name, DispatchArgs::Encoded(mutation.args.clone()))
        {
            Ok(p) if p.kind() == ProcedureKind::Query => Err(SyncError::Validation(format!(
                "'{}' is a query and cannot be pushed",
                p.name()
            ))),
            Ok(p) => Ok(p),
            Err(e) if e.is_batch_fatal() => return Err(e),
            Err(e) => Err(e),
        };

        let (outcome, tables) = transact(self.store.as_ref(), &principal.tenant_id, retry, |tx| {
            let mut group = tx
                .client_group(group_id)
                .unwrap_or_else(|| ClientGroup::new(group_id, principal));
            group.ensure_owner(principal)?;

            let mut client = match tx.client(&mutation.client_id) {
                Some(client) if client.client_group_id != group_id => {
                    return Err(SyncError::denied(
                        PolicyKind::Relationship,
                        format!("client {} belongs to another client group", client.id),
                    ));
                }
                Some(client) => client,
                None if mutation.id > 1 => return Err(SyncError::ClientStateNotFound),
                None => Client::new(&mutation.client_id, &group),
            };

            let expected = client.last_mutation_id + 1;
            if mutation.id < expected {
                return Ok(Outcome::Skipped);
            }
            if mutation.id > expected {
                return Err(SyncError::FutureMutation {
                    client_id: mutation.client_id.clone(),
                    mutation_id: mutation.id,
                    last_mutation_id: client.last_mutation_id,
                });
            }

            let outcome = match &prepared {
                Ok(procedure) => match procedure.run(principal, tx) {
                    Ok(_) => Outcome::Applied,
                    Err(e) if e.is_batch_fatal() => return Err(e),
                    Err(e) => {
                        // Error mode: keep the bookkeeping, drop the effects
                        tx.discard_entity_writes();
                        Outcome::Failed(e)
                    }
                },
                Err(_) => Outcome::Rejected,
            };

            group.client_version += 1;
            group.touch();
            client.last_mutation_id = mutation.id;
            client.version = group.client_version;
            tx.put_client_group(group);
            tx.put_client(client);
            Ok(outcome)
        })
        .await
        .map_err(|e| {
            warn!(client_id = %mutation.client_id, mutation_id = mutation.id, error = %e, "Push aborted");
            e
        })?;

        let error = match outcome {
            Outcome::Applied => {
                metrics::record_mutation("applied");
                None
            }
            Outcome::Skipped => {
                debug!(client_id = %mutation.client_id, mutation_id = mutation.id, "Already processed");
                metrics::record_mutation("skipped");
                return Ok((tables, None));
            }
            Outcome::Failed(e) => Some(e),
            Outcome::Rejected => prepared.err(),
        };

        if let Some(e) = &error {
            metrics::record_mutation("failed");
            info!(
                client_id = %mutation.client_id,
                mutation_id = mutation.id,
                procedure = %mutation.name,
                code = e.code(),
                error = %e,
                "Mutation failed, processed in error mode"
            );
        }

        let status = error.as_ref().map_or("ok", SyncError::code);
        metrics::record_dispatch(&mutation.name, status, start.elapsed());
        Ok((tables, error))
    }

    async fn send_poke(&self, principal: &Principal, group_id: &str, tables: &BTreeSet<String>) {
        let permissions = self.views.permissions_for_tables(tables.iter().map(String::as_str));
        if permissions.is_empty() {
            return;
        }
        let poke = Poke {
            tenant_id: principal.tenant_id.clone(),
            client_group_id: group_id.to_string(),
            permissions,
        };
        match self.notifier.poke(poke).await {
            Ok(()) => metrics::record_poke(true),
            Err(e) => {
                metrics::record_poke(false);
                warn!(error = %e, "Poke failed");
            }
        }
    }
}
