// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::{DispatchArgs, ErasedArgs, ErasedProcedure, ProcedureKind, ProcedureRegistry};
use crate::error::SyncError;
use crate::metrics;
use crate::policy::Principal;
use crate::resilience::retry::RetryConfig;
use crate::store::{transact, EntityStore, Transaction};

/// A procedure resolved and its arguments decoded, ready to run in a transaction.
pub(crate) struct Prepared {
    procedure: Arc<dyn ErasedProcedure>,
    args: ErasedArgs,
}

impl Prepared {
    pub(crate) fn name(&self) -> &'static str {
        self.procedure.name()
    }

    pub(crate) fn kind(&self) -> ProcedureKind {
        self.procedure.kind()
    }

    pub(crate) fn run(&self, principal: &Principal, tx: &mut Transaction) -> Result<Value, SyncError> {
        self.procedure.run(&self.args, principal, tx)
    }
}

/// Runs registered procedures against a store: decode, validate, execute,
/// authorize the post-mutation state, commit.
pub struct Dispatcher {
    store: Arc<dyn EntityStore>,
    registry: Arc<ProcedureRegistry>,
    retry: RetryConfig,
}

impl Dispatcher {
    /// Fails unless the registry is sealed.
    pub fn new(
        store: Arc<dyn EntityStore>,
        registry: Arc<ProcedureRegistry>,
        retry: RetryConfig,
    ) -> Result<Self, SyncError> {
        if !registry.is_sealed() {
            return Err(SyncError::Registry("registry must be sealed before dispatch".into()));
        }
        Ok(Self { store, registry, retry })
    }

    pub fn registry(&self) -> &ProcedureRegistry {
        &self.registry
    }

    pub(crate) fn prepare(&self, name: &str, args: DispatchArgs) -> Result<Prepared, SyncError> {
        let procedure = self.registry.get(name)?;
        let args = procedure.decode(args)?;
        Ok(Prepared { procedure, args })
    }

    /// Run one procedure in its own transaction and return its JSON result.
    ///
    /// Commit conflicts re-run the whole procedure, policy included, from a
    /// fresh snapshot.
    #[tracing::instrument(skip(self, principal, args), fields(tenant_id = %principal.tenant_id, user_id = %principal.user_id))]
    pub async fn dispatch(
        &self,
        principal: &Principal,
        name: &str,
        args: DispatchArgs,
    ) -> Result<Value, SyncError> {
        let start = Instant::now();
        let result = self.dispatch_inner(principal, name, args).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::record_dispatch(name, status, start.elapsed());

        match &result {
            Ok(_) => debug!(procedure = name, "Dispatched"),
            Err(e) if e.is_batch_fatal() => warn!(procedure = name, error = %e, "Dispatch failed"),
            Err(e) => debug!(procedure = name, error = %e, "Dispatch rejected"),
        }
        result
    }

    /// [`dispatch`](Self::dispatch), decoding the result into `R`.
    pub async fn dispatch_as<R: DeserializeOwned>(
        &self,
        principal: &Principal,
        name: &str,
        args: DispatchArgs,
    ) -> Result<R, SyncError> {
        let value = self.dispatch(principal, name, args).await?;
        serde_json::from_value(value)
            .map_err(|e| SyncError::Internal(format!("{}: unexpected result shape: {}", name, e)))
    }

    async fn dispatch_inner(
        &self,
        principal: &Principal,
        name: &str,
        args: DispatchArgs,
    ) -> Result<Value, SyncError> {
        let prepared = self.prepare(name, args)?;
        let (value, _tables) = transact(self.store.as_ref(), &principal.tenant_id, &self.retry, |tx| {
            prepared.run(principal, tx)
        })
        .await?;
        Ok(value)
    }
}
