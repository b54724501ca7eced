// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Named procedures: typed arguments, a policy, and a body that runs inside
//! one transaction.
//!
//! A mutation's policy is evaluated after the body, against the
//! transaction's post-mutation state. A denial ends the dispatch unless the
//! procedure declared a [`Fallback`] for that denial's tag.
//!
//! # Example
//!
//! ```
//! use serde::Deserialize;
//! use tenant_sync::procedures::{MutationContext, Procedure};
//! use tenant_sync::{Entity, EntityId, Policy, SyncError};
//!
//! #[derive(Deserialize)]
//! struct Args { id: EntityId, name: String }
//!
//! struct RenameRoom;
//!
//! impl Procedure for RenameRoom {
//!     type Args = Args;
//!     type Returns = Entity;
//!
//!     fn name(&self) -> &'static str { "renameRoom" }
//!
//!     fn policy(&self, _args: &Args) -> Policy {
//!         Policy::permission("rooms:update")
//!     }
//!
//!     fn execute(&self, args: &Args, ctx: &mut MutationContext<'_>) -> Result<Entity, SyncError> {
//!         let patch = tenant_sync::EntityPatch::new().set("name", args.name.clone().into());
//!         ctx.tx().update_by_id("rooms", &args.id, patch)
//!     }
//! }
//! ```

mod dispatcher;
mod registry;

pub use dispatcher::Dispatcher;
pub use registry::ProcedureRegistry;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::entity::Entity;
use crate::error::SyncError;
use crate::metrics;
use crate::policy::{Policy, Principal};
use crate::store::{EntityReader, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    Mutation,
    /// Read-only; dispatchable directly, rejected by push.
    Query,
}

impl ProcedureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureKind::Mutation => "mutation",
            ProcedureKind::Query => "query",
        }
    }
}

/// Arguments as they reach the dispatcher.
pub enum DispatchArgs {
    /// Wire JSON, decoded into the procedure's `Args`.
    Encoded(Value),
    /// Already-typed `Args`, e.g. from another procedure.
    Decoded(Box<dyn Any + Send>),
}

impl DispatchArgs {
    pub fn decoded<A: Send + 'static>(args: A) -> Self {
        DispatchArgs::Decoded(Box::new(args))
    }
}

impl From<Value> for DispatchArgs {
    fn from(value: Value) -> Self {
        DispatchArgs::Encoded(value)
    }
}

impl fmt::Debug for DispatchArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchArgs::Encoded(value) => f.debug_tuple("Encoded").field(value).finish(),
            DispatchArgs::Decoded(_) => f.write_str("Decoded(..)"),
        }
    }
}

/// What a procedure body sees: the acting principal and the open transaction.
pub struct MutationContext<'a> {
    principal: &'a Principal,
    tx: &'a mut Transaction,
}

impl<'a> MutationContext<'a> {
    pub fn new(principal: &'a Principal, tx: &'a mut Transaction) -> Self {
        Self { principal, tx }
    }

    pub fn principal(&self) -> &Principal {
        self.principal
    }

    pub fn tx(&mut self) -> &mut Transaction {
        self.tx
    }

    /// Read-your-writes view of the tenant.
    pub fn reader(&self) -> &dyn EntityReader {
        &*self.tx
    }
}

pub trait Procedure: Send + Sync + 'static {
    type Args: DeserializeOwned + Send + Sync + 'static;
    type Returns: Serialize + Send + 'static;

    fn name(&self) -> &'static str;

    fn kind(&self) -> ProcedureKind {
        ProcedureKind::Mutation
    }

    /// Checks serde cannot express. `Err` becomes a validation error.
    fn validate(&self, _args: &Self::Args) -> Result<(), String> {
        Ok(())
    }

    fn policy(&self, args: &Self::Args) -> Policy;

    fn execute(&self, args: &Self::Args, ctx: &mut MutationContext<'_>) -> Result<Self::Returns, SyncError>;

    /// Tried in order when the policy denies after `execute`.
    fn fallbacks(&self) -> Vec<Fallback<Self>>
    where
        Self: Sized,
    {
        Vec::new()
    }
}

pub type FallbackFn<P> = Arc<
    dyn Fn(
            &<P as Procedure>::Args,
            <P as Procedure>::Returns,
            &mut MutationContext<'_>,
        ) -> Result<<P as Procedure>::Returns, SyncError>
        + Send
        + Sync,
>;

/// Replacement effect for one specific policy denial.
pub struct Fallback<P: Procedure> {
    name: &'static str,
    recovers: &'static str,
    effect: FallbackFn<P>,
}

impl<P: Procedure> Fallback<P> {
    /// `recovers` is the policy tag this fallback answers.
    pub fn new<F>(name: &'static str, recovers: &'static str, effect: F) -> Self
    where
        F: Fn(&P::Args, P::Returns, &mut MutationContext<'_>) -> Result<P::Returns, SyncError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name,
            recovers,
            effect: Arc::new(effect),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn recovers(&self) -> &'static str {
        self.recovers
    }
}

impl<P: Procedure<Returns = Entity>> Fallback<P> {
    /// Hard-delete the mutated row so it vanishes from every replica instead
    /// of lingering where the actor can no longer see it.
    pub fn hard_delete(table: &'static str, recovers: &'static str) -> Self {
        Self::new("hard_delete", recovers, move |_args, row: Entity, ctx| {
            ctx.tx().delete_by_id(table, &row.id)
        })
    }
}

impl<P: Procedure> fmt::Debug for Fallback<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fallback")
            .field("name", &self.name)
            .field("recovers", &self.recovers)
            .finish()
    }
}

pub(crate) type ErasedArgs = Box<dyn Any + Send + Sync>;

/// Object-safe face of a registered procedure.
pub(crate) trait ErasedProcedure: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> ProcedureKind;
    fn decode(&self, args: DispatchArgs) -> Result<ErasedArgs, SyncError>;
    fn run(&self, args: &ErasedArgs, principal: &Principal, tx: &mut Transaction) -> Result<Value, SyncError>;
}

pub(crate) struct Registered<P: Procedure> {
    procedure: P,
    fallbacks: Vec<Fallback<P>>,
}

impl<P: Procedure> Registered<P> {
    pub(crate) fn new(procedure: P) -> Self {
        let fallbacks = procedure.fallbacks();
        Self { procedure, fallbacks }
    }
}

impl<P: Procedure> ErasedProcedure for Registered<P> {
    fn name(&self) -> &'static str {
        self.procedure.name()
    }

    fn kind(&self) -> ProcedureKind {
        self.procedure.kind()
    }

    fn decode(&self, args: DispatchArgs) -> Result<ErasedArgs, SyncError> {
        let name = self.procedure.name();
        let args: P::Args = match args {
            DispatchArgs::Encoded(value) => serde_json::from_value(value)
                .map_err(|e| SyncError::Validation(format!("{}: {}", name, e)))?,
            DispatchArgs::Decoded(boxed) => *boxed.downcast::<P::Args>().map_err(|_| {
                SyncError::Validation(format!("{}: arguments have the wrong type", name))
            })?,
        };
        self.procedure
            .validate(&args)
            .map_err(|reason| SyncError::Validation(format!("{}: {}", name, reason)))?;
        Ok(Box::new(args))
    }

    fn run(&self, args: &ErasedArgs, principal: &Principal, tx: &mut Transaction) -> Result<Value, SyncError> {
        let name = self.procedure.name();
        let args = args
            .downcast_ref::<P::Args>()
            .ok_or_else(|| SyncError::Internal(format!("{}: decoded arguments of another procedure", name)))?;

        let mut ctx = MutationContext::new(principal, tx);
        let result = self.procedure.execute(args, &mut ctx)?;

        let result = match self.procedure.policy(args).evaluate(principal, ctx.reader()) {
            Ok(()) => result,
            Err(err) => {
                let fallback = err
                    .denial()
                    .and_then(|denial| denial.tag.as_deref())
                    .and_then(|tag| self.fallbacks.iter().find(|f| f.recovers == tag));

                match fallback {
                    Some(fallback) => {
                        debug!(procedure = name, fallback = fallback.name, "Policy denied, applying fallback");
                        metrics::record_fallback(name, fallback.name);
                        (fallback.effect)(args, result, &mut ctx)?
                    }
                    None => {
                        if let Some(denial) = err.denial() {
                            metrics::record_policy_denial(name, denial.kind.as_str());
                        }
                        return Err(err);
                    }
                }
            }
        };

        serde_json::to_value(&result).map_err(|e| SyncError::Internal(format!("{}: {}", name, e)))
    }
}
