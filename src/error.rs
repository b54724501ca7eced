// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy surfaced by dispatch, pull and push.
//!
//! Business failures (`Validation`, `AccessDenied`, `NotFound`, `Conflict`,
//! `UnknownProcedure`) are confined to a single mutation: push records them
//! and moves on. Everything else fails the whole request.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::policy::PolicyKind;
use crate::store::traits::StoreError;

/// Why a policy refused. `tag` lets a procedure pick a fallback for this
/// specific refusal instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub message: String,
    pub kind: PolicyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl Denial {
    pub fn new(kind: PolicyKind, message: impl Into<String>) -> Self {
        Self { message: message.into(), kind, tag: None }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("access denied: {}", .0.message)]
    AccessDenied(Denial),

    #[error("{table} '{id}' not found")]
    NotFound { table: String, id: String },

    #[error("conflict on {table} '{id}': {reason}")]
    Conflict { table: String, id: String, reason: String },

    #[error("store unavailable: {0}")]
    Upstream(#[from] StoreError),

    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("client state not found")]
    ClientStateNotFound,

    #[error("{version_type} version not supported")]
    VersionNotSupported { version_type: String },

    #[error("unknown procedure '{0}'")]
    UnknownProcedure(String),

    #[error("mutation {mutation_id} from client {client_id} is ahead of last processed {last_mutation_id}")]
    FutureMutation {
        client_id: String,
        mutation_id: u64,
        last_mutation_id: u64,
    },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn denied(kind: PolicyKind, message: impl Into<String>) -> Self {
        Self::AccessDenied(Denial::new(kind, message))
    }

    pub fn not_found(table: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound { table: table.to_string(), id: id.to_string() }
    }

    /// Commit lost an optimistic-lock race; re-running from a fresh snapshot may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream(StoreError::Conflict(_)))
    }

    /// Errors that abort a whole push or pull rather than one mutation.
    pub fn is_batch_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_)
                | Self::AccessDenied(_)
                | Self::NotFound { .. }
                | Self::Conflict { .. }
                | Self::UnknownProcedure(_)
        )
    }

    /// Stable name reported to clients and used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::AccessDenied(_) => "AccessDeniedError",
            Self::NotFound { .. } => "NotFoundError",
            Self::Conflict { .. } => "ConflictError",
            Self::Upstream(_) => "UpstreamError",
            Self::Timeout(_) => "TimeoutError",
            Self::ClientStateNotFound => "ClientStateNotFound",
            Self::VersionNotSupported { .. } => "VersionNotSupported",
            Self::UnknownProcedure(_) => "UnknownProcedureError",
            Self::FutureMutation { .. } => "FutureMutationError",
            Self::Registry(_) => "RegistryError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// The denial when this is an access failure.
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Self::AccessDenied(denial) => Some(denial),
            _ => None,
        }
    }
}
