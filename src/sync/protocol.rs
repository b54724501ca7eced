//! Wire types for the pull and push endpoints.
//!
//! Field names follow the client library's JSON (`clientGroupID`,
//! `lastMutationIDChanges`, ...). Transport is left to the embedding service.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::SyncError;

pub const PULL_VERSION: u32 = 1;
pub const PUSH_VERSION: u32 = 1;

/// Patch key carrying whether the client has everything (`"COMPLETE"`) or
/// should pull again (`"PARTIAL"`).
pub const SYNC_STATE_KEY: &str = "_sync_state";

/// Opaque to the client; `order` is the client view version it reflects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cookie {
    pub order: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub pull_version: u32,
    #[serde(rename = "clientGroupID")]
    pub client_group_id: String,
    #[serde(default)]
    pub cookie: Option<Cookie>,
    #[serde(rename = "profileID", default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}

impl PullRequest {
    pub fn new(client_group_id: impl Into<String>, cookie: Option<Cookie>) -> Self {
        Self {
            pull_version: PULL_VERSION,
            client_group_id: client_group_id.into(),
            cookie,
            profile_id: None,
            schema_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Put { key: String, value: Value },
    Del { key: String },
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResult {
    pub cookie: Cookie,
    #[serde(rename = "lastMutationIDChanges")]
    pub last_mutation_id_changes: BTreeMap<String, u64>,
    pub patch: Vec<PatchOperation>,
}

impl PullResult {
    /// True when the sync-state entry says more rows are waiting.
    pub fn is_partial(&self) -> bool {
        self.patch.iter().any(|op| {
            matches!(op, PatchOperation::Put { key, value } if key == SYNC_STATE_KEY && value == "PARTIAL")
        })
    }
}

/// Protocol-level refusals the client library reacts to itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error")]
pub enum ProtocolError {
    ClientStateNotFound,
    #[serde(rename_all = "camelCase")]
    VersionNotSupported { version_type: String },
}

impl ProtocolError {
    /// The wire form of `err`, if it has one.
    pub fn from_error(err: &SyncError) -> Option<Self> {
        match err {
            SyncError::ClientStateNotFound => Some(ProtocolError::ClientStateNotFound),
            SyncError::VersionNotSupported { version_type } => Some(ProtocolError::VersionNotSupported {
                version_type: version_type.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PullResponse {
    Error(ProtocolError),
    Ok(PullResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub push_version: u32,
    #[serde(rename = "clientGroupID")]
    pub client_group_id: String,
    pub mutations: Vec<Mutation>,
    #[serde(rename = "profileID", default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}

impl PushRequest {
    pub fn new(client_group_id: impl Into<String>, mutations: Vec<Mutation>) -> Self {
        Self {
            push_version: PUSH_VERSION,
            client_group_id: client_group_id.into(),
            mutations,
            profile_id: None,
            schema_version: None,
        }
    }
}

/// A mutation that was processed in error mode: its id is consumed, its
/// effects were discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationError {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "mutationID")]
    pub mutation_id: u64,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<MutationError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushResponse {
    Error(ProtocolError),
    Ok(PushResult),
}
