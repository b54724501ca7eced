// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fire-and-forget wake-up signal sent after a push commits.
//!
//! A poke only tells clients that holding one of `permissions` is reason
//! to pull again. Losing one costs latency, never correctness.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::config::SyncConfig;
use crate::entity::TenantId;
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poke {
    pub tenant_id: TenantId,
    /// The group that pushed; its own clients already have the changes.
    pub client_group_id: String,
    /// Pull permissions of the views whose tables were written.
    pub permissions: Vec<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn poke(&self, poke: Poke) -> Result<(), SyncError>;
}

/// In-process fan-out over a tokio broadcast channel.
///
/// Publishing with no subscribers is not an error; slow subscribers see
/// `RecvError::Lagged` and should simply pull.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Poke>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.poke_channel_capacity)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Poke> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn poke(&self, poke: Poke) -> Result<(), SyncError> {
        match self.sender.send(poke) {
            Ok(receivers) => trace!(receivers, "Poke published"),
            Err(_) => trace!("Poke dropped, no subscribers"),
        }
        Ok(())
    }
}

/// Discards every poke.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn poke(&self, _poke: Poke) -> Result<(), SyncError> {
        Ok(())
    }
}
