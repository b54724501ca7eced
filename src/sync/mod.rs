// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull/push sync protocol.
//!
//! The [`SyncServer`] ties the pieces together:
//! - pull: view registry and diff engine over one tenant snapshot
//! - push: procedure dispatch, one transaction per mutation
//! - poke: wake other client groups after a push
//!
//! # Client view lifecycle
//!
//! ```text
//! pull(cookie=None)  → clear + puts, cookie {order: 1}
//! push(m1, m2)       → client lastMutationID 2, group client_version 2
//! pull(cookie=1)     → dels/puts since 1, lastMutationIDChanges, cookie {order: 2}
//! pull(cookie=2)     → nothing changed: same cookie, empty patch
//! ```

pub mod poke;
pub mod protocol;
mod pull;
mod push;
mod server;

pub use poke::{BroadcastNotifier, NoopNotifier, Notifier, Poke};
pub use protocol::{
    Cookie, Mutation, MutationError, PatchOperation, ProtocolError, PullRequest, PullResponse, PullResult,
    PushRequest, PushResponse, PushResult, SYNC_STATE_KEY,
};
pub use server::SyncServer;
