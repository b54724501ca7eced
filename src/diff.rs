// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Diff engine.
//!
//! One function serves every view: [`diff_view`] compares what a client
//! group already holds (its CVR entries) with what the view currently shows
//! the actor, and [`apply_row_budget`] caps a whole pull.
//!
//! # What the group "holds"
//!
//! Entries written at or before the checkpoint (the CVV in the client's
//! cookie) are knowledge. Entries written after it belong to pulls whose
//! response the client never acknowledged, so the row may or may not be on
//! the client: a visible row is re-sent and an invisible one re-deleted.
//! A checkpoint of 0 means the client starts from a cleared cache and holds
//! nothing.
//!
//! # Operation sets
//!
//! ```text
//! creates       visible, not held
//! updates       visible, held at another version (or possibly held)
//! deletes       held (or possibly held), no longer visible
//! fast_forward  deferred creates a sibling group already holds at the
//!               current version, sent without counting against the budget
//! ```

use std::collections::{BTreeMap, HashSet};

use crate::entity::{Entity, EntityId, Version};
use crate::policy::Principal;
use crate::store::TenantSnapshot;
use crate::view::ViewDescriptor;

#[derive(Debug, Clone, Default)]
pub struct DiffRequest {
    pub client_group_id: String,
    /// CVV the client last acknowledged; 0 for a fresh client.
    pub checkpoint: u64,
    /// False when the actor lost read access to the view: everything held is deleted.
    pub readable: bool,
    /// Ids never fast-forwarded.
    pub exclude_ids: HashSet<EntityId>,
}

#[derive(Debug, Clone, Default)]
pub struct ViewDiff {
    pub view: String,
    pub creates: Vec<Entity>,
    pub updates: Vec<Entity>,
    pub deletes: Vec<EntityId>,
    pub fast_forward: Vec<Entity>,
    /// Creates held back by the row budget, left for a later pull.
    pub deferred: Vec<EntityId>,
    sibling_held: HashSet<EntityId>,
    exclude_ids: HashSet<EntityId>,
}

impl ViewDiff {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.fast_forward.is_empty()
    }

    /// Rows delivered as puts, in patch order.
    pub fn puts(&self) -> impl Iterator<Item = &Entity> {
        self.creates
            .iter()
            .chain(self.updates.iter())
            .chain(self.fast_forward.iter())
    }

    pub fn row_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len() + self.fast_forward.len()
    }
}

enum Held {
    Version(Version),
    Deleted,
    Unacknowledged,
}

/// Diff one view for one client group against one snapshot.
///
/// Creates come back complete and ordered by id; [`apply_row_budget`] trims them.
pub fn diff_view(
    snapshot: &TenantSnapshot,
    view: &ViewDescriptor,
    principal: &Principal,
    request: &DiffRequest,
) -> ViewDiff {
    let group = request.client_group_id.as_str();

    let visible: BTreeMap<&EntityId, &Entity> = if request.readable {
        view.find_all(snapshot, principal)
            .into_iter()
            .map(|row| (&row.id, row))
            .collect()
    } else {
        BTreeMap::new()
    };

    let held: BTreeMap<&EntityId, Held> = if request.checkpoint == 0 {
        BTreeMap::new()
    } else {
        snapshot
            .cvr_entries(group, view.name())
            .map(|entry| {
                let state = match entry.entity_version {
                    _ if entry.client_view_version > request.checkpoint => Held::Unacknowledged,
                    Some(version) => Held::Version(version),
                    None => Held::Deleted,
                };
                (&entry.entity_id, state)
            })
            .collect()
    };

    let mut diff = ViewDiff {
        view: view.name().to_string(),
        exclude_ids: request.exclude_ids.clone(),
        ..Default::default()
    };

    for (id, row) in &visible {
        match held.get(id) {
            None | Some(Held::Deleted) => diff.creates.push((*row).clone()),
            Some(Held::Version(version)) if *version == row.version => {}
            Some(Held::Version(_)) | Some(Held::Unacknowledged) => diff.updates.push((*row).clone()),
        }
    }

    for (id, state) in &held {
        if visible.contains_key(id) {
            continue;
        }
        if matches!(state, Held::Version(_) | Held::Unacknowledged) {
            diff.deletes.push((*id).clone());
        }
    }

    diff.sibling_held = diff
        .creates
        .iter()
        .filter(|row| snapshot.sibling_holds(group, view.name(), &row.id, row.version))
        .map(|row| row.id.clone())
        .collect();

    diff
}

/// Cap a pull at `max_rows`.
///
/// Updates and deletes always go out. Creates fill what is left, view by view
/// in order; the rest are deferred, except those a sibling group already holds,
/// which are fast-forwarded. Returns true when nothing was deferred.
pub fn apply_row_budget(diffs: &mut [ViewDiff], max_rows: usize) -> bool {
    let mandatory: usize = diffs.iter().map(|d| d.updates.len() + d.deletes.len()).sum();
    let mut remaining = max_rows.saturating_sub(mandatory);

    for diff in diffs.iter_mut() {
        if diff.creates.len() > remaining {
            let overflow = diff.creates.split_off(remaining);
            for row in overflow {
                if diff.sibling_held.contains(&row.id) && !diff.exclude_ids.contains(&row.id) {
                    diff.fast_forward.push(row);
                } else {
                    diff.deferred.push(row.id);
                }
            }
        }
        remaining -= diff.creates.len();
    }

    diffs.iter().all(|d| d.deferred.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvr::{ClientGroup, CvrEntry};
    use crate::entity::{EntityPatch, TenantId};
    use crate::policy::{Role, RoleAcls};
    use crate::store::{ChangeSet, Transaction};
    use crate::view::Visibility;
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn principal() -> Principal {
        Principal::new(TenantId::new("t1"), "u1", Role::Customer, &RoleAcls::default())
    }

    fn group(id: &str) -> ClientGroup {
        ClientGroup::new(id, &principal())
    }

    fn active() -> ViewDescriptor {
        ViewDescriptor::new("active_products", "products", Visibility::Active)
    }

    fn with_rows(ids: &[&str]) -> TenantSnapshot {
        let mut tx = Transaction::begin(Arc::new(TenantSnapshot::empty(TenantId::new("t1"))));
        for id in ids {
            let mut data = Map::new();
            data.insert("name".into(), json!(id));
            tx.create("products", EntityId::new(*id), data).unwrap();
        }
        let mut snapshot = TenantSnapshot::empty(TenantId::new("t1"));
        snapshot.apply(tx.into_change_set());
        snapshot
    }

    fn record(snapshot: &mut TenantSnapshot, entries: Vec<CvrEntry>) {
        snapshot.apply(ChangeSet { cvr: entries, ..Default::default() });
    }

    fn mutate(snapshot: &TenantSnapshot, id: &str, patch: EntityPatch) -> TenantSnapshot {
        let mut tx = Transaction::begin(Arc::new(snapshot.clone()));
        tx.update_by_id("products", &EntityId::new(id), patch).unwrap();
        let mut next = snapshot.clone();
        next.apply(tx.into_change_set());
        next
    }

    fn request(group: &str, checkpoint: u64) -> DiffRequest {
        DiffRequest {
            client_group_id: group.into(),
            checkpoint,
            readable: true,
            exclude_ids: HashSet::new(),
        }
    }

    fn ids(rows: &[Entity]) -> Vec<&str> {
        rows.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_fresh_client_gets_everything_as_creates() {
        let snapshot = with_rows(&["p1", "p2"]);
        let diff = diff_view(&snapshot, &active(), &principal(), &request("g1", 0));
        assert_eq!(ids(&diff.creates), vec!["p1", "p2"]);
        assert!(diff.updates.is_empty() && diff.deletes.is_empty());
    }

    #[test]
    fn test_held_rows_at_same_version_are_skipped() {
        let mut snapshot = with_rows(&["p1", "p2"]);
        let g = group("g1");
        record(&mut snapshot, vec![
            CvrEntry::sent(&g, "active_products", "p1".into(), 1, 1),
            CvrEntry::sent(&g, "active_products", "p2".into(), 1, 1),
        ]);

        let diff = diff_view(&snapshot, &active(), &principal(), &request("g1", 1));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_update_and_soft_delete() {
        let mut snapshot = with_rows(&["p1", "p2"]);
        let g = group("g1");
        record(&mut snapshot, vec![
            CvrEntry::sent(&g, "active_products", "p1".into(), 1, 1),
            CvrEntry::sent(&g, "active_products", "p2".into(), 1, 1),
        ]);
        let snapshot = mutate(&snapshot, "p1", EntityPatch::new().set("name", json!("renamed")));
        let snapshot = mutate(&snapshot, "p2", EntityPatch::new().soft_delete(5));

        let diff = diff_view(&snapshot, &active(), &principal(), &request("g1", 1));
        assert_eq!(ids(&diff.updates), vec!["p1"]);
        assert_eq!(diff.updates[0].version, 2);
        assert_eq!(diff.deletes, vec![EntityId::new("p2")]);
        assert!(diff.creates.is_empty());
    }

    #[test]
    fn test_delivered_delete_is_not_repeated() {
        let mut snapshot = with_rows(&[]);
        let g = group("g1");
        record(&mut snapshot, vec![CvrEntry::deleted(&g, "active_products", "gone".into(), 1)]);

        let diff = diff_view(&snapshot, &active(), &principal(), &request("g1", 1));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_unacknowledged_entries_are_resent() {
        let mut snapshot = with_rows(&["p1"]);
        let g = group("g1");
        record(&mut snapshot, vec![
            CvrEntry::sent(&g, "active_products", "p1".into(), 2, 1),
            CvrEntry::deleted(&g, "active_products", "p9".into(), 2),
        ]);

        // Client replays cookie 1: the pull that wrote CVV 2 never reached it
        let diff = diff_view(&snapshot, &active(), &principal(), &request("g1", 1));
        assert_eq!(ids(&diff.updates), vec!["p1"]);
        assert_eq!(diff.deletes, vec![EntityId::new("p9")]);
    }

    #[test]
    fn test_unreadable_view_deletes_everything_held() {
        let mut snapshot = with_rows(&["p1", "p2"]);
        let g = group("g1");
        record(&mut snapshot, vec![CvrEntry::sent(&g, "active_products", "p1".into(), 1, 1)]);

        let mut req = request("g1", 1);
        req.readable = false;
        let diff = diff_view(&snapshot, &active(), &principal(), &req);
        assert_eq!(diff.deletes, vec![EntityId::new("p1")]);
        assert!(diff.creates.is_empty());
    }

    #[test]
    fn test_budget_defers_creates_but_not_updates() {
        let mut snapshot = with_rows(&["p1", "p2", "p3", "p4"]);
        let g = group("g1");
        record(&mut snapshot, vec![CvrEntry::sent(&g, "active_products", "p1".into(), 1, 1)]);
        let snapshot = mutate(&snapshot, "p1", EntityPatch::new().set("name", json!("x")));

        let mut diffs = vec![diff_view(&snapshot, &active(), &principal(), &request("g1", 1))];
        let complete = apply_row_budget(&mut diffs, 2);

        assert!(!complete);
        assert_eq!(ids(&diffs[0].updates), vec!["p1"]);
        assert_eq!(ids(&diffs[0].creates), vec!["p2"]);
        assert_eq!(diffs[0].deferred, vec![EntityId::new("p3"), EntityId::new("p4")]);
    }

    #[test]
    fn test_budget_spans_views_in_order() {
        let snapshot = with_rows(&["p1", "p2"]);
        let raw = ViewDescriptor::for_table("products");
        let mut diffs = vec![
            diff_view(&snapshot, &active(), &principal(), &request("g1", 0)),
            diff_view(&snapshot, &raw, &principal(), &request("g1", 0)),
        ];

        assert!(!apply_row_budget(&mut diffs, 3));
        assert_eq!(diffs[0].creates.len(), 2);
        assert_eq!(diffs[1].creates.len(), 1);
        assert_eq!(diffs[1].deferred.len(), 1);
    }

    #[test]
    fn test_fast_forward_uses_sibling_knowledge() {
        let mut snapshot = with_rows(&["p1", "p2", "p3"]);
        let sibling = group("g2");
        record(&mut snapshot, vec![
            CvrEntry::sent(&sibling, "active_products", "p2".into(), 1, 1),
            CvrEntry::sent(&sibling, "active_products", "p3".into(), 1, 1),
        ]);

        let mut req = request("g1", 0);
        req.exclude_ids.insert(EntityId::new("p3"));
        let mut diffs = vec![diff_view(&snapshot, &active(), &principal(), &req)];
        let complete = apply_row_budget(&mut diffs, 1);

        assert_eq!(ids(&diffs[0].creates), vec!["p1"]);
        assert_eq!(ids(&diffs[0].fast_forward), vec!["p2"]);
        assert_eq!(diffs[0].deferred, vec![EntityId::new("p3")]);
        assert!(!complete);
    }

    #[test]
    fn test_sibling_at_old_version_is_not_fast_forwarded() {
        let mut snapshot = with_rows(&["p1", "p2"]);
        let sibling = group("g2");
        record(&mut snapshot, vec![CvrEntry::sent(&sibling, "active_products", "p2".into(), 1, 1)]);
        let snapshot = mutate(&snapshot, "p2", EntityPatch::new().set("name", json!("v2")));

        let mut diffs = vec![diff_view(&snapshot, &active(), &principal(), &request("g1", 0))];
        apply_row_budget(&mut diffs, 1);
        assert!(diffs[0].fast_forward.is_empty());
        assert_eq!(diffs[0].deferred, vec![EntityId::new("p2")]);
    }
}
