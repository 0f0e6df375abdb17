//! Container tree: attachment, quarantine and in-place merges
//!
//! The index holds containers as a flat id map. This module links them into
//! a rooted hierarchy through the `subcontainers` map of each parent and
//! keeps that hierarchy and the quota accounting consistent when updates,
//! renames, moves and deletions are applied.
//!
//! Attachment is a worklist walk up the parent chain: ancestors are linked
//! before descendants, a missing parent makes the topmost unattached
//! container an orphan, and a parent cycle is broken by turning the first
//! repeated container into an orphan. Orphans and losers of name
//! collisions are relinked under `/lost+found/{orphans,name_conflicts}` as
//! `<name>.<id>`.

use crate::container::Container;
use crate::index::ContainerIndex;
use crate::quota::{FileUsageSource, QuotaRegistry, SubtreeAccounting};
use dirlog_common::{
    ContainerId, LOST_FOUND_NAME, NAME_CONFLICTS_NAME, ORPHANS_NAME, ROOT_CONTAINER_ID, StoreMode,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// First id handed out to in-memory quarantine containers on a replica,
/// counting down
const REPLICA_QUARANTINE_TOP_ID: ContainerId = ContainerId::MAX;

/// Containers that could not be linked normally
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AttachReport {
    pub attached: usize,
    pub orphans: Vec<ContainerId>,
    pub conflicts: Vec<ContainerId>,
}

impl AttachReport {
    fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.conflicts.is_empty()
    }
}

/// How an update was merged into the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// The id was not known yet
    Inserted,
    /// Same parent, same name
    Metadata,
    /// Same parent, different name
    Renamed,
    /// Different parent
    Moved {
        from: SubtreeAccounting,
        to: SubtreeAccounting,
    },
    /// Not linked before the update
    Reattached,
}

/// Namespace state guarded by the store lock
#[derive(Debug)]
pub struct Namespace {
    pub(crate) index: ContainerIndex,
    pub(crate) quota: QuotaRegistry,
    mode: StoreMode,
    next_id: ContainerId,
    next_quarantine_id: ContainerId,
    /// Ids whose live state differs from their last record (replica quarantine)
    pub(crate) dirty: BTreeSet<ContainerId>,
    /// Ids deleted by the follower, to spot stray re-creates
    pub(crate) follower_deletions: HashSet<ContainerId>,
    quarantined: u64,
}

enum ChainTop {
    Attached,
    Missing,
    Cycle(ContainerId),
    Blocked,
}

/// Outcome of one attachment walk
enum Walk {
    /// Newly linked ids, topmost first
    Linked(Vec<ContainerId>),
    Waiting,
    Cycle(ContainerId),
}

impl Namespace {
    #[must_use]
    pub fn new(mode: StoreMode, quota: QuotaRegistry) -> Self {
        Self {
            index: ContainerIndex::new(),
            quota,
            mode,
            next_id: ROOT_CONTAINER_ID + 1,
            next_quarantine_id: REPLICA_QUARANTINE_TOP_ID,
            dirty: BTreeSet::new(),
            follower_deletions: HashSet::new(),
            quarantined: 0,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> StoreMode {
        self.mode
    }

    pub(crate) fn set_mode(&mut self, mode: StoreMode) {
        self.mode = mode;
    }

    /// Next id `allocate_id` would return
    #[must_use]
    pub const fn first_free_id(&self) -> ContainerId {
        self.next_id
    }

    /// Number of containers quarantined since boot
    #[must_use]
    pub const fn quarantined(&self) -> u64 {
        self.quarantined
    }

    /// Make sure ids up to `max_id` are never handed out again
    pub fn reserve_ids_through(&mut self, max_id: ContainerId) {
        if max_id < self.next_quarantine_id && max_id >= self.next_id {
            self.next_id = max_id + 1;
        }
    }

    /// Allocate a fresh container id
    pub fn allocate_id(&mut self) -> ContainerId {
        while self.index.contains(self.next_id) {
            self.next_id += 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocate_quarantine_id(&mut self) -> ContainerId {
        if !self.mode.is_replica() {
            return self.allocate_id();
        }
        while self.index.contains(self.next_quarantine_id) {
            self.next_quarantine_id -= 1;
        }
        let id = self.next_quarantine_id;
        self.next_quarantine_id -= 1;
        id
    }

    /// Insert the root when the log did not contain one
    ///
    /// Returns true when a root was created.
    pub fn ensure_root(&mut self) -> bool {
        if self.index.get(ROOT_CONTAINER_ID).is_some() {
            self.index.set_attached(ROOT_CONTAINER_ID, true);
            return false;
        }
        self.index.insert(Container::root(), 0);
        self.index.set_attached(ROOT_CONTAINER_ID, true);
        true
    }

    /// Attach every container not yet linked into the tree
    pub fn attach_all(&mut self) -> AttachReport {
        let mut report = AttachReport::default();
        let mut blocked = HashSet::new();
        // Log order, so the later record of two colliding names wins
        let mut pending = self.index.unattached();
        pending.sort_by_key(|id| (self.index.offset(*id).unwrap_or(0), *id));
        for id in pending {
            self.attach_with_ancestors(id, &mut report, &mut blocked);
        }
        report
    }

    /// Attach `id`, linking its unattached ancestors first
    fn attach_with_ancestors(
        &mut self,
        id: ContainerId,
        report: &mut AttachReport,
        blocked: &mut HashSet<ContainerId>,
    ) -> Walk {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = id;

        let top = loop {
            if blocked.contains(&current) {
                break ChainTop::Blocked;
            }
            let Some(entry) = self.index.entry(current) else {
                break ChainTop::Missing;
            };
            if entry.attached {
                // Descendants of a moved container keep their flag, so
                // check the chain does not lead back into itself
                match self.first_ancestor_in(current, &seen) {
                    Some(start) => break ChainTop::Cycle(start),
                    None => break ChainTop::Attached,
                }
            }
            let Some(container) = entry.container.as_ref() else {
                break ChainTop::Missing;
            };
            if container.is_root() {
                self.index.set_attached(current, true);
                break ChainTop::Attached;
            }
            if !seen.insert(current) {
                break ChainTop::Cycle(current);
            }
            chain.push(current);
            current = container.parent_id;
        };

        match top {
            ChainTop::Attached => {
                chain.reverse();
                for id in &chain {
                    self.link(*id, report);
                }
                Walk::Linked(chain)
            }
            ChainTop::Missing => {
                if let Some(&orphan) = chain.last() {
                    debug!("Container {} has no parent in the index", orphan);
                    blocked.insert(orphan);
                    report.orphans.push(orphan);
                }
                Walk::Waiting
            }
            ChainTop::Cycle(start) => {
                warn!("Parent cycle through container {}", start);
                blocked.insert(start);
                report.orphans.push(start);
                Walk::Cycle(start)
            }
            ChainTop::Blocked => Walk::Waiting,
        }
    }

    /// First container on the parent chain of `from`, inclusive, that is in
    /// `ids`
    fn first_ancestor_in(
        &self,
        from: ContainerId,
        ids: &HashSet<ContainerId>,
    ) -> Option<ContainerId> {
        if ids.is_empty() {
            return None;
        }
        let mut current = from;
        for _ in 0..=self.index.len() {
            if ids.contains(&current) {
                return Some(current);
            }
            let container = self.index.get(current)?;
            if container.is_root() {
                return None;
            }
            current = container.parent_id;
        }
        None
    }

    /// Link `id` into the child map of its parent
    ///
    /// The parent must be attached. A different child already holding the
    /// name is unlinked and reported as a conflict.
    fn link(&mut self, id: ContainerId, report: &mut AttachReport) {
        let Some((parent_id, name)) = self.index.get(id).map(|c| (c.parent_id, c.name.clone()))
        else {
            return;
        };
        let Some(parent) = self.index.get_mut(parent_id) else {
            return;
        };

        if let Some(existing) = parent.subcontainers.insert(name, id) {
            if existing != id {
                self.index.set_attached(existing, false);
                report.conflicts.push(existing);
            }
        }
        self.index.set_attached(id, true);
        report.attached += 1;
    }

    /// Remove `id` from the child map of its parent
    fn unlink(&mut self, id: ContainerId) {
        if id == ROOT_CONTAINER_ID || !self.index.is_attached(id) {
            return;
        }
        let Some((parent_id, name)) = self.index.get(id).map(|c| (c.parent_id, c.name.clone()))
        else {
            return;
        };
        if let Some(parent) = self.index.get_mut(parent_id) {
            if parent.subcontainers.get(&name) == Some(&id) {
                parent.subcontainers.remove(&name);
            }
        }
        self.index.set_attached(id, false);
    }

    /// Attach every container, quarantining what cannot be linked
    ///
    /// Returns the ids whose live state no longer matches the log.
    pub fn attach_and_quarantine(&mut self) -> Vec<ContainerId> {
        let mut changed = Vec::new();
        let mut report = self.attach_all();
        // Each round attaches the descendants of the previous round's orphans
        while !report.is_clean() {
            changed.extend(self.quarantine(report));
            report = self.attach_all();
        }
        changed
    }

    /// Relink orphans and conflict losers under lost+found as `<name>.<id>`
    ///
    /// Renamed containers and newly created lost+found containers are
    /// returned and added to the dirty set.
    pub fn quarantine(&mut self, mut report: AttachReport) -> Vec<ContainerId> {
        let mut changed = Vec::new();
        if report.is_clean() {
            return changed;
        }
        let lost_found = self.ensure_child(ROOT_CONTAINER_ID, LOST_FOUND_NAME, &mut changed);

        for (ids, dir_name) in [
            (std::mem::take(&mut report.orphans), ORPHANS_NAME),
            (std::mem::take(&mut report.conflicts), NAME_CONFLICTS_NAME),
        ] {
            if ids.is_empty() {
                continue;
            }
            let dir = self.ensure_child(lost_found, dir_name, &mut changed);
            for id in ids {
                let Some(container) = self.index.get_mut(id) else {
                    continue;
                };
                container.name = format!("{}.{}", container.name, id);
                container.parent_id = dir;
                let mut ignored = AttachReport::default();
                self.link(id, &mut ignored);
                warn!(
                    "Quarantined container {} under {}/{}",
                    id, LOST_FOUND_NAME, dir_name
                );
                self.quarantined += 1;
                changed.push(id);
            }
        }

        self.dirty.extend(changed.iter().copied());
        changed
    }

    /// Quarantine containers displaced by a name collision outside boot
    fn settle_displaced(&mut self, displaced: Vec<ContainerId>) {
        if displaced.is_empty() {
            return;
        }
        for id in &displaced {
            warn!("Name collision displaced container {}", id);
        }
        self.quarantine(AttachReport {
            conflicts: displaced,
            ..Default::default()
        });
        self.quota.rebuild(&self.index);
    }

    /// Drain the ids whose live state must still be written to the log
    pub(crate) fn take_dirty(&mut self) -> Vec<ContainerId> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    /// True when no child container is linked under `id`
    #[must_use]
    pub fn is_leaf(&self, id: ContainerId) -> bool {
        self.index
            .get(id)
            .is_none_or(|c| c.subcontainers.is_empty())
    }

    /// Find or create the child container `name` of `parent`
    fn ensure_child(
        &mut self,
        parent: ContainerId,
        name: &str,
        changed: &mut Vec<ContainerId>,
    ) -> ContainerId {
        if let Some(id) = self
            .index
            .get(parent)
            .and_then(|p| p.subcontainers.get(name).copied())
        {
            return id;
        }

        let id = self.allocate_quarantine_id();
        let mut container = Container::new(id);
        container.parent_id = parent;
        container.name = name.to_string();
        self.index.insert(container, 0);
        let mut ignored = AttachReport::default();
        self.link(id, &mut ignored);
        info!("Created quarantine container {} ({})", name, id);
        changed.push(id);
        id
    }

    /// Merge an update into the tree
    ///
    /// `offset` is the record offset of the update (0 when not persisted).
    /// Quota accounting follows file set changes and subtree moves.
    pub fn apply_update(&mut self, incoming: Container, offset: u64) -> MergeKind {
        let id = incoming.id;
        self.dirty.remove(&id);

        let Some(entry) = self.index.entry(id) else {
            return self.insert_new(incoming, offset);
        };
        let was_attached = entry.attached;
        let Some(current) = entry.container.clone() else {
            return self.insert_new(incoming, offset);
        };

        if current.is_quota_node() != incoming.is_quota_node() {
            // Flag flips reshape the accounting of a whole subtree
            let kind = self.merge_in_place(&current, incoming, offset, was_attached);
            self.quota.rebuild(&self.index);
            return kind;
        }

        self.merge_in_place(&current, incoming, offset, was_attached)
    }

    fn merge_in_place(
        &mut self,
        current: &Container,
        incoming: Container,
        offset: u64,
        was_attached: bool,
    ) -> MergeKind {
        let id = incoming.id;

        if !was_attached {
            self.store_fields(&incoming, offset);
            self.try_attach(id);
            return MergeKind::Reattached;
        }

        if id == ROOT_CONTAINER_ID || current.parent_id == incoming.parent_id {
            let renamed = current.name != incoming.name && id != ROOT_CONTAINER_ID;
            if renamed {
                self.unlink(id);
            }
            self.store_fields(&incoming, offset);
            self.quota
                .update_container_files(&self.index, Some(current), &incoming);
            if renamed {
                let mut report = AttachReport::default();
                self.link(id, &mut report);
                self.settle_displaced(report.conflicts);
            }
            return if renamed {
                MergeKind::Renamed
            } else {
                MergeKind::Metadata
            };
        }

        // Subtree move
        let from = self.quota.detach_subtree(&self.index, id);
        self.unlink(id);
        self.store_fields(&incoming, offset);
        let to = self.try_attach(id).map_or_else(
            || {
                debug!(
                    "Moved container {} waits for parent {}",
                    id, incoming.parent_id
                );
                SubtreeAccounting::default()
            },
            |(_, accounting)| accounting,
        );
        debug!(
            "Moved container {}: {} files / {} bytes from quota node {:?} to {:?}",
            id, from.files, from.bytes, from.quota_node, to.quota_node
        );
        MergeKind::Moved { from, to }
    }

    fn insert_new(&mut self, incoming: Container, offset: u64) -> MergeKind {
        let id = incoming.id;
        let flagged = incoming.is_quota_node();
        if flagged {
            self.quota.register(&incoming);
        }
        self.index.insert(incoming, offset);
        self.reserve_ids_through(id);
        self.try_attach(id);
        MergeKind::Inserted
    }

    /// Overwrite persisted fields and offset, keeping attached children
    fn store_fields(&mut self, incoming: &Container, offset: u64) {
        if let Some(entry) = self.index.entry_mut(incoming.id) {
            entry.log_offset = offset;
            match entry.container.as_mut() {
                Some(live) => live.copy_fields_from(incoming),
                None => entry.container = Some(incoming.clone()),
            }
        }
    }

    /// Link `id` and its unattached ancestors if the parent chain resolves
    ///
    /// A missing parent leaves the chain waiting. A parent cycle is
    /// quarantined the same way boot would. Returns the number of containers
    /// linked and the accounting of the topmost one, whose subtree covers
    /// everything linked.
    fn try_attach(&mut self, id: ContainerId) -> Option<(usize, SubtreeAccounting)> {
        let mut report = AttachReport::default();
        let mut blocked = HashSet::new();
        let walk = self.attach_with_ancestors(id, &mut report, &mut blocked);
        self.settle_displaced(report.conflicts);

        match walk {
            Walk::Linked(linked) => {
                let top = *linked.first()?;
                Some((linked.len(), self.quota.attach_subtree(&self.index, top)))
            }
            Walk::Waiting => None,
            Walk::Cycle(start) => {
                self.quarantine(AttachReport {
                    orphans: vec![start],
                    ..Default::default()
                });
                self.quota.rebuild(&self.index);
                if start == id {
                    let accounting = SubtreeAccounting {
                        quota_node: QuotaRegistry::nearest_quota_node(&self.index, id),
                        ..Default::default()
                    };
                    return Some((1, accounting));
                }
                // The rest of the chain now ends at the quarantined container
                self.try_attach(id)
                    .map(|(linked, accounting)| (linked + 1, accounting))
            }
        }
    }

    /// Retry attachment of containers waiting for a parent
    ///
    /// Returns the number of containers linked.
    pub fn attach_pending(&mut self) -> usize {
        let mut linked = 0;
        for id in self.index.unattached() {
            if self.index.is_attached(id) {
                continue;
            }
            if let Some((count, _)) = self.try_attach(id) {
                linked += count;
            }
        }
        linked
    }

    /// Remove a container from the tree and the index
    pub fn apply_remove(&mut self, id: ContainerId) -> Option<Container> {
        if self.index.is_attached(id) {
            self.quota.detach_subtree(&self.index, id);
        } else if let Some(container) = self.index.get(id) {
            for file in container.files.clone() {
                self.quota.remove_file(file);
            }
        }
        self.unlink(id);
        self.quota.unregister(id);
        self.dirty.remove(&id);

        let entry = self.index.erase(id)?;
        let container = entry.container?;

        // Children left behind wait for a new parent
        for child in container.subcontainers.values() {
            self.index.set_attached(*child, false);
        }
        Some(container)
    }

    /// Recompute quota accounting from the tree
    pub fn rebuild_quota(&mut self) {
        self.quota.rebuild(&self.index);
    }

    pub(crate) fn set_usage_source(&mut self, usage: Arc<dyn FileUsageSource>) {
        self.quota.set_usage_source(usage);
        self.quota.rebuild(&self.index);
    }

    /// Ids of the containers linked under `id`
    #[must_use]
    pub fn children(&self, id: ContainerId) -> Vec<(String, ContainerId)> {
        self.index.get(id).map_or_else(Vec::new, |c| {
            c.subcontainers
                .iter()
                .map(|(name, id)| (name.clone(), *id))
                .collect()
        })
    }

    /// Path of a container, for diagnostics
    #[must_use]
    pub fn path_of(&self, id: ContainerId) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = id;
        for _ in 0..=self.index.len() {
            let container = self.index.get(current)?;
            if container.is_root() {
                parts.reverse();
                return Some(format!("/{}", parts.join("/")));
            }
            parts.push(container.name.clone());
            current = container.parent_id;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::FileUsage;
    use dirlog_common::FileId;

    struct FixedSize;

    impl FileUsageSource for FixedSize {
        fn file_usage(&self, _file: FileId) -> FileUsage {
            FileUsage {
                size: 100,
                uid: 1,
                gid: 1,
            }
        }
    }

    fn container(id: ContainerId, parent: ContainerId, name: &str) -> Container {
        let mut c = Container::new(id);
        c.parent_id = parent;
        c.name = name.into();
        c
    }

    fn booted(mode: StoreMode, containers: Vec<Container>) -> (Namespace, Vec<ContainerId>) {
        let mut ns = Namespace::new(mode, QuotaRegistry::new(Arc::new(FixedSize)));
        for (i, c) in containers.into_iter().enumerate() {
            ns.index.insert(c, 24 + i as u64 * 100);
        }
        ns.reserve_ids_through(ns.index.max_id());
        ns.ensure_root();
        let changed = ns.attach_and_quarantine();
        ns.quota.rebuild(&ns.index);
        (ns, changed)
    }

    #[test]
    fn test_attach_out_of_order() {
        let (ns, changed) = booted(
            StoreMode::Primary,
            vec![
                container(5, 4, "leaf"),
                container(4, 3, "mid"),
                container(3, ROOT_CONTAINER_ID, "top"),
            ],
        );
        assert!(changed.is_empty());
        assert_eq!(ns.path_of(5).as_deref(), Some("/top/mid/leaf"));
        assert!(ns.index.unattached().is_empty());
    }

    #[test]
    fn test_orphan_quarantined_with_descendants() {
        let (ns, changed) = booted(
            StoreMode::Primary,
            vec![container(6, 99, "lost"), container(7, 6, "below")],
        );

        let orphans_dir = ns
            .index
            .get(ROOT_CONTAINER_ID)
            .and_then(|r| r.subcontainers.get(LOST_FOUND_NAME).copied())
            .and_then(|lf| ns.index.get(lf))
            .and_then(|lf| lf.subcontainers.get(ORPHANS_NAME).copied())
            .unwrap();
        let orphans = ns.children(orphans_dir);
        assert_eq!(orphans, vec![("lost.6".to_string(), 6)]);
        assert_eq!(ns.path_of(7).as_deref(), Some("/lost+found/orphans/lost.6/below"));
        assert!(changed.contains(&6));
        assert!(!changed.contains(&7));
        assert_eq!(ns.index.len(), 5);
        assert_eq!(ns.quarantined(), 1);
    }

    #[test]
    fn test_name_conflict_last_writer_wins() {
        let (ns, _) = booted(
            StoreMode::Primary,
            vec![
                container(8, ROOT_CONTAINER_ID, "same"),
                container(9, ROOT_CONTAINER_ID, "same"),
            ],
        );
        let root = ns.index.get(ROOT_CONTAINER_ID).unwrap();
        let winner = root.subcontainers["same"];
        let loser = if winner == 8 { 9 } else { 8 };
        assert_eq!(
            ns.path_of(loser),
            Some(format!("/lost+found/name_conflicts/same.{loser}"))
        );
        assert!(ns.index.unattached().is_empty());
    }

    #[test]
    fn test_parent_cycle_broken() {
        let (ns, _) = booted(
            StoreMode::Primary,
            vec![container(10, 11, "x"), container(11, 10, "y")],
        );
        assert!(ns.index.unattached().is_empty());
        let paths: Vec<_> = [10, 11].iter().filter_map(|id| ns.path_of(*id)).collect();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.starts_with("/lost+found/orphans/")));
    }

    #[test]
    fn test_replica_quarantine_ids_and_dirty() {
        let (ns, changed) = booted(StoreMode::Replica, vec![container(6, 99, "lost")]);
        let lost_found = ns.index.get(ROOT_CONTAINER_ID).unwrap().subcontainers[LOST_FOUND_NAME];
        assert_eq!(lost_found, ContainerId::MAX);
        assert!(changed.iter().all(|id| ns.dirty.contains(id)));
        assert_eq!(ns.first_free_id(), 7);
    }

    #[test]
    fn test_rename_keeps_children() {
        let (mut ns, _) = booted(
            StoreMode::Primary,
            vec![
                container(3, ROOT_CONTAINER_ID, "old"),
                container(4, 3, "child"),
            ],
        );
        let kind = ns.apply_update(container(3, ROOT_CONTAINER_ID, "new"), 500);
        assert_eq!(kind, MergeKind::Renamed);
        let root = ns.index.get(ROOT_CONTAINER_ID).unwrap();
        assert!(!root.subcontainers.contains_key("old"));
        assert_eq!(root.subcontainers["new"], 3);
        assert_eq!(ns.path_of(4).as_deref(), Some("/new/child"));
        assert_eq!(ns.index.offset(3), Some(500));
    }

    #[test]
    fn test_rename_collision_quarantines_loser() {
        let (mut ns, _) = booted(
            StoreMode::Primary,
            vec![
                container(3, ROOT_CONTAINER_ID, "a"),
                container(4, ROOT_CONTAINER_ID, "b"),
            ],
        );
        ns.apply_update(container(4, ROOT_CONTAINER_ID, "a"), 700);

        let root = ns.index.get(ROOT_CONTAINER_ID).unwrap();
        assert_eq!(root.subcontainers["a"], 4);
        assert!(!root.subcontainers.contains_key("b"));
        assert_eq!(
            ns.path_of(3).as_deref(),
            Some("/lost+found/name_conflicts/a.3")
        );
        let dirty = ns.take_dirty();
        assert!(dirty.contains(&3));
        assert!(ns.take_dirty().is_empty());
    }

    #[test]
    fn test_move_between_quota_nodes() {
        let mut qa = container(2, ROOT_CONTAINER_ID, "qa");
        qa.set_quota_node(true);
        qa.tree_size = 500;
        let mut qb = container(3, ROOT_CONTAINER_ID, "qb");
        qb.set_quota_node(true);
        let mut dir = container(4, 2, "dir");
        dir.files.extend([40, 41]);
        dir.tree_size = 200;
        let mut sub = container(5, 4, "sub");
        sub.files.insert(50);

        let (mut ns, _) = booted(StoreMode::Replica, vec![qa, qb, dir.clone(), sub]);
        assert_eq!(ns.quota.get(2).unwrap().num_files(), 3);

        let mut moved = dir;
        moved.parent_id = 3;
        let kind = ns.apply_update(moved, 900);
        match kind {
            MergeKind::Moved { from, to } => {
                assert_eq!(from.quota_node, Some(2));
                assert_eq!(to.quota_node, Some(3));
                assert_eq!(from.files, 3);
                assert_eq!(to.files, 3);
            }
            other => panic!("unexpected merge {other:?}"),
        }
        assert_eq!(ns.quota.get(2).unwrap().tree_size, 300);
        assert_eq!(ns.quota.get(3).unwrap().tree_size, 200);
        assert_eq!(ns.quota.get(2).unwrap().num_files(), 0);
        assert_eq!(ns.quota.get(3).unwrap().used_bytes, 300);
        assert_eq!(ns.path_of(5).as_deref(), Some("/qb/dir/sub"));
    }

    #[test]
    fn test_insert_waits_for_parent() {
        let (mut ns, _) = booted(StoreMode::Replica, vec![]);
        assert_eq!(
            ns.apply_update(container(21, 20, "child"), 300),
            MergeKind::Inserted
        );
        assert!(!ns.index.is_attached(21));

        ns.apply_update(container(20, ROOT_CONTAINER_ID, "parent"), 400);
        assert_eq!(ns.attach_pending(), 1);
        assert_eq!(ns.path_of(21).as_deref(), Some("/parent/child"));
    }

    #[test]
    fn test_pending_chain_joins_quota_node() {
        let mut quota = container(2, ROOT_CONTAINER_ID, "q");
        quota.set_quota_node(true);
        let (mut ns, _) = booted(StoreMode::Replica, vec![quota]);

        for (id, parent, file) in [(5, 6, 50), (6, 7, 60), (7, 2, 70)] {
            let mut c = container(id, parent, &format!("c{id}"));
            c.files.insert(file);
            ns.apply_update(c, id * 100);
        }
        assert_eq!(ns.attach_pending(), 2);
        assert_eq!(ns.path_of(5).as_deref(), Some("/q/c7/c6/c5"));

        let mut rebuilt = QuotaRegistry::new(Arc::new(FixedSize));
        rebuilt.rebuild(&ns.index);
        for file in [50, 60, 70] {
            assert_eq!(ns.quota.owner_of(file), Some(2));
            assert_eq!(rebuilt.owner_of(file), Some(2));
        }
        assert_eq!(ns.quota.get(2).unwrap().used_bytes, 300);
    }

    #[test]
    fn test_new_quota_node_size_counted_once() {
        let (mut ns, _) = booted(StoreMode::Replica, vec![]);
        let mut flagged = container(9, ROOT_CONTAINER_ID, "q");
        flagged.set_quota_node(true);
        flagged.tree_size = 100;
        flagged.files.insert(90);
        ns.apply_update(flagged, 300);

        let node = ns.quota.get(9).unwrap();
        assert_eq!(node.tree_size, 100);
        assert_eq!(node.num_files(), 1);

        // Same when the flagged container waits for its parent
        let mut waiting = container(11, 10, "late");
        waiting.set_quota_node(true);
        waiting.tree_size = 40;
        ns.apply_update(waiting, 400);
        ns.apply_update(container(10, ROOT_CONTAINER_ID, "parent"), 500);
        ns.attach_pending();
        assert_eq!(ns.path_of(11).as_deref(), Some("/parent/late"));
        assert_eq!(ns.quota.get(11).unwrap().tree_size, 40);
    }

    #[test]
    fn test_move_under_own_descendant_quarantined() {
        let (mut ns, _) = booted(
            StoreMode::Primary,
            vec![
                container(2, ROOT_CONTAINER_ID, "a"),
                container(3, 2, "b"),
            ],
        );
        ns.apply_update(container(2, 3, "a"), 600);
        ns.attach_pending();

        assert_eq!(ns.path_of(2).as_deref(), Some("/lost+found/orphans/a.2"));
        assert_eq!(ns.path_of(3).as_deref(), Some("/lost+found/orphans/a.2/b"));
        assert!(ns.index.unattached().is_empty());
        assert!(ns.take_dirty().contains(&2));
        assert_eq!(ns.quarantined(), 1);
    }

    #[test]
    fn test_remove_detaches() {
        let (mut ns, _) = booted(
            StoreMode::Primary,
            vec![container(3, ROOT_CONTAINER_ID, "gone")],
        );
        let removed = ns.apply_remove(3).unwrap();
        assert_eq!(removed.name, "gone");
        assert!(!ns.index.contains(3));
        assert!(ns.children(ROOT_CONTAINER_ID).is_empty());
        assert!(ns.apply_remove(3).is_none());
    }
}
