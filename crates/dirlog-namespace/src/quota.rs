//! Quota node accounting
//!
//! A container flagged as quota node is the accounting root of every file
//! below it, down to the next flagged container. Each quota node tracks its
//! member files, used bytes per uid and gid, and an aggregate tree size.
//!
//! Moving a subtree between quota nodes is done in two halves, both under
//! the namespace write lock:
//! 1. `detach_subtree` before the reparent: files leave their quota node
//!    and the subtree size is subtracted from the old node
//! 2. `attach_subtree` after the reparent: files join the new node and the
//!    subtree size is added to it

use crate::container::Container;
use crate::index::ContainerIndex;
use dirlog_common::{ContainerId, FileId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Accounting data of one file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileUsage {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
}

/// Source of file usage, backed by the file metadata service
pub trait FileUsageSource: Send + Sync {
    fn file_usage(&self, file: FileId) -> FileUsage;
}

/// Usage source for deployments without file accounting
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFileUsage;

impl FileUsageSource for NoFileUsage {
    fn file_usage(&self, _file: FileId) -> FileUsage {
        FileUsage::default()
    }
}

/// Accounting state of one quota node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaNode {
    pub container_id: ContainerId,
    pub files: HashMap<FileId, FileUsage>,
    pub used_bytes: u64,
    pub bytes_by_uid: HashMap<u32, u64>,
    pub bytes_by_gid: HashMap<u32, u64>,
    /// Aggregate size of the containers accounted to this node
    pub tree_size: u64,
}

impl QuotaNode {
    fn new(container_id: ContainerId, tree_size: u64) -> Self {
        Self {
            container_id,
            tree_size,
            ..Default::default()
        }
    }

    fn add_file(&mut self, file: FileId, usage: FileUsage) {
        if self.files.insert(file, usage).is_none() {
            self.used_bytes += usage.size;
            *self.bytes_by_uid.entry(usage.uid).or_default() += usage.size;
            *self.bytes_by_gid.entry(usage.gid).or_default() += usage.size;
        }
    }

    fn remove_file(&mut self, file: FileId) -> Option<FileUsage> {
        let usage = self.files.remove(&file)?;
        self.used_bytes = self.used_bytes.saturating_sub(usage.size);
        for (map, key) in [
            (&mut self.bytes_by_uid, usage.uid),
            (&mut self.bytes_by_gid, usage.gid),
        ] {
            if let Some(bytes) = map.get_mut(&key) {
                *bytes = bytes.saturating_sub(usage.size);
                if *bytes == 0 {
                    map.remove(&key);
                }
            }
        }
        Some(usage)
    }

    #[must_use]
    pub fn num_files(&self) -> usize {
        self.files.len()
    }
}

/// What a subtree move did to the accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubtreeAccounting {
    pub quota_node: Option<ContainerId>,
    pub files: u64,
    pub bytes: u64,
    pub tree_size: u64,
}

/// All quota nodes of a namespace
pub struct QuotaRegistry {
    nodes: HashMap<ContainerId, QuotaNode>,
    /// Quota node each accounted file currently belongs to
    file_owner: HashMap<FileId, ContainerId>,
    usage: Arc<dyn FileUsageSource>,
}

impl std::fmt::Debug for QuotaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaRegistry")
            .field("nodes", &self.nodes.len())
            .field("files", &self.file_owner.len())
            .finish_non_exhaustive()
    }
}

impl Default for QuotaRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NoFileUsage))
    }
}

impl QuotaRegistry {
    #[must_use]
    pub fn new(usage: Arc<dyn FileUsageSource>) -> Self {
        Self {
            nodes: HashMap::new(),
            file_owner: HashMap::new(),
            usage,
        }
    }

    pub fn set_usage_source(&mut self, usage: Arc<dyn FileUsageSource>) {
        self.usage = usage;
    }

    #[must_use]
    pub fn get(&self, id: ContainerId) -> Option<&QuotaNode> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &QuotaNode> {
        self.nodes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Quota node a file is accounted to
    #[must_use]
    pub fn owner_of(&self, file: FileId) -> Option<ContainerId> {
        self.file_owner.get(&file).copied()
    }

    /// Nearest flagged ancestor of `id`, inclusive
    ///
    /// Returns `None` when no ancestor is flagged or when the chain is
    /// broken by a container that is not attached to the tree.
    #[must_use]
    pub fn nearest_quota_node(index: &ContainerIndex, id: ContainerId) -> Option<ContainerId> {
        let mut current = id;
        for _ in 0..=index.len() {
            let container = index.get(current)?;
            if container.is_quota_node() {
                return Some(current);
            }
            if container.is_root() || !index.is_attached(current) {
                return None;
            }
            current = container.parent_id;
        }
        None
    }

    /// Recompute every quota node from the tree
    pub fn rebuild(&mut self, index: &ContainerIndex) {
        self.nodes.clear();
        self.file_owner.clear();

        for container in index.containers() {
            if container.is_quota_node() {
                self.nodes.insert(
                    container.id,
                    QuotaNode::new(container.id, container.tree_size),
                );
            }
        }

        for container in index.containers() {
            if container.files.is_empty() {
                continue;
            }
            if let Some(node) = Self::nearest_quota_node(index, container.id) {
                for file in &container.files {
                    self.add_file(node, *file);
                }
            }
        }

        debug!(
            "Rebuilt {} quota nodes covering {} files",
            self.nodes.len(),
            self.file_owner.len()
        );
    }

    /// Account `file` to `node`, moving it away from its previous node
    pub fn add_file(&mut self, node: ContainerId, file: FileId) {
        if self.file_owner.get(&file) == Some(&node) {
            return;
        }
        self.remove_file(file);
        let usage = self.usage.file_usage(file);
        if let Some(quota) = self.nodes.get_mut(&node) {
            quota.add_file(file, usage);
            self.file_owner.insert(file, node);
        }
    }

    /// Drop `file` from whatever node it is accounted to
    pub fn remove_file(&mut self, file: FileId) -> Option<FileUsage> {
        let owner = self.file_owner.remove(&file)?;
        self.nodes.get_mut(&owner)?.remove_file(file)
    }

    /// Reconcile the files of one container after its file set changed
    pub fn update_container_files(
        &mut self,
        index: &ContainerIndex,
        before: Option<&Container>,
        after: &Container,
    ) {
        if let Some(before) = before {
            for file in before.files.difference(&after.files) {
                self.remove_file(*file);
            }
        }
        if let Some(node) = Self::nearest_quota_node(index, after.id) {
            for file in &after.files {
                self.add_file(node, *file);
            }
        }
    }

    /// Remove the files of the subtree at `top` from their quota nodes and
    /// subtract its size from the current quota node of `top`
    ///
    /// Call while `top` is still linked to its old parent.
    pub fn detach_subtree(&mut self, index: &ContainerIndex, top: ContainerId) -> SubtreeAccounting {
        let mut accounting = SubtreeAccounting {
            quota_node: Self::nearest_quota_node(index, top),
            ..Default::default()
        };

        for file in subtree_files(index, top) {
            if let Some(usage) = self.remove_file(file) {
                accounting.files += 1;
                accounting.bytes += usage.size;
            }
        }

        // A flagged top carries its own size along
        let tree_size = index.get(top).map_or(0, |c| c.tree_size);
        if let Some(node) = accounting
            .quota_node
            .filter(|id| *id != top)
            .and_then(|id| self.nodes.get_mut(&id))
        {
            node.tree_size = node.tree_size.saturating_sub(tree_size);
            accounting.tree_size = tree_size;
        }

        accounting
    }

    /// Account the files of the subtree at `top` and add its size to the
    /// quota node of `top`
    ///
    /// Call after `top` has been linked to its new parent. Files below
    /// nested quota nodes go to those nodes, files they already own stay
    /// put. Only files of the quota node of `top` are counted.
    pub fn attach_subtree(&mut self, index: &ContainerIndex, top: ContainerId) -> SubtreeAccounting {
        let quota_node = Self::nearest_quota_node(index, top);
        let mut accounting = SubtreeAccounting {
            quota_node,
            ..Default::default()
        };

        let mut queue = VecDeque::from([(top, quota_node)]);
        let mut visited = 0usize;
        while let Some((id, inherited)) = queue.pop_front() {
            visited += 1;
            if visited > index.len() {
                break;
            }
            let Some(container) = index.get(id) else {
                continue;
            };
            let node = if container.is_quota_node() {
                Some(id)
            } else {
                inherited
            };
            if let Some(node) = node {
                for file in &container.files {
                    self.add_file(node, *file);
                    if Some(node) == quota_node {
                        accounting.files += 1;
                        accounting.bytes += self
                            .nodes
                            .get(&node)
                            .and_then(|q| q.files.get(file))
                            .map_or(0, |u| u.size);
                    }
                }
            }
            queue.extend(container.subcontainers.values().map(|child| (*child, node)));
        }

        let tree_size = index.get(top).map_or(0, |c| c.tree_size);
        if let Some(node) = quota_node
            .filter(|id| *id != top)
            .and_then(|id| self.nodes.get_mut(&id))
        {
            node.tree_size += tree_size;
            accounting.tree_size = tree_size;
        }

        accounting
    }

    /// Start accounting for a newly flagged container
    pub fn register(&mut self, container: &Container) {
        self.nodes
            .entry(container.id)
            .or_insert_with(|| QuotaNode::new(container.id, container.tree_size));
    }

    /// Stop accounting for a container, its files become unaccounted
    pub fn unregister(&mut self, id: ContainerId) -> Option<QuotaNode> {
        let node = self.nodes.remove(&id)?;
        for file in node.files.keys() {
            self.file_owner.remove(file);
        }
        Some(node)
    }
}

/// Files of the subtree at `top` that share the quota node of `top`
///
/// Breadth-first; does not descend into nested quota nodes, whose files
/// keep their own accounting when the subtree moves. A flagged `top` keeps
/// all of its files, so the result is empty.
#[must_use]
pub fn subtree_files(index: &ContainerIndex, top: ContainerId) -> Vec<FileId> {
    let mut files = Vec::new();
    let Some(first) = index.get(top) else {
        return files;
    };
    if first.is_quota_node() {
        return files;
    }

    let mut queue = VecDeque::from([top]);
    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        if visited > index.len() {
            break;
        }
        let Some(container) = index.get(id) else {
            continue;
        };
        files.extend(container.files.iter().copied());
        for child in container.subcontainers.values() {
            if index.get(*child).is_some_and(|c| !c.is_quota_node()) {
                queue.push_back(*child);
            }
        }
    }
    files
}
