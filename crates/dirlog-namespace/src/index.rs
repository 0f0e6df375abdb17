//! In-memory container index
//!
//! Maps a container id to the offset of the last update record written for
//! it and to the live container. The index is the only owner of live
//! containers; tree links between containers are ids resolved through it.

use crate::container::Container;
use dirlog_common::ContainerId;
use std::collections::HashMap;

/// Index entry
#[derive(Clone, Debug)]
pub struct IndexEntry {
    /// Offset of the last update record, 0 when never persisted
    pub log_offset: u64,
    /// Live container, `None` until loaded from the log at boot
    pub container: Option<Container>,
    /// Linked into its parent's child map
    pub(crate) attached: bool,
}

impl IndexEntry {
    fn unloaded(log_offset: u64) -> Self {
        Self {
            log_offset,
            container: None,
            attached: false,
        }
    }

    #[must_use]
    pub const fn is_persisted(&self) -> bool {
        self.log_offset != 0
    }
}

/// Container index
#[derive(Debug, Default)]
pub struct ContainerIndex {
    entries: HashMap<ContainerId, IndexEntry>,
}

impl ContainerIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: ContainerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Record the latest update offset for `id` seen by a scan
    ///
    /// A previously loaded container is dropped, it no longer matches the log.
    pub fn record_offset(&mut self, id: ContainerId, offset: u64) {
        self.entries.insert(id, IndexEntry::unloaded(offset));
    }

    /// Insert or replace a live container
    pub fn insert(&mut self, container: Container, log_offset: u64) {
        self.entries.insert(
            container.id,
            IndexEntry {
                log_offset,
                container: Some(container),
                attached: false,
            },
        );
    }

    /// Remove an entry
    pub fn erase(&mut self, id: ContainerId) -> Option<IndexEntry> {
        self.entries.remove(&id)
    }

    #[must_use]
    pub fn entry(&self, id: ContainerId) -> Option<&IndexEntry> {
        self.entries.get(&id)
    }

    pub fn entry_mut(&mut self, id: ContainerId) -> Option<&mut IndexEntry> {
        self.entries.get_mut(&id)
    }

    /// Live container for `id`
    #[must_use]
    pub fn get(&self, id: ContainerId) -> Option<&Container> {
        self.entries.get(&id).and_then(|e| e.container.as_ref())
    }

    pub fn get_mut(&mut self, id: ContainerId) -> Option<&mut Container> {
        self.entries.get_mut(&id).and_then(|e| e.container.as_mut())
    }

    #[must_use]
    pub fn offset(&self, id: ContainerId) -> Option<u64> {
        self.entries.get(&id).map(|e| e.log_offset)
    }

    /// Overwrite the offset of an existing entry
    pub fn set_offset(&mut self, id: ContainerId, offset: u64) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.log_offset = offset;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_attached(&self, id: ContainerId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.attached)
    }

    pub(crate) fn set_attached(&mut self, id: ContainerId, attached: bool) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.attached = attached;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ContainerId, &IndexEntry)> {
        self.entries.iter().map(|(id, e)| (*id, e))
    }

    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.entries.values().filter_map(|e| e.container.as_ref())
    }

    /// Entries still waiting to be loaded, as `(id, offset)`
    #[must_use]
    pub fn unloaded(&self) -> Vec<(ContainerId, u64)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.container.is_none())
            .map(|(id, e)| (*id, e.log_offset))
            .collect()
    }

    /// Persisted `(offset, id)` pairs
    #[must_use]
    pub fn persisted_offsets(&self) -> Vec<(u64, ContainerId)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.is_persisted())
            .map(|(id, e)| (e.log_offset, *id))
            .collect()
    }

    /// Ids that are not linked into the tree
    #[must_use]
    pub fn unattached(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.attached)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn max_id(&self) -> ContainerId {
        self.entries.keys().copied().max().unwrap_or(0)
    }
}
