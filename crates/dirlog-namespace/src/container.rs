//! Container metadata object and its record payload encoding

use dirlog_common::{ContainerId, Error, FileId, Result, ROOT_CONTAINER_ID};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// Container flag: the container is a quota (accounting) root
pub const FLAG_QUOTA_NODE: u16 = 0x0001;

/// Directory-like metadata object
///
/// `subcontainers` is derived from the `parent_id` of the other containers
/// when the tree is attached and is not part of the persisted record.
/// File membership is persisted with the container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub parent_id: ContainerId,
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub flags: u16,
    /// Creation time (unix millis)
    pub ctime: u64,
    /// Modification time (unix millis)
    pub mtime: u64,
    pub attributes: BTreeMap<String, String>,
    pub files: BTreeSet<FileId>,
    /// Aggregate size of the subtree
    pub tree_size: u64,
    #[serde(skip)]
    pub subcontainers: BTreeMap<String, ContainerId>,
}

impl Container {
    /// Create an empty container with the given id
    #[must_use]
    pub fn new(id: ContainerId) -> Self {
        let now = now_millis();
        Self {
            id,
            parent_id: 0,
            name: String::new(),
            uid: 0,
            gid: 0,
            flags: 0,
            ctime: now,
            mtime: now,
            attributes: BTreeMap::new(),
            files: BTreeSet::new(),
            tree_size: 0,
            subcontainers: BTreeMap::new(),
        }
    }

    /// Create the root container
    #[must_use]
    pub fn root() -> Self {
        let mut root = Self::new(ROOT_CONTAINER_ID);
        root.parent_id = ROOT_CONTAINER_ID;
        root
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.id == ROOT_CONTAINER_ID
    }

    #[must_use]
    pub const fn is_quota_node(&self) -> bool {
        self.flags & FLAG_QUOTA_NODE != 0
    }

    pub fn set_quota_node(&mut self, enabled: bool) {
        if enabled {
            self.flags |= FLAG_QUOTA_NODE;
        } else {
            self.flags &= !FLAG_QUOTA_NODE;
        }
    }

    /// Copy the persisted fields of `other`, keeping attached children
    pub fn copy_fields_from(&mut self, other: &Self) {
        let subcontainers = std::mem::take(&mut self.subcontainers);
        *self = other.clone();
        self.subcontainers = subcontainers;
    }

    /// Serialize to a record payload
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from a record payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Read the container id from an update payload without decoding it
///
/// `id` is the first field and bincode's fixed-width integer encoding
/// stores it as the first 8 little-endian bytes.
pub fn peek_id(payload: &[u8]) -> Result<ContainerId> {
    let bytes: [u8; 8] = payload
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Deserialization("update payload too short".into()))?;
    Ok(ContainerId::from_le_bytes(bytes))
}

/// Encode the payload of a delete record
#[must_use]
pub fn delete_payload(id: ContainerId) -> [u8; 8] {
    id.to_le_bytes()
}

/// Decode the payload of a delete record
pub fn parse_delete_payload(data: &[u8]) -> Result<ContainerId> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| Error::Deserialization(format!("delete payload of {} bytes", data.len())))?;
    Ok(ContainerId::from_le_bytes(bytes))
}

/// Current time in unix millis
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_excludes_subcontainers() {
        let mut container = Container::new(10);
        container.parent_id = ROOT_CONTAINER_ID;
        container.name = "a".into();
        container.files.insert(500);
        container.attributes.insert("sys.owner".into(), "ops".into());
        container.subcontainers.insert("child".into(), 11);

        let decoded = Container::from_bytes(&container.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.name, "a");
        assert_eq!(decoded.files.len(), 1);
        assert_eq!(decoded.attributes["sys.owner"], "ops");
        assert!(decoded.subcontainers.is_empty());
    }

    #[test]
    fn test_copy_fields_keeps_children() {
        let mut live = Container::new(10);
        live.subcontainers.insert("child".into(), 11);

        let mut incoming = Container::new(10);
        incoming.name = "renamed".into();
        incoming.uid = 42;

        live.copy_fields_from(&incoming);
        assert_eq!(live.name, "renamed");
        assert_eq!(live.uid, 42);
        assert_eq!(live.subcontainers.get("child"), Some(&11));
    }

    #[test]
    fn test_quota_flag() {
        let mut container = Container::new(3);
        assert!(!container.is_quota_node());
        container.set_quota_node(true);
        assert!(container.is_quota_node());
        container.set_quota_node(false);
        assert!(!container.is_quota_node());
    }

    #[test]
    fn test_peek_id_matches_payload() {
        let mut container = Container::new(0x0102_0304_0506);
        container.name = "peek".into();
        let payload = container.to_bytes().unwrap();
        assert_eq!(peek_id(&payload).unwrap(), 0x0102_0304_0506);
        assert!(peek_id(&payload[..4]).is_err());
    }

    #[test]
    fn test_delete_payload() {
        assert_eq!(parse_delete_payload(&delete_payload(77)).unwrap(), 77);
        assert!(parse_delete_payload(b"short").is_err());
    }

    #[test]
    fn test_root_is_own_parent() {
        let root = Container::root();
        assert!(root.is_root());
        assert_eq!(root.parent_id, root.id);
    }
}
