//! Identifier types shared across dirlog components

use serde::{Deserialize, Serialize};

/// Identifier of a container (directory) in the namespace
pub type ContainerId = u64;

/// Identifier of a file, owned by the file metadata service
pub type FileId = u64;

/// The root container. It is its own parent.
pub const ROOT_CONTAINER_ID: ContainerId = 1;

/// Name of the top-level quarantine container
pub const LOST_FOUND_NAME: &str = "lost+found";

/// Quarantine container for objects whose parent cannot be resolved
pub const ORPHANS_NAME: &str = "orphans";

/// Quarantine container for objects that lost a name collision
pub const NAME_CONFLICTS_NAME: &str = "name_conflicts";

/// Operating mode of a store instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Owns the change log in append mode and accepts mutations
    Primary,
    /// Follows a change log written by a primary, read-only
    Replica,
}

impl StoreMode {
    /// Mode selected by the `slave_mode` option
    #[must_use]
    pub const fn from_slave_flag(slave_mode: bool) -> Self {
        if slave_mode { Self::Replica } else { Self::Primary }
    }

    #[must_use]
    pub const fn is_replica(self) -> bool {
        matches!(self, Self::Replica)
    }
}

impl std::fmt::Display for StoreMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Replica => write!(f, "replica"),
        }
    }
}
