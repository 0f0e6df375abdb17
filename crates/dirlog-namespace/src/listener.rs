//! Change notification

use crate::container::Container;

/// Kind of change applied to a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    Updated,
    Deleted,
}

/// Observer of container changes
///
/// Called synchronously while the namespace write lock is held, on the
/// caller's thread for primary mutations and on the follower thread for
/// replicated changes. Implementations must not call back into the store.
pub trait ChangeListener: Send + Sync {
    fn container_changed(&self, container: &Container, change: Change);
}
