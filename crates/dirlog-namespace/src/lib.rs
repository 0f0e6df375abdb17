//! Dirlog Namespace - Change-log backed container metadata store
//!
//! This crate implements the container (directory) namespace including:
//! - Append-only change log with checksummed records
//! - In-memory container index rebuilt from the log at boot
//! - Tree attachment with orphan and name-conflict quarantine
//! - Quota node accounting with subtree migration
//! - Replica follower tailing a primary's log
//! - Online compaction

pub mod changelog;
pub mod compaction;
pub mod container;
pub mod follower;
pub mod index;
pub mod listener;
pub mod quota;
pub mod scanner;
pub mod store;
pub mod tree;

// Re-exports
pub use changelog::{
    ChangeLog, CompactionStamp, FLAG_COMPACTED, HEADER_SIZE, LogHeader, LogOptions, LogRecord,
    OpenMode, RecordType,
};
pub use compaction::CompactionReport;
pub use container::{Container, FLAG_QUOTA_NODE};
pub use follower::FollowerState;
pub use index::{ContainerIndex, IndexEntry};
pub use listener::{Change, ChangeListener};
pub use quota::{FileUsage, FileUsageSource, NoFileUsage, QuotaNode, QuotaRegistry};
pub use store::{ContainerStore, StoreStats};
pub use tree::{AttachReport, MergeKind, Namespace};
