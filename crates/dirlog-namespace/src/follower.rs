//! Replica follower
//!
//! A dedicated thread tails the change log written by the primary. New
//! complete records are staged (the latest update per id, a set of
//! deletions) and committed in one batch under the namespace write lock
//! once no more bytes are immediately available.

use crate::changelog::{ChangeLog, RecordType, ScanControl, ScanTail, WaitOutcome};
use crate::container::{Container, parse_delete_payload};
use crate::listener::Change;
use crate::store::StoreContext;
use crate::tree::MergeKind;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use dirlog_common::{ContainerId, Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Follower thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowerState {
    Stopped,
    Following,
}

/// Follower progress shared with the store
#[derive(Debug, Default)]
pub(crate) struct FollowerProgress {
    /// Offset of the next record to read
    pub(crate) offset: AtomicU64,
    /// The followed file was replaced, the replica must be rebooted
    pub(crate) resync_required: AtomicBool,
    pub(crate) commits: AtomicU64,
    pub(crate) applied_updates: AtomicU64,
    pub(crate) applied_deletions: AtomicU64,
    /// Deletions waiting for their children to go away
    pub(crate) deferred: Mutex<BTreeSet<ContainerId>>,
}

impl FollowerProgress {
    pub(crate) fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }
}

/// Records read but not yet applied
#[derive(Debug, Default)]
struct StagedBatch {
    updates: HashMap<ContainerId, (Container, u64)>,
    deletions: BTreeSet<ContainerId>,
    next_offset: u64,
    records: u64,
}

impl StagedBatch {
    fn stage_update(&mut self, container: Container, offset: u64) {
        // A later update cancels a pending delete
        self.deletions.remove(&container.id);
        self.updates.insert(container.id, (container, offset));
    }

    fn stage_delete(&mut self, id: ContainerId) {
        // A later delete cancels a pending update
        self.updates.remove(&id);
        self.deletions.insert(id);
    }
}

/// Handle of a running follower thread
pub(crate) struct Follower {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl Follower {
    /// Spawn the follower thread
    pub(crate) fn spawn(ctx: Arc<StoreContext>) -> Result<Self> {
        let (shutdown, rx) = crossbeam_channel::bounded(1);
        let handle = thread::Builder::new()
            .name("dirlog-follower".into())
            .spawn(move || follow(&ctx, &rx))?;
        Ok(Self { shutdown, handle })
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the thread and wait for it to exit
    pub(crate) fn stop(self) {
        let Self { shutdown, handle } = self;
        // A full channel means a stop is already pending; dropping the
        // sender disconnects it either way
        let _ = shutdown.try_send(());
        drop(shutdown);
        if handle.join().is_err() {
            error!("Follower thread panicked");
        }
    }
}

fn follow(ctx: &StoreContext, shutdown: &Receiver<()>) {
    info!("Follower started at offset {}", ctx.follower.offset());
    let poll_interval = ctx.config.poll_interval();
    let mut last_corrupt = None;

    loop {
        let log = ctx.current_log();
        let offset = ctx.follower.offset();

        match log.wait_for_data(offset, poll_interval, shutdown) {
            Ok(WaitOutcome::Cancelled) => break,
            Ok(WaitOutcome::TimedOut) => {
                match log.is_replaced() {
                    Ok(true) => {
                        ctx.follower.resync_required.store(true, Ordering::Release);
                        ctx.record_warning(format!(
                            "followed change log {} was replaced, resync required",
                            log.path().display()
                        ));
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Failed to check followed log: {}", e),
                }
                if !ctx.follower.deferred.lock().is_empty() {
                    commit(ctx, StagedBatch::default());
                }
                continue;
            }
            Ok(WaitOutcome::DataAvailable) => {}
            Err(e) => {
                error!("Follower stopped: {}", e);
                ctx.record_warning(format!("follower stopped: {e}"));
                break;
            }
        }

        let (batch, tail) = match stage(&log, offset) {
            Ok(staged) => staged,
            Err(e) => {
                error!("Follower stopped: {}", e);
                ctx.record_warning(format!("follower stopped: {e}"));
                break;
            }
        };

        if let ScanTail::Corrupt { offset, error } = &tail {
            if last_corrupt != Some(*offset) {
                last_corrupt = Some(*offset);
                ctx.record_warning(format!("follower blocked at offset {offset}: {error}"));
            }
        }

        let progressed = batch.records > 0;
        ctx.follower.offset.store(batch.next_offset, Ordering::Release);
        if progressed {
            commit(ctx, batch);
        } else {
            // Only a partial record so far, the primary is mid-append
            match shutdown.recv_timeout(poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    info!("Follower stopped at offset {}", ctx.follower.offset());
}

/// Read complete records from `from` to the current end of the log
fn stage(log: &ChangeLog, from: u64) -> Result<(StagedBatch, ScanTail)> {
    let mut batch = StagedBatch::default();
    let mut bad_payload = None;

    let summary = log.scan(from, None, |record| {
        let staged = match record.record_type {
            RecordType::Update => Container::from_bytes(&record.payload)
                .map(|container| batch.stage_update(container, record.offset)),
            RecordType::Delete => {
                parse_delete_payload(&record.payload).map(|id| batch.stage_delete(id))
            }
            RecordType::CompactionStamp => Ok(()),
        };
        match staged {
            Ok(()) => {
                batch.records += 1;
                Ok(ScanControl::Continue)
            }
            Err(e) => {
                bad_payload = Some((record.offset, Error::corrupt(record.offset, e.to_string())));
                Ok(ScanControl::Stop)
            }
        }
    })?;

    batch.next_offset = summary.next_offset;
    let tail = match bad_payload {
        Some((offset, error)) => {
            batch.next_offset = offset;
            ScanTail::Corrupt { offset, error }
        }
        None => summary.tail,
    };
    Ok((batch, tail))
}

/// Apply a staged batch under the namespace write lock
fn commit(ctx: &StoreContext, batch: StagedBatch) {
    let mut guard = ctx.namespace.write();
    let ns = &mut *guard;

    // Log order, so parents created in this batch come before their children
    let mut updates: Vec<_> = batch.updates.into_values().collect();
    updates.sort_by_key(|(_, offset)| *offset);
    let num_updates = updates.len() as u64;

    for (container, offset) in updates {
        let id = container.id;
        if ns.follower_deletions.remove(&id) {
            ctx.record_warning(format!("stray re-create of deleted container {id}"));
        }
        let change = match ns.apply_update(container, offset) {
            MergeKind::Inserted => Change::Created,
            _ => Change::Updated,
        };
        if let Some(live) = ns.index.get(id) {
            ctx.notify(live, change);
        }
    }

    let linked = ns.attach_pending();
    if linked > 0 {
        debug!("Attached {} pending containers", linked);
    }

    let mut deferred = ctx.follower.deferred.lock();
    let mut pending: BTreeSet<ContainerId> = std::mem::take(&mut *deferred);
    pending.extend(batch.deletions);
    let mut deleted = 0u64;

    // A parent deleted in the same batch as its children goes once they are gone
    loop {
        let before = pending.len();
        pending.retain(|&id| {
            if !ns.index.contains(id) {
                return false;
            }
            if !ns.is_leaf(id) {
                return true;
            }
            if let Some(removed) = ns.apply_remove(id) {
                ns.follower_deletions.insert(id);
                ctx.notify(&removed, Change::Deleted);
                deleted += 1;
            }
            false
        });
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }

    for id in &pending {
        debug!("Deferring deletion of container {} until its children are gone", id);
    }
    *deferred = pending;

    ctx.follower.commits.fetch_add(1, Ordering::Relaxed);
    ctx.follower
        .applied_updates
        .fetch_add(num_updates, Ordering::Relaxed);
    ctx.follower
        .applied_deletions
        .fetch_add(deleted, Ordering::Relaxed);
}

/// Apply everything the log holds beyond the follower offset
///
/// Used on promotion, after the follower thread has stopped. Returns the
/// end of the last complete record.
pub(crate) fn catch_up(ctx: &StoreContext, log: &ChangeLog) -> Result<u64> {
    let offset = ctx.follower.offset();
    let (batch, tail) = stage(log, offset)?;
    if let ScanTail::Corrupt { offset, error } = tail {
        return Err(Error::corrupt(offset, error.to_string()));
    }
    let next_offset = batch.next_offset;
    if batch.records > 0 {
        commit(ctx, batch);
    }
    ctx.follower.offset.store(next_offset, Ordering::Release);
    Ok(next_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{LogOptions, OpenMode};
    use crate::container::delete_payload;
    use crate::listener::testing::Recorder;
    use crate::store::ContainerStore;
    use dirlog_common::{ROOT_CONTAINER_ID, StoreConfig};
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn writer(path: &Path) -> ChangeLog {
        ChangeLog::open(
            path,
            OpenMode::Append,
            LogOptions {
                sync_on_write: false,
                write_buffer_size: 4096,
            },
        )
        .unwrap()
    }

    fn write_container(log: &ChangeLog, id: ContainerId, parent: ContainerId, name: &str) -> u64 {
        let mut container = Container::new(id);
        container.parent_id = parent;
        container.name = name.into();
        log.append(RecordType::Update, &container.to_bytes().unwrap())
            .unwrap()
    }

    fn replica_config(path: &Path) -> StoreConfig {
        let mut config = StoreConfig::with_changelog(path);
        config.slave_mode = true;
        config.poll_interval_us = 2000;
        config.sync_on_write = false;
        config.boot_threads = 2;
        config
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_staging_cancels_update_then_delete() {
        let dir = tempdir().unwrap();
        let log = writer(&dir.path().join("stage.mdlog"));
        write_container(&log, 10, ROOT_CONTAINER_ID, "a");
        log.append(RecordType::Delete, &delete_payload(10)).unwrap();
        write_container(&log, 11, ROOT_CONTAINER_ID, "b");
        log.append(RecordType::Delete, &delete_payload(11)).unwrap();
        write_container(&log, 11, ROOT_CONTAINER_ID, "b2");

        let (batch, tail) = stage(&log, 0).unwrap();
        assert!(matches!(tail, ScanTail::Clean));
        assert_eq!(batch.records, 5);
        assert!(!batch.updates.contains_key(&10));
        assert!(batch.deletions.contains(&10));
        assert_eq!(batch.updates[&11].0.name, "b2");
        assert!(!batch.deletions.contains(&11));
        assert_eq!(batch.next_offset, log.size());
    }

    #[test]
    fn test_replica_update_then_delete_within_one_cycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("follow.mdlog");
        let primary = writer(&path);
        write_container(&primary, ROOT_CONTAINER_ID, ROOT_CONTAINER_ID, "");

        let store = ContainerStore::open(replica_config(&path)).unwrap();
        let recorder = Arc::new(Recorder::default());
        store.add_change_listener(recorder.clone());

        // Both records land before the follower reads them
        write_container(&primary, 20, ROOT_CONTAINER_ID, "short-lived");
        primary
            .append(RecordType::Delete, &delete_payload(20))
            .unwrap();
        write_container(&primary, 21, ROOT_CONTAINER_ID, "kept");

        store.start_following().unwrap();
        assert!(wait_until(|| store.get_container(21).is_ok()));
        assert!(store.get_container(20).is_err());
        assert!(
            recorder
                .take()
                .iter()
                .all(|(id, change)| *id != 20 || *change == Change::Deleted)
        );
        store.stop_following();
        assert_eq!(store.follower_state(), FollowerState::Stopped);
    }

    #[test]
    fn test_replica_follows_moves_and_renames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("moves.mdlog");
        let primary = writer(&path);
        write_container(&primary, ROOT_CONTAINER_ID, ROOT_CONTAINER_ID, "");
        write_container(&primary, 2, ROOT_CONTAINER_ID, "a");
        write_container(&primary, 3, ROOT_CONTAINER_ID, "b");

        let store = ContainerStore::open(replica_config(&path)).unwrap();
        store.start_following().unwrap();
        assert_eq!(store.follower_state(), FollowerState::Following);

        // Child written before its parent
        write_container(&primary, 5, 4, "child");
        write_container(&primary, 4, 2, "dir");
        assert!(wait_until(|| store.path_of(5).as_deref() == Some("/a/dir/child")));

        write_container(&primary, 4, 3, "moved");
        assert!(wait_until(|| store.path_of(5).as_deref() == Some("/b/moved/child")));
        assert!(store.children(2).unwrap().is_empty());
        store.stop_following();
    }

    #[test]
    fn test_chain_written_child_first_joins_quota_node() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain.mdlog");
        let primary = writer(&path);
        write_container(&primary, ROOT_CONTAINER_ID, ROOT_CONTAINER_ID, "");
        let mut quota = Container::new(2);
        quota.parent_id = ROOT_CONTAINER_ID;
        quota.name = "q".into();
        quota.set_quota_node(true);
        primary
            .append(RecordType::Update, &quota.to_bytes().unwrap())
            .unwrap();

        let store = ContainerStore::open(replica_config(&path)).unwrap();

        // Grandchild, child, then parent, all in one batch
        for (id, parent, name, file) in [(5, 6, "leaf", 50), (6, 7, "mid", 60), (7, 2, "top", 70)] {
            let mut container = Container::new(id);
            container.parent_id = parent;
            container.name = name.into();
            container.files.insert(file);
            primary
                .append(RecordType::Update, &container.to_bytes().unwrap())
                .unwrap();
        }

        store.start_following().unwrap();
        assert!(wait_until(|| store.path_of(5).as_deref() == Some("/q/top/mid/leaf")));
        store.stop_following();

        let node = store.quota_node(2).unwrap();
        assert_eq!(node.num_files(), 3);
        for file in [50, 60, 70] {
            assert!(node.files.contains_key(&file));
        }
        assert_eq!(store.quota_node_for(6), Some(2));
        assert_eq!(store.stats().follower_updates, 3);
    }

    #[test]
    fn test_stray_recreate_recorded_as_warning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stray.mdlog");
        let primary = writer(&path);
        write_container(&primary, ROOT_CONTAINER_ID, ROOT_CONTAINER_ID, "");
        write_container(&primary, 2, ROOT_CONTAINER_ID, "again");

        let store = ContainerStore::open(replica_config(&path)).unwrap();
        store.start_following().unwrap();

        primary.append(RecordType::Delete, &delete_payload(2)).unwrap();
        assert!(wait_until(|| store.get_container(2).is_err()));
        write_container(&primary, 2, ROOT_CONTAINER_ID, "again");
        assert!(wait_until(|| store.get_container(2).is_ok()));
        store.stop_following();

        assert!(
            store
                .warning_messages()
                .iter()
                .any(|w| w.contains("stray re-create of deleted container 2"))
        );
        let stats = store.stats();
        assert_eq!(stats.follower_deletions, 1);
        assert_eq!(stats.follower_updates, 1);
    }

    #[test]
    fn test_deletion_deferred_until_children_gone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("defer.mdlog");
        let primary = writer(&path);
        write_container(&primary, ROOT_CONTAINER_ID, ROOT_CONTAINER_ID, "");
        write_container(&primary, 2, ROOT_CONTAINER_ID, "parent");
        write_container(&primary, 3, 2, "child");

        let store = ContainerStore::open(replica_config(&path)).unwrap();
        store.start_following().unwrap();

        primary.append(RecordType::Delete, &delete_payload(2)).unwrap();
        assert!(wait_until(|| store.stats().deferred_deletions == 1));
        assert!(store.get_container(2).is_ok());

        primary.append(RecordType::Delete, &delete_payload(3)).unwrap();
        assert!(wait_until(|| store.get_container(2).is_err()));
        assert!(store.get_container(3).is_err());
        assert_eq!(store.stats().deferred_deletions, 0);
        store.stop_following();
    }

    #[test]
    fn test_torn_tail_waits_for_rest_of_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.mdlog");
        let primary = writer(&path);
        write_container(&primary, ROOT_CONTAINER_ID, ROOT_CONTAINER_ID, "");

        let store = ContainerStore::open(replica_config(&path)).unwrap();
        store.start_following().unwrap();

        let mut container = Container::new(7);
        container.parent_id = ROOT_CONTAINER_ID;
        container.name = "slow".into();
        let encoded =
            crate::changelog::encode_record(RecordType::Update, &container.to_bytes().unwrap());
        let (head, rest) = encoded.split_at(encoded.len() / 2);
        primary.append_raw(head).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(store.get_container(7).is_err());

        primary.append_raw(rest).unwrap();
        assert!(wait_until(|| store.get_container(7).is_ok()));
        assert_eq!(store.follow_offset(), primary.size());
        store.stop_following();
    }
}
