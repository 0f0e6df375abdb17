//! Online log compaction
//!
//! Writes a new log holding only the latest record of every persisted
//! container, then swaps it in for the active log. Mutations keep running
//! while the bulk copy happens; only preparation and the final swap hold
//! the namespace write lock.
//!
//! 1. Prepare: create `<path>.compact`, remember the old log size as the
//!    watermark and snapshot the persisted `(offset, id)` pairs
//! 2. Copy: copy the snapshot records verbatim, in log order
//! 3. Catch up: copy everything appended past the watermark, once without
//!    the lock and once more under it
//! 4. Commit: verify every persisted index offset is accounted for, stamp,
//!    sync, rename onto the active path and remap the index offsets
//!
//! Any error before the commit removes the new file and leaves the active
//! log untouched.

use crate::changelog::{
    ChangeLog, CompactionStamp, FLAG_COMPACTED, LogOptions, OpenMode, RecordType, ScanControl,
    ScanTail, encode_record,
};
use crate::container::{now_millis, parse_delete_payload, peek_id};
use crate::store::StoreContext;
use dirlog_common::{ContainerId, Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Summary of a finished compaction
#[derive(Debug, Clone, Serialize)]
pub struct CompactionReport {
    pub path: PathBuf,
    /// Records copied from the snapshot
    pub records_copied: u64,
    /// Records copied while catching up with concurrent writes
    pub catch_up_records: u64,
    pub old_size: u64,
    pub new_size: u64,
    pub elapsed: Duration,
}

/// `(old offset, new offset)` of the latest copied update per container
type OffsetMap = HashMap<ContainerId, (u64, u64)>;

/// Work file next to the active log
fn compact_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".compact");
    PathBuf::from(name)
}

pub(crate) fn compact(ctx: &StoreContext) -> Result<CompactionReport> {
    let started = Instant::now();

    // Prepare
    let (old, target, new, watermark, mut snapshot) = {
        let ns = ctx.namespace.write();
        if ns.mode().is_replica() {
            return Err(Error::ReadOnly);
        }
        let old = ctx.current_log();
        let target = compact_path(&old.path());
        let new = ChangeLog::open(
            &target,
            OpenMode::CreateNew {
                flags: FLAG_COMPACTED,
            },
            LogOptions {
                sync_on_write: false,
                write_buffer_size: ctx.config.write_buffer_size,
            },
        )?;
        let watermark = old.size();
        (old, target, new, watermark, ns.index.persisted_offsets())
    };
    info!(
        "Compacting {:?}: {} live records below offset {}",
        old.path(),
        snapshot.len(),
        watermark
    );

    let result = copy_and_commit(ctx, &old, new, &target, watermark, &mut snapshot, started);
    if let Err(e) = &result {
        warn!("Compaction aborted: {}", e);
        if let Err(remove) = std::fs::remove_file(&target) {
            if remove.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {:?}: {}", target, remove);
            }
        }
    }
    result
}

fn copy_and_commit(
    ctx: &StoreContext,
    old: &Arc<ChangeLog>,
    new: ChangeLog,
    target: &Path,
    watermark: u64,
    snapshot: &mut [(u64, ContainerId)],
    started: Instant,
) -> Result<CompactionReport> {
    // Copy
    snapshot.sort_unstable();
    let mut copied = OffsetMap::with_capacity(snapshot.len());
    for &(offset, id) in snapshot.iter() {
        let raw = old.read_raw(offset)?;
        let new_offset = new.append_raw(&raw)?;
        copied.insert(id, (offset, new_offset));
    }
    let records_copied = snapshot.len() as u64;
    debug!("Copied {} records", records_copied);

    // Catch up without the lock
    let mut caught_up = OffsetMap::new();
    let (mut next, mut catch_up_records) =
        catch_up(old, &new, watermark, &mut copied, &mut caught_up)?;

    // Commit
    let mut ns = ctx.namespace.write();
    let mut active = ctx.log.write();
    if !Arc::ptr_eq(&*active, old) {
        return Err(Error::invalid_state("active change log changed during compaction"));
    }

    let (tail_next, tail_records) = catch_up(old, &new, next, &mut copied, &mut caught_up)?;
    next = tail_next;
    catch_up_records += tail_records;
    debug!(
        "Caught up {} records, old log ends at {}",
        catch_up_records, next
    );

    let mut remaps = Vec::with_capacity(ns.index.len());
    for (id, entry) in ns.index.iter() {
        if !entry.is_persisted() {
            continue;
        }
        let Some(&(old_offset, new_offset)) = caught_up.get(&id).or_else(|| copied.get(&id))
        else {
            return Err(Error::CompactionConsistency {
                id,
                expected: 0,
                actual: entry.log_offset,
            });
        };
        if old_offset != entry.log_offset {
            return Err(Error::CompactionConsistency {
                id,
                expected: old_offset,
                actual: entry.log_offset,
            });
        }
        remaps.push((id, new_offset));
    }

    new.append_compaction_stamp(CompactionStamp {
        compacted_at_ms: now_millis(),
        records_copied: records_copied + catch_up_records,
    })?;
    new.sync()?;
    drop(new);

    // Reopen with the configured write options before the rename, which is
    // the last step that can fail
    let reopened = ChangeLog::open(target, OpenMode::Append, LogOptions::from(&ctx.config))?;
    let final_path = old.path();
    reopened.rename_to(&final_path)?;

    let new_size = reopened.size();
    *active = Arc::new(reopened);
    for (id, offset) in remaps {
        ns.index.set_offset(id, offset);
    }

    let report = CompactionReport {
        path: final_path,
        records_copied,
        catch_up_records,
        old_size: next,
        new_size,
        elapsed: started.elapsed(),
    };
    info!(
        "Compacted {:?}: {} -> {} bytes, {} + {} records in {:.1}s",
        report.path,
        report.old_size,
        report.new_size,
        report.records_copied,
        report.catch_up_records,
        report.elapsed.as_secs_f64()
    );
    Ok(report)
}

/// Copy records of `old` from `from` to its current end into `new`
///
/// Returns the end of the copied range and the number of records copied.
fn catch_up(
    old: &ChangeLog,
    new: &ChangeLog,
    from: u64,
    copied: &mut OffsetMap,
    caught_up: &mut OffsetMap,
) -> Result<(u64, u64)> {
    let mut records = 0u64;
    let mut failure = None;

    let summary = old.scan(from, Some(old.size()), |record| {
        let id = match record.record_type {
            RecordType::Update => peek_id(&record.payload),
            RecordType::Delete => parse_delete_payload(&record.payload),
            RecordType::CompactionStamp => return Ok(ScanControl::Continue),
        };
        let id = match id {
            Ok(id) => id,
            Err(e) => {
                failure = Some(Error::corrupt(record.offset, e.to_string()));
                return Ok(ScanControl::Stop);
            }
        };

        let new_offset = new.append_raw(&encode_record(record.record_type, &record.payload))?;
        records += 1;
        if record.record_type == RecordType::Update {
            caught_up.insert(id, (record.offset, new_offset));
        } else {
            caught_up.remove(&id);
            copied.remove(&id);
        }
        Ok(ScanControl::Continue)
    })?;

    if let Some(error) = failure {
        return Err(error);
    }
    match summary.tail {
        ScanTail::Clean | ScanTail::Stopped => Ok((summary.next_offset, records)),
        ScanTail::Truncated { offset } => Err(Error::corrupt(offset, "truncated record in active log")),
        ScanTail::Corrupt { error, .. } => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use crate::changelog::{ChangeLog, LogOptions, OpenMode, RecordType, ScanControl};
    use crate::container::Container;
    use crate::store::ContainerStore;
    use dirlog_common::{ContainerId, ROOT_CONTAINER_ID, StoreConfig};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn config(path: &Path) -> StoreConfig {
        let mut config = StoreConfig::with_changelog(path);
        config.sync_on_write = false;
        config.boot_threads = 2;
        config
    }

    fn make(store: &ContainerStore, parent: ContainerId, name: &str) -> Container {
        let mut container = store.create(None).unwrap();
        container.parent_id = parent;
        container.name = name.into();
        store.update(&container).unwrap();
        container
    }

    fn view(store: &ContainerStore) -> BTreeMap<ContainerId, (Option<String>, Vec<(String, ContainerId)>)> {
        let mut ids = vec![ROOT_CONTAINER_ID];
        let mut out = BTreeMap::new();
        while let Some(id) = ids.pop() {
            let children = store.children(id).unwrap();
            ids.extend(children.iter().map(|(_, child)| *child));
            out.insert(id, (store.path_of(id), children));
        }
        out
    }

    /// Containers named `name` in any update record of the log
    fn records_named(path: &Path, name: &str) -> usize {
        let log = ChangeLog::open(path, OpenMode::ReadOnly, LogOptions::default()).unwrap();
        let mut count = 0;
        log.scan(0, None, |record| {
            if record.record_type == RecordType::Update
                && Container::from_bytes(&record.payload).unwrap().name == name
            {
                count += 1;
            }
            Ok(ScanControl::Continue)
        })
        .unwrap();
        count
    }

    #[test]
    fn test_compaction_preserves_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.mdlog");
        let mut rng = StdRng::seed_from_u64(42);
        let store = ContainerStore::open(config(&path)).unwrap();

        let mut ids = vec![ROOT_CONTAINER_ID];
        for i in 0..200 {
            let parent = ids[rng.gen_range(0..ids.len())];
            ids.push(make(&store, parent, &format!("d{i}")).id);
        }
        for i in 0..300 {
            let id = ids[rng.gen_range(1..ids.len())];
            let mut c = store.get_container(id).unwrap();
            c.attributes.insert("rev".into(), i.to_string());
            store.update(&c).unwrap();
        }
        let before = view(&store);
        let size_before = store.stats().log_size;

        let report = store.compact().unwrap();
        assert_eq!(report.records_copied, ids.len() as u64);
        assert_eq!(report.catch_up_records, 0);
        assert!(report.new_size < size_before);
        assert!(store.stats().log_compacted);
        assert_eq!(view(&store), before);

        // The swapped log takes appends, offsets point into it
        let late = make(&store, ROOT_CONTAINER_ID, "late");
        drop(store);

        let store = ContainerStore::open(config(&path)).unwrap();
        let mut expected = before;
        let root_children = &mut expected.get_mut(&ROOT_CONTAINER_ID).unwrap().1;
        root_children.push(("late".into(), late.id));
        root_children.sort();
        expected.insert(late.id, (Some("/late".into()), vec![]));
        assert_eq!(view(&store), expected);
        assert!(!dir.path().join("c.mdlog.compact").exists());
    }

    #[test]
    fn test_rename_then_compact_drops_old_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.mdlog");
        let store = ContainerStore::open(config(&path)).unwrap();

        let mut c = make(&store, ROOT_CONTAINER_ID, "a");
        c.name = "b".into();
        store.update(&c).unwrap();
        assert_eq!(records_named(&path, "a"), 1);

        store.compact().unwrap();
        drop(store);

        assert_eq!(records_named(&path, "a"), 0);
        assert_eq!(records_named(&path, "b"), 1);
        let store = ContainerStore::open(config(&path)).unwrap();
        assert_eq!(store.path_of(c.id).as_deref(), Some("/b"));
        assert_eq!(store.children(ROOT_CONTAINER_ID).unwrap().len(), 1);
    }

    #[test]
    fn test_compaction_drops_deleted_containers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.mdlog");
        let store = ContainerStore::open(config(&path)).unwrap();
        let gone = make(&store, ROOT_CONTAINER_ID, "gone");
        store.remove(gone.id).unwrap();
        let kept = make(&store, ROOT_CONTAINER_ID, "kept");

        store.compact().unwrap();
        drop(store);

        let store = ContainerStore::open(config(&path)).unwrap();
        assert!(store.get_container(gone.id).is_err());
        assert!(store.get_container(kept.id).is_ok());
    }

    #[test]
    fn test_compaction_with_concurrent_writers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.mdlog");
        let store = Arc::new(ContainerStore::open(config(&path)).unwrap());
        let base: Vec<_> = (0..300)
            .map(|i| make(&store, ROOT_CONTAINER_ID, &format!("base{i}")).id)
            .collect();

        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut created = Vec::new();
                for i in 0..200 {
                    created.push(make(&store, ROOT_CONTAINER_ID, &format!("w{i}")).id);
                    let mut c = store.get_container(base[i % base.len()]).unwrap();
                    c.attributes.insert("w".into(), i.to_string());
                    store.update(&c).unwrap();
                    if i % 7 == 0 {
                        store.remove(created.remove(0)).unwrap();
                    }
                }
                created
            })
        };

        for _ in 0..3 {
            store.compact().unwrap();
        }
        let created = writer.join().unwrap();
        store.compact().unwrap();

        let before = view(&store);
        let total = store.num_containers();
        drop(Arc::try_unwrap(store).ok().unwrap());

        let store = ContainerStore::open(config(&path)).unwrap();
        assert_eq!(view(&store), before);
        assert_eq!(store.num_containers(), total);
        for id in created {
            assert!(store.get_container(id).is_ok());
        }
    }

    #[test]
    fn test_failed_compaction_leaves_log_untouched() {
        use std::os::unix::fs::FileExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("c.mdlog");
        let store = ContainerStore::open(config(&path)).unwrap();
        let damaged = make(&store, ROOT_CONTAINER_ID, "damaged");
        let mut intact = make(&store, ROOT_CONTAINER_ID, "intact");
        let offsets: Vec<_> = [ROOT_CONTAINER_ID, damaged.id, intact.id]
            .iter()
            .map(|id| store.log_offset(*id))
            .collect();
        let size_before = store.stats().log_size;

        // Flip a payload byte so the checksum no longer matches
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let at = offsets[1].unwrap() + 9;
        let mut byte = [0u8; 1];
        std::fs::File::open(&path)
            .unwrap()
            .read_exact_at(&mut byte, at)
            .unwrap();
        file.write_all_at(&[byte[0] ^ 0xff], at).unwrap();
        drop(file);

        assert!(store.compact().is_err());
        assert!(!dir.path().join("c.mdlog.compact").exists());
        let after: Vec<_> = [ROOT_CONTAINER_ID, damaged.id, intact.id]
            .iter()
            .map(|id| store.log_offset(*id))
            .collect();
        assert_eq!(after, offsets);
        let stats = store.stats();
        assert!(!stats.log_compacted);
        assert_eq!(stats.log_size, size_before);
        assert_eq!(stats.log_path, path);

        // Still writable
        intact.attributes.insert("after".into(), "abort".into());
        store.update(&intact).unwrap();
        assert_eq!(store.log_offset(intact.id), Some(size_before));
        assert_eq!(
            store.get_container(intact.id).unwrap().attributes["after"],
            "abort"
        );
    }

    #[test]
    fn test_compaction_refused_on_replica() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.mdlog");
        drop(ContainerStore::open(config(&path)).unwrap());

        let mut replica = config(&path);
        replica.slave_mode = true;
        let store = ContainerStore::open(replica).unwrap();
        assert!(matches!(
            store.compact(),
            Err(dirlog_common::Error::ReadOnly)
        ));
    }
}
