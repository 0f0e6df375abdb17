//! Container metadata store
//!
//! Boots the namespace from the change log, serves primary mutations and
//! runs the follower in replica mode. All state is reached through one
//! `StoreContext` shared with the follower thread and the compactor.
//!
//! Lock order: namespace, then the active log pointer, then the log writer
//! (taken inside `ChangeLog`).

use crate::changelog::{ChangeLog, LogOptions, OpenMode, RecordType};
use crate::compaction::{self, CompactionReport};
use crate::container::{Container, delete_payload};
use crate::follower::{self, Follower, FollowerProgress, FollowerState};
use crate::index::ContainerIndex;
use crate::listener::{Change, ChangeListener};
use crate::quota::{FileUsageSource, NoFileUsage, QuotaNode, QuotaRegistry};
use crate::scanner::{ScanOptions, scan_into_index};
use crate::tree::Namespace;
use dirlog_common::{ContainerId, Error, ROOT_CONTAINER_ID, Result, StoreConfig, StoreMode};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, info, warn};

/// State shared by the store, the follower and the compactor
pub(crate) struct StoreContext {
    pub(crate) config: StoreConfig,
    pub(crate) namespace: RwLock<Namespace>,
    /// Active change log, swapped by compaction and promotion
    pub(crate) log: RwLock<Arc<ChangeLog>>,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    warnings: Mutex<Vec<String>>,
    pub(crate) follower: FollowerProgress,
}

impl StoreContext {
    pub(crate) fn current_log(&self) -> Arc<ChangeLog> {
        Arc::clone(&self.log.read())
    }

    pub(crate) fn notify(&self, container: &Container, change: Change) {
        for listener in self.listeners.read().iter() {
            listener.container_changed(container, change);
        }
    }

    pub(crate) fn record_warning(&self, message: String) {
        warn!("{}", message);
        self.warnings.lock().push(message);
    }

    /// Write the live state of every dirty container
    fn persist_dirty(&self, ns: &mut Namespace, log: &ChangeLog) -> Result<usize> {
        let dirty = ns.take_dirty();
        for id in &dirty {
            persist_container(ns, log, *id)?;
        }
        Ok(dirty.len())
    }
}

fn persist_container(ns: &mut Namespace, log: &ChangeLog, id: ContainerId) -> Result<()> {
    let Some(container) = ns.index.get(id) else {
        return Ok(());
    };
    let offset = log.append(RecordType::Update, &container.to_bytes()?)?;
    ns.index.set_offset(id, offset);
    Ok(())
}

fn ensure_primary(ns: &Namespace) -> Result<()> {
    if ns.mode().is_replica() {
        return Err(Error::ReadOnly);
    }
    Ok(())
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub mode: StoreMode,
    /// Number of containers in the index
    pub containers: usize,
    /// Containers with a record in the log
    pub persisted: usize,
    /// Containers not linked into the tree
    pub unattached: usize,
    pub quota_nodes: usize,
    pub quarantined: u64,
    pub first_free_id: ContainerId,
    pub log_path: PathBuf,
    pub log_size: u64,
    pub log_compacted: bool,
    pub follower_state: FollowerState,
    pub follow_offset: u64,
    pub follower_commits: u64,
    /// Updates and deletions applied by the follower
    pub follower_updates: u64,
    pub follower_deletions: u64,
    pub deferred_deletions: usize,
    pub resync_required: bool,
    pub warnings: usize,
}

/// Change-log backed container metadata store
pub struct ContainerStore {
    ctx: Arc<StoreContext>,
    follower: Mutex<Option<Follower>>,
    /// Serializes compactions
    compaction_lock: Mutex<()>,
}

impl ContainerStore {
    /// Boot a store from its change log
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_usage(config, Arc::new(NoFileUsage))
    }

    /// Boot a store, sizing quota accounting with `usage`
    pub fn open_with_usage(config: StoreConfig, usage: Arc<dyn FileUsageSource>) -> Result<Self> {
        config.validate()?;
        let mode = config.mode();
        let started = Instant::now();
        info!(
            "Booting container store from {:?} ({})",
            config.changelog_path, mode
        );

        let open_mode = if mode.is_replica() {
            OpenMode::ReadOnly
        } else {
            OpenMode::Append
        };
        let log = ChangeLog::open(&config.changelog_path, open_mode, LogOptions::from(&config))?;

        let mut namespace = Namespace::new(mode, QuotaRegistry::new(usage));
        let outcome = scan_into_index(
            &log,
            log.first_record_offset(),
            &mut namespace.index,
            ScanOptions {
                mode,
                auto_repair: config.auto_repair,
                progress_interval: config.progress_interval,
            },
        )?;
        if let Some(offset) = outcome.repair_offset {
            if !mode.is_replica() {
                log.truncate(offset)?;
            }
        }

        let phase = Instant::now();
        let loaded = load_containers(&log, &mut namespace.index, config.boot_threads)?;
        info!(
            "Loaded {} containers in {:.1}s",
            loaded,
            phase.elapsed().as_secs_f64()
        );

        let phase = Instant::now();
        namespace.reserve_ids_through(outcome.max_id);
        let created_root = namespace.ensure_root();
        let quarantined = namespace.attach_and_quarantine();
        namespace.rebuild_quota();
        info!(
            "Attached tree in {:.1}s: {} containers, {} quarantine changes, {} quota nodes",
            phase.elapsed().as_secs_f64(),
            namespace.index.len(),
            quarantined.len(),
            namespace.quota.len()
        );

        if created_root && !mode.is_replica() {
            persist_container(&mut namespace, &log, ROOT_CONTAINER_ID)?;
            info!("Created root container");
        }

        let follower = FollowerProgress::default();
        follower.offset.store(outcome.next_offset, Ordering::Release);
        if let Some(stamp) = outcome.stamp {
            info!(
                "Log compacted at {} ({} records), following from offset {}",
                stamp.compacted_at_ms, stamp.records_copied, outcome.next_offset
            );
        }

        let ctx = Arc::new(StoreContext {
            config,
            namespace: RwLock::new(namespace),
            log: RwLock::new(Arc::new(log)),
            listeners: RwLock::new(Vec::new()),
            warnings: Mutex::new(outcome.warnings),
            follower,
        });

        if !mode.is_replica() {
            let mut ns = ctx.namespace.write();
            let log = ctx.current_log();
            let persisted = ctx.persist_dirty(&mut ns, &log)?;
            if persisted > 0 {
                info!("Persisted {} quarantined containers", persisted);
            }
        }

        info!(
            "Container store ready in {:.1}s",
            started.elapsed().as_secs_f64()
        );

        Ok(Self {
            ctx,
            follower: Mutex::new(None),
            compaction_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn mode(&self) -> StoreMode {
        self.ctx.namespace.read().mode()
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.ctx.config
    }

    /// Create a container in memory
    ///
    /// Nothing is written until the first `update`. The container is linked
    /// into the tree once an update gives it a parent.
    pub fn create(&self, id_hint: Option<ContainerId>) -> Result<Container> {
        let mut ns = self.ctx.namespace.write();
        ensure_primary(&ns)?;

        let id = match id_hint {
            Some(0) => return Err(Error::invalid_state("container id 0 is reserved")),
            Some(id) if ns.index.contains(id) => return Err(Error::AlreadyExists(id)),
            Some(id) => {
                ns.reserve_ids_through(id);
                id
            }
            None => ns.allocate_id(),
        };

        let container = Container::new(id);
        ns.index.insert(container.clone(), 0);
        debug!("Created container {}", id);
        self.ctx.notify(&container, Change::Created);
        Ok(container)
    }

    /// Persist a new state of an existing container
    pub fn update(&self, container: &Container) -> Result<()> {
        let mut ns = self.ctx.namespace.write();
        ensure_primary(&ns)?;
        if !ns.index.contains(container.id) {
            return Err(Error::NotFound(container.id));
        }

        let log = self.ctx.current_log();
        let offset = log.append(RecordType::Update, &container.to_bytes()?)?;
        ns.apply_update(container.clone(), offset);
        self.ctx.persist_dirty(&mut ns, &log)?;

        if let Some(live) = ns.index.get(container.id) {
            self.ctx.notify(live, Change::Updated);
        }
        Ok(())
    }

    /// Delete a container, returning its last state
    pub fn remove(&self, id: ContainerId) -> Result<Container> {
        let mut ns = self.ctx.namespace.write();
        ensure_primary(&ns)?;
        if !ns.index.contains(id) {
            return Err(Error::NotFound(id));
        }

        self.ctx
            .current_log()
            .append(RecordType::Delete, &delete_payload(id))?;
        let removed = ns.apply_remove(id).ok_or(Error::NotFound(id))?;
        debug!("Removed container {} ({:?})", id, removed.name);
        self.ctx.notify(&removed, Change::Deleted);
        Ok(removed)
    }

    /// Copy of a container
    pub fn get_container(&self, id: ContainerId) -> Result<Container> {
        self.ctx
            .namespace
            .read()
            .index
            .get(id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    /// Child containers linked under `id`, by name
    pub fn children(&self, id: ContainerId) -> Result<Vec<(String, ContainerId)>> {
        let ns = self.ctx.namespace.read();
        if !ns.index.contains(id) {
            return Err(Error::NotFound(id));
        }
        Ok(ns.children(id))
    }

    /// Absolute path of a linked container
    #[must_use]
    pub fn path_of(&self, id: ContainerId) -> Option<String> {
        self.ctx.namespace.read().path_of(id)
    }

    /// Offset of the last record written for `id`, 0 when not persisted
    #[must_use]
    pub fn log_offset(&self, id: ContainerId) -> Option<u64> {
        self.ctx.namespace.read().index.offset(id)
    }

    /// Accounting of the quota node `id`
    #[must_use]
    pub fn quota_node(&self, id: ContainerId) -> Option<QuotaNode> {
        self.ctx.namespace.read().quota.get(id).cloned()
    }

    /// Quota node `id` is accounted to
    #[must_use]
    pub fn quota_node_for(&self, id: ContainerId) -> Option<ContainerId> {
        QuotaRegistry::nearest_quota_node(&self.ctx.namespace.read().index, id)
    }

    /// Replace the file usage source and recompute quota accounting
    pub fn set_file_usage_source(&self, usage: Arc<dyn FileUsageSource>) {
        self.ctx.namespace.write().set_usage_source(usage);
    }

    #[must_use]
    pub fn num_containers(&self) -> usize {
        self.ctx.namespace.read().index.len()
    }

    #[must_use]
    pub fn first_free_id(&self) -> ContainerId {
        self.ctx.namespace.read().first_free_id()
    }

    pub fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.ctx.listeners.write().push(listener);
    }

    /// Warnings recorded since boot or the last clear
    #[must_use]
    pub fn warning_messages(&self) -> Vec<String> {
        self.ctx.warnings.lock().clone()
    }

    pub fn clear_warning_messages(&self) {
        self.ctx.warnings.lock().clear();
    }

    /// Start tailing the log (replica mode)
    pub fn start_following(&self) -> Result<()> {
        if !self.mode().is_replica() {
            return Err(Error::invalid_state("only a replica follows the change log"));
        }
        if self.ctx.follower.resync_required.load(Ordering::Acquire) {
            return Err(Error::invalid_state(
                "followed change log was replaced, reboot the replica",
            ));
        }

        let mut follower = self.follower.lock();
        if follower.as_ref().is_some_and(Follower::is_running) {
            return Ok(());
        }
        if let Some(finished) = follower.take() {
            finished.stop();
        }
        *follower = Some(Follower::spawn(Arc::clone(&self.ctx))?);
        Ok(())
    }

    /// Stop the follower thread, waiting for it to exit
    pub fn stop_following(&self) {
        if let Some(follower) = self.follower.lock().take() {
            follower.stop();
        }
    }

    #[must_use]
    pub fn follower_state(&self) -> FollowerState {
        if self
            .follower
            .lock()
            .as_ref()
            .is_some_and(Follower::is_running)
        {
            FollowerState::Following
        } else {
            FollowerState::Stopped
        }
    }

    /// Offset of the next record the follower reads
    #[must_use]
    pub fn follow_offset(&self) -> u64 {
        self.ctx.follower.offset()
    }

    /// Promote a replica to primary
    ///
    /// Stops following, applies what is left in the log, keeps a copy at
    /// `<old path>.failover` when configured and moves the log to
    /// `new_path`, where it is reopened for appending. Containers that only
    /// exist in replica memory (synthetic root, quarantine) are persisted.
    pub fn slave_to_master(&self, new_path: impl AsRef<Path>) -> Result<()> {
        let new_path = new_path.as_ref().to_path_buf();
        self.stop_following();

        let mut ns = self.ctx.namespace.write();
        if !ns.mode().is_replica() {
            return Err(Error::invalid_state("store is already primary"));
        }
        drop(ns);

        let followed = self.ctx.current_log();
        let end = follower::catch_up(&self.ctx, &followed)?;

        ns = self.ctx.namespace.write();
        let mut active = self.ctx.log.write();
        let old_path = active.path();

        if self.ctx.config.keep_failover_copy {
            let copy = failover_path(&old_path);
            std::fs::copy(&old_path, &copy)?;
            info!("Kept failover copy of the change log at {:?}", copy);
        }
        if new_path != old_path {
            if let Err(e) = std::fs::rename(&old_path, &new_path) {
                debug!("Rename to {:?} failed ({}), copying instead", new_path, e);
                std::fs::copy(&old_path, &new_path)?;
            }
        }

        let log = ChangeLog::open(&new_path, OpenMode::Append, LogOptions::from(&self.ctx.config))?;
        if log.size() > end {
            self.ctx.record_warning(format!(
                "promotion: dropped incomplete record at offset {end} of {}",
                new_path.display()
            ));
            log.truncate(end)?;
        }

        ns.set_mode(StoreMode::Primary);
        let unpersisted: Vec<_> = ns
            .index
            .iter()
            .filter(|(_, entry)| !entry.is_persisted() && entry.attached)
            .map(|(id, _)| id)
            .collect();
        for id in &unpersisted {
            persist_container(&mut ns, &log, *id)?;
        }
        let dirty = self.ctx.persist_dirty(&mut ns, &log)?;
        let deferred = self.ctx.follower.deferred.lock().len();
        if deferred > 0 {
            self.ctx.record_warning(format!(
                "promotion: {deferred} replicated deletions still waiting for children"
            ));
        }

        *active = Arc::new(log);
        info!(
            "Promoted to primary on {:?}: persisted {} replica-only and {} quarantined containers",
            new_path,
            unpersisted.len(),
            dirty
        );
        Ok(())
    }

    /// Rewrite the log keeping only the latest record per container
    pub fn compact(&self) -> Result<CompactionReport> {
        let _guard = self.compaction_lock.lock();
        compaction::compact(&self.ctx)
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        // Before the namespace lock, a stopping follower may still need it
        let follower_state = self.follower_state();
        let ns = self.ctx.namespace.read();
        let log = self.ctx.current_log();
        StoreStats {
            mode: ns.mode(),
            containers: ns.index.len(),
            persisted: ns.index.iter().filter(|(_, e)| e.is_persisted()).count(),
            unattached: ns.index.iter().filter(|(_, e)| !e.attached).count(),
            quota_nodes: ns.quota.len(),
            quarantined: ns.quarantined(),
            first_free_id: ns.first_free_id(),
            log_path: log.path(),
            log_size: log.size(),
            log_compacted: log.is_compacted(),
            follower_state,
            follow_offset: self.ctx.follower.offset(),
            follower_commits: self.ctx.follower.commits.load(Ordering::Relaxed),
            follower_updates: self.ctx.follower.applied_updates.load(Ordering::Relaxed),
            follower_deletions: self.ctx.follower.applied_deletions.load(Ordering::Relaxed),
            deferred_deletions: self.ctx.follower.deferred.lock().len(),
            resync_required: self.ctx.follower.resync_required.load(Ordering::Acquire),
            warnings: self.ctx.warnings.lock().len(),
        }
    }

    /// Flush the log to disk
    pub fn sync(&self) -> Result<()> {
        self.ctx.current_log().sync()
    }
}

impl Drop for ContainerStore {
    fn drop(&mut self) {
        self.stop_following();
        if let Err(e) = self.sync() {
            warn!("Failed to sync change log on shutdown: {}", e);
        }
    }
}

/// `<path>.failover`
fn failover_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".failover");
    PathBuf::from(name)
}

/// Deserialize every container the scan registered, in parallel
fn load_containers(log: &ChangeLog, index: &mut ContainerIndex, threads: usize) -> Result<usize> {
    let pending = index.unloaded();
    if pending.is_empty() {
        return Ok(0);
    }
    let chunk_size = pending.len().div_ceil(threads.max(1));

    let batches: Vec<Result<Vec<Container>>> = std::thread::scope(|scope| {
        let workers: Vec<_> = pending
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|&(id, offset)| load_container(log, id, offset))
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker
                    .join()
                    .unwrap_or_else(|_| Err(Error::invalid_state("boot loader thread panicked")))
            })
            .collect()
    });

    let mut loaded = 0;
    for batch in batches {
        for container in batch? {
            let offset = index.offset(container.id).unwrap_or(0);
            index.insert(container, offset);
            loaded += 1;
        }
    }
    Ok(loaded)
}

fn load_container(log: &ChangeLog, id: ContainerId, offset: u64) -> Result<Container> {
    let record = log.read_record(offset)?;
    let container = Container::from_bytes(&record.payload)
        .map_err(|e| Error::corrupt(offset, e.to_string()))?;
    if container.id != id {
        return Err(Error::corrupt(
            offset,
            format!("record holds container {} instead of {}", container.id, id),
        ));
    }
    Ok(container)
}
