//! Change log scanner
//!
//! Replays update and delete records into the container index. Update
//! records only register their offset, the containers themselves are
//! loaded afterwards (see `store::load_containers`).

use crate::changelog::{ChangeLog, CompactionStamp, RecordType, ScanControl, ScanTail};
use crate::container::{parse_delete_payload, peek_id};
use crate::index::ContainerIndex;
use dirlog_common::{ContainerId, Error, Result, StoreMode};
use std::time::Instant;
use tracing::{info, warn};

/// Scanner options
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub mode: StoreMode,
    /// Stop at the last valid record instead of failing on corruption
    pub auto_repair: bool,
    /// Log progress every this many records, 0 disables
    pub progress_interval: u64,
}

/// Where a scan left off
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Offset of the first record not applied
    pub next_offset: u64,
    pub records: u64,
    pub updates: u64,
    pub deletes: u64,
    /// Largest id seen in an update record
    pub max_id: ContainerId,
    /// Set when a replica stopped at a compaction stamp
    pub stamp: Option<CompactionStamp>,
    /// Offset the log must be cut at, when auto-repair kicked in
    pub repair_offset: Option<u64>,
    pub warnings: Vec<String>,
}

/// Rebuild index offsets from `log`, starting at `from`
pub fn scan_into_index(
    log: &ChangeLog,
    from: u64,
    index: &mut ContainerIndex,
    options: ScanOptions,
) -> Result<ScanOutcome> {
    let started = Instant::now();
    let total_bytes = log.size();
    let mut outcome = ScanOutcome::default();
    let mut failure: Option<Error> = None;

    let summary = log.scan(from, None, |record| {
        outcome.records += 1;
        if options.progress_interval > 0 && outcome.records % options.progress_interval == 0 {
            info!(
                "Scanned {} records ({} of {} bytes, {:.1}s)",
                outcome.records,
                record.offset,
                total_bytes,
                started.elapsed().as_secs_f64()
            );
        }

        let applied = match record.record_type {
            RecordType::Update => peek_id(&record.payload).map(|id| {
                index.record_offset(id, record.offset);
                outcome.max_id = outcome.max_id.max(id);
                outcome.updates += 1;
            }),
            RecordType::Delete => parse_delete_payload(&record.payload).map(|id| {
                index.erase(id);
                outcome.deletes += 1;
            }),
            RecordType::CompactionStamp => {
                // Advisory for a primary, a replica hands over to the follower here
                if options.mode.is_replica() {
                    outcome.stamp = CompactionStamp::from_bytes(&record.payload);
                    return Ok(ScanControl::Stop);
                }
                Ok(())
            }
        };

        match applied {
            Ok(()) => Ok(ScanControl::Continue),
            Err(e) => {
                // Undecodable payload behind a valid checksum
                failure = Some(Error::corrupt(record.offset, e.to_string()));
                outcome.records -= 1;
                Ok(ScanControl::Stop)
            }
        }
    })?;

    outcome.next_offset = summary.next_offset;

    let bad_tail = match (failure, summary.tail) {
        (Some(error), _) => {
            // The record that failed to apply was counted as consumed by the scan
            let offset = match &error {
                Error::CorruptRecord { offset, .. } => *offset,
                _ => summary.next_offset,
            };
            outcome.next_offset = offset;
            Some((offset, error))
        }
        (None, ScanTail::Clean | ScanTail::Stopped) => None,
        (None, ScanTail::Truncated { offset }) => {
            if options.mode.is_replica() {
                // The primary may be in the middle of an append
                None
            } else {
                Some((offset, Error::corrupt(offset, "truncated record at end of log")))
            }
        }
        (None, ScanTail::Corrupt { offset, error }) => Some((offset, error)),
    };

    if let Some((offset, error)) = bad_tail {
        if !options.auto_repair {
            return Err(error);
        }
        let message = format!("auto-repair: log cut at offset {offset} ({error})");
        warn!("{}", message);
        outcome.warnings.push(message);
        outcome.repair_offset = Some(offset);
    }

    info!(
        "Scan finished: {} records ({} updates, {} deletes) in {:.1}s, next offset {}",
        outcome.records,
        outcome.updates,
        outcome.deletes,
        started.elapsed().as_secs_f64(),
        outcome.next_offset
    );

    Ok(outcome)
}
