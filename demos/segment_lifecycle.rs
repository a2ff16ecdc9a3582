//! Walk a segment through its life: transactional appends, reads, a crash, recovery and
//! retirement.
//!
//! Run:
//! `cargo run --example segment_lifecycle`

use logsegment::batch::{ControlRecordType, MemoryRecords, RecordBatch, RecordBatchBuilder};
use logsegment::config::{RollParams, SegmentConfig};
use logsegment::epochcache::{CheckpointedLeaderEpochCache, LeaderEpochCache};
use logsegment::formats::DELETED_FILE_SUFFIX;
use logsegment::producerstate::{AppendOrigin, ProducerStateTracker};
use logsegment::segment::Segment;
use logsegment::storage::{Directory, FsDirectory};
use logsegment::time::{SystemTime, Time};
use std::sync::Arc;

const PARENT: &str = "orders-0";

fn append(
    seg: &mut Segment,
    tracker: &mut ProducerStateTracker,
    cache: &mut dyn LeaderEpochCache,
    batch: &RecordBatch,
) -> logsegment::LogResult<()> {
    let completed = tracker.update(batch, AppendOrigin::Client)?;
    let records = MemoryRecords::with_batches([batch]);
    seg.append(batch.last_offset(), batch.max_timestamp(), batch.last_offset(), &records, Some(cache))?;
    if let Some(completed) = completed {
        let lso = tracker.last_stable_offset(&completed);
        seg.update_txn_index(&completed, lso)?;
        tracker.complete_txn(&completed);
    }
    tracker.update_map_end_offset(batch.next_offset());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempfile::tempdir()?;
    let dir: Arc<dyn Directory> = Arc::new(FsDirectory::new(tmp.path())?);
    let time: Arc<dyn Time> = Arc::new(SystemTime::new());
    let config = SegmentConfig::default();
    let now = time.milliseconds();

    let mut seg = Segment::open(dir.clone(), PARENT, 0, &config, time.clone(), "")?;
    let mut tracker = ProducerStateTracker::new(dir.clone(), PARENT);
    let mut epochs =
        CheckpointedLeaderEpochCache::open(dir.clone(), format!("{PARENT}/leader-epoch-checkpoint"))?;

    // Producer 7 writes two records in a transaction, then aborts it.
    let mut b = RecordBatchBuilder::new(0);
    b.partition_leader_epoch(1)
        .producer(7, 0, 0)
        .transactional(true)
        .append(now, Some(b"order-1"), b"created")
        .append(now, Some(b"order-1"), b"paid");
    append(&mut seg, &mut tracker, &mut epochs, &b.build()?)?;
    let mut b = RecordBatchBuilder::new(2);
    b.partition_leader_epoch(1)
        .producer(7, 0, -1)
        .control_marker(ControlRecordType::Abort, now, 0);
    append(&mut seg, &mut tracker, &mut epochs, &b.build()?)?;

    // A plain write under a new leader epoch.
    let mut b = RecordBatchBuilder::new(3);
    b.partition_leader_epoch(2).append(now + 1, Some(b"order-2"), b"created");
    append(&mut seg, &mut tracker, &mut epochs, &b.build()?)?;

    if let Some(info) = seg.read(0, 64 * 1024, None, true)? {
        for batch in info.records.batches()? {
            println!(
                "batch {}..={} epoch={} control={}",
                batch.base_offset(),
                batch.last_offset(),
                batch.partition_leader_epoch(),
                batch.is_control_batch()
            );
        }
    }
    for txn in seg.txn_index().all_aborted_txns()? {
        println!(
            "aborted: producer={} offsets {}..={} lso={}",
            txn.producer_id, txn.first_offset, txn.last_offset, txn.last_stable_offset
        );
    }
    tracker.take_snapshot()?;

    // Simulate a crash and rebuild everything from the record store.
    seg.flush()?;
    drop(seg);
    let mut seg = Segment::open(dir.clone(), PARENT, 0, &config, time.clone(), "")?;
    let mut rebuilt = ProducerStateTracker::new(dir.clone(), PARENT);
    let truncated = seg.recover(&mut rebuilt, Some(&mut epochs))?;
    println!(
        "recovered: next offset {} truncated {truncated} bytes, epochs {:?}",
        seg.read_next_offset()?,
        epochs.entries()
    );

    let params = RollParams::new(&config, now + 1, 4, 100, time.milliseconds());
    println!("should roll: {}", seg.should_roll(&params)?);

    // Retire the segment.
    seg.on_became_inactive_segment()?;
    seg.change_file_suffixes("", DELETED_FILE_SUFFIX)?;
    seg.delete_if_exists()?;
    println!("files left: {:?}", dir.list_dir(PARENT)?);
    Ok(())
}
