#![no_main]

use logsegment::epochcache::CheckpointedLeaderEpochCache;
use logsegment::producerstate::ProducerStateTracker;
use logsegment::storage::{Directory, MemoryDirectory};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
    dir.atomic_write("p-0/leader-epoch-checkpoint", data).ok();
    let _ = CheckpointedLeaderEpochCache::open(dir.clone(), "p-0/leader-epoch-checkpoint");

    // Unreadable producer snapshots are discarded rather than loaded.
    dir.atomic_write("p-0/00000000000000000010.snapshot", data).ok();
    let mut tracker = ProducerStateTracker::new(dir, "p-0");
    let _ = tracker.load_snapshot_at_or_before(10);
});
