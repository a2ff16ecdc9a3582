#![no_main]

use logsegment::config::SegmentConfig;
use logsegment::producerstate::ProducerStateTracker;
use logsegment::segment::Segment;
use logsegment::storage::{Directory, MemoryDirectory};
use logsegment::time::{MockTime, Time};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let dir: Arc<dyn Directory> = MemoryDirectory::new().into();
    // Arbitrary bytes as the record store of a segment at base offset 0.
    if dir.atomic_write("f-0/00000000000000000000.log", data).is_err() {
        return;
    }
    let time: Arc<dyn Time> = Arc::new(MockTime::new(0));
    let Ok(mut seg) = Segment::open(dir.clone(), "f-0", 0, &SegmentConfig::default(), time, "")
    else {
        return;
    };
    let mut tracker = ProducerStateTracker::new(dir, "f-0");
    if seg.recover(&mut tracker, None).is_ok() {
        // Whatever survived must be a readable, index-consistent prefix.
        seg.sanity_check().unwrap();
        assert!(seg.size() <= data.len() as u64);
        let _ = seg.read(0, usize::MAX, None, true);
    }
});
