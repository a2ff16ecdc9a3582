#![no_main]

use logsegment::batch::{MemoryRecords, RecordBatch};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(batch) = RecordBatch::from_bytes(data.to_vec()) {
        if batch.is_valid() {
            let _ = batch.records();
            let _ = batch.control_record_type();
        }
    }
    let records = MemoryRecords::from_bytes(data.to_vec());
    let _ = records.batch_headers();
    let _ = records.append_info();
});
