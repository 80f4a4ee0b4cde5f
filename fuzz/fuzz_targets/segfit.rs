#![no_main]

use brk_alloc_hater::SegFitSubject;
use heap_hater::{AllocatorOp, Evaluator};
use libfuzzer_sys::fuzz_target;

const CAPACITY: usize = 8 << 20;

fuzz_target!(|ops: Vec<AllocatorOp>| {
    let subject = match SegFitSubject::new(CAPACITY) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut evaluator = Evaluator::new(subject);
    evaluator.evaluate(ops).unwrap();
});
