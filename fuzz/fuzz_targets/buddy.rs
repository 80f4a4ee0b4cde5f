#![no_main]

use brk_alloc_hater::BuddySubject;
use heap_hater::{AllocatorOp, Evaluator};
use libfuzzer_sys::fuzz_target;

const CAPACITY: usize = 8 << 20;

fuzz_target!(|ops: Vec<AllocatorOp>| {
    let subject = match BuddySubject::new(CAPACITY) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut evaluator = Evaluator::new(subject);
    evaluator.evaluate(ops).unwrap();
});
