//! Shared helpers for the oxrcu benchmarks.

use oxrcu_core::RcuPtr;

/// A published record benchmarks read through.
pub struct Payload {
    pub value: u64,
}

/// Publish an initial payload and return the cell.
pub fn published_cell(value: u64) -> (RcuPtr<Payload>, *mut Payload) {
    let p = Box::into_raw(Box::new(Payload { value }));
    (RcuPtr::new(p), p)
}
