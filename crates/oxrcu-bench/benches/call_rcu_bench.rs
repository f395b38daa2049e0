//! Submission-side cost of the deferred-callback service: enqueue onto
//! the default worker, and routing through the priority chain.

use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use oxrcu_core::{
    call_rcu, get_call_rcu_data, get_default_call_rcu_data, qsbr, RcuHead,
};

static FREED: AtomicUsize = AtomicUsize::new(0);

#[repr(C)]
struct BenchNode {
    head: RcuHead,
}

unsafe fn free_node(head: *mut RcuHead) {
    // SAFETY: head is the first field of a BenchNode from Box::into_raw.
    unsafe { drop(Box::from_raw(head as *mut BenchNode)) };
    FREED.fetch_add(1, Ordering::Relaxed);
}

fn bench_submission(c: &mut Criterion) {
    qsbr::rcu_register_thread();
    // Materialize the default worker outside the timed region.
    get_default_call_rcu_data();

    c.bench_function("call_rcu_submit", |b| {
        b.iter(|| {
            let node = Box::into_raw(Box::new(BenchNode {
                head: RcuHead::new(),
            }));
            // SAFETY: fresh node; the service owns it from here.
            unsafe { call_rcu(std::ptr::addr_of_mut!((*node).head), free_node) };
        });
        // Let the worker's grace periods progress past this thread
        // between sampling batches.
        qsbr::rcu_quiescent_state();
    });

    c.bench_function("worker_routing", |b| {
        b.iter(|| {
            qsbr::rcu_read_lock();
            let crd = black_box(get_call_rcu_data());
            qsbr::rcu_read_unlock();
            crd
        })
    });

    qsbr::rcu_unregister_thread();
}

criterion_group!(benches, bench_submission);
criterion_main!(benches);
