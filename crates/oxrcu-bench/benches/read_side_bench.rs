//! Read-side cost of both flavors: QSBR lock/unlock (should be ~free),
//! quiescent-state announcement, BP lock/unlock, and a protected
//! pointer dereference.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use oxrcu_bench::published_cell;
use oxrcu_core::{bp, qsbr};

fn bench_qsbr_read_side(c: &mut Criterion) {
    qsbr::rcu_register_thread();
    let (cell, raw) = published_cell(42);

    c.bench_function("qsbr_read_lock_unlock", |b| {
        b.iter(|| {
            qsbr::rcu_read_lock();
            black_box(());
            qsbr::rcu_read_unlock();
        })
    });

    c.bench_function("qsbr_protected_dereference", |b| {
        b.iter(|| {
            qsbr::rcu_read_lock();
            let p = cell.dereference();
            // SAFETY: published payload, no writer in this benchmark.
            let v = unsafe { (*p).value };
            qsbr::rcu_read_unlock();
            black_box(v)
        })
    });

    c.bench_function("qsbr_quiescent_state", |b| {
        b.iter(qsbr::rcu_quiescent_state)
    });

    qsbr::rcu_unregister_thread();
    // SAFETY: no readers left.
    unsafe { drop(Box::from_raw(raw)) };
}

fn bench_bp_read_side(c: &mut Criterion) {
    let (cell, raw) = published_cell(42);

    c.bench_function("bp_read_lock_unlock", |b| {
        b.iter(|| {
            bp::rcu_read_lock();
            black_box(());
            bp::rcu_read_unlock();
        })
    });

    c.bench_function("bp_protected_dereference", |b| {
        b.iter(|| {
            bp::rcu_read_lock();
            let p = cell.dereference();
            // SAFETY: published payload, no writer in this benchmark.
            let v = unsafe { (*p).value };
            bp::rcu_read_unlock();
            black_box(v)
        })
    });

    // SAFETY: no readers left.
    unsafe { drop(Box::from_raw(raw)) };
}

fn bench_synchronize(c: &mut Criterion) {
    qsbr::rcu_register_thread();
    c.bench_function("qsbr_synchronize_solo", |b| {
        b.iter(qsbr::synchronize_rcu)
    });
    qsbr::rcu_unregister_thread();
}

criterion_group!(
    benches,
    bench_qsbr_read_side,
    bench_bp_read_side,
    bench_synchronize
);
criterion_main!(benches);
