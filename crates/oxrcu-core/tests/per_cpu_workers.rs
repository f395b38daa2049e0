//! Per-CPU worker directory: one worker per CPU, pinned submission,
//! slot replacement rules, and full teardown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::ThreadId;
use std::time::Duration;

use oxrcu_core::{
    affinity, call_rcu, call_rcu_data_free, create_all_cpu_call_rcu_data, create_call_rcu_data,
    errno, free_all_cpu_call_rcu_data, get_cpu_call_rcu_data, rcu_quiescent_state, rcu_read_lock,
    rcu_read_unlock, rcu_register_thread, rcu_unregister_thread, set_cpu_call_rcu_data,
    synchronize_rcu, RcuHead,
};

// Every scenario mutates the process-global per-CPU table.
static SCENARIO_LOCK: Mutex<()> = Mutex::new(());

#[repr(C)]
struct TracedNode {
    head: RcuHead,
    counter: *const AtomicUsize,
    seen_threads: *const Mutex<Vec<ThreadId>>,
}

unsafe fn trace_and_free(head: *mut RcuHead) {
    // SAFETY: head is the first field of a TracedNode allocated with
    // Box::into_raw.
    unsafe {
        let node = head as *mut TracedNode;
        (*(*node).seen_threads)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(std::thread::current().id());
        (*(*node).counter).fetch_add(1, Ordering::SeqCst);
        drop(Box::from_raw(node));
    }
}

fn wait_for(counter: &AtomicUsize, target: usize) {
    for _ in 0..10_000 {
        if counter.load(Ordering::SeqCst) >= target {
            return;
        }
        rcu_quiescent_state();
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!(
        "callbacks did not drain: {} of {target}",
        counter.load(Ordering::SeqCst)
    );
}

#[test]
fn per_cpu_submission_stays_on_per_cpu_workers() {
    let _g = SCENARIO_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(ncpus) = affinity::num_configured_cpus() else {
        // Platform cannot enumerate CPUs; the per-CPU path degrades to
        // the default worker and there is nothing to exercise here.
        return;
    };
    create_all_cpu_call_rcu_data(0).expect("per-CPU worker creation failed");

    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    static SEEN: Mutex<Vec<ThreadId>> = Mutex::new(Vec::new());
    COUNTER.store(0, Ordering::SeqCst);
    SEEN.lock().unwrap_or_else(|e| e.into_inner()).clear();

    const SUBMITTERS: usize = 4;
    const PER_SUBMITTER: usize = 1000;

    // Submitters register, submit, and unregister before the scope
    // closes; nobody inside the scope waits on callback completion, so
    // worker grace periods cannot deadlock against a blocked joiner.
    let pinned = Mutex::new(0usize);
    std::thread::scope(|scope| {
        for i in 0..SUBMITTERS {
            let pinned = &pinned;
            scope.spawn(move || {
                rcu_register_thread();
                let cpu = i % ncpus;
                if affinity::set_current_thread_affinity(cpu).is_ok() {
                    *pinned.lock().unwrap_or_else(|e| e.into_inner()) += 1;
                }
                for _ in 0..PER_SUBMITTER {
                    let node = Box::into_raw(Box::new(TracedNode {
                        head: RcuHead::new(),
                        counter: &COUNTER,
                        seen_threads: &SEEN,
                    }));
                    // SAFETY: node is live and ours until the callback.
                    unsafe { call_rcu(std::ptr::addr_of_mut!((*node).head), trace_and_free) };
                }
                rcu_unregister_thread();
            });
        }
    });

    rcu_register_thread();
    wait_for(&COUNTER, SUBMITTERS * PER_SUBMITTER);

    let all_pinned = *pinned.lock().unwrap_or_else(|e| e.into_inner()) == SUBMITTERS;
    if all_pinned && ncpus >= SUBMITTERS {
        let distinct: HashSet<ThreadId> = SEEN
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        assert!(
            distinct.len() <= SUBMITTERS,
            "expected at most {SUBMITTERS} worker threads, saw {}",
            distinct.len()
        );
    }

    free_all_cpu_call_rcu_data();
    rcu_unregister_thread();
}

#[test]
fn slot_replacement_follows_the_protocol() {
    let _g = SCENARIO_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if affinity::num_configured_cpus().is_none() {
        return;
    }
    rcu_register_thread();
    // Start from an empty table.
    free_all_cpu_call_rcu_data();

    let cpu = 0usize;
    rcu_read_lock();
    let existing = get_cpu_call_rcu_data(cpu);
    rcu_read_unlock();
    assert!(existing.is_null(), "slot not empty after free_all");

    let w_new = create_call_rcu_data(0, -1);
    set_cpu_call_rcu_data(cpu, w_new).expect("install into empty slot");

    // A second install into the occupied slot must be refused.
    let w_loser = create_call_rcu_data(0, -1);
    assert_eq!(
        set_cpu_call_rcu_data(cpu, w_loser),
        Err(errno::EEXIST),
        "occupied slot must refuse a second worker"
    );
    // SAFETY: w_loser was never installed anywhere.
    unsafe { call_rcu_data_free(w_loser) };

    // Clear, then install a replacement.
    set_cpu_call_rcu_data(cpu, std::ptr::null_mut()).expect("clearing a slot");
    let w_new2 = create_call_rcu_data(0, -1);
    set_cpu_call_rcu_data(cpu, w_new2).expect("install after clear");

    // The displaced worker may still be referenced by in-flight
    // call_rcu routing; only a grace period makes freeing safe.
    synchronize_rcu();
    // SAFETY: removed from the table, grace period elapsed.
    unsafe { call_rcu_data_free(w_new) };

    set_cpu_call_rcu_data(cpu, std::ptr::null_mut()).expect("final clear");
    synchronize_rcu();
    // SAFETY: as above.
    unsafe { call_rcu_data_free(w_new2) };
    rcu_unregister_thread();
}

#[test]
fn out_of_range_cpu_is_rejected() {
    let _g = SCENARIO_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if affinity::num_configured_cpus().is_none() {
        return;
    }
    let w = create_call_rcu_data(0, -1);
    assert_eq!(set_cpu_call_rcu_data(usize::MAX, w), Err(errno::EINVAL));
    // SAFETY: never installed.
    unsafe { call_rcu_data_free(w) };
}

#[test]
fn free_all_clears_every_slot() {
    let _g = SCENARIO_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let Some(ncpus) = affinity::num_configured_cpus() else {
        return;
    };
    rcu_register_thread();
    create_all_cpu_call_rcu_data(0).expect("per-CPU worker creation failed");
    free_all_cpu_call_rcu_data();
    for cpu in 0..ncpus {
        rcu_read_lock();
        let crdp = get_cpu_call_rcu_data(cpu);
        rcu_read_unlock();
        assert!(crdp.is_null(), "cpu {cpu} slot survived free_all");
    }
    rcu_unregister_thread();
}
