//! Workload runner: N enqueuers and M dequeuers over the RCU-protected
//! queue for a fixed duration, with deferred node reclamation through
//! `call_rcu`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use oxrcu_core::{
    affinity, arch, call_rcu, rcu_quiescent_state, rcu_read_lock, rcu_read_unlock,
    rcu_register_thread, rcu_unregister_thread, RcuHead,
};

use crate::lfq::{LfqNode, RcuLfQueue};
use crate::HarnessError;

/// Parsed workload parameters.
#[derive(Debug, Clone)]
pub struct Config {
    pub nr_dequeuers: usize,
    pub nr_enqueuers: usize,
    pub duration_s: u64,
    /// Enqueuer delay loop count per operation (`-d`).
    pub wdelay: u64,
    /// Dequeuer read-side duration loop count per operation (`-c`).
    pub rduration: u64,
    /// Candidate CPUs for round-robin thread pinning (`-a`).
    pub affinity: Vec<usize>,
    pub verbose: bool,
}

/// Aggregate counters for the SUMMARY line.
#[derive(Debug, Clone, Serialize)]
pub struct Totals {
    pub nr_enqueues: u64,
    pub nr_dequeues: u64,
    pub successful_enqueues: u64,
    pub successful_dequeues: u64,
    pub end_dequeues: u64,
}

impl Totals {
    pub fn nr_ops(&self) -> u64 {
        self.nr_enqueues + self.nr_dequeues
    }

    /// Conservation law of the workload: everything successfully
    /// enqueued is either successfully dequeued or drained at the end.
    pub fn balanced(&self) -> bool {
        self.successful_enqueues == self.successful_dequeues + self.end_dequeues
    }
}

/// Announce a quiescent state this often (in operations).
const QS_PERIOD: u64 = 1024;

fn loop_sleep(loops: u64) {
    for _ in 0..loops {
        arch::cpu_relax();
    }
}

unsafe fn free_node_cb(head: *mut RcuHead) {
    // SAFETY: head is the first field of an LfqNode from LfqNode::boxed.
    unsafe { drop(Box::from_raw(head as *mut LfqNode)) };
}

struct AffinityPlan {
    cpus: Vec<usize>,
    next: AtomicUsize,
}

impl AffinityPlan {
    fn new(cpus: Vec<usize>) -> Result<Self, HarnessError> {
        if !cpus.is_empty() {
            let ncpus =
                affinity::num_configured_cpus().ok_or(HarnessError::AffinityUnsupported)?;
            if let Some(&bad) = cpus.iter().find(|&&c| c >= ncpus) {
                return Err(HarnessError::CpuOutOfRange { cpu: bad, ncpus });
            }
        }
        Ok(Self {
            cpus,
            next: AtomicUsize::new(0),
        })
    }

    /// Pin the calling thread to the next CPU of the rotation.
    fn apply(&self) {
        if self.cpus.is_empty() {
            return;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.cpus.len();
        // Best effort, as in the original harness.
        let _ = affinity::set_current_thread_affinity(self.cpus[idx]);
    }
}

/// Run the workload and return the aggregated counters.
pub fn run(config: &Config) -> Result<Totals, HarnessError> {
    let plan = Arc::new(AffinityPlan::new(config.affinity.clone())?);
    let queue = Arc::new(RcuLfQueue::new());
    let go = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    let mut enqueuers = Vec::with_capacity(config.nr_enqueuers);
    for id in 0..config.nr_enqueuers {
        let queue = Arc::clone(&queue);
        let go = Arc::clone(&go);
        let stop = Arc::clone(&stop);
        let plan = Arc::clone(&plan);
        let wdelay = config.wdelay;
        let verbose = config.verbose;
        enqueuers.push(std::thread::spawn(move || {
            plan.apply();
            rcu_register_thread();
            while !go.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            let mut nr_enqueues = 0u64;
            let mut successful = 0u64;
            while !stop.load(Ordering::Acquire) {
                let node = LfqNode::boxed(nr_enqueues);
                rcu_read_lock();
                // SAFETY: fresh node; ownership passes to the queue.
                unsafe { queue.enqueue(node) };
                rcu_read_unlock();
                nr_enqueues += 1;
                successful += 1;
                if wdelay > 0 {
                    loop_sleep(wdelay);
                }
                if nr_enqueues % QS_PERIOD == 0 {
                    rcu_quiescent_state();
                }
            }
            rcu_unregister_thread();
            if verbose {
                eprintln!("enqueuer {id}: {successful} enqueues");
            }
            (nr_enqueues, successful)
        }));
    }

    let mut dequeuers = Vec::with_capacity(config.nr_dequeuers);
    for id in 0..config.nr_dequeuers {
        let queue = Arc::clone(&queue);
        let go = Arc::clone(&go);
        let stop = Arc::clone(&stop);
        let plan = Arc::clone(&plan);
        let rduration = config.rduration;
        let verbose = config.verbose;
        dequeuers.push(std::thread::spawn(move || {
            plan.apply();
            rcu_register_thread();
            while !go.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            let mut nr_dequeues = 0u64;
            let mut successful = 0u64;
            while !stop.load(Ordering::Acquire) {
                rcu_read_lock();
                let node = queue.dequeue();
                if rduration > 0 {
                    loop_sleep(rduration);
                }
                rcu_read_unlock();
                nr_dequeues += 1;
                if !node.is_null() {
                    successful += 1;
                    // Retired node may still be visible to concurrent
                    // dequeuers; reclaim after a grace period.
                    // SAFETY: node came out of the queue exactly once.
                    unsafe {
                        call_rcu(std::ptr::addr_of_mut!((*node).head), free_node_cb);
                    }
                }
                if nr_dequeues % QS_PERIOD == 0 {
                    rcu_quiescent_state();
                }
            }
            rcu_unregister_thread();
            if verbose {
                eprintln!("dequeuer {id}: {successful} dequeues");
            }
            (nr_dequeues, successful)
        }));
    }

    go.store(true, Ordering::Release);
    std::thread::sleep(Duration::from_secs(config.duration_s));
    stop.store(true, Ordering::Release);

    let mut totals = Totals {
        nr_enqueues: 0,
        nr_dequeues: 0,
        successful_enqueues: 0,
        successful_dequeues: 0,
        end_dequeues: 0,
    };
    for handle in enqueuers {
        let (nr, ok) = handle.join().map_err(|_| HarnessError::WorkerPanicked)?;
        totals.nr_enqueues += nr;
        totals.successful_enqueues += ok;
    }
    for handle in dequeuers {
        let (nr, ok) = handle.join().map_err(|_| HarnessError::WorkerPanicked)?;
        totals.nr_dequeues += nr;
        totals.successful_dequeues += ok;
    }

    // End-of-test drain: the system is quiesced, nodes retire directly.
    loop {
        let node = queue.dequeue();
        if node.is_null() {
            break;
        }
        totals.end_dequeues += 1;
        // SAFETY: no concurrent access remains.
        unsafe { drop(Box::from_raw(node)) };
    }
    Arc::try_unwrap(queue)
        .ok()
        .ok_or(HarnessError::WorkerPanicked)?
        .destroy();

    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_run_balances_enqueues_and_dequeues() {
        let config = Config {
            nr_dequeuers: 2,
            nr_enqueuers: 2,
            duration_s: 1,
            wdelay: 0,
            rduration: 0,
            affinity: Vec::new(),
            verbose: false,
        };
        let totals = run(&config).expect("run failed");
        assert!(totals.successful_enqueues > 0, "no work happened");
        assert!(
            totals.balanced(),
            "conservation violated: {} != {} + {}",
            totals.successful_enqueues,
            totals.successful_dequeues,
            totals.end_dequeues
        );
    }

    #[test]
    fn out_of_range_affinity_is_rejected() {
        let config = Config {
            nr_dequeuers: 1,
            nr_enqueuers: 1,
            duration_s: 1,
            wdelay: 0,
            rduration: 0,
            affinity: vec![usize::MAX],
            verbose: false,
        };
        match run(&config) {
            Err(HarnessError::CpuOutOfRange { .. }) | Err(HarnessError::AffinityUnsupported) => {}
            other => panic!("expected an affinity error, got {other:?}"),
        }
    }
}
