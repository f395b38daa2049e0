//! Deferred-callback service: `call_rcu` and its worker threads.
//!
//! A callback is an [`RcuHead`] embedded in the object being reclaimed.
//! `call_rcu` enqueues it on a worker's wait-free queue; the worker
//! detaches whole batches, runs **one** `synchronize_rcu` per batch,
//! then invokes every callback in submission order. Batching is the
//! central throughput mechanism: a grace period is amortized over all
//! callbacks submitted before the detach.
//!
//! ## Worker routing
//!
//! Submission picks a worker by priority: the thread's own override
//! (`set_thread_call_rcu_data`), then the per-CPU worker for the
//! submitting CPU, then the lazily created default worker. The per-CPU
//! table is itself RCU-protected: `call_rcu` reads it inside a
//! read-side critical section, and replacing an entry requires the
//! registry mutex plus a grace period before the old worker is freed.
//!
//! ## Lifecycle
//!
//! Worker descriptors are heap records handled by raw pointer, created
//! with `Box::into_raw` and reclaimed with `Box::from_raw` once their
//! thread has acknowledged `STOP` with `STOPPED`. The default worker is
//! never freed: it is the sink for callbacks orphaned by teardown, and
//! self-submitting callbacks make a bounded full drain impossible
//! anywhere else.
//!
//! ## Fork
//!
//! `call_rcu_before_fork` parks every worker (`PAUSE`/`PAUSED`
//! handshake, workers leave the reader registry) and holds the registry
//! mutex across the fork. The parent resumes workers; the child
//! inherits descriptors whose threads no longer exist, so it rebuilds a
//! default worker, reroutes inherited callbacks to it, and frees the
//! corpses.

use core::cell::Cell;
use core::sync::atomic::{AtomicI32, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Once;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::affinity::{current_cpu, num_configured_cpus, set_current_thread_affinity};
use crate::arch::smp_mb;
use crate::die::{die, warn_once};
use crate::errno;
use crate::futex::{futex_wait, futex_wake_one};
use crate::pointer::RcuPtr;
use crate::qsbr;
use crate::wfq::{chain_next, WfqNode, WfqQueue};

// ---------------------------------------------------------------------------
// Worker flags
// ---------------------------------------------------------------------------

/// Caller-settable: worker spins instead of sleeping on its futex.
pub const CALL_RCU_RT: usize = 1 << 0;

/// Library-set: worker must exit its loop.
pub const CALL_RCU_STOP: usize = 1 << 1;

/// Library-set: worker has exited and will not touch its descriptor again.
pub const CALL_RCU_STOPPED: usize = 1 << 2;

/// Fork in progress: worker must park outside the reader registry.
pub const CALL_RCU_PAUSE: usize = 1 << 3;

/// Worker acknowledges `PAUSE`; cleared when it resumes.
pub const CALL_RCU_PAUSED: usize = 1 << 4;

/// Worker sleep bound: a lost wake costs at most this much latency.
const WORKER_SLEEP: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Callback head
// ---------------------------------------------------------------------------

/// Reclamation callback. Receives the head it was enqueued with; the
/// containing object may be recovered by embedding the head at a known
/// offset.
pub type RcuCallback = unsafe fn(*mut RcuHead);

/// Intrusive callback record. Embed in the object to be reclaimed; no
/// separate allocation is ever made for a callback.
///
/// From the moment `call_rcu` accepts a head until its callback runs,
/// the head (and the object containing it) is owned by the service and
/// must not be read, written, or freed by the caller.
#[repr(C)]
pub struct RcuHead {
    next: WfqNode,
    func: Option<RcuCallback>,
}

impl RcuHead {
    pub const fn new() -> Self {
        Self {
            next: WfqNode::new(),
            func: None,
        }
    }
}

impl Default for RcuHead {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Worker descriptor
// ---------------------------------------------------------------------------

/// Descriptor of one callback worker. Cache-line aligned so the queue
/// tail (hammered by producers) does not share a line with neighboring
/// descriptors.
#[repr(C, align(128))]
pub struct CallRcuData {
    /// Pending callbacks.
    cbs: WfqQueue,
    /// `CALL_RCU_*` flag bits.
    flags: AtomicUsize,
    /// Sleep word. 0 = open, -1 = worker armed for sleep.
    futex: AtomicI32,
    /// Advisory queue length.
    qlen: AtomicUsize,
    /// CPU this worker is pinned to, or -1.
    cpu_affinity: i32,
    /// Worker thread handle, taken at join time.
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Raw worker handle. Owned by the library; see [`call_rcu_data_free`].
pub type CallRcuDataPtr = *mut CallRcuData;

struct SendPtr(*mut CallRcuData);
// SAFETY: the descriptor is heap-pinned and outlives the worker thread.
unsafe impl Send for SendPtr {}

// ---------------------------------------------------------------------------
// Directories
// ---------------------------------------------------------------------------

struct WorkerList {
    workers: Vec<*mut CallRcuData>,
}

// SAFETY: the raw pointers are only dereferenced under the protocol
// documented on CallRcuData (mutex for list access, flags for lifetime).
unsafe impl Send for WorkerList {}

/// All live worker descriptors. The mutex also serializes per-CPU table
/// mutation and is held across fork. Never held across a
/// `synchronize_rcu` call.
static CALL_RCU_REGISTRY: Mutex<WorkerList> = Mutex::new(WorkerList {
    workers: Vec::new(),
});

/// The default worker; created lazily, never freed.
static DEFAULT_CALL_RCU_DATA: AtomicPtr<CallRcuData> = AtomicPtr::new(core::ptr::null_mut());

/// Per-CPU worker table, RCU-protected.
struct PerCpuTable {
    slots: Vec<AtomicPtr<CallRcuData>>,
}

static PER_CPU_CALL_RCU_DATA: RcuPtr<PerCpuTable> = RcuPtr::new(core::ptr::null_mut());

/// Number of configured CPUs; 0 until probed or when unavailable.
static MAXCPUS: AtomicIsize = AtomicIsize::new(0);

thread_local! {
    static THREAD_CALL_RCU_DATA: Cell<*mut CallRcuData> = const { Cell::new(core::ptr::null_mut()) };
}

static GET_CPU_RANGE_WARNED: Once = Once::new();
static SET_CPU_RANGE_WARNED: Once = Once::new();

/// Size the per-CPU table if the platform can enumerate CPUs. Caller
/// holds the registry mutex.
fn alloc_cpu_call_rcu_data() {
    if MAXCPUS.load(Ordering::Relaxed) != 0 {
        return;
    }
    let Some(n) = num_configured_cpus() else {
        return;
    };
    let table = Box::new(PerCpuTable {
        slots: (0..n).map(|_| AtomicPtr::new(core::ptr::null_mut())).collect(),
    });
    PER_CPU_CALL_RCU_DATA.assign(Box::into_raw(table));
    MAXCPUS.store(n as isize, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Worker sleep/wake
// ---------------------------------------------------------------------------

fn call_rcu_wake_up(crd: &CallRcuData) {
    smp_mb(); // queue write before futex probe
    if crd.futex.load(Ordering::Relaxed) == -1 {
        crd.futex.store(0, Ordering::Relaxed);
        futex_wake_one(&crd.futex);
    }
}

fn wake_call_rcu_thread(crd: &CallRcuData) {
    if crd.flags.load(Ordering::Relaxed) & CALL_RCU_RT == 0 {
        call_rcu_wake_up(crd);
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

fn call_rcu_worker(crdp: *mut CallRcuData) {
    // SAFETY: the descriptor stays alive until this thread publishes
    // STOPPED; nothing below touches it after that store.
    let crd = unsafe { &*crdp };

    if crd.cpu_affinity >= 0 {
        if let Err(err) = set_current_thread_affinity(crd.cpu_affinity as usize) {
            die("call_rcu worker could not set CPU affinity", err);
        }
    }

    // Callbacks may take read-side locks, so the worker is a reader.
    qsbr::rcu_register_thread();
    THREAD_CALL_RCU_DATA.with(|t| t.set(crdp));

    let rt = crd.flags.load(Ordering::Relaxed) & CALL_RCU_RT != 0;
    if !rt {
        crd.futex.store(-1, Ordering::Relaxed);
        smp_mb(); // arm before reading the queue
    }
    loop {
        if crd.flags.load(Ordering::Relaxed) & CALL_RCU_PAUSE != 0 {
            // Fork requested quiescence: leave the reader registry so
            // the child does not inherit our registration, acknowledge,
            // and hold until released.
            qsbr::rcu_unregister_thread();
            smp_mb();
            crd.flags.fetch_or(CALL_RCU_PAUSED, Ordering::SeqCst);
            while crd.flags.load(Ordering::Relaxed) & CALL_RCU_PAUSE != 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            crd.flags.fetch_and(!CALL_RCU_PAUSED, Ordering::SeqCst);
            qsbr::rcu_register_thread();
        }

        if !crd.cbs.is_empty() {
            // SAFETY: this thread is the queue's only consumer.
            if let Some(batch) = unsafe { crd.cbs.splice_batch() } {
                // One grace period covers the whole batch.
                qsbr::synchronize_rcu();
                let mut count: usize = 0;
                let mut node = batch.first;
                while !node.is_null() {
                    // Advance before invoking: the callback frees its node.
                    // SAFETY: node belongs to the detached chain.
                    let next = unsafe { chain_next(node, batch.tail_link) };
                    if node != crd.cbs.dummy_ptr() {
                        let head = node as *mut RcuHead;
                        // SAFETY: enqueued by call_rcu with the callback
                        // set; ownership transfers to the callback here.
                        unsafe {
                            if let Some(func) = (*head).func {
                                func(head);
                            }
                        }
                        count += 1;
                    }
                    node = next;
                }
                crd.qlen.fetch_sub(count, Ordering::Relaxed);
            }
        }
        if crd.flags.load(Ordering::Relaxed) & CALL_RCU_STOP != 0 {
            break;
        }
        qsbr::rcu_thread_offline();
        if !rt {
            if crd.cbs.is_empty() {
                crd.futex.store(-1, Ordering::Relaxed);
                smp_mb(); // arm before the emptiness recheck
                if crd.cbs.is_empty() {
                    // Bounded: a wake lost to the arming window costs
                    // one sleep interval at most.
                    let _ = futex_wait(&crd.futex, -1, Some(WORKER_SLEEP));
                }
            } else {
                std::thread::sleep(WORKER_SLEEP);
            }
        } else {
            std::thread::sleep(WORKER_SLEEP);
        }
        qsbr::rcu_thread_online();
    }
    if !rt {
        smp_mb(); // queue reads before opening the futex
        crd.futex.store(0, Ordering::Relaxed);
    }
    crd.flags.fetch_or(CALL_RCU_STOPPED, Ordering::SeqCst);
    qsbr::rcu_unregister_thread();
}

// ---------------------------------------------------------------------------
// Worker creation
// ---------------------------------------------------------------------------

/// Allocate a descriptor, link it into the worker list, and start its
/// thread. Caller holds the registry mutex.
fn call_rcu_data_init(list: &mut WorkerList, flags: usize, cpu_affinity: i32) -> *mut CallRcuData {
    let crdp = Box::into_raw(Box::new(CallRcuData {
        cbs: WfqQueue::new(),
        flags: AtomicUsize::new(flags),
        futex: AtomicI32::new(0),
        qlen: AtomicUsize::new(0),
        cpu_affinity,
        thread: Mutex::new(None),
    }));
    // SAFETY: crdp was just leaked to a stable heap address.
    unsafe { (*crdp).cbs.init() };
    list.workers.push(crdp);
    smp_mb(); // descriptor initialized before the thread runs

    let ptr = SendPtr(crdp);
    match std::thread::Builder::new()
        .name("call_rcu".into())
        .spawn(move || {
            // Rebind so the closure captures the Send wrapper, not the
            // raw pointer field.
            let ptr = ptr;
            call_rcu_worker(ptr.0);
        }) {
        Ok(handle) => {
            // SAFETY: crdp is live; the worker only reads `thread` at
            // teardown, after STOPPED.
            unsafe { *(*crdp).thread.lock() = Some(handle) };
        }
        Err(_) => die("call_rcu worker spawn failed", errno::EAGAIN),
    }
    crdp
}

/// Create a worker with the given flags (`CALL_RCU_RT` is the only
/// caller-settable bit) and optional CPU pinning (`cpu_affinity >= 0`).
pub fn create_call_rcu_data(flags: usize, cpu_affinity: i32) -> CallRcuDataPtr {
    let mut list = CALL_RCU_REGISTRY.lock();
    call_rcu_data_init(&mut list, flags, cpu_affinity)
}

/// Create one pinned worker per configured CPU. Slots already occupied
/// are left alone. A racing creator losing a slot (`EEXIST`) frees its
/// worker and continues.
pub fn create_all_cpu_call_rcu_data(flags: usize) -> Result<(), i32> {
    {
        let _list = CALL_RCU_REGISTRY.lock();
        alloc_cpu_call_rcu_data();
    }
    let maxcpus = MAXCPUS.load(Ordering::Relaxed);
    if maxcpus <= 0 {
        return Err(errno::EINVAL);
    }
    if PER_CPU_CALL_RCU_DATA.dereference().is_null() {
        return Err(errno::ENOMEM);
    }
    for cpu in 0..maxcpus as usize {
        let crdp;
        {
            let mut list = CALL_RCU_REGISTRY.lock();
            if !cpu_slot_load(cpu).is_null() {
                continue;
            }
            crdp = call_rcu_data_init(&mut list, flags, cpu as i32);
        }
        if let Err(err) = set_cpu_call_rcu_data(cpu, crdp) {
            // SAFETY: crdp was created above and installed nowhere.
            unsafe { call_rcu_data_free(crdp) };
            if err == errno::EEXIST {
                continue;
            }
            return Err(err);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Directory accessors
// ---------------------------------------------------------------------------

fn cpu_slot_load(cpu: usize) -> *mut CallRcuData {
    let table = PER_CPU_CALL_RCU_DATA.dereference();
    if table.is_null() {
        return core::ptr::null_mut();
    }
    // SAFETY: the table is only replaced after a grace period; callers
    // are inside an RSCS or hold the registry mutex.
    let table = unsafe { &*table };
    match table.slots.get(cpu) {
        Some(slot) => slot.load(Ordering::Acquire),
        None => core::ptr::null_mut(),
    }
}

/// Worker assigned to `cpu`, or null. Call inside a read-side critical
/// section; the result is only guaranteed live until the caller's next
/// quiescent state.
pub fn get_cpu_call_rcu_data(cpu: usize) -> CallRcuDataPtr {
    if PER_CPU_CALL_RCU_DATA.dereference().is_null() {
        return core::ptr::null_mut();
    }
    let maxcpus = MAXCPUS.load(Ordering::Relaxed);
    if maxcpus > 0 && cpu >= maxcpus as usize {
        warn_once(&GET_CPU_RANGE_WARNED, "get: CPU id out of range");
        return core::ptr::null_mut();
    }
    cpu_slot_load(cpu)
}

/// The default worker, created on first use. Never freed, so no
/// read-side protection is needed on the result.
pub fn get_default_call_rcu_data() -> CallRcuDataPtr {
    let crdp = DEFAULT_CALL_RCU_DATA.load(Ordering::Acquire);
    if !crdp.is_null() {
        return crdp;
    }
    let mut list = CALL_RCU_REGISTRY.lock();
    let crdp = DEFAULT_CALL_RCU_DATA.load(Ordering::Acquire);
    if !crdp.is_null() {
        return crdp;
    }
    let crdp = call_rcu_data_init(&mut list, 0, -1);
    DEFAULT_CALL_RCU_DATA.store(crdp, Ordering::Release);
    crdp
}

/// Worker the calling thread would submit to right now: thread override,
/// else per-CPU worker, else the default. Call inside a read-side
/// critical section when the result may be a per-CPU worker.
pub fn get_call_rcu_data() -> CallRcuDataPtr {
    let tls = THREAD_CALL_RCU_DATA
        .try_with(Cell::get)
        .unwrap_or(core::ptr::null_mut());
    if !tls.is_null() {
        return tls;
    }
    if MAXCPUS.load(Ordering::Relaxed) > 0 {
        if let Some(cpu) = current_cpu() {
            let crd = cpu_slot_load(cpu);
            if !crd.is_null() {
                return crd;
            }
        }
    }
    get_default_call_rcu_data()
}

/// The calling thread's worker override, or null.
pub fn get_thread_call_rcu_data() -> CallRcuDataPtr {
    THREAD_CALL_RCU_DATA
        .try_with(Cell::get)
        .unwrap_or(core::ptr::null_mut())
}

/// Set (or clear, with null) the calling thread's worker override. The
/// caller owns disposal of any previously set worker.
pub fn set_thread_call_rcu_data(crdp: CallRcuDataPtr) {
    let _ = THREAD_CALL_RCU_DATA.try_with(|t| t.set(crdp));
}

/// Install `crdp` as the worker for `cpu`, or clear the slot with null.
///
/// Installing over an occupied slot fails with `EEXIST`; clear it first.
/// After clearing or replacing, the caller must let a grace period
/// elapse before freeing the displaced worker — `call_rcu` may still
/// hold the old pointer inside its read-side critical section.
pub fn set_cpu_call_rcu_data(cpu: usize, crdp: CallRcuDataPtr) -> Result<(), i32> {
    let _list = CALL_RCU_REGISTRY.lock();
    alloc_cpu_call_rcu_data();
    let maxcpus = MAXCPUS.load(Ordering::Relaxed);
    if maxcpus <= 0 || cpu >= maxcpus as usize {
        warn_once(&SET_CPU_RANGE_WARNED, "set: CPU id out of range");
        return Err(errno::EINVAL);
    }
    let table = PER_CPU_CALL_RCU_DATA.dereference();
    if table.is_null() {
        return Err(errno::ENOMEM);
    }
    // SAFETY: table replacement requires this mutex, which we hold.
    let table = unsafe { &*table };
    if !table.slots[cpu].load(Ordering::Relaxed).is_null() && !crdp.is_null() {
        return Err(errno::EEXIST);
    }
    table.slots[cpu].store(crdp, Ordering::Release);
    Ok(())
}

/// Thread handle of a worker, for diagnostics and affinity checks.
pub fn get_call_rcu_thread(crdp: CallRcuDataPtr) -> Option<std::thread::Thread> {
    if crdp.is_null() {
        return None;
    }
    // SAFETY: caller guarantees crdp is a live worker handle.
    unsafe { (*crdp).thread.lock().as_ref().map(|h| h.thread().clone()) }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Schedule `func(head)` to run after a following grace period.
///
/// Wait-free with respect to other submitters. Must be called from a
/// registered read-side thread: the per-CPU worker table is consulted
/// under a read-side critical section.
///
/// # Safety
///
/// - `head` must point to a live `RcuHead` that is not currently
///   enqueued, embedded in an object that stays valid until `func`
///   runs.
/// - From return until `func(head)` executes, the caller must neither
///   access nor free the head or its containing object.
/// - `func` must be safe to call with `head` after a grace period.
pub unsafe fn call_rcu(head: *mut RcuHead, func: RcuCallback) {
    // SAFETY: caller owns the head until the service takes it.
    unsafe {
        (*head).next.init();
        (*head).func = Some(func);
    }
    // The per-CPU table must stay live while we route.
    qsbr::rcu_read_lock();
    let crdp = get_call_rcu_data();
    // SAFETY: crdp is live (thread override and default are never freed
    // under us; per-CPU workers survive until a grace period after
    // removal, and we are inside an RSCS).
    unsafe {
        let crd = &*crdp;
        crd.cbs.enqueue(core::ptr::addr_of_mut!((*head).next));
        crd.qlen.fetch_add(1, Ordering::Relaxed);
        wake_call_rcu_thread(crd);
    }
    qsbr::rcu_read_unlock();
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

/// Stop and free a worker. Refuses null and the default worker
/// (silently, like a repeated free of the same worker).
///
/// The worker drains in-flight callbacks before exiting; anything still
/// queued after that is spliced onto the default worker, preserving
/// order, so no accepted callback is ever dropped.
///
/// # Safety
///
/// `crdp` must have come from worker creation and must already be
/// removed from every directory (thread overrides, per-CPU slots), with
/// a grace period elapsed since removal.
pub unsafe fn call_rcu_data_free(crdp: CallRcuDataPtr) {
    if crdp.is_null() || crdp == DEFAULT_CALL_RCU_DATA.load(Ordering::Relaxed) {
        return;
    }
    {
        // Claim the unlink first: a second free of the same worker
        // finds it gone and returns.
        let mut list = CALL_RCU_REGISTRY.lock();
        let before = list.workers.len();
        list.workers.retain(|&p| p != crdp);
        if list.workers.len() == before {
            return;
        }
    }
    // SAFETY: crdp is live until we free it below; we just claimed it.
    let crd = unsafe { &*crdp };
    if crd.flags.load(Ordering::Relaxed) & CALL_RCU_STOPPED == 0 {
        crd.flags.fetch_or(CALL_RCU_STOP, Ordering::SeqCst);
        wake_call_rcu_thread(crd);
        while crd.flags.load(Ordering::Relaxed) & CALL_RCU_STOPPED == 0 {
            // The worker may be mid-grace-period, waiting on this very
            // thread; keep quiescing so it can finish and see STOP.
            qsbr::rcu_quiescent_state();
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    if let Some(handle) = crd.thread.lock().take() {
        let _ = handle.join();
    }
    if !crd.cbs.is_empty() {
        // SAFETY: the worker has exited; we are the only consumer now.
        if let Some(mut batch) = unsafe { crd.cbs.splice_batch() } {
            // The sentinel lives inside crdp and must not migrate; it
            // can only be the chain head (it was never re-enqueued).
            if batch.first == crd.cbs.dummy_ptr() {
                // SAFETY: sentinel belongs to the detached chain.
                batch.first = unsafe { chain_next(batch.first, batch.tail_link) };
            }
            if !batch.first.is_null() {
                let default = get_default_call_rcu_data();
                // SAFETY: default worker queues live forever.
                unsafe {
                    (*default).cbs.splice_onto(batch);
                    (*default)
                        .qlen
                        .fetch_add(crd.qlen.load(Ordering::Relaxed), Ordering::Relaxed);
                    wake_call_rcu_thread(&*default);
                }
            }
        }
    }
    // SAFETY: created by call_rcu_data_init via Box::into_raw; the
    // worker thread exited and the unlink above made us sole owner.
    unsafe { drop(Box::from_raw(crdp)) };
}

/// Tear down every per-CPU worker: clear all slots, wait a grace period
/// for in-flight `call_rcu` routing, then free the displaced workers.
pub fn free_all_cpu_call_rcu_data() {
    let maxcpus = MAXCPUS.load(Ordering::Relaxed);
    if maxcpus <= 0 {
        return;
    }
    let mut snapshot: Vec<*mut CallRcuData> = Vec::with_capacity(maxcpus as usize);
    for cpu in 0..maxcpus as usize {
        qsbr::rcu_read_lock();
        let crdp = get_cpu_call_rcu_data(cpu);
        qsbr::rcu_read_unlock();
        snapshot.push(crdp);
        if crdp.is_null() {
            continue;
        }
        let _ = set_cpu_call_rcu_data(cpu, core::ptr::null_mut());
    }
    // call_rcu sites may still hold a stale per-CPU pointer.
    qsbr::synchronize_rcu();
    for crdp in snapshot {
        if crdp.is_null() {
            continue;
        }
        // SAFETY: removed from the table and a grace period has passed.
        unsafe { call_rcu_data_free(crdp) };
    }
}

// ---------------------------------------------------------------------------
// Fork hooks
// ---------------------------------------------------------------------------

/// Park every worker outside the reader registry and hold the registry
/// mutex so the child sees consistent service state. Pair with the
/// after-fork hooks.
pub fn call_rcu_before_fork() {
    let guard = CALL_RCU_REGISTRY.lock();
    for &crdp in &guard.workers {
        // SAFETY: listed workers are live while the mutex is held.
        let crd = unsafe { &*crdp };
        crd.flags.fetch_or(CALL_RCU_PAUSE, Ordering::SeqCst);
        smp_mb();
        wake_call_rcu_thread(crd);
    }
    for &crdp in &guard.workers {
        // SAFETY: as above.
        let crd = unsafe { &*crdp };
        while crd.flags.load(Ordering::Relaxed) & CALL_RCU_PAUSED == 0 {
            // A worker mid-grace-period may be waiting on this thread;
            // quiesce so it can reach the pause check.
            qsbr::rcu_quiescent_state();
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    // Held across fork; released by the after-fork hooks.
    core::mem::forget(guard);
}

/// Resume workers in the parent after `fork()`.
pub fn call_rcu_after_fork_parent() {
    // SAFETY: we logically hold the guard forgotten in before_fork.
    let list = unsafe { &*CALL_RCU_REGISTRY.data_ptr() };
    for &crdp in &list.workers {
        // SAFETY: listed workers are live while the lock is held.
        let crd = unsafe { &*crdp };
        crd.flags.fetch_and(!CALL_RCU_PAUSE, Ordering::SeqCst);
    }
    for &crdp in &list.workers {
        // SAFETY: as above.
        let crd = unsafe { &*crdp };
        while crd.flags.load(Ordering::Relaxed) & CALL_RCU_PAUSED != 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    // SAFETY: paired with the forgotten guard from before_fork.
    unsafe { CALL_RCU_REGISTRY.force_unlock() };
}

/// Rebuild the service in the child after `fork()`: recreate a default
/// worker, reroute inherited callbacks to it, and dispose of worker
/// descriptors whose threads did not survive the fork.
pub fn call_rcu_after_fork_child() {
    // SAFETY: paired with the forgotten guard from before_fork.
    unsafe { CALL_RCU_REGISTRY.force_unlock() };

    let old_workers: Vec<*mut CallRcuData> = CALL_RCU_REGISTRY.lock().workers.clone();
    if old_workers.is_empty() {
        return;
    }

    // Reset the directories before creating the replacement default so
    // nothing routes to a corpse.
    DEFAULT_CALL_RCU_DATA.store(core::ptr::null_mut(), Ordering::Relaxed);
    MAXCPUS.store(0, Ordering::Relaxed);
    let old_table = PER_CPU_CALL_RCU_DATA.xchg(core::ptr::null_mut());
    if !old_table.is_null() {
        // SAFETY: single-threaded after fork; no reader can hold it.
        unsafe { drop(Box::from_raw(old_table)) };
    }
    let _ = THREAD_CALL_RCU_DATA.try_with(|t| t.set(core::ptr::null_mut()));

    get_default_call_rcu_data();

    for crdp in old_workers {
        // SAFETY: inherited descriptors stay allocated until freed below.
        let crd = unsafe { &*crdp };
        // The worker thread did not fork with us; its handle refers to
        // no thread in this process.
        if let Some(handle) = crd.thread.lock().take() {
            core::mem::forget(handle);
        }
        crd.flags.store(CALL_RCU_STOPPED, Ordering::SeqCst);
        // SAFETY: orphan descriptor, marked stopped; leftover callbacks
        // drain to the new default.
        unsafe { call_rcu_data_free(crdp) };
    }
}

/// Advisory queue length of a worker. Test and diagnostic hook.
pub fn call_rcu_queue_len(crdp: CallRcuDataPtr) -> usize {
    if crdp.is_null() {
        return 0;
    }
    // SAFETY: caller guarantees crdp is a live worker handle.
    unsafe { (*crdp).qlen.load(Ordering::Relaxed) }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
