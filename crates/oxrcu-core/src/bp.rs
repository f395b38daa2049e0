//! Bulletproof (BP) flavor: signal-safe, registration-free readers.
//!
//! A thread's first `rcu_read_lock` lazily claims a reader slot from a
//! shared mmap'd arena (with every signal blocked around the claim, so
//! a handler cannot re-enter the registration path). After that, the
//! read side is plain loads and stores on the thread's own slot plus a
//! fence — no library calls, no locks, no allocation — and is therefore
//! safe to run from an async-signal handler.
//!
//! ## Counter layout
//!
//! The slot counter packs a nesting count in its low half and the
//! grace-period phase at bit `usize::BITS / 2`. The outermost
//! `rcu_read_lock` snapshots the global counter (phase + count 1);
//! nested locks add 1; unlocks subtract 1. A slot is inside a critical
//! section whenever its nesting half is non-zero.
//!
//! ## Arena
//!
//! Slots live in mmap'd chunks that are never unmapped or moved, so a
//! slot pointer cached in TLS stays valid for the process lifetime.
//! Growth appends a new, larger chunk under the registry mutex. A slot
//! is recycled (claim word cleared) when its thread exits.
//!
//! `synchronize_rcu` here is the pure spin/sleep variant: readers never
//! touch a futex, keeping the read side free of syscalls.

use core::cell::Cell;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::affinity::gettid;
use crate::arch::{cpu_relax, smp_mb};
#[cfg(unix)]
use crate::die::die;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Nesting-count increment for one read-lock level.
const RCU_GP_COUNT: usize = 1;

/// Phase bit, in the upper half of the word so the nesting count below
/// it can never carry into it.
pub(crate) const RCU_GP_CTR_PHASE: usize = 1 << (usize::BITS / 2);

/// Mask of the nesting-count half.
const RCU_GP_CTR_NEST_MASK: usize = RCU_GP_CTR_PHASE - 1;

/// Scan iterations before the synchronizer stops spinning and sleeps.
const RCU_QS_ACTIVE_ATTEMPTS: u32 = 64;

/// Sleep between rescans once spinning gives up.
const GP_SLEEP: Duration = Duration::from_millis(10);

/// Slot capacity of the first arena chunk; each further chunk doubles.
const ARENA_INIT_SLOTS: usize = 8;

// ---------------------------------------------------------------------------
// Global state
// ---------------------------------------------------------------------------

/// Global grace-period counter. Starts at count 1 so an online slot
/// snapshot is never zero.
static RCU_GP_CTR: AtomicUsize = AtomicUsize::new(RCU_GP_COUNT);

/// Slot arena. The mutex also serializes grace periods and fork.
static ARENA: Mutex<Arena> = Mutex::new(Arena::new());

/// Signal mask saved by the fork hooks between before/after.
static FORK_SIGMASK: Mutex<Option<SavedSigMask>> = Mutex::new(None);

// ---------------------------------------------------------------------------
// Reader slot and arena
// ---------------------------------------------------------------------------

/// Per-thread reader record in the shared arena. Cache-line aligned;
/// written only by its owning thread (and by fork/teardown paths that
/// run single-threaded).
#[repr(C, align(128))]
pub struct BpSlot {
    /// Nesting count (low half) and observed phase (bit WORD/2).
    ctr: AtomicUsize,
    /// Claim word: 1 while a live thread owns this slot.
    in_use: AtomicU32,
    /// OS thread id of the owner, for diagnostics.
    tid: AtomicI32,
}

impl BpSlot {
    fn gp_ongoing(&self, gp: usize) -> bool {
        let v = self.ctr.load(Ordering::Acquire);
        (v & RCU_GP_CTR_NEST_MASK) != 0 && ((v ^ gp) & RCU_GP_CTR_PHASE) != 0
    }
}

struct Chunk {
    base: *mut BpSlot,
    capacity: usize,
    used: usize,
}

struct Arena {
    chunks: Vec<Chunk>,
}

// SAFETY: chunk base pointers refer to process-lifetime mappings; all
// slot access is atomic.
unsafe impl Send for Arena {}

impl Arena {
    const fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    /// Claim a free slot for `tid`, growing the arena if necessary.
    fn claim(&mut self, tid: i32) -> *const BpSlot {
        for chunk in &mut self.chunks {
            for i in 0..chunk.used {
                // SAFETY: i < used <= capacity of a live mapping.
                let slot = unsafe { &*chunk.base.add(i) };
                if slot.in_use.load(Ordering::Acquire) == 0 {
                    slot.ctr.store(0, Ordering::Relaxed);
                    slot.tid.store(tid, Ordering::Relaxed);
                    slot.in_use.store(1, Ordering::Release);
                    return slot;
                }
            }
            if chunk.used < chunk.capacity {
                let i = chunk.used;
                chunk.used += 1;
                // SAFETY: i < capacity of a live mapping.
                let slot = unsafe { &*chunk.base.add(i) };
                slot.ctr.store(0, Ordering::Relaxed);
                slot.tid.store(tid, Ordering::Relaxed);
                slot.in_use.store(1, Ordering::Release);
                return slot;
            }
        }
        let capacity = self
            .chunks
            .last()
            .map_or(ARENA_INIT_SLOTS, |c| c.capacity * 2);
        self.chunks.push(map_chunk(capacity));
        self.claim(tid)
    }

    fn active_slots(&self) -> impl Iterator<Item = &BpSlot> {
        self.chunks.iter().flat_map(|chunk| {
            // SAFETY: used <= capacity of a live mapping; slots are
            // plain atomics and valid for shared access.
            let slots = unsafe { core::slice::from_raw_parts(chunk.base, chunk.used) };
            slots
                .iter()
                .filter(|s| s.in_use.load(Ordering::Acquire) != 0)
        })
    }
}

/// Map a new arena chunk. Zero-filled pages are valid free slots.
#[cfg(unix)]
fn map_chunk(capacity: usize) -> Chunk {
    let bytes = capacity * core::mem::size_of::<BpSlot>();
    // SAFETY: anonymous private mapping with no fd.
    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        // SAFETY: errno read immediately after a failed mmap.
        die("reader arena mmap failed", unsafe { *libc::__errno_location() });
    }
    Chunk {
        base: ptr as *mut BpSlot,
        capacity,
        used: 0,
    }
}

#[cfg(not(unix))]
fn map_chunk(capacity: usize) -> Chunk {
    let mut slots = Vec::with_capacity(capacity);
    for _ in 0..capacity {
        slots.push(BpSlot {
            ctr: AtomicUsize::new(0),
            in_use: AtomicU32::new(0),
            tid: AtomicI32::new(0),
        });
    }
    let base = Box::leak(slots.into_boxed_slice()).as_mut_ptr();
    Chunk {
        base,
        capacity,
        used: 0,
    }
}

// ---------------------------------------------------------------------------
// Signal masking around registration
// ---------------------------------------------------------------------------

#[cfg(unix)]
type SavedSigMask = libc::sigset_t;
#[cfg(not(unix))]
type SavedSigMask = ();

#[cfg(unix)]
fn block_all_signals() -> SavedSigMask {
    // SAFETY: both sets live on this frame; pthread_sigmask only reads
    // and writes them.
    unsafe {
        let mut all: libc::sigset_t = core::mem::zeroed();
        let mut old: libc::sigset_t = core::mem::zeroed();
        libc::sigfillset(&mut all);
        libc::pthread_sigmask(libc::SIG_BLOCK, &all, &mut old);
        old
    }
}

#[cfg(unix)]
fn restore_signals(saved: SavedSigMask) {
    // SAFETY: saved came from block_all_signals on this thread.
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, &saved, core::ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn block_all_signals() -> SavedSigMask {}

#[cfg(not(unix))]
fn restore_signals(_saved: SavedSigMask) {}

// ---------------------------------------------------------------------------
// Thread-local slot handle
// ---------------------------------------------------------------------------

struct BpTls {
    slot: Cell<*const BpSlot>,
}

impl Drop for BpTls {
    fn drop(&mut self) {
        let slot = self.slot.get();
        if !slot.is_null() {
            // Recycle the slot. No lock: the claim word only flips
            // 1 -> 0 here, and a synchronizer reading the stale claim
            // sees a zero nesting count.
            // SAFETY: arena slots are never unmapped.
            let slot = unsafe { &*slot };
            slot.ctr.store(0, Ordering::Release);
            slot.tid.store(0, Ordering::Relaxed);
            slot.in_use.store(0, Ordering::Release);
        }
    }
}

thread_local! {
    static BP_TLS: BpTls = const {
        BpTls {
            slot: Cell::new(core::ptr::null()),
        }
    };
}

/// Fetch the calling thread's slot, claiming one on first use.
fn reader_slot() -> *const BpSlot {
    BP_TLS.with(|tls| {
        let mut slot = tls.slot.get();
        if slot.is_null() {
            let saved = block_all_signals();
            slot = ARENA.lock().claim(gettid());
            restore_signals(saved);
            tls.slot.set(slot);
        }
        slot
    })
}

// ---------------------------------------------------------------------------
// Reader-side API
// ---------------------------------------------------------------------------

/// Enter a read-side critical section. Nestable; safe from an
/// async-signal handler once the thread has read-locked at least once
/// before (the first call on a thread claims its slot and must happen
/// outside a handler).
pub fn rcu_read_lock() {
    // SAFETY: arena slots are never unmapped.
    let slot = unsafe { &*reader_slot() };
    let tmp = slot.ctr.load(Ordering::Relaxed);
    if tmp & RCU_GP_CTR_NEST_MASK == 0 {
        slot.ctr
            .store(RCU_GP_CTR.load(Ordering::Relaxed), Ordering::Relaxed);
        smp_mb();
    } else {
        slot.ctr.store(tmp + RCU_GP_COUNT, Ordering::Relaxed);
    }
}

/// Exit a read-side critical section.
pub fn rcu_read_unlock() {
    smp_mb();
    let slot = BP_TLS.with(|tls| tls.slot.get());
    debug_assert!(!slot.is_null(), "rcu_read_unlock without rcu_read_lock");
    // SAFETY: arena slots are never unmapped; lock preceded unlock.
    let slot = unsafe { &*slot };
    slot.ctr.store(
        slot.ctr.load(Ordering::Relaxed) - RCU_GP_COUNT,
        Ordering::Relaxed,
    );
}

/// Registration is lazy in this flavor; provided for API symmetry.
#[inline(always)]
pub fn rcu_register_thread() {}

/// Unregistration happens on thread exit; provided for API symmetry.
#[inline(always)]
pub fn rcu_unregister_thread() {}

// ---------------------------------------------------------------------------
// Writer-side API
// ---------------------------------------------------------------------------

/// Wait for a full grace period: until no reader slot is still inside a
/// critical section tagged with the pre-flip phase. Two passes bracket
/// the flip as in the QSBR engine.
pub fn synchronize_rcu() {
    let saved = block_all_signals();
    {
        let arena = ARENA.lock();
        smp_mb();
        for _ in 0..2 {
            let flipped = RCU_GP_CTR.load(Ordering::Relaxed) ^ RCU_GP_CTR_PHASE;
            RCU_GP_CTR.store(flipped, Ordering::Release);
            smp_mb();
            wait_for_readers(&arena);
        }
        smp_mb();
    }
    restore_signals(saved);
}

fn wait_for_readers(arena: &Arena) {
    let mut wait_loops: u32 = 0;
    loop {
        wait_loops = wait_loops.saturating_add(1);
        let gp = RCU_GP_CTR.load(Ordering::Relaxed);
        if !arena.active_slots().any(|s| s.gp_ongoing(gp)) {
            break;
        }
        if wait_loops >= RCU_QS_ACTIVE_ATTEMPTS {
            std::thread::sleep(GP_SLEEP);
        } else {
            cpu_relax();
        }
    }
}

// ---------------------------------------------------------------------------
// Fork hooks
// ---------------------------------------------------------------------------

/// Call before `fork()`. Blocks signals and takes the registry mutex so
/// the child inherits a consistent arena.
pub fn rcu_bp_before_fork() {
    let saved = block_all_signals();
    *FORK_SIGMASK.lock() = Some(saved);
    let guard = ARENA.lock();
    core::mem::forget(guard);
}

/// Call in the parent after `fork()`.
pub fn rcu_bp_after_fork_parent() {
    // SAFETY: paired with the forgotten guard from rcu_bp_before_fork.
    unsafe { ARENA.force_unlock() };
    if let Some(saved) = FORK_SIGMASK.lock().take() {
        restore_signals(saved);
    }
}

/// Call in the child after `fork()`. Discards every reader slot except
/// the calling thread's own; the other owning threads did not survive
/// the fork.
pub fn rcu_bp_after_fork_child() {
    // SAFETY: paired with the forgotten guard from rcu_bp_before_fork.
    unsafe { ARENA.force_unlock() };
    let mine = BP_TLS.with(|tls| tls.slot.get());
    {
        let arena = ARENA.lock();
        for slot in arena.active_slots() {
            if slot as *const BpSlot != mine {
                slot.ctr.store(0, Ordering::Relaxed);
                slot.tid.store(0, Ordering::Relaxed);
                slot.in_use.store(0, Ordering::Release);
            }
        }
    }
    if let Some(saved) = FORK_SIGMASK.lock().take() {
        restore_signals(saved);
    }
}

/// Number of claimed reader slots. Test and diagnostic hook.
pub fn active_reader_count() -> usize {
    ARENA.lock().active_slots().count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
