//! Quiescent-State-Based Reclamation (QSBR) flavor.
//!
//! The cheapest possible read side: `rcu_read_lock` / `rcu_read_unlock`
//! compile to a compiler barrier and nothing else. In exchange, every
//! registered thread owes the engine periodic quiescent-state
//! announcements (`rcu_quiescent_state`) outside any read-side critical
//! section, or an offline/online bracket around blocking regions.
//!
//! ## Grace-period protocol
//!
//! The global counter `RCU_GP_CTR` carries an ONLINE bit (bit 0) and a
//! PHASE bit (bit 1). Each reader slot mirrors the counter value it
//! last observed; a zero slot is offline. `synchronize_rcu` flips the
//! PHASE bit and waits until no slot is both online and tagged with the
//! old phase — and it does this twice, so a reader that sampled the
//! counter concurrently with the first flip is still forced through a
//! quiescent state before the call returns.
//!
//! Waiters spin briefly, then arm a futex that quiescing readers wake.
//! The futex wait is bounded (~10 ms) so a lost wake costs at most one
//! sleep interval.
//!
//! ## Registry ownership
//!
//! Each registered thread holds an `Arc<ReaderSlot>` in TLS; the global
//! registry holds the other reference. The TLS handle unregisters on
//! thread exit, so a thread that forgets `rcu_unregister_thread` cannot
//! stall writers forever.

use core::cell::RefCell;
use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::affinity::gettid;
use crate::arch::{barrier, cpu_relax, smp_mb};
use crate::futex::{futex_wait, futex_wake_one};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Low bit of the global counter: set while any phase is live. A reader
/// slot holding a value with this bit set is online.
pub(crate) const RCU_GP_ONLINE: usize = 1 << 0;

/// Phase bit, flipped by each grace-period pass.
pub(crate) const RCU_GP_CTR_PHASE: usize = 1 << 1;

/// Scan iterations before a synchronizer stops spinning and arms the
/// grace-period futex.
const RCU_QS_ACTIVE_ATTEMPTS: u32 = 64;

/// Bounded futex sleep between rescans.
const GP_SLEEP: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Global state
// ---------------------------------------------------------------------------

/// Global grace-period counter.
static RCU_GP_CTR: AtomicUsize = AtomicUsize::new(RCU_GP_ONLINE);

/// Futex synchronizers sleep on while readers lag. 0 = open, -1 = armed.
static GP_FUTEX: AtomicI32 = AtomicI32::new(0);

/// Reader registry. The mutex also serializes grace periods.
static REGISTRY: Mutex<Vec<Arc<ReaderSlot>>> = Mutex::new(Vec::new());

// ---------------------------------------------------------------------------
// Reader slot
// ---------------------------------------------------------------------------

/// Per-thread reader record, cache-line aligned against false sharing
/// between the owning reader and scanning synchronizers.
#[repr(align(128))]
pub struct ReaderSlot {
    /// Counter value this reader last observed; 0 while offline.
    ctr: AtomicUsize,
    /// Set by a synchronizer that intends to sleep on this reader.
    waiting: AtomicI32,
    /// OS thread id, for diagnostics.
    tid: i32,
}

impl ReaderSlot {
    fn new(tid: i32) -> Self {
        Self {
            ctr: AtomicUsize::new(0),
            waiting: AtomicI32::new(0),
            tid,
        }
    }

    /// Announce a quiescent state: observe the current global counter.
    fn quiescent_state(&self) {
        smp_mb();
        self.ctr
            .store(RCU_GP_CTR.load(Ordering::Relaxed), Ordering::Release);
        smp_mb(); // ctr store before futex read
        self.wake_up_gp();
        smp_mb();
    }

    /// Go offline: writers stop waiting for this thread entirely.
    fn offline(&self) {
        smp_mb();
        self.ctr.store(0, Ordering::Release);
        smp_mb(); // ctr store before futex read
        self.wake_up_gp();
        barrier();
    }

    /// Come back online, observing the current global counter.
    fn online(&self) {
        barrier();
        self.ctr
            .store(RCU_GP_CTR.load(Ordering::Relaxed), Ordering::Release);
        smp_mb();
    }

    /// Wake a synchronizer sleeping on this reader, if one marked us.
    fn wake_up_gp(&self) {
        if self.waiting.load(Ordering::Relaxed) != 0 {
            self.waiting.store(0, Ordering::Relaxed);
            smp_mb();
            if GP_FUTEX.load(Ordering::Relaxed) != -1 {
                return;
            }
            GP_FUTEX.store(0, Ordering::Relaxed);
            futex_wake_one(&GP_FUTEX);
        }
    }

    /// Does this reader still hold the phase preceding `gp`?
    fn gp_ongoing(&self, gp: usize) -> bool {
        let v = self.ctr.load(Ordering::Acquire);
        v != 0 && ((v ^ gp) & RCU_GP_CTR_PHASE) != 0
    }

    /// OS thread id of the owner.
    pub fn tid(&self) -> i32 {
        self.tid
    }
}

// ---------------------------------------------------------------------------
// Thread-local reader handle
// ---------------------------------------------------------------------------

struct TlsReader {
    slot: RefCell<Option<Arc<ReaderSlot>>>,
}

impl Drop for TlsReader {
    fn drop(&mut self) {
        // Thread exiting without rcu_unregister_thread: unregister here
        // so writers never wait on a dead thread.
        if let Some(slot) = self.slot.borrow_mut().take() {
            unregister_slot(&slot);
        }
    }
}

thread_local! {
    static READER: TlsReader = const {
        TlsReader {
            slot: RefCell::new(None),
        }
    };
}

fn current_slot() -> Option<Arc<ReaderSlot>> {
    READER
        .try_with(|r| r.slot.borrow().clone())
        .unwrap_or(None)
}

fn unregister_slot(slot: &Arc<ReaderSlot>) {
    slot.offline();
    let mut reg = REGISTRY.lock();
    reg.retain(|s| !Arc::ptr_eq(s, slot));
}

// ---------------------------------------------------------------------------
// Reader-side API
// ---------------------------------------------------------------------------

/// Register the calling thread as an RCU reader. Idempotent.
///
/// After return the thread may enter read-side critical sections, and
/// owes the engine periodic [`rcu_quiescent_state`] calls (or
/// offline/online brackets) until it unregisters.
pub fn rcu_register_thread() {
    READER.with(|r| {
        let mut tls = r.slot.borrow_mut();
        if tls.is_some() {
            return;
        }
        let slot = Arc::new(ReaderSlot::new(gettid()));
        {
            let mut reg = REGISTRY.lock();
            reg.push(Arc::clone(&slot));
            slot.ctr
                .store(RCU_GP_CTR.load(Ordering::Relaxed), Ordering::Relaxed);
            smp_mb();
        }
        *tls = Some(slot);
    });
}

/// Unregister the calling thread. Idempotent; also runs automatically
/// on thread exit.
pub fn rcu_unregister_thread() {
    let _ = READER.try_with(|r| {
        if let Some(slot) = r.slot.borrow_mut().take() {
            unregister_slot(&slot);
        }
    });
}

/// Enter a read-side critical section. Free: a compiler barrier only.
#[inline(always)]
pub fn rcu_read_lock() {
    debug_assert!(
        current_slot().map_or(false, |s| s.ctr.load(Ordering::Relaxed) != 0),
        "rcu_read_lock on a thread that is not registered and online"
    );
    barrier();
}

/// Exit a read-side critical section. Free: a compiler barrier only.
#[inline(always)]
pub fn rcu_read_unlock() {
    barrier();
}

/// Announce a quiescent state. Must be called outside any read-side
/// critical section. No-op on an unregistered thread.
pub fn rcu_quiescent_state() {
    if let Some(slot) = current_slot() {
        slot.quiescent_state();
    }
}

/// Take the calling thread offline: an extended quiescent state during
/// which the thread must not enter read-side critical sections.
pub fn rcu_thread_offline() {
    if let Some(slot) = current_slot() {
        slot.offline();
    }
}

/// Bring the calling thread back online after [`rcu_thread_offline`].
pub fn rcu_thread_online() {
    if let Some(slot) = current_slot() {
        slot.online();
    }
}

// ---------------------------------------------------------------------------
// Writer-side API
// ---------------------------------------------------------------------------

/// Wait for a full grace period.
///
/// Returns only after every reader whose read-side critical section
/// began before this call has announced a quiescent state, gone
/// offline, or unregistered. A registered caller is taken offline for
/// the duration and restored afterwards, so it cannot deadlock on
/// itself.
///
/// With no registered readers the call returns immediately.
pub fn synchronize_rcu() {
    let slot = current_slot();
    let was_online = slot
        .as_ref()
        .is_some_and(|s| s.ctr.load(Ordering::Relaxed) != 0);

    smp_mb();
    if was_online {
        if let Some(s) = slot.as_ref() {
            s.ctr.store(0, Ordering::Release);
        }
    }

    {
        let reg = REGISTRY.lock();
        if !reg.is_empty() {
            // Two passes: a reader racing with the first flip may carry
            // either phase, but cannot survive both.
            for _ in 0..2 {
                let flipped = RCU_GP_CTR.load(Ordering::Relaxed) ^ RCU_GP_CTR_PHASE;
                RCU_GP_CTR.store(flipped, Ordering::Release);
                smp_mb();
                wait_for_readers(&reg);
            }
        }
    }

    if was_online {
        if let Some(s) = slot.as_ref() {
            s.online();
        }
    }
    smp_mb();
}

/// Wait until no registry slot still carries the pre-flip phase.
fn wait_for_readers(registry: &[Arc<ReaderSlot>]) {
    let mut wait_loops: u32 = 0;
    loop {
        wait_loops = wait_loops.saturating_add(1);
        let gp = RCU_GP_CTR.load(Ordering::Relaxed);
        let mut lagging = false;
        for slot in registry {
            if slot.gp_ongoing(gp) {
                lagging = true;
                if wait_loops >= RCU_QS_ACTIVE_ATTEMPTS {
                    slot.waiting.store(1, Ordering::Relaxed);
                }
            }
        }
        if !lagging {
            break;
        }
        if wait_loops >= RCU_QS_ACTIVE_ATTEMPTS {
            GP_FUTEX.store(-1, Ordering::Relaxed);
            smp_mb();
            // A reader may have quiesced between the scan and arming;
            // only sleep if someone still lags. The bounded wait covers
            // wakes lost to that window.
            let gp = RCU_GP_CTR.load(Ordering::Relaxed);
            if registry.iter().any(|s| s.gp_ongoing(gp)) {
                let _ = futex_wait(&GP_FUTEX, -1, Some(GP_SLEEP));
            }
        } else {
            cpu_relax();
        }
    }
    if wait_loops >= RCU_QS_ACTIVE_ATTEMPTS {
        GP_FUTEX.store(0, Ordering::Relaxed);
    }
}

/// Number of currently registered readers. Test and diagnostic hook.
pub fn registered_reader_count() -> usize {
    REGISTRY.lock().len()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
