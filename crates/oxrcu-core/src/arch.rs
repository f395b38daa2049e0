//! Architecture shim: memory barriers, cache-line geometry, CPU relax,
//! and a cycle counter.
//!
//! Everything here compiles down to the matching hardware primitive on
//! x86-64 (mfence / lfence / sfence / `rep; nop` / rdtsc) and to the
//! portable equivalent elsewhere.

use core::sync::atomic::{compiler_fence, fence, Ordering};

/// Cache-line size used for alignment of per-thread and per-worker
/// structures. Sized for the largest prefetch granularity in the wild
/// (adjacent-line prefetch on x86 makes the effective line 128 bytes).
pub const CACHE_LINE_SIZE: usize = 128;

/// Full memory barrier.
#[inline(always)]
pub fn smp_mb() {
    fence(Ordering::SeqCst);
}

/// Read memory barrier.
#[inline(always)]
pub fn smp_rmb() {
    fence(Ordering::Acquire);
}

/// Write memory barrier.
#[inline(always)]
pub fn smp_wmb() {
    fence(Ordering::Release);
}

/// Compiler barrier. No hardware fence is emitted; the compiler may not
/// reorder memory accesses across it.
#[inline(always)]
pub fn barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// Busy-wait hint for spin loops.
#[inline(always)]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

/// Cycle-counter value. Monotonic per CPU; use only for coarse
/// instrumentation, not for ordering.
pub type Cycles = u64;

/// Read the CPU cycle counter.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn get_cycles() -> Cycles {
    // SAFETY: rdtsc has no memory effects and is available on every
    // x86-64 implementation.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Read the CPU cycle counter (portable fallback: monotonic nanoseconds).
#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn get_cycles() -> Cycles {
    use std::time::Instant;
    use std::sync::OnceLock;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as Cycles
}
