//! CPU topology and affinity capabilities.
//!
//! The per-CPU worker directory depends on `sched_getcpu` and
//! `sysconf(_SC_NPROCESSORS_CONF)`. Where either is unavailable the
//! per-CPU path degrades: `num_configured_cpus` reports no CPUs and
//! callback routing falls through to the default worker.

/// Number of configured CPUs, or `None` when the platform cannot
/// enumerate them.
#[cfg(target_os = "linux")]
pub fn num_configured_cpus() -> Option<usize> {
    // SAFETY: sysconf with a valid name has no memory effects.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n <= 0 { None } else { Some(n as usize) }
}

#[cfg(not(target_os = "linux"))]
pub fn num_configured_cpus() -> Option<usize> {
    None
}

/// CPU the calling thread is currently running on, or `None` when the
/// platform cannot report it.
#[cfg(target_os = "linux")]
pub fn current_cpu() -> Option<usize> {
    // SAFETY: sched_getcpu has no memory effects.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 { None } else { Some(cpu as usize) }
}

#[cfg(not(target_os = "linux"))]
pub fn current_cpu() -> Option<usize> {
    None
}

/// Pin the calling thread to `cpu`.
#[cfg(target_os = "linux")]
pub fn set_current_thread_affinity(cpu: usize) -> Result<(), i32> {
    // SAFETY: mask is a plain value on this frame, zeroed before use.
    unsafe {
        let mut mask: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut mask);
        libc::CPU_SET(cpu, &mut mask);
        if libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &mask) != 0 {
            return Err(*libc::__errno_location());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_current_thread_affinity(_cpu: usize) -> Result<(), i32> {
    // No affinity support; callers treat this as best-effort.
    Ok(())
}

/// OS thread id of the caller. Used for reader-slot bookkeeping only.
#[cfg(target_os = "linux")]
pub fn gettid() -> i32 {
    // SAFETY: gettid has no memory effects and cannot fail.
    (unsafe { libc::syscall(libc::SYS_gettid) }) as i32
}

#[cfg(not(target_os = "linux"))]
pub fn gettid() -> i32 {
    use std::sync::atomic::{AtomicI32, Ordering};

    static NEXT: AtomicI32 = AtomicI32::new(1);
    thread_local! {
        static TID: i32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|t| *t)
}
