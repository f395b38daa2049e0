//! Futex-backed sleep/wake over a shared `AtomicI32`.
//!
//! The word protocol used throughout this crate: `0` means open, `-1`
//! means a sleeper is (about to be) parked. Wakers that observe `-1`
//! store `0` and issue a wake; sleepers re-check the word before
//! parking so a wake between check and park is never lost (the kernel
//! compares the word against `expected` atomically).
//!
//! Off Linux there is no futex syscall; `wait` degrades to a bounded
//! sleep-and-recheck loop, which preserves the ≤ wake-granularity
//! latency contract at higher cost.

use core::sync::atomic::AtomicI32;
use std::time::Duration;

/// Block until `futex` no longer holds `expected`, a wake arrives, or
/// `timeout` elapses.
///
/// Returns `Ok(())` on wake or value change, `Err(ETIMEDOUT)` /
/// `Err(EINTR)` / `Err(EAGAIN)` as reported by the kernel. All error
/// returns are benign for callers here; they simply rescan.
#[cfg(target_os = "linux")]
pub fn futex_wait(futex: &AtomicI32, expected: i32, timeout: Option<Duration>) -> Result<(), i32> {
    let ts;
    let ts_ptr = match timeout {
        Some(d) => {
            ts = libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            };
            &ts as *const libc::timespec
        }
        None => core::ptr::null(),
    };
    // SAFETY: the futex word is a valid, aligned i32 for the duration
    // of the call; the timespec (when present) lives on this frame.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        // SAFETY: errno read immediately after a failed syscall.
        let err = unsafe { *libc::__errno_location() };
        Err(err)
    }
}

/// Wake one waiter parked on `futex`.
#[cfg(target_os = "linux")]
pub fn futex_wake_one(futex: &AtomicI32) {
    // SAFETY: the futex word is a valid, aligned i32.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            futex.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1i32,
        );
    }
}

/// Portable fallback: bounded sleep-and-recheck.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(futex: &AtomicI32, expected: i32, timeout: Option<Duration>) -> Result<(), i32> {
    let step = Duration::from_millis(1);
    let mut remaining = timeout.unwrap_or(Duration::from_millis(10));
    while futex.load(core::sync::atomic::Ordering::Acquire) == expected {
        if remaining.is_zero() {
            return Err(crate::errno::ETIMEDOUT);
        }
        let slice = step.min(remaining);
        std::thread::sleep(slice);
        remaining -= slice;
    }
    Ok(())
}

/// Portable fallback: wakes are delivered by the sleeper's recheck.
#[cfg(not(target_os = "linux"))]
pub fn futex_wake_one(_futex: &AtomicI32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn wait_returns_when_value_differs() {
        let f = AtomicI32::new(0);
        // Word is 0, expected is -1: kernel refuses to sleep (EAGAIN),
        // fallback sees mismatch immediately.
        let _ = futex_wait(&f, -1, Some(Duration::from_millis(50)));
    }

    #[test]
    fn wait_times_out() {
        let f = AtomicI32::new(-1);
        let start = std::time::Instant::now();
        let _ = futex_wait(&f, -1, Some(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn wake_unblocks_waiter() {
        let f = Arc::new(AtomicI32::new(-1));
        let f2 = Arc::clone(&f);
        let waiter = std::thread::spawn(move || {
            while f2.load(Ordering::Acquire) == -1 {
                let _ = futex_wait(&f2, -1, Some(Duration::from_millis(100)));
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        f.store(0, Ordering::Release);
        futex_wake_one(&f);
        waiter.join().expect("waiter panicked");
    }
}
