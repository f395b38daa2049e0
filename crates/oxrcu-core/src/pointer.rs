//! Pointer publication: the writer/reader hand-off cell.
//!
//! Writers publish a new version of a record with a release-store and
//! readers pick it up with an acquire-load inside a read-side critical
//! section. The cell is one machine word; the generic parameter changes
//! only the pointee type, never the generated code shape.
//!
//! Writers must serialize among themselves with their own protocol;
//! the cell only orders writer-to-reader hand-off.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicPtr, Ordering};

/// An RCU-protected pointer cell.
pub struct RcuPtr<T> {
    p: AtomicPtr<T>,
    _marker: PhantomData<*mut T>,
}

// SAFETY: all access goes through atomic operations; the grace-period
// protocol (not this cell) guarantees pointee lifetime.
unsafe impl<T: Send + Sync> Send for RcuPtr<T> {}
unsafe impl<T: Send + Sync> Sync for RcuPtr<T> {}

impl<T> RcuPtr<T> {
    pub const fn new(ptr: *mut T) -> Self {
        Self {
            p: AtomicPtr::new(ptr),
            _marker: PhantomData,
        }
    }

    /// Acquire-load the current version. Call inside a read-side
    /// critical section; the returned pointer is valid until the
    /// caller's next quiescent state (QSBR) or read unlock (BP).
    #[inline]
    pub fn dereference(&self) -> *mut T {
        self.p.load(Ordering::Acquire)
    }

    /// Release-store a new version. All writer stores to `*v` before
    /// this call are visible to any reader that dereferences the new
    /// pointer.
    #[inline]
    pub fn assign(&self, v: *mut T) {
        self.p.store(v, Ordering::Release);
    }

    /// Atomically publish `v` and return the previous version.
    #[inline]
    pub fn xchg(&self, v: *mut T) -> *mut T {
        self.p.swap(v, Ordering::AcqRel)
    }

    /// Publish `new` only if the cell still holds `old`. Returns the
    /// observed previous value; equality with `old` signals success.
    #[inline]
    pub fn cmpxchg(&self, old: *mut T, new: *mut T) -> *mut T {
        match self
            .p
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(prev) => prev,
            Err(prev) => prev,
        }
    }
}

impl<T> Default for RcuPtr<T> {
    fn default() -> Self {
        Self::new(core::ptr::null_mut())
    }
}

/// Acquire-load `p`. See [`RcuPtr::dereference`].
#[inline]
pub fn rcu_dereference<T>(p: &RcuPtr<T>) -> *mut T {
    p.dereference()
}

/// Release-store `v` into `p`. See [`RcuPtr::assign`].
#[inline]
pub fn rcu_assign_pointer<T>(p: &RcuPtr<T>, v: *mut T) {
    p.assign(v)
}

/// Atomic exchange. See [`RcuPtr::xchg`].
#[inline]
pub fn rcu_xchg_pointer<T>(p: &RcuPtr<T>, v: *mut T) -> *mut T {
    p.xchg(v)
}

/// Atomic compare-and-swap. See [`RcuPtr::cmpxchg`].
#[inline]
pub fn rcu_cmpxchg_pointer<T>(p: &RcuPtr<T>, old: *mut T, new: *mut T) -> *mut T {
    p.cmpxchg(old, new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_null_by_default() {
        let p: RcuPtr<u64> = RcuPtr::default();
        assert!(p.dereference().is_null());
    }

    #[test]
    fn assign_then_dereference() {
        let p: RcuPtr<u64> = RcuPtr::default();
        let v = Box::into_raw(Box::new(7u64));
        p.assign(v);
        assert_eq!(p.dereference(), v);
        // SAFETY: v came from Box::into_raw above and has no readers.
        unsafe { drop(Box::from_raw(v)) };
    }

    #[test]
    fn xchg_returns_previous() {
        let a = Box::into_raw(Box::new(1u64));
        let b = Box::into_raw(Box::new(2u64));
        let p = RcuPtr::new(a);
        assert_eq!(p.xchg(b), a);
        assert_eq!(p.dereference(), b);
        // SAFETY: both came from Box::into_raw and have no readers.
        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn cmpxchg_succeeds_only_on_match() {
        let a = Box::into_raw(Box::new(1u64));
        let b = Box::into_raw(Box::new(2u64));
        let p = RcuPtr::new(a);

        let prev = p.cmpxchg(a, b);
        assert_eq!(prev, a, "matching CAS must succeed");
        assert_eq!(p.dereference(), b);

        let prev = p.cmpxchg(a, core::ptr::null_mut());
        assert_eq!(prev, b, "stale CAS must fail and report the winner");
        assert_eq!(p.dereference(), b);

        // SAFETY: both came from Box::into_raw and have no readers.
        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }
}
