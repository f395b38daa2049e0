//! # oxrcu-core
//!
//! Userspace Read-Copy-Update: writers publish new versions of shared
//! data and defer reclamation of old versions until no reader can still
//! observe them. Readers traverse without locks; the grace-period
//! engine decides when "no reader can still observe them" has come
//! true.
//!
//! Two reader flavors:
//!
//! - [`qsbr`] — zero-overhead read side; each registered thread
//!   periodically announces a quiescent state. Re-exported at the crate
//!   root as the default flavor.
//! - [`bp`] — "bulletproof": no registration, safe from async-signal
//!   handlers, at a small per-read cost.
//!
//! Deferred reclamation goes through [`call_rcu`]: callbacks are
//! batched on per-CPU worker threads, one grace period per batch, and
//! the whole service survives `fork()`.
//!
//! ## Example
//!
//! ```no_run
//! use oxrcu_core::{rcu_register_thread, rcu_read_lock, rcu_read_unlock,
//!                  rcu_quiescent_state, synchronize_rcu, RcuPtr};
//!
//! static CONFIG: RcuPtr<u64> = RcuPtr::new(std::ptr::null_mut());
//!
//! rcu_register_thread();
//!
//! // Reader:
//! rcu_read_lock();
//! let p = CONFIG.dereference();
//! if !p.is_null() {
//!     // SAFETY: protected by the read-side critical section.
//!     let _value = unsafe { *p };
//! }
//! rcu_read_unlock();
//! rcu_quiescent_state();
//!
//! // Writer:
//! let new = Box::into_raw(Box::new(42u64));
//! let old = CONFIG.xchg(new);
//! synchronize_rcu();
//! if !old.is_null() {
//!     // SAFETY: no reader can still hold `old` after the grace period.
//!     unsafe { drop(Box::from_raw(old)) };
//! }
//! ```

pub mod affinity;
pub mod arch;
mod atfork;
pub mod bp;
pub mod call_rcu;
pub mod errno;
pub mod futex;
pub mod pointer;
pub mod qsbr;
pub mod wfq;

mod die;

// Unit tests in qsbr and call_rcu both observe the process-global
// reader registry (worker threads are registered readers); one lock
// serializes them across the two modules.
#[cfg(test)]
pub(crate) mod test_util {
    pub(crate) static GLOBAL_RCU_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
}

pub use atfork::rcu_init;
pub use bp::{rcu_bp_after_fork_child, rcu_bp_after_fork_parent, rcu_bp_before_fork};
pub use pointer::{
    rcu_assign_pointer, rcu_cmpxchg_pointer, rcu_dereference, rcu_xchg_pointer, RcuPtr,
};

// QSBR is the default flavor at the crate root.
pub use qsbr::{
    rcu_quiescent_state, rcu_read_lock, rcu_read_unlock, rcu_register_thread,
    rcu_thread_offline, rcu_thread_online, rcu_unregister_thread, synchronize_rcu,
};

pub use call_rcu::{
    call_rcu, call_rcu_after_fork_child, call_rcu_after_fork_parent, call_rcu_before_fork,
    call_rcu_data_free, create_all_cpu_call_rcu_data, create_call_rcu_data,
    free_all_cpu_call_rcu_data, get_call_rcu_data, get_call_rcu_thread, get_cpu_call_rcu_data,
    get_default_call_rcu_data, get_thread_call_rcu_data, set_cpu_call_rcu_data,
    set_thread_call_rcu_data, CallRcuData, CallRcuDataPtr, RcuCallback, RcuHead, CALL_RCU_PAUSE,
    CALL_RCU_PAUSED, CALL_RCU_RT, CALL_RCU_STOP, CALL_RCU_STOPPED,
};
