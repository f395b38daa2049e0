//! Process-wide fork glue.
//!
//! The fork hooks themselves live with their flavors
//! ([`crate::call_rcu`], [`crate::bp`]); this module wires them into
//! `pthread_atfork` so a plain `fork()` anywhere in the process runs
//! them in the right order. Applications that cannot call [`rcu_init`]
//! early may instead invoke the hooks manually around each fork.
//!
//! Lock order: the callback-service registry is taken before the BP
//! arena in `prepare`, and released in reverse in both `parent` and
//! `child`.

use std::sync::Once;

static ATFORK_ONCE: Once = Once::new();

/// Initialize the library: install the fork hooks exactly once.
/// Idempotent and cheap; safe to call from several threads.
#[cfg(unix)]
pub fn rcu_init() {
    ATFORK_ONCE.call_once(|| {
        extern "C" fn prepare() {
            crate::call_rcu::call_rcu_before_fork();
            crate::bp::rcu_bp_before_fork();
        }
        extern "C" fn parent() {
            crate::bp::rcu_bp_after_fork_parent();
            crate::call_rcu::call_rcu_after_fork_parent();
        }
        extern "C" fn child() {
            crate::bp::rcu_bp_after_fork_child();
            crate::call_rcu::call_rcu_after_fork_child();
        }
        // SAFETY: the handlers do not unwind and only use
        // fork-hook-safe operations by construction.
        let rc = unsafe { libc::pthread_atfork(Some(prepare), Some(parent), Some(child)) };
        if rc != 0 {
            crate::die::die("pthread_atfork registration failed", rc);
        }
    });
}

/// No fork on this platform; nothing to install.
#[cfg(not(unix))]
pub fn rcu_init() {
    ATFORK_ONCE.call_once(|| {});
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        rcu_init();
        rcu_init();
        assert!(ATFORK_ONCE.is_completed());
    }
}
