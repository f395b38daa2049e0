//! Fatal-error exit and warn-once diagnostics.
//!
//! OS-primitive failures (thread spawn, affinity, mutex state) indicate
//! a process too corrupt to uphold grace-period guarantees; continuing
//! silently could let a reader touch freed memory. Such failures abort.

use std::sync::Once;

/// Abort the process with a diagnostic. Used for failures after which
/// the grace-period contract can no longer be honored.
pub(crate) fn die(what: &str, err: i32) -> ! {
    log::error!("oxrcu: {what}: errno {err}");
    eprintln!("[error] oxrcu: {what}: errno {err}");
    std::process::abort();
}

/// Emit a warning exactly once per call site.
///
/// `once` must be a `static Once` owned by the caller so each distinct
/// condition warns independently.
pub(crate) fn warn_once(once: &'static Once, msg: &str) {
    once.call_once(|| {
        log::warn!("oxrcu: {msg}");
        eprintln!("[warn] oxrcu: {msg}");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warn_once_fires_once() {
        static ONCE: Once = Once::new();
        warn_once(&ONCE, "test condition");
        warn_once(&ONCE, "test condition");
        assert!(ONCE.is_completed());
    }
}
