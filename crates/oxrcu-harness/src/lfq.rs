//! RCU-protected lock-free queue fixture.
//!
//! Michael–Scott shape with a permanent dummy at the head: enqueue
//! CASes the tail node's next link then swings the tail; dequeue CASes
//! the head forward and retires the old head node. Retired nodes still
//! visible to concurrent dequeuers make this RCU's problem: callers
//! dequeue under a read-side critical section and defer the free with
//! `call_rcu`.

use oxrcu_core::{RcuHead, RcuPtr};

/// Queue node. The callback head comes first so a `*mut RcuHead`
/// handed to `call_rcu` is also a `*mut LfqNode`.
#[repr(C)]
pub struct LfqNode {
    pub head: RcuHead,
    next: RcuPtr<LfqNode>,
    pub value: u64,
}

impl LfqNode {
    pub fn boxed(value: u64) -> *mut LfqNode {
        Box::into_raw(Box::new(LfqNode {
            head: RcuHead::new(),
            next: RcuPtr::new(std::ptr::null_mut()),
            value,
        }))
    }
}

/// The queue: head always points at the current dummy node.
pub struct RcuLfQueue {
    head: RcuPtr<LfqNode>,
    tail: RcuPtr<LfqNode>,
}

// SAFETY: all mutation is CAS-based; node lifetime is governed by the
// callers' grace-period protocol.
unsafe impl Send for RcuLfQueue {}
unsafe impl Sync for RcuLfQueue {}

impl RcuLfQueue {
    pub fn new() -> Self {
        let dummy = LfqNode::boxed(0);
        Self {
            head: RcuPtr::new(dummy),
            tail: RcuPtr::new(dummy),
        }
    }

    /// Append `node`. Call inside a read-side critical section.
    ///
    /// # Safety
    ///
    /// `node` must be live, not enqueued anywhere, and ownership passes
    /// to the queue until a dequeue retires it.
    pub unsafe fn enqueue(&self, node: *mut LfqNode) {
        // SAFETY: node is exclusively ours until linked.
        unsafe {
            (*node).next.assign(std::ptr::null_mut());
        }
        loop {
            let tail = self.tail.dereference();
            // SAFETY: tail is reachable and protected by the caller's
            // read-side critical section.
            let next = unsafe { (*tail).next.cmpxchg(std::ptr::null_mut(), node) };
            if next.is_null() {
                // Linked; swing the tail (failure means someone else
                // already did).
                self.tail.cmpxchg(tail, node);
                return;
            }
            // Tail was lagging; help it forward and retry.
            self.tail.cmpxchg(tail, next);
        }
    }

    /// Pop the oldest element. Call inside a read-side critical section.
    ///
    /// Returns the retired node (whose `value` is stale dummy content —
    /// the dequeued value lives in the node that just became the
    /// dummy), or null when empty. The caller must defer reclamation of
    /// the returned node until a grace period, typically via
    /// `call_rcu`.
    pub fn dequeue(&self) -> *mut LfqNode {
        loop {
            let head = self.head.dereference();
            // SAFETY: head is protected by the caller's read-side
            // critical section.
            let next = unsafe { (*head).next.dereference() };
            if next.is_null() {
                return std::ptr::null_mut();
            }
            if self.head.cmpxchg(head, next) == head {
                return head;
            }
        }
    }

    /// Tear down a quiesced queue: no concurrent access, all retired
    /// nodes already reclaimed. Frees the remaining dummy.
    pub fn destroy(self) {
        let dummy = self.head.dereference();
        debug_assert!({
            // SAFETY: exclusive access during destroy.
            let next = unsafe { (*dummy).next.dereference() };
            next.is_null()
        });
        // SAFETY: allocated by LfqNode::boxed; queue is empty.
        unsafe { drop(Box::from_raw(dummy)) };
    }
}

impl Default for RcuLfQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free(node: *mut LfqNode) {
        // SAFETY: allocated by LfqNode::boxed, retired by dequeue.
        unsafe { drop(Box::from_raw(node)) };
    }

    #[test]
    fn empty_queue_dequeues_null() {
        let q = RcuLfQueue::new();
        assert!(q.dequeue().is_null());
        q.destroy();
    }

    #[test]
    fn elements_come_out_in_order() {
        let q = RcuLfQueue::new();
        for v in 0..10u64 {
            // SAFETY: fresh node, single-threaded.
            unsafe { q.enqueue(LfqNode::boxed(v)) };
        }
        // The retired node carries the previous dummy's value; the
        // values parade through one position late.
        let mut retired = 0usize;
        loop {
            let node = q.dequeue();
            if node.is_null() {
                break;
            }
            retired += 1;
            free(node);
        }
        assert_eq!(retired, 10);
        q.destroy();
    }

    #[test]
    fn concurrent_enqueue_dequeue_balances() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let q = Arc::new(RcuLfQueue::new());
        let dequeued = Arc::new(AtomicUsize::new(0));
        const PER_THREAD: usize = 10_000;
        const ENQUEUERS: usize = 2;

        let producers: Vec<_> = (0..ENQUEUERS)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for v in 0..PER_THREAD as u64 {
                        // SAFETY: fresh node per iteration.
                        unsafe { q.enqueue(LfqNode::boxed(v)) };
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().expect("producer panicked");
        }

        // Single consumer after the producers are done: nodes retired
        // here can be freed directly, no grace period needed.
        loop {
            let node = q.dequeue();
            if node.is_null() {
                break;
            }
            dequeued.fetch_add(1, Ordering::Relaxed);
            free(node);
        }
        assert_eq!(dequeued.load(Ordering::Relaxed), ENQUEUERS * PER_THREAD);
        Arc::try_unwrap(q).ok().expect("queue still shared").destroy();
    }
}
