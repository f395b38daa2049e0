//! Wait-free MPSC queue used by the callback service.
//!
//! Producers are wait-free: an enqueue is one atomic exchange on the
//! tail link plus one store to the previous link. The single consumer
//! detaches the entire pending chain in O(1) by resetting `head` and
//! exchanging `tail` back to the head link.
//!
//! ## Layout
//!
//! `head` doubles as a link field: after a batch detach, `tail` points
//! at `head` itself, so the next enqueue writes straight into `head`.
//! A sentinel `dummy` node seeds the queue so the very first enqueue
//! has a link to chain through; the consumer must skip it (compare
//! against [`WfqQueue::dummy_ptr`]). The dummy leaves the queue with
//! the first detached batch and never returns.
//!
//! A producer that has exchanged the tail but not yet stored into the
//! previous link leaves a transient NULL in the chain; the consumer
//! resolves it by briefly sleeping and reloading ([`chain_next`]).
//!
//! Nodes are intrusive and caller-owned. The queue never allocates.

use core::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

/// Intrusive queue link. Embed as the first field of the enqueued
/// record and cast between the two (both are `repr(C)`).
#[repr(C)]
pub struct WfqNode {
    next: AtomicPtr<WfqNode>,
}

impl WfqNode {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Reset the link before enqueueing.
    pub fn init(&self) {
        self.next.store(core::ptr::null_mut(), Ordering::Relaxed);
    }
}

impl Default for WfqNode {
    fn default() -> Self {
        Self::new()
    }
}

/// A detached batch: the chain from `first` up to the node whose link
/// field is `tail_link`.
pub struct WfqBatch {
    pub first: *mut WfqNode,
    pub tail_link: *mut AtomicPtr<WfqNode>,
}

/// The queue. Self-referential once initialized (`tail` points into the
/// structure), so it must live at a stable address: call [`init`]
/// after the owning allocation is in place and never move it afterward.
///
/// [`init`]: WfqQueue::init
pub struct WfqQueue {
    head: AtomicPtr<WfqNode>,
    tail: AtomicPtr<AtomicPtr<WfqNode>>,
    dummy: WfqNode,
}

impl WfqQueue {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
            tail: AtomicPtr::new(core::ptr::null_mut()),
            dummy: WfqNode::new(),
        }
    }

    /// Seed the queue with its sentinel node.
    ///
    /// # Safety
    ///
    /// `self` must already live at its final address; the queue holds
    /// interior pointers from here on.
    pub unsafe fn init(&self) {
        self.dummy.init();
        self.head
            .store(self.dummy_ptr(), Ordering::Relaxed);
        self.tail
            .store(&self.dummy.next as *const _ as *mut _, Ordering::Relaxed);
    }

    /// Address of the sentinel node; consumers skip it during batch
    /// iteration.
    pub fn dummy_ptr(&self) -> *mut WfqNode {
        &self.dummy as *const WfqNode as *mut WfqNode
    }

    fn head_link(&self) -> *mut AtomicPtr<WfqNode> {
        &self.head as *const AtomicPtr<WfqNode> as *mut AtomicPtr<WfqNode>
    }

    /// True when no node (not even the sentinel) is chained: the tail
    /// points back at the head link. Note the freshly initialized queue
    /// reports non-empty — it still carries the sentinel, which the
    /// first batch detach consumes.
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire) == self.head_link()
    }

    /// Append `node` to the queue. Wait-free; safe to call from many
    /// threads concurrently.
    ///
    /// # Safety
    ///
    /// `node` must be valid, not currently enqueued anywhere, and must
    /// remain untouched by the caller until the consumer hands it back.
    pub unsafe fn enqueue(&self, node: *mut WfqNode) {
        // SAFETY: caller guarantees node validity and exclusivity.
        unsafe {
            (*node).init();
            let link = &(*node).next as *const AtomicPtr<WfqNode> as *mut AtomicPtr<WfqNode>;
            let prev_link = self.tail.swap(link, Ordering::AcqRel);
            // Producers between the swap above and this store leave the
            // chain transiently broken; consumers resolve via chain_next.
            (*prev_link).store(node, Ordering::Release);
        }
    }

    /// Detach everything currently enqueued. Single consumer only.
    ///
    /// Returns `None` when the queue is empty. The returned chain ends
    /// at the node owning `tail_link`; new enqueues land in a fresh
    /// chain and are not part of this batch.
    ///
    /// # Safety
    ///
    /// Only one thread may consume from the queue.
    pub unsafe fn splice_batch(&self) -> Option<WfqBatch> {
        if self.is_empty() {
            return None;
        }
        // A producer that just reset tail to a new node may not have
        // linked it into head yet.
        let mut first = self.head.load(Ordering::Acquire);
        while first.is_null() {
            std::thread::sleep(Duration::from_millis(1));
            first = self.head.load(Ordering::Acquire);
        }
        self.head.store(core::ptr::null_mut(), Ordering::Relaxed);
        let tail_link = self.tail.swap(self.head_link(), Ordering::AcqRel);
        Some(WfqBatch { first, tail_link })
    }

    /// Append a detached chain to this queue, ahead of any nodes
    /// enqueued afterwards. Used when draining a dying queue into a
    /// surviving one.
    ///
    /// # Safety
    ///
    /// `batch` must come from [`splice_batch`] and contain no sentinel
    /// node owned by another (shorter-lived) queue.
    ///
    /// [`splice_batch`]: WfqQueue::splice_batch
    pub unsafe fn splice_onto(&self, batch: WfqBatch) {
        // SAFETY: batch.tail_link is the link field of a live node per
        // the caller contract.
        unsafe {
            let end_prev = self.tail.swap(batch.tail_link, Ordering::AcqRel);
            (*end_prev).store(batch.first, Ordering::Release);
        }
    }
}

/// Step to the next node of a detached chain, resolving transient NULL
/// links left by in-flight producers. Returns null at the end of the
/// batch.
///
/// # Safety
///
/// `node` must belong to a chain returned by [`WfqQueue::splice_batch`]
/// whose `tail_link` is `tail_link`.
pub unsafe fn chain_next(node: *mut WfqNode, tail_link: *mut AtomicPtr<WfqNode>) -> *mut WfqNode {
    // SAFETY: node is a live chain member per the caller contract.
    unsafe {
        let link = &(*node).next as *const AtomicPtr<WfqNode> as *mut AtomicPtr<WfqNode>;
        if link == tail_link {
            // Last node of the batch; its link belongs to the next
            // batch now.
            return core::ptr::null_mut();
        }
        let mut next = (*node).next.load(Ordering::Acquire);
        while next.is_null() {
            std::thread::sleep(Duration::from_millis(1));
            next = (*node).next.load(Ordering::Acquire);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(queue: &WfqQueue) -> Vec<*mut WfqNode> {
        let mut out = Vec::new();
        // SAFETY: single-consumer access within the test.
        unsafe {
            let Some(batch) = queue.splice_batch() else {
                return out;
            };
            let mut node = batch.first;
            while !node.is_null() {
                if node != queue.dummy_ptr() {
                    out.push(node);
                }
                node = chain_next(node, batch.tail_link);
            }
        }
        out
    }

    fn boxed_node() -> *mut WfqNode {
        Box::into_raw(Box::new(WfqNode::new()))
    }

    fn free_nodes(nodes: Vec<*mut WfqNode>) {
        for n in nodes {
            // SAFETY: created via Box::into_raw in boxed_node.
            unsafe { drop(Box::from_raw(n)) };
        }
    }

    #[test]
    fn fresh_queue_carries_only_the_sentinel() {
        let q = Box::new(WfqQueue::new());
        unsafe { q.init() };
        assert!(!q.is_empty(), "sentinel should register as pending");
        assert!(collect(&q).is_empty());
        assert!(q.is_empty(), "first detach consumes the sentinel");
    }

    #[test]
    fn enqueue_preserves_fifo() {
        let q = Box::new(WfqQueue::new());
        unsafe { q.init() };
        let nodes: Vec<_> = (0..16).map(|_| boxed_node()).collect();
        for &n in &nodes {
            unsafe { q.enqueue(n) };
        }
        let drained = collect(&q);
        assert_eq!(drained, nodes);
        free_nodes(drained);
    }

    #[test]
    fn batches_partition_the_stream() {
        let q = Box::new(WfqQueue::new());
        unsafe { q.init() };
        let first: Vec<_> = (0..4).map(|_| boxed_node()).collect();
        for &n in &first {
            unsafe { q.enqueue(n) };
        }
        let batch1 = collect(&q);
        assert_eq!(batch1, first);

        let second: Vec<_> = (0..4).map(|_| boxed_node()).collect();
        for &n in &second {
            unsafe { q.enqueue(n) };
        }
        let batch2 = collect(&q);
        assert_eq!(batch2, second);
        free_nodes(batch1);
        free_nodes(batch2);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        use std::sync::Arc;

        const PER_THREAD: usize = 1000;
        const THREADS: usize = 4;

        let q = Arc::new(WfqQueue::new());
        unsafe { q.init() };

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        unsafe { q.enqueue(boxed_node()) };
                    }
                })
            })
            .collect();

        let mut drained = Vec::new();
        while drained.len() < PER_THREAD * THREADS {
            drained.extend(collect(&q));
        }
        for h in handles {
            h.join().expect("producer panicked");
        }
        drained.extend(collect(&q));
        assert_eq!(drained.len(), PER_THREAD * THREADS);
        free_nodes(drained);
    }

    #[test]
    fn splice_onto_merges_chains() {
        let src = Box::new(WfqQueue::new());
        let dst = Box::new(WfqQueue::new());
        unsafe {
            src.init();
            dst.init();
        }
        // Drain both sentinels first so the spliced chain is sentinel-free.
        assert!(collect(&src).is_empty());
        assert!(collect(&dst).is_empty());

        let nodes: Vec<_> = (0..8).map(|_| boxed_node()).collect();
        for &n in &nodes {
            unsafe { src.enqueue(n) };
        }
        unsafe {
            let batch = src.splice_batch().expect("source should be non-empty");
            dst.splice_onto(batch);
        }
        assert!(src.is_empty());
        let drained = collect(&dst);
        assert_eq!(drained, nodes);
        free_nodes(drained);
    }
}
