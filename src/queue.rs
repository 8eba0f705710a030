// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lock-free multi-producer multi-consumer queue of ready task closures,
//! and the notifier bookkeeping an [`ExecutionSystem`](crate::executor::ExecutionSystem)
//! uses to wake exactly one sleeping worker per push.
//!
//! The values list is a Michael-Scott queue; node storage is drawn from a
//! per-queue freelist that only ever grows (in fixed-size blocks of
//! [`BLOCK_SIZE`] nodes) and is never returned to the global allocator until
//! the queue itself is dropped. Both the values list and the freelist are
//! singly-linked stacks addressed by a `(pointer, tag)` pair packed into one
//! `u64`: the tag lives in the high 16 bits and the pointer in the low 48,
//! which is sufficient on every mainstream 64-bit target because user-space
//! pointers are canonical (top 16 bits zero). Every CAS on a head/tail word
//! bumps the tag, which is what makes the scheme ABA-safe without a
//! double-word CAS.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crossbeam_utils::CachePadded;

/// Number of nodes in one freelist block.
pub const BLOCK_SIZE: usize = 64;

const TAG_BITS: u32 = 16;
const PTR_BITS: u32 = 64 - TAG_BITS;
const PTR_MASK: u64 = (1u64 << PTR_BITS) - 1;

#[inline]
fn pack<T>(ptr: *mut Node<T>, tag: u16) -> u64 {
    debug_assert_eq!(ptr as u64 & !PTR_MASK, 0, "pointer does not fit in 48 bits");
    (ptr as u64 & PTR_MASK) | (u64::from(tag) << PTR_BITS)
}

#[inline]
fn unpack_ptr<T>(word: u64) -> *mut Node<T> {
    (word & PTR_MASK) as *mut Node<T>
}

#[inline]
fn unpack_tag(word: u64) -> u16 {
    #[allow(clippy::cast_possible_truncation, reason = "intentional 16-bit tag extraction")]
    {
        (word >> PTR_BITS) as u16
    }
}

struct Node<T> {
    next: AtomicU64,
    slot: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    fn empty() -> Self {
        Self {
            next: AtomicU64::new(0),
            slot: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Unsafe: caller must guarantee exclusive access to the node's slot and
/// that it currently holds an initialized `T`.
unsafe fn take_value<T>(node: *mut Node<T>) -> T {
    // SAFETY: caller contract above.
    unsafe { (*node).slot.get().read().assume_init() }
}

/// Unsafe: caller must guarantee the node's slot is currently uninitialized.
unsafe fn write_value<T>(node: *mut Node<T>, value: T) {
    // SAFETY: caller contract above.
    unsafe {
        (*node).slot.get().write(MaybeUninit::new(value));
    }
}

/// The lock-free freelist of node storage backing a [`TaskQueue`].
///
/// Grown in blocks of [`BLOCK_SIZE`] under a short mutex; popping and
/// pushing free nodes is otherwise a pure CAS loop on a tagged Treiber
/// stack.
struct Freelist<T> {
    head: CachePadded<AtomicU64>,
    blocks: Mutex<Vec<Box<[Node<T>]>>>,
}

impl<T> Freelist<T> {
    fn new() -> Self {
        let list = Self {
            head: CachePadded::new(AtomicU64::new(0)),
            blocks: Mutex::new(Vec::new()),
        };
        list.grow();
        list
    }

    /// Allocates a new block of nodes and pushes all of them onto the
    /// freelist stack.
    fn grow(&self) {
        let mut block: Box<[Node<T>]> = (0..BLOCK_SIZE).map(|_| Node::empty()).collect();
        // Link the block's nodes into a chain, then splice the whole chain
        // onto the freelist head in one CAS.
        for i in 0..block.len() - 1 {
            let next_ptr: *mut Node<T> = ptr::addr_of_mut!(block[i + 1]);
            *block[i].next.get_mut() = pack(next_ptr, 0);
        }
        let first: *mut Node<T> = ptr::addr_of_mut!(block[0]);
        let last: *mut Node<T> = ptr::addr_of_mut!(block[block.len() - 1]);

        let mut blocks = self.blocks.lock().unwrap();
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            // SAFETY: `last` belongs to this not-yet-published block.
            unsafe { (*last).next.store(old_head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(
                    old_head,
                    pack(first, unpack_tag(old_head).wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        blocks.push(block);
    }

    fn pop(&self) -> *mut Node<T> {
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            let node = unpack_ptr::<T>(old_head);
            if node.is_null() {
                self.grow();
                continue;
            }
            // SAFETY: `node` came from the freelist and is not concurrently
            // mutated except via this same CAS protocol.
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if self
                .head
                .compare_exchange_weak(
                    old_head,
                    pack(unpack_ptr::<T>(next), unpack_tag(old_head).wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return node;
            }
        }
    }

    fn push(&self, node: *mut Node<T>) {
        loop {
            let old_head = self.head.load(Ordering::Acquire);
            // SAFETY: `node` is exclusively owned by the caller at this point.
            unsafe { (*node).next.store(old_head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(
                    old_head,
                    pack(node, unpack_tag(old_head).wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
        }
    }
}

// SAFETY: the freelist only ever exposes nodes through the CAS protocol
// above; no node is reachable from two threads at once outside of it.
unsafe impl<T: Send> Send for Freelist<T> {}
// SAFETY: all mutation goes through atomics or the `blocks` mutex.
unsafe impl<T: Send> Sync for Freelist<T> {}

/// One logical stream of ready work: a lock-free MPMC queue of task
/// closures plus the list of worker [`Notifier`]s subscribed to it.
///
/// A closure pushed with [`TaskQueue::push`] is observed by exactly one
/// [`TaskQueue::try_pop`] caller; [`TaskQueue::is_empty`] is advisory only.
pub struct TaskQueue<T> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    free: Freelist<T>,
    subscribers: Mutex<Vec<Arc<Notifier>>>,
}

impl<T> TaskQueue<T> {
    /// Constructs an empty queue with one pre-allocated block of freelist
    /// nodes.
    #[must_use]
    pub fn new() -> Self {
        let free = Freelist::new();
        let stub = free.pop();
        // The stub node carries no value; it only ever participates as the
        // list's dummy head/tail.
        let word = pack(stub, 0);
        Self {
            head: CachePadded::new(AtomicU64::new(word)),
            tail: CachePadded::new(AtomicU64::new(word)),
            free,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a worker notifier so that future pushes may wake it.
    #[expect(clippy::missing_panics_doc, reason = "subscriber mutex poisoning only")]
    pub fn subscribe(&self, notifier: Arc<Notifier>) {
        self.subscribers.lock().unwrap().push(notifier);
    }

    /// Enqueues `value`. Never blocks and never fails under normal
    /// operation; aborts the process if the freelist cannot grow to
    /// provide a node (allocation failure is fatal to the queue, per the
    /// resource model).
    pub fn push(&self, value: T) {
        let node = self.free.pop();
        // SAFETY: `node` was just drawn from the freelist, so its slot is
        // uninitialized, and it is not reachable from any other thread yet.
        unsafe {
            write_value(node, value);
            (*node).next.store(0, Ordering::Relaxed);
        }

        loop {
            let tail_word = self.tail.load(Ordering::Acquire);
            let tail_ptr = unpack_ptr::<T>(tail_word);
            // SAFETY: `tail_ptr` is either the stub or a previously linked
            // node; both remain allocated for the queue's lifetime.
            let next_word = unsafe { (*tail_ptr).next.load(Ordering::Acquire) };
            if tail_word != self.tail.load(Ordering::Acquire) {
                continue;
            }
            let next_ptr = unpack_ptr::<T>(next_word);
            if next_ptr.is_null() {
                // SAFETY: see above.
                let linked = unsafe {
                    (*tail_ptr).next.compare_exchange_weak(
                        next_word,
                        pack(node, unpack_tag(next_word).wrapping_add(1)),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                };
                if linked.is_ok() {
                    let _ = self.tail.compare_exchange(
                        tail_word,
                        pack(node, unpack_tag(tail_word).wrapping_add(1)),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.wake_one_subscriber();
                    return;
                }
            } else {
                // Another producer linked a node but hasn't swung tail yet;
                // help it along before retrying.
                let _ = self.tail.compare_exchange(
                    tail_word,
                    pack(next_ptr, unpack_tag(tail_word).wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }

    /// Attempts to dequeue one value. Returns `None` only if the queue was
    /// observably empty at some point during the call.
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let head_word = self.head.load(Ordering::Acquire);
            let tail_word = self.tail.load(Ordering::Acquire);
            let head_ptr = unpack_ptr::<T>(head_word);
            // SAFETY: `head_ptr` is either the stub or a node previously
            // linked into the list; it remains allocated for the queue's
            // lifetime (freed nodes only re-enter the freelist, never the
            // global allocator).
            let next_word = unsafe { (*head_ptr).next.load(Ordering::Acquire) };
            if head_word != self.head.load(Ordering::Acquire) {
                continue;
            }
            let next_ptr = unpack_ptr::<T>(next_word);
            let tail_ptr = unpack_ptr::<T>(tail_word);
            if head_ptr == tail_ptr {
                if next_ptr.is_null() {
                    return None;
                }
                // Tail has fallen behind; help advance it and retry.
                let _ = self.tail.compare_exchange(
                    tail_word,
                    pack(next_ptr, unpack_tag(tail_word).wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            if self
                .head
                .compare_exchange_weak(
                    head_word,
                    pack(next_ptr, unpack_tag(head_word).wrapping_add(1)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // SAFETY: we won the CAS that made `next_ptr` the new
                // dummy head, so its slot is now exclusively ours to read;
                // no other operation touches a node's slot once it is no
                // longer the node directly after head.
                let value = unsafe { take_value(next_ptr) };
                self.free.push(head_ptr);
                return Some(value);
            }
        }
    }

    /// Advisory check used only by workers deciding whether to sleep.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let head_word = self.head.load(Ordering::Acquire);
        let head_ptr = unpack_ptr::<T>(head_word);
        // SAFETY: see `try_pop`.
        let next = unsafe { (*head_ptr).next.load(Ordering::Acquire) };
        unpack_ptr::<T>(next).is_null()
    }

    /// Walks the subscriber list and wakes the first worker found sleeping,
    /// leaving any others undisturbed (thundering-herd avoidance).
    fn wake_one_subscriber(&self) {
        let subs = self.subscribers.lock().unwrap();
        for notifier in subs.iter() {
            if notifier.try_wake() {
                break;
            }
        }
    }

    /// Unconditionally wakes every subscribed worker, used on shutdown.
    #[expect(clippy::missing_panics_doc, reason = "subscriber mutex poisoning only")]
    pub fn wake_all_subscribers(&self) {
        let subs = self.subscribers.lock().unwrap();
        for notifier in subs.iter() {
            notifier.wake();
        }
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TaskQueue<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

impl<T> fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

// SAFETY: a `TaskQueue<T>` only ever moves `T` values between threads
// through the lock-free protocol above, which requires `T: Send`.
unsafe impl<T: Send> Send for TaskQueue<T> {}
// SAFETY: see above; concurrent `&TaskQueue<T>` access is the whole point.
unsafe impl<T: Send> Sync for TaskQueue<T> {}

static_assertions::assert_impl_all!(TaskQueue<()>: Send, Sync);

/// A park/unpark handle one worker thread subscribes to a [`TaskQueue`]
/// with, so the queue's producers can wake it without a thundering herd.
pub struct Notifier {
    sleeping: AtomicBool,
    gate: Mutex<()>,
    cv: Condvar,
}

impl Notifier {
    /// Constructs a notifier in the awake state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sleeping: AtomicBool::new(false),
            gate: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Marks this notifier as sleeping, then blocks the calling thread
    /// until [`Notifier::try_wake`] or [`Notifier::wake`] clears the flag —
    /// unless `recheck` (called once, immediately after the `sleeping` flag
    /// is set, before actually waiting) reports there's work after all, in
    /// which case the flag is cleared and this returns without blocking.
    ///
    /// Without this recheck a push landing between the caller's last empty
    /// `try_pop` and the `sleeping` store below would race `try_wake`'s
    /// `compare_exchange(true, false)`: it would still observe `sleeping ==
    /// false` and skip waking anyone, stranding the pushed closure until an
    /// unrelated later push. `recheck` closes that window by re-examining
    /// the same condition the caller already had in hand (queue emptiness,
    /// a shutdown flag, ...) while the intent-to-park is already visible to
    /// producers.
    #[expect(clippy::missing_panics_doc, reason = "gate mutex poisoning only")]
    pub fn park_unless(&self, recheck: impl FnOnce() -> bool) {
        self.sleeping.store(true, Ordering::Release);
        if recheck() {
            self.sleeping.store(false, Ordering::Release);
            return;
        }
        let guard = self.gate.lock().unwrap();
        let _guard = self
            .cv
            .wait_while(guard, |()| self.sleeping.load(Ordering::Acquire))
            .unwrap();
    }

    /// Blocks the calling thread until woken or `deadline` elapses,
    /// returning `true` if woken.
    #[expect(clippy::missing_panics_doc, reason = "gate mutex poisoning only")]
    pub fn park_until(&self, deadline: std::time::Instant) -> bool {
        self.sleeping.store(true, Ordering::Release);
        let mut guard = self.gate.lock().unwrap();
        loop {
            if !self.sleeping.load(Ordering::Acquire) {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                self.sleeping.store(false, Ordering::Release);
                return false;
            }
            let (next_guard, timeout) = self.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = next_guard;
            if timeout.timed_out() {
                continue;
            }
        }
    }

    /// Attempts to wake this notifier; returns `true` iff it was sleeping.
    #[expect(clippy::missing_panics_doc, reason = "gate mutex poisoning only")]
    pub fn try_wake(&self) -> bool {
        if self
            .sleeping
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _guard = self.gate.lock().unwrap();
            self.cv.notify_one();
            true
        } else {
            false
        }
    }

    /// Unconditionally wakes this notifier, whether or not it was sleeping.
    #[expect(clippy::missing_panics_doc, reason = "gate mutex poisoning only")]
    pub fn wake(&self) {
        self.sleeping.store(false, Ordering::Release);
        let _guard = self.gate.lock().unwrap();
        self.cv.notify_all();
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("sleeping", &self.sleeping.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_fifo_single_thread() {
        let q: TaskQueue<i32> = TaskQueue::new();
        assert!(q.is_empty());
        q.push(1);
        q.push(2);
        q.push(3);
        assert!(!q.is_empty());
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn freelist_growth_delivers_every_item_exactly_once() {
        let q = Arc::new(TaskQueue::<usize>::new());
        let n = BLOCK_SIZE + 1;
        for i in 0..n {
            q.push(i);
        }
        let mut seen = vec![false; n];
        for _ in 0..n {
            let v = q.try_pop().expect("expected a value");
            assert!(!seen[v], "value {v} delivered twice");
            seen[v] = true;
        }
        assert!(seen.iter().all(|&b| b));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn concurrent_producers_deliver_each_value_exactly_once() {
        let q = Arc::new(TaskQueue::<usize>::new());
        let producers = 4;
        let per_producer = 500;
        let mut handles = Vec::new();
        for p in 0..producers {
            let q = Arc::clone(&q);
            handles.push(thread::spawn(move || {
                for i in 0..per_producer {
                    q.push(p * per_producer + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = vec![false; producers * per_producer];
        let mut count = 0;
        while let Some(v) = q.try_pop() {
            assert!(!seen[v]);
            seen[v] = true;
            count += 1;
        }
        assert_eq!(count, producers * per_producer);
    }

    #[test]
    fn notifier_wakes_only_first_sleeping_subscriber() {
        let q: TaskQueue<i32> = TaskQueue::new();
        let a = Arc::new(Notifier::new());
        let b = Arc::new(Notifier::new());
        q.subscribe(Arc::clone(&a));
        q.subscribe(Arc::clone(&b));

        a.sleeping.store(true, Ordering::Release);
        b.sleeping.store(true, Ordering::Release);

        q.push(42);

        assert!(!a.sleeping.load(Ordering::Acquire));
        assert!(b.sleeping.load(Ordering::Acquire));
    }
}
