mod cache;

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use cache::CachePadded;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn alloc(value: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

/// A producer swapped the head but has not linked its node yet. The item is
/// there, the consumer just cannot reach it for a moment.
#[derive(Debug, PartialEq)]
pub struct InconsistentError;

/// Node based multi-producer single-consumer queue.
///
/// `push` is wait-free and may be called from any number of threads. `pop`,
/// `peek` and `is_empty` must only ever be called by one thread at a time,
/// the owners of this type (see [`crate::ingest`]) enforce that by handing
/// out a single consumer handle.
///
/// See: <http://www.1024cores.net/home/lock-free-algorithms/queues/non-intrusive-mpsc-node-based-queue>
pub struct Queue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<UnsafeCell<*mut Node<T>>>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        unsafe {
            let mut current = *self.tail.get();

            while !current.is_null() {
                let next = (*current).next.load(Ordering::Relaxed);
                drop(Box::from_raw(current));
                current = next;
            }
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        let stub = Node::alloc(None);

        Self {
            head: CachePadded::new(AtomicPtr::new(stub)),
            tail: CachePadded::new(UnsafeCell::new(stub)),
        }
    }
}

impl<T> Queue<T> {
    pub fn push(&self, item: T) {
        let node = Node::alloc(Some(item));
        let prev = self.head.swap(node, Ordering::AcqRel);

        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Pops the oldest item.
    ///
    /// `Err(InconsistentError)` means the queue does hold data but a pusher
    /// was preempted halfway, retrying shortly will succeed.
    pub fn pop(&self) -> Result<Option<T>, InconsistentError> {
        unsafe {
            let tail = *self.tail.get();
            let next = (*tail).next.load(Ordering::Acquire);

            if !next.is_null() {
                *self.tail.get() = next;

                // `next` becomes the new stub, its value moves out
                let item = (*next).value.take();
                drop(Box::from_raw(tail));

                return Ok(item);
            }

            if self.head.load(Ordering::Acquire) == tail {
                Ok(None)
            } else {
                Err(InconsistentError)
            }
        }
    }

    /// Like `pop` but spins through the inconsistent window, which only
    /// lasts for the two instructions between swap and link in `push`.
    pub fn pop_spin(&self) -> Option<T> {
        loop {
            match self.pop() {
                Ok(item) => return item,
                Err(InconsistentError) => std::hint::spin_loop(),
            }
        }
    }

    /// Borrows the oldest item without removing it.
    pub fn peek(&self) -> Option<&T> {
        unsafe {
            let tail = *self.tail.get();
            let next = (*tail).next.load(Ordering::Acquire);

            if next.is_null() {
                return None;
            }

            (*next).value.as_ref()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == unsafe { *self.tail.get() }
    }
}
