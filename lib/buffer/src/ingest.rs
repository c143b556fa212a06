use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures::task::AtomicWaker;

use crate::queue::Queue;

/// Creates a bounded, two-phase MPSC buffer holding at most `capacity` items.
///
/// Items leave the queue when polled, but the slot they occupy is only given
/// back once the consumer calls [`IngestReceiver::commit`]. The consumer can
/// therefore hold on to polled items (while it is encoding and handing them
/// over downstream) without producers refilling the space underneath it.
#[must_use]
pub fn ingest<T>(capacity: usize) -> (IngestSender<T>, IngestReceiver<T>) {
    let inner = Arc::new(Inner {
        queue: Queue::default(),
        occupied: AtomicUsize::new(0),
        capacity,
        closed: AtomicBool::new(false),
        recv: AtomicWaker::new(),
    });

    (
        IngestSender {
            inner: Arc::clone(&inner),
        },
        IngestReceiver { inner },
    )
}

struct Inner<T> {
    queue: Queue<T>,
    occupied: AtomicUsize,
    capacity: usize,
    closed: AtomicBool,

    recv: AtomicWaker,
}

impl<T> Inner<T> {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.recv.wake();
    }
}

/// Producer handle, cheap to clone and safe to use from any thread.
pub struct IngestSender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for IngestSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for IngestSender<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestSender")
            .field("occupied", &self.inner.occupied)
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.inner.closed)
            .finish()
    }
}

impl<T> IngestSender<T> {
    /// Offers an item to the buffer.
    ///
    /// # Errors
    ///
    /// The item is handed back when the buffer is full or closed.
    pub fn offer(&self, item: T) -> Result<(), T> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(item);
        }

        let mut current = self.inner.occupied.load(Ordering::Acquire);
        loop {
            if current >= self.inner.capacity {
                return Err(item);
            }

            match self.inner.occupied.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.inner.queue.push(item);
        self.inner.recv.wake();

        Ok(())
    }

    /// Number of slots taken, items queued plus items polled but not yet
    /// committed.
    #[inline]
    pub fn occupied(&self) -> usize {
        self.inner.occupied.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Rejects every following offer. Items already queued stay pollable.
    pub fn close(&self) {
        self.inner.close()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// The single consumer of an ingestion buffer.
///
/// `poll` takes `&mut self`, so a reference obtained from `peek` can never
/// outlive the item it points to.
pub struct IngestReceiver<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Debug for IngestReceiver<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestReceiver")
            .field("occupied", &self.inner.occupied)
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.inner.closed)
            .finish()
    }
}

impl<T> Drop for IngestReceiver<T> {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

impl<T> IngestReceiver<T> {
    /// The oldest item, left in place.
    #[inline]
    pub fn peek(&self) -> Option<&T>
    where
        T: Sync,
    {
        self.inner.queue.peek()
    }

    /// Removes the oldest item. Its slot stays occupied until committed.
    #[inline]
    pub fn poll(&mut self) -> Option<T> {
        self.inner.queue.pop_spin()
    }

    /// Releases `n` slots taken by items polled earlier.
    pub fn commit(&self, n: usize) {
        let _ = self
            .inner
            .occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(n))
            });
    }

    #[inline]
    pub fn occupied(&self) -> usize {
        self.inner.occupied.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// True when nothing is left to poll. Polled but uncommitted items do
    /// not count.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once an item can be polled, or the buffer is closed.
    #[inline]
    pub fn ready(&mut self) -> Ready<'_, T> {
        Ready { receiver: self }
    }

    pub fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        if !self.inner.queue.is_empty() || self.is_closed() {
            return Poll::Ready(());
        }

        // register first, then re-check, so a push racing with the
        // registration is not missed
        self.inner.recv.register(cx.waker());

        if !self.inner.queue.is_empty() || self.is_closed() {
            return Poll::Ready(());
        }

        Poll::Pending
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct Ready<'a, T> {
    receiver: &'a IngestReceiver<T>,
}

impl<T> Future for Ready<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver.poll_ready(cx)
    }
}
