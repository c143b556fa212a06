use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// An encoded batch waiting to be delivered.
///
/// The buffer is pooled, [`BinaryBatch::take_payload`] freezes it for
/// sending and [`BinaryBatch::reclaim`] takes it back once the request is
/// done with it.
pub struct BinaryBatch {
    pub batch_id: u64,
    pub size_items: usize,
    pub size_bytes: usize,

    data: BytesMut,
}

impl Debug for BinaryBatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryBatch")
            .field("batch_id", &format_args!("{:x}", self.batch_id))
            .field("size_items", &self.size_items)
            .field("size_bytes", &self.size_bytes)
            .field("capacity", &self.data.capacity())
            .finish()
    }
}

impl BinaryBatch {
    fn with_capacity(capacity: usize) -> Self {
        BinaryBatch {
            batch_id: 0,
            size_items: 0,
            size_bytes: 0,
            data: BytesMut::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Moves the encoded bytes out as an immutable, cheaply clonable handle.
    /// The batch keeps its metadata but holds no buffer until `reclaim`.
    pub fn take_payload(&mut self) -> Bytes {
        std::mem::take(&mut self.data).freeze()
    }

    /// Puts the allocation behind `payload` back into this batch.
    ///
    /// Nothing is reclaimed while another handle to the payload is alive, the
    /// batch then allocates afresh on its next use.
    pub fn reclaim(&mut self, payload: Bytes) {
        if let Ok(mut data) = payload.try_into_mut() {
            data.clear();
            self.data = data;
        }
    }
}

/// FIFO of encoded batches bounded by their total size in bytes.
///
/// Many producers and many consumers may share it. A single spent batch is
/// kept in a pool, so in the steady state one encode buffer bounces between
/// the encoder and the senders instead of being allocated per batch.
pub struct BinaryBatchQueue {
    items: Mutex<VecDeque<BinaryBatch>>,
    pool: Mutex<Option<BinaryBatch>>,

    size_bytes: AtomicUsize,
    max_bytes: usize,

    notify: Notify,
}

impl Debug for BinaryBatchQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryBatchQueue")
            .field("size_bytes", &self.size_bytes)
            .field("max_bytes", &self.max_bytes)
            .field("len", &self.len())
            .field("pool_size", &self.pool_size())
            .finish()
    }
}

impl BinaryBatchQueue {
    pub fn new(max_bytes: usize) -> Self {
        BinaryBatchQueue {
            items: Mutex::new(VecDeque::new()),
            pool: Mutex::new(None),
            size_bytes: AtomicUsize::new(0),
            max_bytes,
            notify: Notify::new(),
        }
    }

    /// Enqueues a batch of `size_items` records whose encoding takes exactly
    /// `claimed_bytes`, written into the batch buffer by `write`.
    ///
    /// Returns false, without calling `write`, when the queue cannot take
    /// `claimed_bytes` more.
    pub fn offer<F>(&self, batch_id: u64, size_items: usize, claimed_bytes: usize, write: F) -> bool
    where
        F: FnOnce(&mut BytesMut),
    {
        if !self.reserve(claimed_bytes) {
            return false;
        }

        // fresh and regrown buffers get 1.5x the claim
        let grown = claimed_bytes + claimed_bytes / 2;
        let mut batch = self
            .pool
            .lock()
            .take()
            .unwrap_or_else(|| BinaryBatch::with_capacity(grown));
        if batch.data.capacity() < claimed_bytes {
            batch.data = BytesMut::with_capacity(grown);
        }

        batch.data.clear();
        write(&mut batch.data);
        batch.batch_id = batch_id;
        batch.size_items = size_items;
        batch.size_bytes = claimed_bytes;

        self.items.lock().push_back(batch);
        self.notify.notify_one();

        true
    }

    /// Takes the oldest batch, releasing its share of the byte budget.
    pub fn borrow(&self) -> Option<BinaryBatch> {
        let batch = self.items.lock().pop_front()?;
        self.size_bytes.fetch_sub(batch.size_bytes, Ordering::AcqRel);

        Some(batch)
    }

    /// Hands a delivered (or dropped) batch back for reuse.
    pub fn return_buffer(&self, batch: BinaryBatch) {
        let mut pool = self.pool.lock();
        if pool.is_none() {
            *pool = Some(batch);
        }
    }

    /// Resolves after a batch was offered. A permit is stored when nobody
    /// waits, so an offer made before the call is not lost.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn pool_size(&self) -> usize {
        usize::from(self.pool.lock().is_some())
    }

    fn reserve(&self, claimed: usize) -> bool {
        let mut current = self.size_bytes.load(Ordering::Acquire);
        loop {
            let Some(next) = current.checked_add(claimed) else {
                return false;
            };
            if next > self.max_bytes {
                return false;
            }

            match self.size_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}
