use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Bounded FIFO of `f32` elements connecting two pipeline stages.
///
/// The producer appends batches with [`push`](SampleQueue::push), which
/// blocks while the buffer is at capacity. The consumer drains with
/// [`pull`](SampleQueue::pull), which blocks until data arrives or the
/// producer latches the queue exhausted. Exhaustion is one-way: once set,
/// `pull` hands out whatever is still buffered and then returns empty
/// batches forever, and `push` fails fast.
pub struct SampleQueue {
    inner: Mutex<Inner>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

struct Inner {
    buffer: VecDeque<f32>,
    exhausted: bool,
}

impl SampleQueue {
    /// `capacity` bounds the number of buffered elements; a producer
    /// pushing into a full queue blocks until the consumer catches up.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        SampleQueue {
            inner: Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity),
                exhausted: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
        }
    }

    /// Append `batch`, blocking under backpressure. Returns `false` if the
    /// queue has been exhausted (the batch is dropped in that case).
    ///
    /// A batch larger than the whole capacity is admitted once the buffer
    /// is empty, so oversized pushes still make progress.
    pub fn push(&self, batch: Vec<f32>) -> bool {
        self.push_slice(&batch)
    }

    /// Copying variant of [`push`](SampleQueue::push) for producers that
    /// reuse their batch buffer.
    pub fn push_slice(&self, batch: &[f32]) -> bool {
        if batch.is_empty() {
            return true;
        }
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.exhausted {
                return false;
            }
            let fits = inner.buffer.len() + batch.len() <= self.capacity;
            if fits || inner.buffer.is_empty() {
                break;
            }
            inner = self.writable.wait(inner).unwrap();
        }
        inner.buffer.extend(batch.iter().copied());
        self.readable.notify_one();
        true
    }

    /// Remove and return up to `max` buffered elements in FIFO order
    /// (`max == 0` means "everything buffered"). Blocks until data is
    /// available or the queue is exhausted; an empty result means
    /// exhausted *and* drained.
    pub fn pull(&self, max: usize) -> Vec<f32> {
        let mut inner = self.inner.lock().unwrap();
        while inner.buffer.is_empty() && !inner.exhausted {
            inner = self.readable.wait(inner).unwrap();
        }
        if inner.buffer.is_empty() {
            return Vec::new();
        }
        let take = if max == 0 || max >= inner.buffer.len() {
            inner.buffer.len()
        } else {
            max
        };
        let result: Vec<f32> = inner.buffer.drain(..take).collect();
        self.writable.notify_one();
        result
    }

    /// Latch the queue exhausted. Idempotent; wakes every waiter on both
    /// sides so blocked producers fail fast and consumers drain out.
    pub fn set_exhausted(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.exhausted = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// True only once the latch is set and the buffer has been drained.
    pub fn is_exhausted(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.exhausted && inner.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
