//! Bounded message queue
//!
//! A fixed-capacity FIFO of fixed-size byte elements shared between a producer
//! (the transfer completion path) and a consumer thread. All storage is
//! allocated once at construction; the queue never grows.
//!
//! # Overflow
//!
//! When the queue is full an enqueue is rejected and the new element is
//! dropped. The oldest data is never evicted. Every rejection increments the
//! overflow counter and raises a sticky overflow flag, so a consumer that was
//! not dequeuing at the time can still find out that data was lost. Both are
//! cleared only by [`MessageQueue::reset`].

use crate::error::{PipeError, Result};
use crate::timeout::Timeout;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Ring storage and bookkeeping, only touched under the queue mutex
#[derive(Debug)]
struct Ring {
    storage: Box<[u8]>,
    element_size: usize,
    capacity: usize,
    /// Number of valid elements
    used: usize,
    /// Slot of the next element to read
    head: usize,
    /// Slot of the last element written
    tail: usize,
    overflow: bool,
    overflow_counter: u64,
}

impl Ring {
    fn push(&mut self, element: &[u8]) -> bool {
        if self.used < self.capacity {
            if self.used != 0 {
                self.tail = (self.tail + 1) % self.capacity;
            } else {
                self.head = self.tail;
            }
            let offset = self.tail * self.element_size;
            self.storage[offset..offset + self.element_size].copy_from_slice(element);
            self.used += 1;
            true
        } else {
            self.overflow_counter += 1;
            self.overflow = true;
            false
        }
    }

    fn pop(&mut self, out: &mut [u8]) -> bool {
        if self.used == 0 {
            return false;
        }
        let offset = self.head * self.element_size;
        out[..self.element_size].copy_from_slice(&self.storage[offset..offset + self.element_size]);
        self.head = (self.head + 1) % self.capacity;
        self.used -= 1;
        true
    }

    fn clear(&mut self) {
        self.used = 0;
        self.head = 0;
        self.tail = 0;
        self.overflow = false;
        self.overflow_counter = 0;
    }
}

/// Snapshot of queue occupancy and overflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub capacity: usize,
    pub element_size: usize,
    pub used: usize,
    pub overflow: bool,
    pub overflow_counter: u64,
}

/// Thread-safe bounded FIFO of fixed-size elements
#[derive(Debug)]
pub struct MessageQueue {
    ring: Mutex<Ring>,
    /// Signalled once per successful enqueue
    available: Condvar,
    capacity: usize,
    element_size: usize,
}

impl MessageQueue {
    /// Allocate a queue of `capacity` slots, each `element_size` bytes
    ///
    /// # Errors
    ///
    /// `IllegalParameter` for a zero capacity or element size, `Resource` if
    /// the backing storage cannot be allocated.
    pub fn new(capacity: usize, element_size: usize) -> Result<Self> {
        if capacity == 0 || element_size == 0 {
            return Err(PipeError::IllegalParameter(format!(
                "queue needs a non-zero geometry ({} x {} bytes)",
                capacity, element_size
            )));
        }
        let bytes = capacity.checked_mul(element_size).ok_or_else(|| {
            PipeError::Resource(format!(
                "queue size overflows ({} x {} bytes)",
                capacity, element_size
            ))
        })?;

        let mut storage = Vec::new();
        storage.try_reserve_exact(bytes).map_err(|e| {
            tracing::error!(
                "Unable to create message queue ({} x {} bytes): {}",
                capacity,
                element_size,
                e
            );
            PipeError::Resource(format!("message queue allocation failed: {}", e))
        })?;
        storage.resize(bytes, 0);

        debug!(
            "Message queue for {} elements of size {} bytes",
            capacity, element_size
        );

        Ok(Self {
            ring: Mutex::new(Ring {
                storage: storage.into_boxed_slice(),
                element_size,
                capacity,
                used: 0,
                head: 0,
                tail: 0,
                overflow: false,
                overflow_counter: 0,
            }),
            available: Condvar::new(),
            capacity,
            element_size,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        // Ring bookkeeping is updated after the copy, so a panic mid-copy
        // leaves it consistent.
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an element and wake one waiting consumer
    ///
    /// # Errors
    ///
    /// `Full` if the queue has no free slot; the element is dropped and the
    /// overflow state is updated. `IllegalParameter` if `element` is not
    /// exactly `element_size` bytes.
    pub fn enqueue(&self, element: &[u8]) -> Result<()> {
        if element.len() != self.element_size {
            return Err(PipeError::IllegalParameter(format!(
                "element of {} bytes, queue expects {}",
                element.len(),
                self.element_size
            )));
        }

        let mut ring = self.lock();
        let first_overflow = !ring.overflow;
        if ring.push(element) {
            trace!("Enqueued element, used={}/{}", ring.used, ring.capacity);
            drop(ring);
            self.available.notify_one();
            Ok(())
        } else {
            if first_overflow {
                warn!(
                    "Message queue overflow ({} slots), dropping new elements",
                    ring.capacity
                );
            }
            trace!("Dropped element, overflow counter={}", ring.overflow_counter);
            Err(PipeError::Full)
        }
    }

    /// Remove the oldest element into `out`
    ///
    /// Blocks according to `timeout` while the queue is empty. Wakeups that
    /// find the queue still empty go back to waiting until the deadline.
    ///
    /// # Errors
    ///
    /// `Empty` if no element arrived in time, `IllegalParameter` if `out` is
    /// shorter than `element_size`.
    pub fn dequeue(&self, out: &mut [u8], timeout: Timeout) -> Result<()> {
        if out.len() < self.element_size {
            return Err(PipeError::IllegalParameter(format!(
                "output buffer of {} bytes, queue elements are {}",
                out.len(),
                self.element_size
            )));
        }

        let mut ring = self.lock();
        match timeout {
            Timeout::Immediate => {}
            Timeout::Infinite => {
                ring = self
                    .available
                    .wait_while(ring, |r| r.used == 0)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Timeout::After(duration) => {
                let (guard, _) = self
                    .available
                    .wait_timeout_while(ring, duration, |r| r.used == 0)
                    .unwrap_or_else(PoisonError::into_inner);
                ring = guard;
            }
        }

        if ring.pop(out) {
            trace!("Dequeued element, used={}/{}", ring.used, ring.capacity);
            Ok(())
        } else {
            Err(PipeError::Empty)
        }
    }

    /// Remove the oldest element into a freshly allocated buffer
    pub fn dequeue_element(&self, timeout: Timeout) -> Result<Vec<u8>> {
        let mut element = vec![0u8; self.element_size];
        self.dequeue(&mut element, timeout)?;
        Ok(element)
    }

    /// Drop all queued elements and clear the overflow flag and counter
    ///
    /// The backing storage is kept.
    pub fn reset(&self) {
        let mut ring = self.lock();
        ring.clear();
        debug!("Message queue reset");
    }

    /// Sticky flag: at least one element was dropped since the last reset
    pub fn overflow(&self) -> bool {
        self.lock().overflow
    }

    /// Number of dropped elements since the last reset
    pub fn overflow_counter(&self) -> u64 {
        self.lock().overflow_counter
    }

    pub fn len(&self) -> usize {
        self.lock().used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn stats(&self) -> QueueStats {
        let ring = self.lock();
        QueueStats {
            capacity: ring.capacity,
            element_size: ring.element_size,
            used: ring.used,
            overflow: ring.overflow,
            overflow_counter: ring.overflow_counter,
        }
    }
}
