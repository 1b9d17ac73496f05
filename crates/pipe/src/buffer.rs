//! Double buffer for in-flight USB transfers
//!
//! The producer fills one half while the most recently completed half stays
//! available for inspection. Each half has its own lock, so reading the
//! completed half never contends with the transfer filling the other one.

use crate::error::{PipeError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
pub struct DoubleBuffer {
    halves: [Mutex<Box<[u8]>>; 2],
    /// Index of the half currently being filled
    index: AtomicUsize,
    size: usize,
}

fn allocate(size: usize) -> Result<Box<[u8]>> {
    let mut data = Vec::new();
    data.try_reserve_exact(size).map_err(|e| {
        tracing::error!("Unable to create double buffer (2 * {} bytes): {}", size, e);
        PipeError::Resource(format!("double buffer allocation failed: {}", e))
    })?;
    data.resize(size, 0);
    Ok(data.into_boxed_slice())
}

impl DoubleBuffer {
    /// Allocate two halves of `size` bytes each
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(PipeError::IllegalParameter(
                "double buffer size must be non-zero".to_string(),
            ));
        }
        let first = allocate(size)?;
        let second = allocate(size)?;
        tracing::debug!("Double buffer each of size {} bytes", size);

        Ok(Self {
            halves: [Mutex::new(first), Mutex::new(second)],
            index: AtomicUsize::new(0),
            size,
        })
    }

    /// Size of each half in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Index of the half currently being filled
    pub fn fill_index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    /// Run `f` on the half currently being filled
    pub fn fill<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let index = self.fill_index();
        let mut half = self.halves[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut half[..])
    }

    /// Hand the filled half over to the consumer side and start filling the other
    ///
    /// Returns the index of the half that was just completed.
    pub fn swap(&self) -> usize {
        self.index.fetch_xor(1, Ordering::AcqRel)
    }

    /// Run `f` on the most recently completed half
    pub fn with_completed<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let index = self.fill_index() ^ 1;
        let half = self.halves[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&half[..])
    }
}
