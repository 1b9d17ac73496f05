//! Test utilities for rust-canusb
//!
//! Provides a simulated USB interface and helper functions for testing the
//! pipe runtime without hardware.
//!
//! # Example
//!
//! ```
//! use common::test_utils::SimulatedInterface;
//! use pipe::query_endpoints;
//!
//! let interface = SimulatedInterface::can_adapter_two_channels();
//! let endpoints = query_endpoints(&interface).unwrap();
//! assert_eq!(endpoints.num_endpoints(), 3);
//! assert_eq!(endpoints.pipe_ref_out(2), 4);
//! ```

use pipe::{PipeDirection, PipeRef, PipeType, UsbInterface};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest time a simulated read idles before reporting a timeout
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Descriptor of one simulated pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedPipe {
    pub transfer_type: PipeType,
    pub direction: PipeDirection,
    pub packet_size: u16,
}

/// Scripted outcome of one bulk IN transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStep {
    Data(Vec<u8>),
    Error(rusb::Error),
}

/// In-memory [`UsbInterface`]
///
/// Pipe metadata comes from the descriptors given at construction. Bulk IN
/// transfers replay scripted [`ReadStep`]s per pipe and report
/// `rusb::Error::Timeout` when the script is exhausted. Bulk OUT transfers
/// are recorded.
#[derive(Debug, Default)]
pub struct SimulatedInterface {
    pipes: Vec<SimulatedPipe>,
    num_pipes_error: Option<rusb::Error>,
    query_errors: HashMap<PipeRef, rusb::Error>,
    reads: Mutex<HashMap<PipeRef, VecDeque<ReadStep>>>,
    writes: Mutex<Vec<(PipeRef, Vec<u8>)>>,
    read_calls: AtomicU64,
}

impl SimulatedInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two CAN channels: endpoint 1 with 64-byte bulk pipes #1 (IN) and #2
    /// (OUT), endpoint 2 with 512-byte bulk pipes #3 (IN) and #4 (OUT)
    pub fn can_adapter_two_channels() -> Self {
        Self::new().with_bulk_pair(64).with_bulk_pair(512)
    }

    /// Append one pipe
    pub fn with_pipe(
        mut self,
        transfer_type: PipeType,
        direction: PipeDirection,
        packet_size: u16,
    ) -> Self {
        self.pipes.push(SimulatedPipe {
            transfer_type,
            direction,
            packet_size,
        });
        self
    }

    /// Append a bulk IN pipe followed by a bulk OUT pipe
    pub fn with_bulk_pair(self, packet_size: u16) -> Self {
        self.with_pipe(PipeType::Bulk, PipeDirection::In, packet_size)
            .with_pipe(PipeType::Bulk, PipeDirection::Out, packet_size)
    }

    /// Make the pipe count query fail
    pub fn fail_num_pipes(mut self, error: rusb::Error) -> Self {
        self.num_pipes_error = Some(error);
        self
    }

    /// Make every metadata query of `pipe` fail
    pub fn fail_pipe_queries(mut self, pipe: PipeRef, error: rusb::Error) -> Self {
        self.query_errors.insert(pipe, error);
        self
    }

    /// Queue data to be returned by the next bulk IN transfer on `pipe`
    pub fn push_read(&self, pipe: PipeRef, data: &[u8]) {
        self.push_step(pipe, ReadStep::Data(data.to_vec()));
    }

    /// Queue an error to be returned by a bulk IN transfer on `pipe`
    pub fn push_read_error(&self, pipe: PipeRef, error: rusb::Error) {
        self.push_step(pipe, ReadStep::Error(error));
    }

    fn push_step(&self, pipe: PipeRef, step: ReadStep) {
        let mut reads = self.reads.lock().unwrap_or_else(PoisonError::into_inner);
        reads.entry(pipe).or_default().push_back(step);
    }

    /// Scripted reads not yet consumed on `pipe`
    pub fn pending_reads(&self, pipe: PipeRef) -> usize {
        let reads = self.reads.lock().unwrap_or_else(PoisonError::into_inner);
        reads.get(&pipe).map_or(0, VecDeque::len)
    }

    /// Bulk IN transfers attempted so far, on any pipe
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::Relaxed)
    }

    /// Bulk OUT transfers recorded so far
    pub fn writes(&self) -> Vec<(PipeRef, Vec<u8>)> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn pipe(&self, pipe: PipeRef) -> Result<&SimulatedPipe, rusb::Error> {
        if let Some(error) = self.query_errors.get(&pipe) {
            return Err(*error);
        }
        if pipe == 0 {
            return Err(rusb::Error::InvalidParam);
        }
        self.pipes
            .get(pipe as usize - 1)
            .ok_or(rusb::Error::InvalidParam)
    }
}

impl UsbInterface for SimulatedInterface {
    fn num_pipes(&self) -> Result<u8, rusb::Error> {
        if let Some(error) = self.num_pipes_error {
            return Err(error);
        }
        u8::try_from(self.pipes.len()).map_err(|_| rusb::Error::Overflow)
    }

    fn pipe_transfer_type(&self, pipe: PipeRef) -> Result<PipeType, rusb::Error> {
        self.pipe(pipe).map(|p| p.transfer_type)
    }

    fn pipe_direction(&self, pipe: PipeRef) -> Result<PipeDirection, rusb::Error> {
        self.pipe(pipe).map(|p| p.direction)
    }

    fn pipe_max_packet_size(&self, pipe: PipeRef) -> Result<u16, rusb::Error> {
        self.pipe(pipe).map(|p| p.packet_size)
    }

    fn read_pipe(
        &self,
        pipe: PipeRef,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        let step = {
            let mut reads = self.reads.lock().unwrap_or_else(PoisonError::into_inner);
            reads.get_mut(&pipe).and_then(VecDeque::pop_front)
        };
        match step {
            Some(ReadStep::Data(data)) if data.len() > buf.len() => Err(rusb::Error::Overflow),
            Some(ReadStep::Data(data)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Some(ReadStep::Error(error)) => Err(error),
            None => {
                std::thread::sleep(timeout.min(IDLE_POLL));
                Err(rusb::Error::Timeout)
            }
        }
    }

    fn write_pipe(
        &self,
        pipe: PipeRef,
        buf: &[u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        if self.pipe(pipe)?.direction != PipeDirection::Out {
            return Err(rusb::Error::InvalidParam);
        }
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pipe, buf.to_vec()));
        Ok(buf.len())
    }
}

/// Poll `condition` until it holds or `timeout` expires
///
/// Returns the last value of the condition.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Eight-byte element carrying `n` in little-endian order
pub fn numbered_element(n: u64) -> [u8; 8] {
    n.to_le_bytes()
}
