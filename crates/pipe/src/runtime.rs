//! USB pipe runtime
//!
//! A [`UsbPipe`] stages the data of one platform pipe: a double buffer for the
//! transfer in flight, a bounded message queue and, if selected by the
//! options, a byte stream. The transfer completion path hands data in through
//! [`UsbPipe::complete`], which runs the client's [`CompletionHandler`] or
//! falls back to [`UsbPipe::deliver`]. A consumer thread takes data out with
//! `dequeue`/`read_packet`.
//!
//! Only one transport is active per runtime. A byte-stream runtime refuses
//! the queue operations and a queue runtime refuses the packet operations.
//!
//! The runtime exclusively owns its buffers, queue, stream and handler;
//! dropping it releases all of them.

use crate::buffer::DoubleBuffer;
use crate::error::{PipeError, Result};
use crate::queue::{MessageQueue, QueueStats};
use crate::stream::ByteStream;
use crate::timeout::Timeout;
use crate::usb::PipeRef;
use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, trace, warn};

bitflags! {
    /// Transport and direction selection of a pipe runtime
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PipeOptions: u16 {
        /// Outbound pipe (clear for an inbound pipe)
        const TX_QUEUE = 0x0001;
        /// Deliver raw packets through the byte stream instead of the queue
        const BYTE_STREAM = 0x0010;
    }
}

impl PipeOptions {
    /// Inbound pipe using the message queue
    pub const RX_QUEUE: Self = Self::empty();
}

/// Sizing of a pipe runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeConfig {
    /// Size of each half of the double buffer
    pub buffer_size: usize,
    /// Number of queue slots
    pub queue_capacity: usize,
    /// Bytes per queue slot
    pub element_size: usize,
    pub options: PipeOptions,
}

/// Client hook run on every completed inbound transfer
///
/// Receives the runtime and the transfer data. It typically decodes the USB
/// packet and stores the result with [`UsbPipe::enqueue`] or
/// [`UsbPipe::write_packet`], returning the number of items stored.
pub type CompletionHandler = Box<dyn Fn(&UsbPipe, &[u8]) -> Result<usize> + Send + Sync>;

/// Runtime state of one platform pipe
pub struct UsbPipe {
    pipe_ref: Option<PipeRef>,
    buffer: DoubleBuffer,
    queue: MessageQueue,
    stream: Option<ByteStream>,
    options: PipeOptions,
    /// An asynchronous transfer is active on this pipe
    running: AtomicBool,
    on_complete: Option<CompletionHandler>,
    /// Packets the byte stream refused
    stream_drops: AtomicU64,
}

impl fmt::Debug for UsbPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbPipe")
            .field("pipe_ref", &self.pipe_ref)
            .field("buffer", &self.buffer)
            .field("queue", &self.queue)
            .field("stream", &self.stream)
            .field("options", &self.options)
            .field("running", &self.running)
            .field("on_complete", &self.on_complete.is_some())
            .field("stream_drops", &self.stream_drops)
            .finish()
    }
}

impl UsbPipe {
    /// Allocate the double buffer, the queue and, if selected, the byte stream
    ///
    /// # Errors
    ///
    /// `Resource` (or `IllegalParameter` for zero sizes) if any part cannot be
    /// created; everything allocated up to that point is released again.
    pub fn new(config: PipeConfig) -> Result<Self> {
        debug!(
            "Creating pipe runtime (buffer {} bytes, queue {} x {} bytes, options {:?})",
            config.buffer_size, config.queue_capacity, config.element_size, config.options
        );
        let buffer = DoubleBuffer::new(config.buffer_size)?;
        let queue = MessageQueue::new(config.queue_capacity, config.element_size)?;
        let stream = if config.options.contains(PipeOptions::BYTE_STREAM) {
            Some(ByteStream::new()?)
        } else {
            None
        };

        Ok(Self {
            pipe_ref: None,
            buffer,
            queue,
            stream,
            options: config.options,
            running: AtomicBool::new(false),
            on_complete: None,
            stream_drops: AtomicU64::new(0),
        })
    }

    /// Bind the runtime to a platform pipe
    pub fn configure(&mut self, pipe_ref: PipeRef) -> Result<()> {
        if pipe_ref == 0 {
            return Err(PipeError::IllegalParameter(
                "pipe reference 0 is not a pipe".to_string(),
            ));
        }
        if self.is_running() {
            return Err(PipeError::Resource(format!(
                "pipe #{} is running",
                self.pipe_ref.unwrap_or(0)
            )));
        }
        self.pipe_ref = Some(pipe_ref);
        debug!("Pipe runtime configured for pipe #{}", pipe_ref);
        Ok(())
    }

    /// Register the handler that receives completed transfers
    ///
    /// Replaces any previous handler. Without a handler, completed transfers
    /// go through [`UsbPipe::deliver`].
    ///
    /// # Errors
    ///
    /// `Resource` while a transfer is active on the pipe.
    pub fn set_completion_handler<F>(&mut self, handler: F) -> Result<()>
    where
        F: Fn(&UsbPipe, &[u8]) -> Result<usize> + Send + Sync + 'static,
    {
        if self.is_running() {
            return Err(PipeError::Resource(format!(
                "pipe #{} is running",
                self.pipe_ref.unwrap_or(0)
            )));
        }
        self.on_complete = Some(Box::new(handler));
        debug!(
            "Completion handler registered on pipe #{}",
            self.pipe_ref.unwrap_or(0)
        );
        Ok(())
    }

    /// Remove the completion handler, restoring the default delivery
    pub fn clear_completion_handler(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(PipeError::Resource(format!(
                "pipe #{} is running",
                self.pipe_ref.unwrap_or(0)
            )));
        }
        self.on_complete = None;
        Ok(())
    }

    pub fn has_completion_handler(&self) -> bool {
        self.on_complete.is_some()
    }

    /// Release all resources
    ///
    /// Equivalent to dropping the runtime, with a log line.
    pub fn destroy(self) {
        if self.is_running() {
            warn!(
                "Destroying pipe #{} while a transfer is still active",
                self.pipe_ref.unwrap_or(0)
            );
        }
        debug!("Pipe runtime for pipe #{} destroyed", self.pipe_ref.unwrap_or(0));
    }

    pub fn pipe_ref(&self) -> Option<PipeRef> {
        self.pipe_ref
    }

    pub fn options(&self) -> PipeOptions {
        self.options
    }

    pub fn is_tx(&self) -> bool {
        self.options.contains(PipeOptions::TX_QUEUE)
    }

    pub fn uses_byte_stream(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Mark the pipe as running; false if it already was
    pub(crate) fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_stopped(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn buffer(&self) -> &DoubleBuffer {
        &self.buffer
    }

    fn queue(&self) -> Result<&MessageQueue> {
        if self.stream.is_some() {
            error!("Unable to access message queue (byte stream selected)");
            return Err(PipeError::Resource(
                "message queue not active on a byte-stream pipe".to_string(),
            ));
        }
        Ok(&self.queue)
    }

    /// # Errors
    ///
    /// `Resource` on a byte-stream runtime.
    pub fn enqueue(&self, message: &[u8]) -> Result<()> {
        self.queue()?.enqueue(message)
    }

    /// # Errors
    ///
    /// `Resource` on a byte-stream runtime.
    pub fn dequeue(&self, message: &mut [u8], timeout: Timeout) -> Result<()> {
        self.queue()?.dequeue(message, timeout)
    }

    pub fn dequeue_element(&self, timeout: Timeout) -> Result<Vec<u8>> {
        self.queue()?.dequeue_element(timeout)
    }

    /// Discard queued elements and clear the overflow state
    pub fn reset_queue(&self) -> Result<()> {
        self.queue()?.reset();
        Ok(())
    }

    /// Sticky queue overflow flag
    pub fn queue_overflow(&self) -> bool {
        self.queue.overflow()
    }

    pub fn overflow_counter(&self) -> u64 {
        self.queue.overflow_counter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn element_size(&self) -> usize {
        self.queue.element_size()
    }

    fn stream(&self) -> Result<&ByteStream> {
        self.stream.as_ref().ok_or_else(|| {
            error!("Unable to access byte stream (not configured)");
            PipeError::Resource("byte stream not configured".to_string())
        })
    }

    /// Write a raw packet to the byte stream
    ///
    /// # Errors
    ///
    /// `Resource` if the runtime was created without [`PipeOptions::BYTE_STREAM`],
    /// `Full` if the stream refused the packet (counted in [`UsbPipe::stream_drops`]).
    pub fn write_packet(&self, packet: &[u8]) -> Result<()> {
        self.write_stream(self.stream()?, packet)
    }

    fn write_stream(&self, stream: &ByteStream, packet: &[u8]) -> Result<()> {
        let written = stream.write(packet);
        if let Err(PipeError::Full) = written {
            self.stream_drops.fetch_add(1, Ordering::Relaxed);
        }
        written
    }

    /// Packets lost because the byte stream was full
    pub fn stream_drops(&self) -> u64 {
        self.stream_drops.load(Ordering::Relaxed)
    }

    /// Read exactly `packet.len()` bytes from the byte stream
    ///
    /// # Errors
    ///
    /// `Resource` if the runtime was created without [`PipeOptions::BYTE_STREAM`].
    pub fn read_packet(&self, packet: &mut [u8], timeout: Timeout) -> Result<()> {
        self.stream()?.read(packet, timeout)
    }

    /// Entry point of the transfer completion path
    ///
    /// Runs the registered [`CompletionHandler`], or [`UsbPipe::deliver`] if
    /// there is none. Empty transfers are ignored.
    pub fn complete(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        match &self.on_complete {
            Some(handler) => handler(self, data),
            None => self.deliver(data),
        }
    }

    /// Hand completed transfer data to the active transport
    ///
    /// In byte-stream mode the data is written as one packet. In queue mode it
    /// is split into `element_size` chunks which are enqueued one by one;
    /// chunks that do not fit are dropped and counted as overflow, a trailing
    /// partial chunk is discarded. Returns the number of elements (or packets)
    /// stored.
    pub fn deliver(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if let Some(stream) = &self.stream {
            self.write_stream(stream, data)?;
            return Ok(1);
        }

        let element_size = self.queue.element_size();
        let chunks = data.chunks_exact(element_size);
        let remainder = chunks.remainder().len();
        let mut stored = 0;
        for chunk in chunks {
            match self.queue.enqueue(chunk) {
                Ok(()) => stored += 1,
                Err(PipeError::Full) => {}
                Err(e) => return Err(e),
            }
        }
        if remainder != 0 {
            warn!(
                "Discarding {} trailing bytes on pipe #{} (element size {})",
                remainder,
                self.pipe_ref.unwrap_or(0),
                element_size
            );
        }
        trace!(
            "Delivered {} bytes as {} elements on pipe #{}",
            data.len(),
            stored,
            self.pipe_ref.unwrap_or(0)
        );
        Ok(stored)
    }
}
