//! Read pump
//!
//! Keeps a bulk IN transfer armed on a pipe and hands every completed transfer
//! to the pipe runtime. The pump runs in its own named OS thread: it reads into
//! the fill half of the runtime's double buffer, swaps halves, and hands the
//! completed half to [`UsbPipe::complete`], which runs the client's completion
//! handler or the default delivery into the queue or byte stream.
//!
//! [`transmit`] is the outbound counterpart: it drains the queue of a TX
//! runtime into its bulk OUT pipe.
//!
//! Platform timeouts are only idle polls that let the thread notice an abort
//! request. Any other platform error stops the pump and clears the runtime's
//! running flag. Status changes are posted as [`PumpEvent`]s; posting never
//! blocks the transfer loop.

use crate::error::{PipeError, Result};
use crate::runtime::UsbPipe;
use crate::timeout::Timeout;
use crate::usb::{PipeRef, UsbInterface};
use async_channel::{Receiver, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the pump status channel
const EVENT_CAPACITY: usize = 16;

/// Read pump tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSettings {
    /// Timeout of each bulk read; bounds how long an abort takes
    pub read_timeout: Duration,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// Status messages posted by a read pump
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEvent {
    /// Transfers are armed on the pipe
    Started { pipe: PipeRef },
    /// The pump stopped after an abort request
    Stopped {
        pipe: PipeRef,
        /// Completed transfers carrying data
        transfers: u64,
    },
    /// The pump stopped on a platform error
    Failed { pipe: PipeRef, error: String },
}

/// Handle to a running read pump
pub struct ReadPump {
    pipe: Arc<UsbPipe>,
    pipe_ref: PipeRef,
    stop: Arc<AtomicBool>,
    events: Receiver<PumpEvent>,
    thread: Option<JoinHandle<Result<()>>>,
}

/// Start reading `pipe`'s platform pipe in a dedicated thread
///
/// # Errors
///
/// - `NullArgument` if the runtime was not configured with a pipe
/// - `IllegalParameter` for an outbound runtime
/// - `Resource` if the pipe is already running or the thread cannot be spawned
pub fn spawn_read_pump<I>(
    interface: Arc<I>,
    pipe: Arc<UsbPipe>,
    settings: PumpSettings,
) -> Result<ReadPump>
where
    I: UsbInterface + ?Sized + 'static,
{
    let pipe_ref = pipe.pipe_ref().ok_or(PipeError::NullArgument("pipe reference"))?;
    if pipe.is_tx() {
        return Err(PipeError::IllegalParameter(format!(
            "pipe #{} is an outbound pipe",
            pipe_ref
        )));
    }
    if !pipe.try_start() {
        return Err(PipeError::Resource(format!(
            "pipe #{} is already running",
            pipe_ref
        )));
    }

    let (event_tx, event_rx) = bounded(EVENT_CAPACITY);
    let stop = Arc::new(AtomicBool::new(false));

    let spawned = {
        let pipe = pipe.clone();
        let stop = stop.clone();
        std::thread::Builder::new()
            .name(format!("usb-pipe-{}", pipe_ref))
            .spawn(move || run(interface.as_ref(), &pipe, pipe_ref, &stop, &event_tx, settings))
    };
    let thread = match spawned {
        Ok(thread) => thread,
        Err(e) => {
            pipe.set_stopped();
            error!("Unable to start read pump on pipe #{}: {}", pipe_ref, e);
            return Err(PipeError::Resource(format!("thread spawn failed: {}", e)));
        }
    };

    Ok(ReadPump {
        pipe,
        pipe_ref,
        stop,
        events: event_rx,
        thread: Some(thread),
    })
}

fn post(events: &Sender<PumpEvent>, event: PumpEvent) {
    if let Err(e) = events.try_send(event) {
        trace!("Pump event dropped: {}", e);
    }
}

fn run<I: UsbInterface + ?Sized>(
    interface: &I,
    pipe: &UsbPipe,
    pipe_ref: PipeRef,
    stop: &AtomicBool,
    events: &Sender<PumpEvent>,
    settings: PumpSettings,
) -> Result<()> {
    info!("Read pump started on pipe #{}", pipe_ref);
    post(events, PumpEvent::Started { pipe: pipe_ref });

    let buffer = pipe.buffer();
    let mut transfers: u64 = 0;

    while !stop.load(Ordering::Acquire) {
        let read = buffer.fill(|half| interface.read_pipe(pipe_ref, half, settings.read_timeout));
        let length = match read {
            Ok(0) => continue,
            Ok(length) => length,
            Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => continue,
            Err(e) => {
                error!("Unable to read pipe #{}: {}", pipe_ref, e);
                pipe.set_stopped();
                post(
                    events,
                    PumpEvent::Failed {
                        pipe: pipe_ref,
                        error: e.to_string(),
                    },
                );
                return Err(PipeError::Usb(e));
            }
        };

        buffer.swap();
        transfers += 1;
        let delivered = buffer.with_completed(|half| pipe.complete(&half[..length]));
        match delivered {
            Ok(_) => {}
            Err(PipeError::Full) => {
                warn!("Pipe #{} transport full, {} bytes dropped", pipe_ref, length);
            }
            Err(e) => {
                error!("Unable to deliver data of pipe #{}: {}", pipe_ref, e);
                pipe.set_stopped();
                post(
                    events,
                    PumpEvent::Failed {
                        pipe: pipe_ref,
                        error: e.to_string(),
                    },
                );
                return Err(e);
            }
        }
    }

    pipe.set_stopped();
    info!(
        "Read pump stopped on pipe #{} after {} transfers",
        pipe_ref, transfers
    );
    post(
        events,
        PumpEvent::Stopped {
            pipe: pipe_ref,
            transfers,
        },
    );
    Ok(())
}

/// Send every element staged in an outbound runtime's queue
///
/// Each element goes out as one bulk OUT transfer on the runtime's pipe.
/// Stops at the first platform error; elements sent before it are gone from
/// the queue, the rest stay staged. Returns the number of elements sent.
///
/// # Errors
///
/// - `NullArgument` if the runtime was not configured with a pipe
/// - `IllegalParameter` for an inbound runtime
/// - `Resource` for a byte-stream runtime
/// - `Usb` on a platform error
pub fn transmit<I>(interface: &I, pipe: &UsbPipe, timeout: Duration) -> Result<usize>
where
    I: UsbInterface + ?Sized,
{
    let pipe_ref = pipe.pipe_ref().ok_or(PipeError::NullArgument("pipe reference"))?;
    if !pipe.is_tx() {
        return Err(PipeError::IllegalParameter(format!(
            "pipe #{} is an inbound pipe",
            pipe_ref
        )));
    }

    let mut element = vec![0u8; pipe.element_size()];
    let mut sent = 0;
    loop {
        match pipe.dequeue(&mut element, Timeout::Immediate) {
            Ok(()) => {}
            Err(PipeError::Empty) => break,
            Err(e) => return Err(e),
        }
        let written = interface.write_pipe(pipe_ref, &element, timeout).map_err(|e| {
            error!("Unable to write pipe #{}: {}", pipe_ref, e);
            PipeError::Usb(e)
        })?;
        if written < element.len() {
            warn!(
                "Short write on pipe #{} ({} of {} bytes)",
                pipe_ref,
                written,
                element.len()
            );
        }
        sent += 1;
    }

    trace!("Transmitted {} elements on pipe #{}", sent, pipe_ref);
    Ok(sent)
}

impl ReadPump {
    pub fn pipe_ref(&self) -> PipeRef {
        self.pipe_ref
    }

    /// The runtime the pump delivers into
    pub fn pipe(&self) -> &Arc<UsbPipe> {
        &self.pipe
    }

    /// Receiver for status events (clones share the same stream)
    pub fn events(&self) -> Receiver<PumpEvent> {
        self.events.clone()
    }

    /// True while the transfer loop is alive
    pub fn is_running(&self) -> bool {
        self.pipe.is_running()
    }

    /// Request the pump to stop and wait for the thread to exit
    ///
    /// Returns the error that stopped the pump earlier, if any.
    pub fn abort(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        debug!("Aborting read pump on pipe #{}", self.pipe_ref);
        match thread.join() {
            Ok(result) => result,
            Err(_) => {
                self.pipe.set_stopped();
                error!("Read pump on pipe #{} panicked", self.pipe_ref);
                Err(PipeError::Fatal(format!(
                    "read pump on pipe #{} panicked",
                    self.pipe_ref
                )))
            }
        }
    }
}

impl Drop for ReadPump {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            debug!("Read pump on pipe #{} ended with: {}", self.pipe_ref, e);
        }
    }
}
