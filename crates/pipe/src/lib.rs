//! USB pipe runtime for USB-to-CAN interfaces
//!
//! This crate is the transport core between a platform USB layer and a CAN
//! protocol client. It provides:
//!
//! - [`MessageQueue`]: bounded FIFO of fixed-size elements with blocking,
//!   timed and polling consumption and sticky overflow accounting
//! - [`ByteStream`]: OS pipe side channel with accumulating, timed reads
//! - [`UsbPipe`]: per-pipe runtime owning a double buffer, a queue and an
//!   optional byte stream
//! - [`query_endpoints`]: discovery of the bulk IN/OUT pipe pairs backing the
//!   logical CAN channels of an interface
//! - [`spawn_read_pump`]: a worker thread that keeps a bulk IN transfer armed
//!   and delivers completed transfers into a [`UsbPipe`]
//! - [`transmit`]: sends the elements staged in an outbound [`UsbPipe`]
//!
//! Unix only: the byte stream is built on an OS pipe.
//!
//! # Example
//!
//! ```
//! use pipe::{PipeConfig, PipeOptions, Timeout, UsbPipe};
//!
//! let pipe = UsbPipe::new(PipeConfig {
//!     buffer_size: 512,
//!     queue_capacity: 64,
//!     element_size: 8,
//!     options: PipeOptions::RX_QUEUE,
//! })
//! .unwrap();
//!
//! // Completion path
//! pipe.enqueue(&[0x12, 0x34, 0, 0, 0, 0, 0, 0]).unwrap();
//!
//! // Consumer
//! let element = pipe.dequeue_element(Timeout::millis(100)).unwrap();
//! assert_eq!(element[0], 0x12);
//! ```

pub mod buffer;
pub mod endpoints;
pub mod error;
pub mod pump;
pub mod queue;
pub mod runtime;
pub mod stream;
pub mod timeout;
pub mod usb;

pub use buffer::DoubleBuffer;
pub use endpoints::{Endpoint, Endpoints, MAX_ENDPOINTS, PipeProps, query_endpoints};
pub use error::{PipeError, Result, STATUS_OK};
pub use pump::{PumpEvent, PumpSettings, ReadPump, spawn_read_pump, transmit};
pub use queue::{MessageQueue, QueueStats};
pub use runtime::{CompletionHandler, PipeConfig, PipeOptions, UsbPipe};
pub use stream::ByteStream;
pub use timeout::{INFINITE, Timeout};
pub use usb::{PipeDirection, PipeRef, PipeType, RusbInterface, UsbInterface};
