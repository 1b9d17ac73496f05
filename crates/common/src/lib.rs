//! Common utilities for rust-canusb
//!
//! This crate provides shared functionality between the pipe runtime and the
//! command line tool: the top-level error type, logging setup and a simulated
//! USB interface for exercising the pipe runtime without hardware.

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
