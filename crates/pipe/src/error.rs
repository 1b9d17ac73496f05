//! Pipe runtime error types
//!
//! Every fallible operation in this crate returns [`PipeError`]. The variants
//! follow the CAN API V3 status taxonomy so that a driver layered on top can
//! still hand a signed status code to its own callers via [`PipeError::code`].

use thiserror::Error;

/// Status code for a successful operation
pub const STATUS_OK: i32 = 0;

/// Pipe runtime errors
#[derive(Debug, Error)]
pub enum PipeError {
    /// A required piece of the pipe context is missing
    #[error("Missing argument: {0}")]
    NullArgument(&'static str),

    /// Allocation or OS resource failure, or the transport was not configured
    #[error("Resource error: {0}")]
    Resource(String),

    /// Queue or byte stream is full, the data was dropped
    #[error("Full: data dropped")]
    Full,

    /// No data arrived within the timeout
    #[error("Empty: no data available")]
    Empty,

    /// Unrecoverable I/O failure
    #[error("Fatal I/O error: {0}")]
    Fatal(String),

    /// Pipe classification not supported (only bulk pipes are)
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Invalid parameter or unexpected pipe property
    #[error("Illegal parameter: {0}")]
    IllegalParameter(String),

    /// Platform USB layer failure, propagated verbatim
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

impl PipeError {
    /// Signed status code compatible with the CAN API V3 error codes
    pub fn code(&self) -> i32 {
        match self {
            PipeError::Full => -20,
            PipeError::Empty => -30,
            PipeError::Resource(_) => -90,
            PipeError::IllegalParameter(_) => -93,
            PipeError::NullArgument(_) => -94,
            PipeError::NotSupported(_) => -98,
            PipeError::Fatal(_) | PipeError::Usb(_) => -99,
        }
    }

    /// True for the backpressure/no-data conditions a caller is expected to retry
    pub fn is_transient(&self) -> bool {
        matches!(self, PipeError::Full | PipeError::Empty)
    }
}

/// Type alias for pipe results
pub type Result<T> = std::result::Result<T, PipeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(PipeError::Full.code(), -20);
        assert_eq!(PipeError::Empty.code(), -30);
        assert_eq!(PipeError::Resource("x".into()).code(), -90);
        assert_eq!(PipeError::IllegalParameter("x".into()).code(), -93);
        assert_eq!(PipeError::NullArgument("pipe").code(), -94);
        assert_eq!(PipeError::NotSupported("x".into()).code(), -98);
        assert_eq!(PipeError::Fatal("x".into()).code(), -99);
        assert_eq!(PipeError::Usb(rusb::Error::NoDevice).code(), -99);
    }

    #[test]
    fn test_transient() {
        assert!(PipeError::Full.is_transient());
        assert!(PipeError::Empty.is_transient());
        assert!(!PipeError::Fatal("broken".into()).is_transient());
    }

    #[test]
    fn test_usb_error_display() {
        let err = PipeError::from(rusb::Error::Timeout);
        let msg = format!("{}", err);
        assert!(msg.contains("USB error"));
    }
}
