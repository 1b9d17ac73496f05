//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Pipe error: {0}")]
    Pipe(#[from] pipe::PipeError),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Status code of the underlying pipe error, if any
    pub fn status_code(&self) -> Option<i32> {
        match self {
            Error::Pipe(e) => Some(e.code()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
