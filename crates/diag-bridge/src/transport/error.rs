//! Transport layer errors

use thiserror::Error;

use super::ControlRequest;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Failed to open diagnostic device: {0}")]
    Open(String),

    #[error("Device read failed: {0}")]
    Read(String),

    #[error("Device write failed: {0}")]
    Write(String),

    /// The device rejected the argument memory itself (the platform's
    /// EFAULT analogue). Distinct from a broken channel: for writes it means
    /// the payload was structurally rejected, for control operations it means
    /// the argument buffer was shorter than the driver expected.
    #[error("Device invalidated the argument")]
    InvalidArgument,

    #[error("Control operation {request:?} failed: {message}")]
    Control {
        request: ControlRequest,
        message: String,
    },

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// True for the invalidated-argument condition, which callers treat as
    /// recoverable on the write path and as a length signal while probing.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, TransportError::InvalidArgument)
    }
}
