//! Bridge error taxonomy
//!
//! Everything that reaches a thread's top-level handler is a
//! [`BridgeError`]; the handler's policy is simple because the taxonomy
//! already is: anything that propagates this far is fatal to the whole
//! process. Recoverable conditions (a rejected device write, one client's
//! dead socket, a failed negotiation rung) are handled where they occur and
//! never become a `BridgeError`.

use thiserror::Error;

use crate::frame::FrameError;
use crate::negotiate::NegotiationError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("diag transport: {0}")]
    Transport(#[from] TransportError),

    #[error("framing: {0}")]
    Frame(#[from] FrameError),

    #[error("negotiation: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("short read from diag device: {len} bytes, need at least {min}")]
    ShortRead { len: usize, min: usize },

    #[error("listener: {0}")]
    Io(#[from] std::io::Error),
}
