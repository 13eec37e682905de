//! Device channel
//!
//! The one place that talks to the diagnostic device after negotiation:
//! blocking batched reads for the device reader thread, framed message
//! writes for the connection multiplexor. The remote-variant flag is fixed
//! at construction (it was discovered during negotiation, before the first
//! write) and decides the sentinel handling in both directions.

use std::sync::Arc;

use crate::error::BridgeError;
use crate::frame::{self, BATCH_HEADER_LEN};
use crate::transport::{DiagTransport, TransportError};

/// What happened to a message handed to [`DeviceChannel::write_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    /// The device structurally rejected the payload (invalidated-argument
    /// condition). Not fatal; the caller mirrors the device's own rejection
    /// frame back to the clients.
    Rejected,
}

pub struct DeviceChannel {
    transport: Arc<dyn DiagTransport>,
    remote_variant: bool,
}

impl DeviceChannel {
    pub fn new(transport: Arc<dyn DiagTransport>, remote_variant: bool) -> Self {
        Self {
            transport,
            remote_variant,
        }
    }

    pub fn remote_variant(&self) -> bool {
        self.remote_variant
    }

    /// Block until the device yields one batch. A read error or a batch too
    /// short to carry the tag+count header is fatal.
    pub fn read_batch<'a>(&self, buf: &'a mut [u8]) -> Result<&'a [u8], BridgeError> {
        let len = self.transport.read_batch(buf)?;
        if len < BATCH_HEADER_LEN {
            return Err(BridgeError::ShortRead {
                len,
                min: BATCH_HEADER_LEN,
            });
        }
        Ok(&buf[..len])
    }

    /// Frame and write one client message to the device. The
    /// invalidated-argument condition maps to [`WriteOutcome::Rejected`];
    /// every other write failure is fatal.
    pub fn write_message(&self, payload: &[u8]) -> Result<WriteOutcome, BridgeError> {
        let encoded = frame::encode_message(payload, self.remote_variant);
        tracing::trace!(
            len = payload.len(),
            head = %hex::encode(&payload[..payload.len().min(16)]),
            "forwarding client message to device"
        );
        match self.transport.write(&encoded) {
            Ok(()) => Ok(WriteOutcome::Accepted),
            Err(TransportError::InvalidArgument) => {
                tracing::debug!("device invalidated a client message");
                Ok(WriteOutcome::Rejected)
            }
            Err(e) => Err(e.into()),
        }
    }
}
