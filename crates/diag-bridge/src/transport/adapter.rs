//! Transport adapter trait and control-operation types

use super::TransportError;

/// Control operations the bridge issues against the diagnostic device.
///
/// The numeric request codes come from the historical character-device
/// control interface and are stable across all known driver variants; what
/// varies between variants is the argument layout, which the mode negotiator
/// handles as opaque parameter blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlRequest {
    /// Switch the device's logging mode (the negotiated operation).
    SwitchLogging,
    /// Query whether traffic is routed through a remote peripheral.
    RemoteDev,
    /// Register a notification client (best-effort, post-negotiation).
    NotifyRegister,
    /// Configure streaming buffering watermarks (best-effort).
    BufferingConfig,
}

impl ControlRequest {
    /// Raw request code passed to the device's control interface.
    pub fn request_code(self) -> u64 {
        match self {
            ControlRequest::SwitchLogging => 7,
            ControlRequest::NotifyRegister => 23,
            ControlRequest::RemoteDev => 32,
            ControlRequest::BufferingConfig => 35,
        }
    }
}

/// Argument to a control operation.
///
/// Historical driver variants disagree not only on argument layout but on
/// the call shape itself: some take a pointer to a parameter blob, some take
/// a bare integer by value, and some expect a trailing padding word after
/// the argument. The negotiation ladder exercises all of these.
pub enum ControlArg<'a> {
    /// Bare integer argument passed by value.
    Scalar { value: u64, padded: bool },
    /// Pointer to an opaque parameter blob.
    Blob { data: &'a [u8], padded: bool },
    /// Output buffer the driver fills in.
    Out(&'a mut [u8]),
}

/// Blocking interface to the diagnostic device.
///
/// One handle per process; the device reader thread calls `read_batch`, the
/// connection multiplexor calls `write`, and the mode negotiator drives
/// `control` before either loop starts. Implementations do not need any
/// internal locking beyond what those three entry points require.
pub trait DiagTransport: Send + Sync {
    /// Block until the device yields one batch, filling `buf` from the
    /// start. Returns the number of bytes read. Short batches are the
    /// caller's problem; a transport only reports what the device gave it.
    fn read_batch(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Block until the device accepts `data` as one message write.
    ///
    /// Returns `TransportError::InvalidArgument` when the device rejected
    /// the payload structurally rather than the channel being broken.
    fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Issue a control operation. The return value is the driver's own
    /// (non-negative) result code where one exists.
    fn control(&self, request: ControlRequest, arg: ControlArg<'_>) -> Result<i32, TransportError>;
}
