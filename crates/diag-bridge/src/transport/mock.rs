//! Scriptable in-memory transport for tests
//!
//! Stands in for the character device: batches are injected by the test and
//! handed out by a blocking `read_batch`, writes are recorded, and the
//! control interface follows a configurable policy so negotiation paths can
//! be steered (which argument length probes clean, which call shapes the
//! fake driver accepts).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use super::{ControlArg, ControlRequest, DiagTransport, TransportError};
use crate::config::MockConfig;
use crate::negotiate::PROBE_FILL;

/// What the fake driver accepts on its control interface.
#[derive(Debug, Clone)]
pub struct MockControlPolicy {
    /// Minimum argument length that does not fail with
    /// `InvalidArgument` while probing (the fake driver's expected
    /// structure size).
    pub probe_arg_len: usize,
    /// Blob lengths for which a real mode-switch call succeeds.
    pub accept_blob_lens: Vec<usize>,
    /// Whether the bare-integer call shape succeeds.
    pub accept_scalar: bool,
    /// Whether the padded bare-integer call shape succeeds.
    pub accept_scalar_padded: bool,
    /// Whether notification-client registration succeeds.
    pub notify_register_ok: bool,
    /// Whether buffering watermark configuration succeeds.
    pub buffering_config_ok: bool,
}

impl Default for MockControlPolicy {
    fn default() -> Self {
        // Permissive: a modern driver that expects the newest layout's
        // argument length but tolerates every call shape.
        Self {
            probe_arg_len: 24,
            accept_blob_lens: vec![24, 20, 9, 4],
            accept_scalar: true,
            accept_scalar_padded: true,
            notify_register_ok: true,
            buffering_config_ok: true,
        }
    }
}

/// One recorded control call, for test assertions.
#[derive(Debug, Clone)]
pub enum RecordedArg {
    Scalar { value: u64, padded: bool },
    Blob { data: Vec<u8>, padded: bool },
    Out,
}

#[derive(Debug, Clone)]
pub struct ControlRecord {
    pub request: ControlRequest,
    pub arg: RecordedArg,
}

/// Mock transport for tests.
pub struct MockTransport {
    batches: Mutex<VecDeque<Vec<u8>>>,
    batch_ready: Condvar,
    writes: Mutex<Vec<Vec<u8>>>,
    reject_writes: AtomicBool,
    remote_variant: AtomicBool,
    policy: Mutex<MockControlPolicy>,
    controls: Mutex<Vec<ControlRecord>>,
}

impl MockTransport {
    pub fn new(config: &MockConfig) -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            batch_ready: Condvar::new(),
            writes: Mutex::new(Vec::new()),
            reject_writes: AtomicBool::new(false),
            remote_variant: AtomicBool::new(config.remote_variant),
            policy: Mutex::new(MockControlPolicy::default()),
            controls: Mutex::new(Vec::new()),
        }
    }

    /// Replace the control policy.
    pub fn set_control_policy(&self, policy: MockControlPolicy) {
        *self.policy.lock() = policy;
    }

    /// Queue one batch for `read_batch` to hand out.
    pub fn inject_batch(&self, batch: Vec<u8>) {
        self.batches.lock().push_back(batch);
        self.batch_ready.notify_one();
    }

    /// Make every subsequent write fail with the invalidated-argument
    /// condition (or stop doing so).
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    pub fn set_remote_variant(&self, remote: bool) {
        self.remote_variant.store(remote, Ordering::SeqCst);
    }

    /// Everything written to the device so far.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    /// Every control call issued so far, probing included.
    pub fn control_records(&self) -> Vec<ControlRecord> {
        self.controls.lock().clone()
    }

    /// Mode-switch attempts only, with probe calls filtered out.
    pub fn switch_attempts(&self) -> Vec<ControlRecord> {
        self.controls
            .lock()
            .iter()
            .filter(|r| {
                r.request == ControlRequest::SwitchLogging
                    && !matches!(
                        &r.arg,
                        RecordedArg::Blob { data, .. }
                            if data.iter().all(|&b| b == PROBE_FILL)
                    )
            })
            .cloned()
            .collect()
    }

    fn switch_logging(&self, arg: &RecordedArg) -> Result<i32, TransportError> {
        let policy = self.policy.lock();
        match arg {
            RecordedArg::Blob { data, .. } => {
                // Probe buffers are recognisable by their fill pattern; real
                // parameter blobs always start with the requested mode.
                let is_probe = data.iter().all(|&b| b == PROBE_FILL);
                if is_probe {
                    if data.len() >= policy.probe_arg_len {
                        Ok(0)
                    } else {
                        Err(TransportError::InvalidArgument)
                    }
                } else if policy.accept_blob_lens.contains(&data.len()) {
                    Ok(0)
                } else {
                    Err(TransportError::Control {
                        request: ControlRequest::SwitchLogging,
                        message: format!("unsupported argument length {}", data.len()),
                    })
                }
            }
            RecordedArg::Scalar { padded, .. } => {
                let ok = if *padded {
                    policy.accept_scalar_padded
                } else {
                    policy.accept_scalar
                };
                if ok {
                    Ok(0)
                } else {
                    Err(TransportError::Control {
                        request: ControlRequest::SwitchLogging,
                        message: "unsupported call shape".to_string(),
                    })
                }
            }
            RecordedArg::Out => Err(TransportError::Control {
                request: ControlRequest::SwitchLogging,
                message: "output argument not valid here".to_string(),
            }),
        }
    }
}

impl DiagTransport for MockTransport {
    fn read_batch(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut batches = self.batches.lock();
        while batches.is_empty() {
            self.batch_ready.wait(&mut batches);
        }
        let batch = batches.pop_front().expect("non-empty after wait");
        if batch.len() > buf.len() {
            return Err(TransportError::Read(format!(
                "injected batch of {} bytes exceeds receive buffer of {}",
                batch.len(),
                buf.len()
            )));
        }
        buf[..batch.len()].copy_from_slice(&batch);
        Ok(batch.len())
    }

    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidArgument);
        }
        self.writes.lock().push(data.to_vec());
        Ok(())
    }

    fn control(&self, request: ControlRequest, arg: ControlArg<'_>) -> Result<i32, TransportError> {
        let recorded = match &arg {
            ControlArg::Scalar { value, padded } => RecordedArg::Scalar {
                value: *value,
                padded: *padded,
            },
            ControlArg::Blob { data, padded } => RecordedArg::Blob {
                data: data.to_vec(),
                padded: *padded,
            },
            ControlArg::Out(_) => RecordedArg::Out,
        };
        self.controls.lock().push(ControlRecord {
            request,
            arg: recorded.clone(),
        });

        match request {
            ControlRequest::SwitchLogging => self.switch_logging(&recorded),
            ControlRequest::RemoteDev => {
                if let ControlArg::Out(out) = arg {
                    let flag: u32 = self.remote_variant.load(Ordering::SeqCst).into();
                    let bytes = flag.to_le_bytes();
                    let n = out.len().min(bytes.len());
                    out[..n].copy_from_slice(&bytes[..n]);
                    Ok(0)
                } else {
                    Err(TransportError::Control {
                        request,
                        message: "expected an output argument".to_string(),
                    })
                }
            }
            ControlRequest::NotifyRegister => {
                if self.policy.lock().notify_register_ok {
                    Ok(1)
                } else {
                    Err(TransportError::Control {
                        request,
                        message: "registration refused".to_string(),
                    })
                }
            }
            ControlRequest::BufferingConfig => {
                if self.policy.lock().buffering_config_ok {
                    Ok(0)
                } else {
                    Err(TransportError::Control {
                        request,
                        message: "buffering configuration refused".to_string(),
                    })
                }
            }
        }
    }
}
