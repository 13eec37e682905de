//! Character-device transport (Linux only)
//!
//! Owns the single privileged handle to the diagnostic device and maps the
//! raw `read`/`write`/`ioctl` surface onto [`DiagTransport`]. The EFAULT
//! errno is translated to `TransportError::InvalidArgument` in both the
//! write and control paths; everything the negotiator and write path need
//! to distinguish hangs off that one mapping.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use super::{ControlArg, ControlRequest, DiagTransport, TransportError};
use crate::config::ChardevConfig;

pub struct ChardevTransport {
    file: File,
}

impl ChardevTransport {
    pub fn open(config: &ChardevConfig) -> Result<Self, TransportError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_LARGEFILE)
            .open(&config.path)
            .map_err(|e| TransportError::Open(format!("{}: {}", config.path, e)))?;
        tracing::info!(path = %config.path, "opened diagnostic device");
        Ok(Self { file })
    }

    /// Legacy call shapes pass a trailing length word after the argument;
    /// the value is ignored by every driver that accepts the shape.
    const TRAILING_PAD: libc::c_ulong = 12;

    fn control_result(&self, request: ControlRequest, ret: libc::c_int) -> Result<i32, TransportError> {
        if ret >= 0 {
            return Ok(ret);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EFAULT) {
            Err(TransportError::InvalidArgument)
        } else {
            Err(TransportError::Control {
                request,
                message: err.to_string(),
            })
        }
    }
}

impl DiagTransport for ChardevTransport {
    fn read_batch(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (&self.file)
            .read(buf)
            .map_err(|e| TransportError::Read(e.to_string()))
    }

    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        match (&self.file).write(data) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EFAULT) => {
                Err(TransportError::InvalidArgument)
            }
            Err(e) => Err(TransportError::Write(e.to_string())),
        }
    }

    fn control(&self, request: ControlRequest, arg: ControlArg<'_>) -> Result<i32, TransportError> {
        let fd = self.file.as_raw_fd();
        let code = request.request_code() as libc::c_ulong;
        // SAFETY: the pointers passed live for the duration of the call and
        // the request codes match the driver's expected argument shapes.
        let ret = unsafe {
            match arg {
                ControlArg::Scalar {
                    value,
                    padded: false,
                } => libc::ioctl(fd, code, value as libc::c_ulong),
                ControlArg::Scalar {
                    value,
                    padded: true,
                } => libc::ioctl(fd, code, value as libc::c_ulong, Self::TRAILING_PAD, 0, 0, 0, 0),
                ControlArg::Blob {
                    data,
                    padded: false,
                } => libc::ioctl(fd, code, data.as_ptr()),
                ControlArg::Blob { data, padded: true } => {
                    libc::ioctl(fd, code, data.as_ptr(), Self::TRAILING_PAD, 0, 0, 0, 0)
                }
                ControlArg::Out(out) => libc::ioctl(fd, code, out.as_mut_ptr()),
            }
        };
        self.control_result(request, ret)
    }
}
