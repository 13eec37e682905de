//! Connection multiplexor and device reader
//!
//! Two threads of control, nothing else:
//!
//! - the multiplexor (the thread calling [`Bridge::run`]) readiness-polls
//!   the listener and every client socket, accepting connections and
//!   forwarding client bytes to the device;
//! - the `diag-reader` thread blocks on the device's batched read and
//!   broadcasts each decoded message to every client.
//!
//! Both loops run until a fatal condition; there are no timeouts and no
//!   cancellation. The registry's exclusive section is the only shared
//! state between them.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::BridgeConfig;
use crate::device::{DeviceChannel, WriteOutcome};
use crate::error::BridgeError;
use crate::frame::{self, BAD_CMD_FRAME, BATCH_HEADER_LEN};
use crate::registry::{ClientRegistry, ClientSink};

const LISTEN_BACKLOG: i32 = 16;

/// Floor for the configured buffer length; anything smaller could not
/// hold even a batch header.
const MIN_BUFFER_LEN: usize = 4096;

pub struct Bridge {
    device: Arc<DeviceChannel>,
    registry: Arc<ClientRegistry<TcpStream>>,
    listener: TcpListener,
    recv_buffer_len: usize,
}

impl Bridge {
    /// Bind the listener and wire up the registry. The device must already
    /// be negotiated; `Bridge` never issues control operations.
    pub fn bind(config: &BridgeConfig, device: DeviceChannel) -> Result<Self, BridgeError> {
        let addr: SocketAddr = format!("{}:{}", config.listen_addr, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("listen address: {e}")))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        let listener: TcpListener = socket.into();

        let registry = Arc::new(ClientRegistry::new(
            listener.as_raw_fd(),
            config.max_clients,
        ));

        Ok(Self {
            device: Arc::new(device),
            registry,
            listener,
            recv_buffer_len: config.recv_buffer_len.max(MIN_BUFFER_LEN),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Registry handle, mainly so callers can observe the client count.
    pub fn registry(&self) -> Arc<ClientRegistry<TcpStream>> {
        Arc::clone(&self.registry)
    }

    /// Spawn the device reader and run the multiplexor on the calling
    /// thread. Never returns except with a fatal error.
    pub fn run(self) -> Result<(), BridgeError> {
        let device = Arc::clone(&self.device);
        let registry = Arc::clone(&self.registry);
        let buf_len = self.recv_buffer_len;

        thread::Builder::new()
            .name("diag-reader".to_string())
            .spawn(move || {
                // This thread's top-level handler: a fatal condition here
                // takes the whole process down. There is no state to
                // reconcile, so no partial shutdown is attempted.
                if let Err(e) = device_reader(&device, &registry, buf_len) {
                    tracing::error!(error = %e, "diag reader failed");
                    std::process::exit(1);
                }
            })?;

        self.mux_loop()
    }

    fn mux_loop(&self) -> Result<(), BridgeError> {
        // Client messages may grow a header on the way to the device, so
        // leave room for it.
        let mut scratch = vec![0u8; self.recv_buffer_len - BATCH_HEADER_LEN];

        loop {
            let slots = self.registry.poll_slots();
            let mut pfds: Vec<libc::pollfd> = slots
                .iter()
                .map(|&(_, fd)| libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();

            // Wait indefinitely for at least one ready socket.
            let ready = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            // Removals compact the registry, shifting every later slot down
            // by one; `removed` tracks that for the rest of this pass.
            let mut removed = 0usize;
            for (k, pfd) in pfds.iter().enumerate() {
                if pfd.revents == 0 {
                    continue;
                }
                let (slot, _) = slots[k];
                if slot == 0 {
                    if pfd.revents & libc::POLLIN != 0 {
                        self.accept_one()?;
                    }
                    continue;
                }
                let slot = slot - removed;

                // Read on a duplicated handle so the syscall runs outside
                // the exclusive section; a stalled client read must not
                // hold up the device reader's broadcasts.
                let read = match self.registry.with_client(slot, |c| c.try_clone()) {
                    None => continue,
                    Some(Err(e)) => Err(e),
                    Some(Ok(mut handle)) => handle.recv(&mut scratch),
                };
                match read {
                    Ok(0) | Err(_) => {
                        if let Some(client) = self.registry.remove(slot) {
                            tracing::info!(peer = %client.peer(), "client disconnected");
                        }
                        removed += 1;
                    }
                    Ok(n) => match self.device.write_message(&scratch[..n])? {
                        WriteOutcome::Accepted => {}
                        WriteOutcome::Rejected => {
                            // Mirror the device's own rejection frame back
                            // to the observers.
                            self.registry.broadcast(&BAD_CMD_FRAME);
                        }
                    },
                }
            }
        }
    }

    fn accept_one(&self) -> Result<(), BridgeError> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                match self.registry.register(stream) {
                    Ok(slot) => tracing::info!(%peer, slot, "client connected"),
                    // Dropping the stream closes the connection; the rest
                    // of the bridge is unaffected.
                    Err(e) => tracing::warn!(%peer, error = %e, "rejecting client"),
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The dedicated reader loop: block on the device, decode, fan out. The
/// whole batch is decoded before anything is broadcast, so a framing
/// violation never produces a partial broadcast.
fn device_reader(
    device: &DeviceChannel,
    registry: &ClientRegistry<TcpStream>,
    buf_len: usize,
) -> Result<(), BridgeError> {
    let mut buf = vec![0u8; buf_len];
    loop {
        let batch = device.read_batch(&mut buf)?;
        match frame::decode_batch(batch, device.remote_variant())? {
            None => continue,
            Some(frames) => {
                let payloads: Vec<&[u8]> = frames.iter().map(|f| f.payload).collect();
                tracing::trace!(messages = payloads.len(), "broadcasting batch");
                registry.broadcast_all(&payloads);
            }
        }
    }
}
