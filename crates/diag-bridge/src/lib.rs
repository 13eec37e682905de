//! Bridge between a Qualcomm DIAG character device and TCP observers.
//!
//! The crate negotiates the device into memory-buffered logging mode,
//! then shuttles traffic both ways:
//!
//! ```text
//!                 +--------------------+
//!   /dev/diag --> | DeviceChannel      | --> decode_batch --> broadcast
//!                 | (DiagTransport)    |
//!   /dev/diag <-- |                    | <-- encode_message <-- clients
//!                 +--------------------+
//! ```
//!
//! The [`transport`] module abstracts the device behind a trait so the
//! whole pipeline runs against an in-memory mock in tests. [`negotiate`]
//! walks the parameter-layout ladder, [`frame`] owns the wire formats,
//! [`registry`] tracks connected clients, and [`server`] ties it all
//! together in exactly two blocking threads.

pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod negotiate;
pub mod registry;
pub mod server;
pub mod transport;

pub use config::{BridgeConfig, BufferingConfig, TransportConfig};
pub use device::{DeviceChannel, WriteOutcome};
pub use error::BridgeError;
pub use negotiate::{negotiate, NegotiationOutcome, NoFallback};
pub use server::Bridge;
pub use transport::{create_transport, DiagTransport, TransportError};
