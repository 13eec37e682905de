//! Integration tests for the DIAG bridge
//!
//! This crate contains end-to-end tests that exercise the full stack:
//! - TCP accept/broadcast multiplexing
//! - Device batch framing
//! - The mock device transport
//!
//! Everything runs against [`diag_bridge::transport::MockTransport`]
//! on a loopback listener, so no hardware or privileges are needed:
//!
//! ```bash
//! cargo test -p diag-tests
//! ```

pub use diag_bridge;
