//! Transport layer for the diagnostic device
//!
//! This module provides adapters over the single upstream device handle:
//! - Character-device adapter for the real diagnostics port (Linux only)
//! - Mock adapter for testing
//!
//! Everything above this layer (negotiation, framing, fan-out) only sees
//! the [`DiagTransport`] trait.

mod adapter;
pub mod error;
pub mod mock;

#[cfg(target_os = "linux")]
pub mod chardev;

pub use adapter::{ControlArg, ControlRequest, DiagTransport};
pub use error::TransportError;
pub use mock::{MockControlPolicy, MockTransport};

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a transport adapter based on configuration
pub fn create_transport(config: &TransportConfig) -> Result<Arc<dyn DiagTransport>, TransportError> {
    match config {
        #[cfg(target_os = "linux")]
        TransportConfig::Chardev(cfg) => {
            let adapter = chardev::ChardevTransport::open(cfg)?;
            Ok(Arc::new(adapter))
        }
        #[cfg(not(target_os = "linux"))]
        TransportConfig::Chardev(_) => Err(TransportError::Unsupported(
            "the character-device transport requires Linux".to_string(),
        )),
        TransportConfig::Mock(cfg) => {
            let adapter = mock::MockTransport::new(cfg);
            Ok(Arc::new(adapter))
        }
    }
}
