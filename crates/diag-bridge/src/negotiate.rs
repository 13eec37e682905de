//! Mode negotiation state machine
//!
//! Brings the diagnostic device into streaming ("memory device") logging
//! mode before any client is served. The control interface went through
//! several mutually-incompatible argument layouts over the years and offers
//! no version query, so the negotiator first probes the argument length the
//! running driver expects, then walks an ordered ladder of known layouts
//! (newest to oldest), then two legacy call shapes, and finally hands the
//! problem to an alternate capability provider.
//!
//! The ladder deliberately falls through to older layouts after a matched
//! layout fails. On some drivers this may mask a negotiation failure as a
//! quiet success; the order is kept as-is on purpose, and divergence should
//! be reported rather than reordered away.

use bytes::BufMut;
use thiserror::Error;

use crate::config::BufferingConfig;
use crate::transport::{ControlArg, ControlRequest, DiagTransport, TransportError};

/// Byte the probe buffer is filled with. Harmless to the driver and
/// recognisable as "not a real parameter blob".
pub const PROBE_FILL: u8 = 0x3f;

/// The logging mode every path requests: streaming batches into the
/// process's memory, all peripherals selected.
pub const MEMORY_DEVICE_MODE: u32 = 2;

/// Peripheral selection mask for the older structured layouts.
const PERIPHERAL_MASK_ALL: u32 = 0x1f;
/// The newest layout grew the peripheral space; all-ones over it.
const PERIPHERAL_MASK_ALL_WIDE: u32 = 0x7f;
/// Local-device bit in the newest layout's device mask.
const DEVICE_MASK_LOCAL: u32 = 1;

/// Streaming buffering mode for the post-negotiation watermark setup.
const BUFFERING_MODE_STREAMING: u8 = 0;
/// Signal number carried in the notification registration blob.
const NOTIFY_SIGNAL: i32 = 13;

#[derive(Debug, Error, Clone)]
pub enum NegotiationError {
    #[error("every negotiation path was exhausted without switching the logging mode")]
    Exhausted,

    #[error("fallback capability provider unavailable: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Historical argument layouts for the mode-switch operation, newest to
/// oldest by field count. The exact field meanings are opaque to the rest
/// of the bridge; each layout only knows how to render itself as the packed
/// parameter blob the corresponding driver generation expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLayout {
    /// Newest shape: adds a per-device mask and routing fields.
    Q,
    /// Adds peripheral-domain fields over the original structure.
    Pie,
    /// The first structured layout: mode, peripheral mask, one flag byte.
    Nougat,
    /// Pointer to a bare integer holding the mode.
    LegacyInt,
}

/// Ordered negotiation ladder.
pub const LADDER: [ParamLayout; 4] = [
    ParamLayout::Q,
    ParamLayout::Pie,
    ParamLayout::Nougat,
    ParamLayout::LegacyInt,
];

/// Largest argument length any known layout uses; upper bound for probing.
pub const MAX_PARAM_LEN: usize = 24;

impl ParamLayout {
    /// Packed byte length of this layout's parameter blob.
    pub fn arg_len(self) -> usize {
        match self {
            ParamLayout::Q => 24,
            ParamLayout::Pie => 20,
            ParamLayout::Nougat => 9,
            ParamLayout::LegacyInt => 4,
        }
    }

    /// Render the parameter blob requesting `mode`.
    pub fn encode(self, mode: u32) -> Vec<u8> {
        let mut blob = Vec::with_capacity(self.arg_len());
        match self {
            ParamLayout::Q => {
                blob.put_u32_le(mode);
                blob.put_u32_le(PERIPHERAL_MASK_ALL_WIDE);
                blob.put_u32_le(0); // pd_mask
                blob.put_u8(1); // mode_param
                blob.put_u8(0); // diag_id
                blob.put_u8(0); // pd_val
                blob.put_u8(0); // reserved
                blob.put_i32_le(0); // peripheral
                blob.put_u32_le(DEVICE_MASK_LOCAL);
            }
            ParamLayout::Pie => {
                blob.put_u32_le(mode);
                blob.put_u32_le(PERIPHERAL_MASK_ALL);
                blob.put_u32_le(0); // pd_mask
                blob.put_u8(0); // mode_param
                blob.put_u8(0); // diag_id
                blob.put_u8(0); // pd_val
                blob.put_u8(0); // reserved
                blob.put_i32_le(0); // peripheral
            }
            ParamLayout::Nougat => {
                blob.put_u32_le(mode);
                blob.put_u32_le(PERIPHERAL_MASK_ALL);
                blob.put_u8(0); // mode_param
            }
            ParamLayout::LegacyInt => {
                blob.put_u32_le(mode);
            }
        }
        debug_assert_eq!(blob.len(), self.arg_len());
        blob
    }
}

/// Last-resort mode switching when no native control-operation variant
/// succeeds.
///
/// Contract: the call is synchronous and self-contained. A provider must
/// not leave background work running past its return; anything it starts
/// has to be finished or torn down before the call completes, because the
/// negotiator cannot account for ambient threads it never sees.
pub trait FallbackProvider: Send + Sync {
    fn switch_logging(&self, mode: u32) -> Result<(), NegotiationError>;
}

/// The shipped default: no alternate provider available.
pub struct NoFallback;

impl FallbackProvider for NoFallback {
    fn switch_logging(&self, _mode: u32) -> Result<(), NegotiationError> {
        Err(NegotiationError::Unsupported(
            "no alternate capability provider configured".to_string(),
        ))
    }
}

/// Which path ultimately switched the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPath {
    Variant(ParamLayout),
    LegacyShape { padded: bool },
    Fallback,
}

#[derive(Debug, Clone)]
pub struct NegotiationOutcome {
    /// Whether the device routes through a remote peripheral and therefore
    /// needs the per-message sentinel on both directions.
    pub remote_variant: bool,
    /// Argument length the driver accepted while probing, if any.
    pub probed_len: Option<usize>,
    pub path: NegotiationPath,
}

/// Negotiator states, surfaced in logs and useful when reading traces of a
/// device that refuses to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    ProbingArgLength,
    TryingVariant(usize),
    FallbackProvider,
    Success,
    Fatal,
}

pub struct Negotiator<'a> {
    transport: &'a dyn DiagTransport,
    fallback: &'a dyn FallbackProvider,
    buffering: BufferingConfig,
}

/// Run the full negotiation once, before any client is served.
pub fn negotiate(
    transport: &dyn DiagTransport,
    fallback: &dyn FallbackProvider,
    buffering: BufferingConfig,
) -> Result<NegotiationOutcome, NegotiationError> {
    Negotiator {
        transport,
        fallback,
        buffering,
    }
    .run()
}

impl Negotiator<'_> {
    fn run(&self) -> Result<NegotiationOutcome, NegotiationError> {
        let mut state = State::Idle;

        let remote_variant = self.query_remote_variant();

        self.transition(&mut state, State::ProbingArgLength);
        let probed_len = self.probe_arg_len();
        tracing::debug!(?probed_len, "probed mode-switch argument length");

        let start = probed_len.and_then(|len| LADDER.iter().position(|l| l.arg_len() == len));
        if let Some(start) = start {
            for (i, layout) in LADDER.iter().enumerate().skip(start) {
                self.transition(&mut state, State::TryingVariant(i));
                let blob = layout.encode(MEMORY_DEVICE_MODE);
                match self.transport.control(
                    ControlRequest::SwitchLogging,
                    ControlArg::Blob {
                        data: &blob,
                        padded: false,
                    },
                ) {
                    Ok(_) => {
                        return self.succeed(
                            &mut state,
                            remote_variant,
                            probed_len,
                            NegotiationPath::Variant(*layout),
                        );
                    }
                    Err(e) => {
                        tracing::debug!(?layout, error = %e, "mode-switch variant failed");
                    }
                }
            }
        } else {
            tracing::debug!(?probed_len, "probed length matches no known layout");
        }

        for padded in [false, true] {
            match self.transport.control(
                ControlRequest::SwitchLogging,
                ControlArg::Scalar {
                    value: MEMORY_DEVICE_MODE.into(),
                    padded,
                },
            ) {
                Ok(_) => {
                    return self.succeed(
                        &mut state,
                        remote_variant,
                        probed_len,
                        NegotiationPath::LegacyShape { padded },
                    );
                }
                Err(e) => {
                    tracing::debug!(padded, error = %e, "legacy mode-switch shape failed");
                }
            }
        }

        self.transition(&mut state, State::FallbackProvider);
        match self.fallback.switch_logging(MEMORY_DEVICE_MODE) {
            Ok(()) => self.succeed(&mut state, remote_variant, probed_len, NegotiationPath::Fallback),
            Err(e) => {
                tracing::warn!(error = %e, "fallback capability provider failed");
                self.transition(&mut state, State::Fatal);
                Err(NegotiationError::Exhausted)
            }
        }
    }

    fn transition(&self, state: &mut State, next: State) {
        tracing::trace!(from = ?state, to = ?next, "negotiation state");
        *state = next;
    }

    fn succeed(
        &self,
        state: &mut State,
        remote_variant: bool,
        probed_len: Option<usize>,
        path: NegotiationPath,
    ) -> Result<NegotiationOutcome, NegotiationError> {
        self.transition(state, State::Success);
        tracing::info!(?path, remote_variant, "logging mode switched");
        self.configure_post_switch();
        Ok(NegotiationOutcome {
            remote_variant,
            probed_len,
            path,
        })
    }

    /// Peripheral-routing query. Failure is tolerated: an old driver that
    /// does not know the query is a local-routing device.
    fn query_remote_variant(&self) -> bool {
        let mut out = [0u8; 4];
        match self
            .transport
            .control(ControlRequest::RemoteDev, ControlArg::Out(&mut out))
        {
            Ok(_) => u32::from_le_bytes(out) != 0,
            Err(e) => {
                tracing::warn!(error = %e, "remote-device query failed, assuming local routing");
                false
            }
        }
    }

    /// Find the exact argument length the driver expects for the
    /// mode-switch operation by binary search: lengths below the expected
    /// structure size fail with the invalidated-argument condition, lengths
    /// at or above it fail (or succeed) for other reasons. Uses an ordinary
    /// bounded probe buffer; no version query exists on this interface.
    fn probe_arg_len(&self) -> Option<usize> {
        let fill = [PROBE_FILL; MAX_PARAM_LEN];
        let accepts = |len: usize| {
            !matches!(
                self.transport.control(
                    ControlRequest::SwitchLogging,
                    ControlArg::Blob {
                        data: &fill[..len],
                        padded: false,
                    },
                ),
                Err(TransportError::InvalidArgument)
            )
        };

        if !accepts(MAX_PARAM_LEN) {
            return None;
        }
        let (mut lo, mut hi) = (0usize, MAX_PARAM_LEN);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if accepts(mid) {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Some(lo)
    }

    /// Best-effort post-switch setup: register a notification client and
    /// configure the streaming buffering watermarks. Failures are logged
    /// and ignored; the bridge works without either.
    fn configure_post_switch(&self) {
        let mut notify = Vec::with_capacity(14);
        notify.put_i32_le(0); // client id, allocated by the driver
        notify.put_u16_le(0); // notification list
        notify.put_i32_le(NOTIFY_SIGNAL);
        notify.put_i32_le(0); // token
        if let Err(e) = self.transport.control(
            ControlRequest::NotifyRegister,
            ControlArg::Blob {
                data: &notify,
                padded: false,
            },
        ) {
            tracing::warn!(error = %e, "notification-client registration failed (ignored)");
        }

        let watermarks = [
            0, // peripheral
            BUFFERING_MODE_STREAMING,
            self.buffering.high_watermark,
            self.buffering.low_watermark,
        ];
        if let Err(e) = self.transport.control(
            ControlRequest::BufferingConfig,
            ControlArg::Blob {
                data: &watermarks,
                padded: false,
            },
        ) {
            tracing::warn!(error = %e, "buffering watermark configuration failed (ignored)");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::{MockControlPolicy, MockTransport, RecordedArg};
    use pretty_assertions::assert_eq;

    struct CountingFallback {
        calls: AtomicUsize,
        succeed: bool,
    }

    impl CountingFallback {
        fn new(succeed: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                succeed,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl FallbackProvider for CountingFallback {
        fn switch_logging(&self, _mode: u32) -> Result<(), NegotiationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(())
            } else {
                Err(NegotiationError::Unsupported("stub".to_string()))
            }
        }
    }

    fn mock_with(policy: MockControlPolicy) -> MockTransport {
        let mock = MockTransport::new(&MockConfig::default());
        mock.set_control_policy(policy);
        mock
    }

    #[test]
    fn layout_blob_lengths_match_declared() {
        for layout in LADDER {
            assert_eq!(layout.encode(MEMORY_DEVICE_MODE).len(), layout.arg_len());
        }
    }

    #[test]
    fn probe_selects_matching_layout() {
        let mock = mock_with(MockControlPolicy {
            probe_arg_len: 20,
            accept_blob_lens: vec![20],
            accept_scalar: false,
            accept_scalar_padded: false,
            ..Default::default()
        });
        let fallback = CountingFallback::new(false);

        let outcome = negotiate(&mock, &fallback, BufferingConfig::default()).unwrap();

        assert_eq!(outcome.probed_len, Some(20));
        assert_eq!(outcome.path, NegotiationPath::Variant(ParamLayout::Pie));
        assert_eq!(fallback.calls(), 0);
    }

    #[test]
    fn ladder_falls_through_to_third_variant() {
        // Driver expects the newest layout's length but only the third rung
        // actually succeeds; the fallback must stay untouched.
        let mock = mock_with(MockControlPolicy {
            probe_arg_len: 24,
            accept_blob_lens: vec![ParamLayout::Nougat.arg_len()],
            accept_scalar: false,
            accept_scalar_padded: false,
            ..Default::default()
        });
        let fallback = CountingFallback::new(true);

        let outcome = negotiate(&mock, &fallback, BufferingConfig::default()).unwrap();

        assert_eq!(outcome.path, NegotiationPath::Variant(ParamLayout::Nougat));
        assert_eq!(fallback.calls(), 0);

        let lens: Vec<usize> = mock
            .switch_attempts()
            .iter()
            .filter_map(|r| match &r.arg {
                RecordedArg::Blob { data, .. } => Some(data.len()),
                _ => None,
            })
            .collect();
        assert_eq!(lens, vec![24, 20, 9]);
    }

    #[test]
    fn unknown_probed_length_degrades_to_legacy_shapes() {
        let mock = mock_with(MockControlPolicy {
            probe_arg_len: 15, // matches no known layout
            accept_blob_lens: vec![],
            accept_scalar: false,
            accept_scalar_padded: true,
            ..Default::default()
        });
        let fallback = CountingFallback::new(false);

        let outcome = negotiate(&mock, &fallback, BufferingConfig::default()).unwrap();

        assert_eq!(outcome.probed_len, Some(15));
        assert_eq!(outcome.path, NegotiationPath::LegacyShape { padded: true });
        // No structured variant was attempted, only the two legacy shapes.
        let attempts = mock.switch_attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts
            .iter()
            .all(|r| matches!(r.arg, RecordedArg::Scalar { .. })));
    }

    #[test]
    fn fallback_runs_only_after_everything_else() {
        let mock = mock_with(MockControlPolicy {
            probe_arg_len: 24,
            accept_blob_lens: vec![],
            accept_scalar: false,
            accept_scalar_padded: false,
            ..Default::default()
        });
        let fallback = CountingFallback::new(true);

        let outcome = negotiate(&mock, &fallback, BufferingConfig::default()).unwrap();

        assert_eq!(outcome.path, NegotiationPath::Fallback);
        assert_eq!(fallback.calls(), 1);
    }

    #[test]
    fn exhaustion_is_terminal() {
        let mock = mock_with(MockControlPolicy {
            probe_arg_len: 24,
            accept_blob_lens: vec![],
            accept_scalar: false,
            accept_scalar_padded: false,
            ..Default::default()
        });

        let err = negotiate(&mock, &NoFallback, BufferingConfig::default()).unwrap_err();
        assert!(matches!(err, NegotiationError::Exhausted));
    }

    #[test]
    fn best_effort_configuration_failures_are_not_fatal() {
        let mock = mock_with(MockControlPolicy {
            notify_register_ok: false,
            buffering_config_ok: false,
            ..Default::default()
        });

        let outcome = negotiate(&mock, &NoFallback, BufferingConfig::default()).unwrap();
        assert!(matches!(outcome.path, NegotiationPath::Variant(_)));
    }

    #[test]
    fn remote_variant_flag_comes_from_device_query() {
        let mock = MockTransport::new(&MockConfig {
            remote_variant: true,
        });
        let outcome = negotiate(&mock, &NoFallback, BufferingConfig::default()).unwrap();
        assert!(outcome.remote_variant);
    }
}
