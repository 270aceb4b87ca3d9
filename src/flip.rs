//! Page-flip synchronization
//!
//! A window has at most one flip in flight. [`FlipState::begin`] records a
//! queued flip; the only way back to idle is [`FlipState::complete`], which
//! [`wait_for_flip`] calls when the device reports the flip done.

use crate::device::{CrtcId, DeviceEvent, FramebufferId, KmsDevice, PollOutcome};
use crate::{Error, Result};
use std::time::Duration;
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlipState {
    #[default]
    Idle,
    Pending { crtc: CrtcId, fb: FramebufferId },
}

impl FlipState {
    pub fn is_pending(&self) -> bool {
        matches!(self, FlipState::Pending { .. })
    }

    /// Record a flip that was just queued on the hardware
    pub fn begin(&mut self, crtc: CrtcId, fb: FramebufferId) -> Result<()> {
        if let FlipState::Pending { fb: pending, .. } = self {
            return Err(Error::ProtocolViolation(format!(
                "flip to framebuffer {} requested while flip to {} is pending",
                fb, pending
            )));
        }
        *self = FlipState::Pending { crtc, fb };
        Ok(())
    }

    /// Flip completion for `crtc`; returns whether it finished our flip
    pub fn complete(&mut self, crtc: CrtcId) -> bool {
        match *self {
            FlipState::Pending { crtc: pending, .. } if pending == crtc => {
                *self = FlipState::Idle;
                true
            }
            _ => false,
        }
    }
}

/// Block until the pending flip (if any) completes.
///
/// `None` waits forever. A timeout reports [`Error::FrameDropped`] and leaves
/// the flip pending: the hardware flip is still queued.
pub fn wait_for_flip<D: KmsDevice>(
    device: &D,
    state: &mut FlipState,
    timeout: Option<Duration>,
) -> Result<()> {
    while state.is_pending() {
        let outcome = device.poll(timeout).map_err(|e| {
            error!("DRM poll error: {}", e);
            e
        })?;

        match outcome {
            PollOutcome::HangUp => {
                error!("DRM poll hup or error");
                return Err(Error::DeviceHangup);
            }
            PollOutcome::Readable => {
                for event in device.dispatch_events()? {
                    match event {
                        DeviceEvent::PageFlip { crtc, frame } => {
                            if state.complete(crtc) {
                                trace!(crtc = crtc.0, frame, "page flip complete");
                            }
                        }
                        other => trace!(?other, "ignoring DRM event"),
                    }
                }
            }
            PollOutcome::TimedOut => {
                debug!("dropping frame while waiting for flip");
                return Err(Error::FrameDropped);
            }
        }
    }

    Ok(())
}
