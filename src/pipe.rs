//! Display pipe negotiation
//!
//! Walks the device's connectors, encoders and CRTCs in list order and claims
//! the first connector -> encoder -> CRTC chain that can light a display. The
//! CRTC's state at that moment is kept so teardown can put it back.

use crate::device::{
    ConnectionState, ConnectorId, ConnectorInfo, CrtcId, CrtcState, EncoderId, EncoderInfo,
    KmsDevice, ModeInfo, ResourceSet,
};
use crate::scoped::Scoped;
use crate::{Error, Result};
use tracing::{debug, info, warn};

/// Pixel formats published to the display abstraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Argb8888,
}

/// A display mode as published to the display abstraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub format: PixelFormat,
}

impl DisplayMode {
    fn from_mode(mode: &ModeInfo) -> Self {
        Self {
            width: u32::from(mode.width),
            height: u32::from(mode.height),
            refresh_rate: mode.refresh,
            format: PixelFormat::Argb8888,
        }
    }
}

/// A published display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDisplay {
    pub name: String,
    pub desktop_mode: DisplayMode,
    pub current_mode: DisplayMode,
}

/// The claimed connector -> encoder -> CRTC chain
pub struct DisplayPipe {
    connector: ConnectorId,
    encoder: EncoderId,
    crtc: CrtcId,
    mode: ModeInfo,
    saved_crtc: Scoped<CrtcState>,
}

impl DisplayPipe {
    pub fn connector(&self) -> ConnectorId {
        self.connector
    }

    pub fn encoder(&self) -> EncoderId {
        self.encoder
    }

    pub fn crtc(&self) -> CrtcId {
        self.crtc
    }

    /// Mode the pipe is driven in
    pub fn mode(&self) -> &ModeInfo {
        &self.mode
    }

    /// CRTC state found before the pipe was claimed
    pub fn saved_crtc(&self) -> &CrtcState {
        &self.saved_crtc
    }

    /// The single mode this pipe publishes
    pub fn display_mode(&self) -> DisplayMode {
        DisplayMode::from_mode(&self.mode)
    }

    pub fn display(&self) -> VideoDisplay {
        let mode = self.display_mode();
        VideoDisplay {
            name: format!("KMSDRM-{}", self.connector),
            desktop_mode: mode,
            current_mode: mode,
        }
    }

    /// Put the saved CRTC state back on the hardware and release it.
    ///
    /// A failed restore is only logged: at teardown nothing better can be done.
    pub fn restore<D: KmsDevice>(self, device: &D) {
        let saved = &self.saved_crtc;
        match device.set_crtc(
            saved.id,
            saved.framebuffer,
            saved.position,
            &[self.connector],
            saved.mode.as_ref(),
        ) {
            Ok(()) => debug!(crtc = saved.id.0, "restored saved CRTC state"),
            Err(e) => warn!(crtc = saved.id.0, "could not restore saved CRTC mode: {}", e),
        }
    }
}

impl std::fmt::Debug for DisplayPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayPipe")
            .field("connector", &self.connector)
            .field("encoder", &self.encoder)
            .field("crtc", &self.crtc)
            .field("mode", &self.mode.name)
            .finish()
    }
}

fn find_connector<D: KmsDevice>(
    device: &D,
    resources: &ResourceSet,
) -> Result<Scoped<ConnectorInfo>> {
    for &id in &resources.connectors {
        let connector = match device.connector(id) {
            Ok(connector) => connector,
            Err(e) => {
                debug!(connector = id.0, "skipping connector: {}", e);
                continue;
            }
        };

        if connector.state == ConnectionState::Connected && !connector.modes.is_empty() {
            debug!(
                connector = id.0,
                modes = connector.modes.len(),
                "found connector"
            );
            return Ok(connector);
        }
    }

    Err(Error::unavailable("no currently active connector found"))
}

fn find_encoder<D: KmsDevice>(
    device: &D,
    resources: &ResourceSet,
    connector: &ConnectorInfo,
) -> Result<Scoped<EncoderInfo>> {
    for &id in &resources.encoders {
        let encoder = match device.encoder(id) {
            Ok(encoder) => encoder,
            Err(e) => {
                debug!(encoder = id.0, "skipping encoder: {}", e);
                continue;
            }
        };

        if connector.current_encoder == Some(encoder.id) || connector.encoders.contains(&encoder.id)
        {
            debug!(encoder = id.0, "found encoder");
            return Ok(encoder);
        }
    }

    Err(Error::unavailable("no connected encoder found"))
}

/// The encoder's bound CRTC, or else the first CRTC its mask allows
fn find_crtc<D: KmsDevice>(
    device: &D,
    resources: &ResourceSet,
    encoder: &EncoderInfo,
) -> Result<(CrtcId, Scoped<CrtcState>)> {
    if let Some(bound) = encoder.crtc {
        match device.crtc(bound) {
            Ok(state) => return Ok((bound, state)),
            Err(e) => debug!(crtc = bound.0, "bound CRTC unreadable: {}", e),
        }
    }

    let first_allowed = resources
        .crtcs
        .iter()
        .take(32)
        .enumerate()
        .find(|(i, _)| encoder.possible_crtcs & (1u32 << *i) != 0);

    if let Some((_, &crtc)) = first_allowed {
        debug!(encoder = encoder.id.0, crtc = crtc.0, "set encoder's CRTC");
        if let Ok(state) = device.crtc(crtc) {
            return Ok((crtc, state));
        }
    }

    Err(Error::unavailable("no CRTC found"))
}

/// Claim a display pipe on `device`.
///
/// Every resource fetched on the way is released before this returns, except
/// the saved CRTC state, which moves into the returned pipe.
pub fn negotiate<D: KmsDevice>(device: &D) -> Result<DisplayPipe> {
    let resources = device.resources()?;

    let connector = find_connector(device, &resources)?;
    let encoder = find_encoder(device, &resources, &connector)?;
    let (crtc, saved_crtc) = find_crtc(device, &resources, &encoder)?;

    debug!(
        crtc = saved_crtc.id.0,
        fb = saved_crtc.framebuffer.map(|fb| fb.0).unwrap_or(0),
        x = saved_crtc.position.0,
        y = saved_crtc.position.1,
        width = saved_crtc.size.0,
        height = saved_crtc.size.1,
        "saved CRTC"
    );

    let mode = match &saved_crtc.mode {
        Some(mode) => mode.clone(),
        None => {
            debug!("current mode is invalid, selecting connector's mode #0");
            connector.modes[0].clone()
        }
    };

    info!(
        connector = connector.id.0,
        encoder = encoder.id.0,
        crtc = crtc.0,
        mode = %mode.name,
        "claimed display pipe"
    );

    Ok(DisplayPipe {
        connector: connector.id,
        encoder: encoder.id,
        crtc,
        mode,
        saved_crtc,
    })
}
