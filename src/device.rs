//! Mode-setting device seam
//!
//! The negotiator, binder and flip synchronizer only talk to hardware through
//! [`KmsDevice`]. [`crate::drm_device::DrmCard`] implements it on a real
//! `/dev/dri/cardN` node; the scripted backend in `testing` implements it in
//! memory.
//!
//! # Object IDs
//! All DRM object ids are carried as plain `u32` newtypes so selections and
//! saved state can be compared, logged and replayed without holding on to
//! the backend's handle types.

use crate::alloc::BufferAllocator;
use crate::scoped::Scoped;
use crate::Result;
use smithay::reexports::drm::control::Mode;
use std::fmt;
use std::path::Path;
use std::time::Duration;

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

object_id!(
    /// DRM connector object id
    ConnectorId
);
object_id!(
    /// DRM encoder object id
    EncoderId
);
object_id!(
    /// DRM CRTC object id
    CrtcId
);
object_id!(
    /// Hardware framebuffer id returned by ADDFB
    FramebufferId
);

/// Identity of a graphics buffer (the buffer object's address for GBM)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Identity of an allocation surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// DRM resources enumeration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSet {
    pub connectors: Vec<ConnectorId>,
    pub encoders: Vec<EncoderId>,
    pub crtcs: Vec<CrtcId>,
}

impl ResourceSet {
    /// A device can drive a display only with at least one of each object.
    pub fn supports_modesetting(&self) -> bool {
        !self.connectors.is_empty() && !self.encoders.is_empty() && !self.crtcs.is_empty()
    }
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Unknown,
}

/// A display mode as reported by the hardware
#[derive(Clone)]
pub struct ModeInfo {
    pub name: String,
    pub width: u16,
    pub height: u16,
    pub refresh: u32,
    hardware: Option<Mode>,
}

impl ModeInfo {
    /// A mode with no hardware timings attached (used by in-memory backends).
    pub fn new(width: u16, height: u16, refresh: u32) -> Self {
        Self {
            name: format!("{}x{}@{}", width, height, refresh),
            width,
            height,
            refresh,
            hardware: None,
        }
    }

    /// Full timings to hand back to the kernel, if this mode came from it.
    pub fn hardware(&self) -> Option<Mode> {
        self.hardware
    }
}

impl From<Mode> for ModeInfo {
    fn from(mode: Mode) -> Self {
        let (width, height) = mode.size();
        let refresh = mode.vrefresh();
        Self {
            name: format!("{}x{}@{}", width, height, refresh),
            width,
            height,
            refresh,
            hardware: Some(mode),
        }
    }
}

impl PartialEq for ModeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.width == other.width
            && self.height == other.height
            && self.refresh == other.refresh
    }
}

impl fmt::Debug for ModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeInfo")
            .field("name", &self.name)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("refresh", &self.refresh)
            .field("hardware", &self.hardware.is_some())
            .finish()
    }
}

/// DRM connector info
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorInfo {
    pub id: ConnectorId,
    pub state: ConnectionState,
    pub modes: Vec<ModeInfo>,
    /// Encoder currently bound to this connector
    pub current_encoder: Option<EncoderId>,
    /// Encoders this connector can be driven by
    pub encoders: Vec<EncoderId>,
}

/// DRM encoder info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: EncoderId,
    pub crtc: Option<CrtcId>,
    /// Bit `i` set means the CRTC at index `i` of the resource set's CRTC
    /// list can drive this encoder.
    pub possible_crtcs: u32,
}

/// Full CRTC state: what is scanned out, where, and in which mode
#[derive(Debug, Clone, PartialEq)]
pub struct CrtcState {
    pub id: CrtcId,
    pub framebuffer: Option<FramebufferId>,
    pub position: (u32, u32),
    pub size: (u32, u32),
    /// `None` when the kernel reports `mode_valid == 0`
    pub mode: Option<ModeInfo>,
}

impl CrtcState {
    pub fn mode_valid(&self) -> bool {
        self.mode.is_some()
    }
}

/// What ADDFB needs to know about a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    /// Driver-local GEM handle of the buffer
    pub handle: u32,
}

/// Result of polling the device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Readable,
    HangUp,
    TimedOut,
}

/// Events read back from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    PageFlip { crtc: CrtcId, frame: u32 },
    VBlank { crtc: CrtcId, frame: u32 },
    Unknown,
}

/// The mode-setting operations the display pipe needs from a device
pub trait KmsDevice {
    /// Path of the device node, for diagnostics
    fn path(&self) -> &Path;

    fn resources(&self) -> Result<Scoped<ResourceSet>>;

    fn connector(&self, id: ConnectorId) -> Result<Scoped<ConnectorInfo>>;

    fn encoder(&self, id: EncoderId) -> Result<Scoped<EncoderInfo>>;

    fn crtc(&self, id: CrtcId) -> Result<Scoped<CrtcState>>;

    /// Program a CRTC (legacy SETCRTC)
    fn set_crtc(
        &self,
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorId],
        mode: Option<&ModeInfo>,
    ) -> Result<()>;

    fn add_framebuffer(&self, buffer: &BufferDesc, depth: u32, bpp: u32) -> Result<FramebufferId>;

    fn remove_framebuffer(&self, fb: FramebufferId) -> Result<()>;

    /// Queue a flip to `fb` at the next vblank and request a completion event
    fn page_flip(&self, crtc: CrtcId, fb: FramebufferId) -> Result<()>;

    /// Wait for the device descriptor to become readable. `None` waits forever.
    /// Resolution is milliseconds; a non-zero timeout shorter than that rounds up.
    fn poll(&self, timeout: Option<Duration>) -> Result<PollOutcome>;

    /// Read and decode whatever events are pending on the descriptor
    fn dispatch_events(&self) -> Result<Vec<DeviceEvent>>;
}

/// Opens device nodes and creates their buffer allocation contexts
pub trait Backend {
    type Device: KmsDevice;
    type Allocator: BufferAllocator;

    fn open(&self, path: &Path) -> Result<Self::Device>;

    fn create_allocator(&self, device: &Self::Device) -> Result<Self::Allocator>;
}
