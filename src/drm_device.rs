//! DRM device node backed by the kernel's KMS ioctls
//!
//! [`DrmCard`] wraps an open `/dev/dri/cardN` file and implements the drm-rs
//! `Device`/`control::Device` traits on it, then exposes the subset of
//! mode-setting the display pipe needs through [`KmsDevice`].

use crate::device::{
    Backend, BufferDesc, ConnectionState, ConnectorId, ConnectorInfo, CrtcId, CrtcState,
    DeviceEvent, EncoderId, EncoderInfo, FramebufferId, KmsDevice, ModeInfo, PollOutcome,
    ResourceSet,
};
use crate::gbm_device::GbmContext;
use crate::scoped::Scoped;
use crate::{Error, Result};
use smithay::reexports::drm;
use smithay::reexports::drm::buffer::{self, DrmFourcc};
use smithay::reexports::drm::control::{
    self, connector, crtc, encoder, framebuffer, Device as ControlDevice, PageFlipFlags,
    RawResourceHandle,
};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// An open DRM card node
#[derive(Debug)]
pub struct DrmCard {
    file: File,
    path: PathBuf,
}

impl DrmCard {
    /// Open a card node read/write, close-on-exec
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;

        debug!(path = %path.display(), fd = file.as_raw_fd(), "opened DRM device");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Duplicate the descriptor (the allocation context keeps its own)
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
            path: self.path.clone(),
        })
    }
}

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for DrmCard {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl drm::Device for DrmCard {}
impl ControlDevice for DrmCard {}

impl Drop for DrmCard {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), fd = self.file.as_raw_fd(), "closed DRM device");
    }
}

/// Turn one of our ids back into a drm-rs handle
fn to_handle<T: From<RawResourceHandle>>(raw: u32, what: &str) -> Result<T> {
    control::from_u32(raw).ok_or_else(|| Error::unavailable(format!("invalid {} id {}", what, raw)))
}

/// `poll(2)` timeout in whole milliseconds, rounded up
fn poll_timeout_ms(timeout: Duration) -> libc::c_int {
    let ms = timeout.as_nanos().div_ceil(1_000_000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

/// ADDFB view of a buffer described by size, pitch and GEM handle
struct ScanoutDesc {
    desc: BufferDesc,
    handle: buffer::Handle,
}

impl buffer::Buffer for ScanoutDesc {
    fn size(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    fn format(&self) -> DrmFourcc {
        DrmFourcc::Xrgb8888
    }

    fn pitch(&self) -> u32 {
        self.desc.stride
    }

    fn handle(&self) -> buffer::Handle {
        self.handle
    }
}

impl KmsDevice for DrmCard {
    fn path(&self) -> &Path {
        &self.path
    }

    fn resources(&self) -> Result<Scoped<ResourceSet>> {
        let handles = self.resource_handles().map_err(|e| {
            Error::unavailable(format!("drmModeGetResources({}) failed: {}", self.path.display(), e))
        })?;

        Ok(Scoped::new(ResourceSet {
            connectors: handles.connectors().iter().map(|h| ConnectorId(u32::from(*h))).collect(),
            encoders: handles.encoders().iter().map(|h| EncoderId(u32::from(*h))).collect(),
            crtcs: handles.crtcs().iter().map(|h| CrtcId(u32::from(*h))).collect(),
        }))
    }

    fn connector(&self, id: ConnectorId) -> Result<Scoped<ConnectorInfo>> {
        let conn: connector::Handle = to_handle(id.0, "connector")?;
        let info = self
            .get_connector(conn, true)
            .map_err(|e| Error::unavailable(format!("connector {}: {}", id, e)))?;

        let state = match info.state() {
            connector::State::Connected => ConnectionState::Connected,
            connector::State::Disconnected => ConnectionState::Disconnected,
            _ => ConnectionState::Unknown,
        };

        Ok(Scoped::new(ConnectorInfo {
            id,
            state,
            modes: info.modes().iter().copied().map(ModeInfo::from).collect(),
            current_encoder: info.current_encoder().map(|e| EncoderId(u32::from(e))),
            encoders: info.encoders().iter().map(|e| EncoderId(u32::from(*e))).collect(),
        }))
    }

    fn encoder(&self, id: EncoderId) -> Result<Scoped<EncoderInfo>> {
        let enc: encoder::Handle = to_handle(id.0, "encoder")?;
        let info = self
            .get_encoder(enc)
            .map_err(|e| Error::unavailable(format!("encoder {}: {}", id, e)))?;

        // drm-rs keeps the raw mask private; rebuild it against the resource
        // set's CRTC order.
        let handles = self.resource_handles()?;
        let allowed = handles.filter_crtcs(info.possible_crtcs());
        let possible_crtcs = handles
            .crtcs()
            .iter()
            .take(32)
            .enumerate()
            .filter(|(_, c)| allowed.contains(*c))
            .fold(0u32, |mask, (i, _)| mask | (1u32 << i));

        Ok(Scoped::new(EncoderInfo {
            id,
            crtc: info.crtc().map(|c| CrtcId(u32::from(c))),
            possible_crtcs,
        }))
    }

    fn crtc(&self, id: CrtcId) -> Result<Scoped<CrtcState>> {
        let handle: crtc::Handle = to_handle(id.0, "CRTC")?;
        let info = self
            .get_crtc(handle)
            .map_err(|e| Error::unavailable(format!("CRTC {}: {}", id, e)))?;

        let mode = info.mode().map(ModeInfo::from);
        let size = mode
            .as_ref()
            .map(|m| (u32::from(m.width), u32::from(m.height)))
            .unwrap_or((0, 0));

        Ok(Scoped::new(CrtcState {
            id,
            framebuffer: info.framebuffer().map(|fb| FramebufferId(u32::from(fb))),
            position: info.position(),
            size,
            mode,
        }))
    }

    fn set_crtc(
        &self,
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorId],
        mode: Option<&ModeInfo>,
    ) -> Result<()> {
        let crtc_handle: crtc::Handle = to_handle(crtc.0, "CRTC")?;
        let fb = framebuffer
            .map(|fb| to_handle::<framebuffer::Handle>(fb.0, "framebuffer"))
            .transpose()?;
        let conns = connectors
            .iter()
            .map(|c| to_handle::<connector::Handle>(c.0, "connector"))
            .collect::<Result<Vec<_>>>()?;
        let hw_mode = match mode {
            Some(m) => Some(m.hardware().ok_or_else(|| {
                Error::ModeSetting(format!("mode {} carries no hardware timings", m.name))
            })?),
            None => None,
        };

        ControlDevice::set_crtc(self, crtc_handle, fb, position, &conns, hw_mode)
            .map_err(|e| Error::ModeSetting(format!("drmModeSetCrtc({}) failed: {}", crtc, e)))
    }

    fn add_framebuffer(&self, buffer: &BufferDesc, depth: u32, bpp: u32) -> Result<FramebufferId> {
        let scanout = ScanoutDesc {
            desc: *buffer,
            handle: to_handle(buffer.handle, "buffer handle")?,
        };

        let fb = ControlDevice::add_framebuffer(self, &scanout, depth, bpp)
            .map_err(|e| Error::unavailable(format!("drmModeAddFB failed: {}", e)))?;

        Ok(FramebufferId(u32::from(fb)))
    }

    fn remove_framebuffer(&self, fb: FramebufferId) -> Result<()> {
        let fb_handle: framebuffer::Handle = to_handle(fb.0, "framebuffer")?;
        self.destroy_framebuffer(fb_handle)?;
        Ok(())
    }

    fn page_flip(&self, crtc: CrtcId, fb: FramebufferId) -> Result<()> {
        let crtc_handle: crtc::Handle = to_handle(crtc.0, "CRTC")?;
        let fb_handle: framebuffer::Handle = to_handle(fb.0, "framebuffer")?;

        ControlDevice::page_flip(self, crtc_handle, fb_handle, PageFlipFlags::EVENT, None)
            .map_err(|e| Error::ModeSetting(format!("drmModePageFlip({}, {}) failed: {}", crtc, fb, e)))
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<PollOutcome> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = match timeout {
            Some(t) => poll_timeout_ms(t),
            None => -1,
        };

        // SAFETY: pfd is a single valid pollfd that outlives the call
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        if pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
            Ok(PollOutcome::HangUp)
        } else if pfd.revents & libc::POLLIN != 0 {
            Ok(PollOutcome::Readable)
        } else {
            Ok(PollOutcome::TimedOut)
        }
    }

    fn dispatch_events(&self) -> Result<Vec<DeviceEvent>> {
        let events = self.receive_events()?;

        Ok(events
            .map(|event| match event {
                control::Event::PageFlip(flip) => DeviceEvent::PageFlip {
                    crtc: CrtcId(u32::from(flip.crtc)),
                    frame: flip.frame,
                },
                control::Event::Vblank(vblank) => DeviceEvent::VBlank {
                    crtc: CrtcId(u32::from(vblank.crtc)),
                    frame: vblank.frame,
                },
                _ => {
                    warn!("unknown DRM event");
                    DeviceEvent::Unknown
                }
            })
            .collect())
    }
}

/// Opens `/dev/dri/cardN` nodes and layers GBM on top of them
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmBackend;

impl Backend for DrmBackend {
    type Device = DrmCard;
    type Allocator = GbmContext;

    fn open(&self, path: &Path) -> Result<DrmCard> {
        DrmCard::open(path)
    }

    fn create_allocator(&self, device: &DrmCard) -> Result<GbmContext> {
        info!(path = %device.path.display(), "creating GBM device");
        GbmContext::new(device.try_clone()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_timeout_rounds_up() {
        assert_eq!(poll_timeout_ms(Duration::ZERO), 0);
        assert_eq!(poll_timeout_ms(Duration::from_micros(1)), 1);
        assert_eq!(poll_timeout_ms(Duration::from_micros(16_500)), 17);
        assert_eq!(poll_timeout_ms(Duration::from_millis(16)), 16);
        assert_eq!(poll_timeout_ms(Duration::from_secs(u64::MAX)), libc::c_int::MAX);
    }
}
