//! GBM buffer allocation context
//!
//! Wraps a gbm device created on (a duplicate of) the card's descriptor.
//! Surfaces created here are what the EGL layer renders into; their locked
//! front buffers are what the pipe turns into framebuffers.

use crate::alloc::{usage, BufferAllocator, NativeWindow, ScanoutBuffer, ScanoutSurface, SurfaceFormat};
use crate::device::{BufferDesc, BufferId, SurfaceId};
use crate::drm_device::DrmCard;
use crate::{Error, Result};
use smithay::reexports::drm::buffer::Buffer as DrmBuffer;
use smithay::reexports::gbm::{self, AsRaw, BufferObjectFlags, Format};
use std::os::raw::c_void;
use tracing::{debug, info};

fn to_gbm_format(format: SurfaceFormat) -> Format {
    match format {
        SurfaceFormat::Xrgb8888 => Format::Xrgb8888,
        SurfaceFormat::Argb8888 => Format::Argb8888,
    }
}

fn to_gbm_flags(mask: u32) -> BufferObjectFlags {
    let mut flags = BufferObjectFlags::empty();
    if mask & usage::SCANOUT != 0 {
        flags |= BufferObjectFlags::SCANOUT;
    }
    if mask & usage::CURSOR != 0 {
        flags |= BufferObjectFlags::CURSOR;
    }
    if mask & usage::RENDERING != 0 {
        flags |= BufferObjectFlags::RENDERING;
    }
    if mask & usage::WRITE != 0 {
        flags |= BufferObjectFlags::WRITE;
    }
    if mask & usage::LINEAR != 0 {
        flags |= BufferObjectFlags::LINEAR;
    }
    flags
}

/// GBM device layered on a DRM card
pub struct GbmContext {
    device: gbm::Device<DrmCard>,
}

impl GbmContext {
    pub fn new(card: DrmCard) -> Result<Self> {
        let device = gbm::Device::new(card)
            .map_err(|e| Error::Allocation(format!("couldn't create gbm device: {}", e)))?;

        info!(backend = ?device.backend_name(), "GBM device created");

        Ok(Self { device })
    }
}

impl BufferAllocator for GbmContext {
    type Surface = GbmScanoutSurface;

    fn is_format_supported(&self, format: SurfaceFormat, usage: u32) -> bool {
        self.device
            .is_format_supported(to_gbm_format(format), to_gbm_flags(usage))
    }

    fn create_surface(
        &self,
        width: u32,
        height: u32,
        format: SurfaceFormat,
        usage: u32,
    ) -> Result<GbmScanoutSurface> {
        let surface = self
            .device
            .create_surface::<()>(width, height, to_gbm_format(format), to_gbm_flags(usage))
            .map_err(|e| Error::unavailable(format!("couldn't create gbm surface: {}", e)))?;

        debug!("created {}x{} gbm surface ({:?})", width, height, format);

        Ok(GbmScanoutSurface { surface })
    }
}

impl Drop for GbmContext {
    fn drop(&mut self) {
        debug!("destroying GBM device");
    }
}

/// A gbm surface the renderer draws into
pub struct GbmScanoutSurface {
    surface: gbm::Surface<()>,
}

impl ScanoutSurface for GbmScanoutSurface {
    type Buffer = GbmScanoutBuffer;

    fn id(&self) -> SurfaceId {
        SurfaceId(self.surface.as_raw() as usize as u64)
    }

    fn native_window(&self) -> NativeWindow {
        NativeWindow(self.surface.as_raw() as *mut c_void)
    }

    fn lock_front_buffer(&mut self) -> Result<GbmScanoutBuffer> {
        // SAFETY: called once per finished frame, after the renderer swapped
        let bo = unsafe { self.surface.lock_front_buffer() }
            .map_err(|e| Error::unavailable(format!("couldn't lock front buffer: {}", e)))?;

        Ok(GbmScanoutBuffer { bo })
    }

    fn release_buffer(&mut self, buffer: GbmScanoutBuffer) {
        // Dropping a locked buffer object hands it back to its surface
        drop(buffer);
    }
}

/// A front buffer locked from a gbm surface
pub struct GbmScanoutBuffer {
    bo: gbm::BufferObject<()>,
}

impl ScanoutBuffer for GbmScanoutBuffer {
    fn id(&self) -> BufferId {
        BufferId(self.bo.as_raw() as usize as u64)
    }

    fn desc(&self) -> BufferDesc {
        let (width, height) = DrmBuffer::size(&self.bo);
        BufferDesc {
            width,
            height,
            stride: DrmBuffer::pitch(&self.bo),
            handle: u32::from(DrmBuffer::handle(&self.bo)),
        }
    }
}
