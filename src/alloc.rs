//! Buffer allocation context seam
//!
//! The allocation context (GBM on real hardware) creates renderable
//! surfaces. The rendering layer draws into a surface through its native
//! window handle; the display pipe then locks the finished front buffer and
//! scans it out.

use crate::device::{BufferDesc, BufferId, SurfaceId};
use crate::Result;
use std::os::raw::c_void;

/// DRM fourcc format codes
pub mod drm_fourcc {
    pub const DRM_FORMAT_XRGB8888: u32 = 0x34325258; // 'XR24'
    pub const DRM_FORMAT_ARGB8888: u32 = 0x34325241; // 'AR24'
}

/// Buffer usage flags
pub mod usage {
    pub const SCANOUT: u32 = 1 << 0;
    pub const CURSOR: u32 = 1 << 1;
    pub const RENDERING: u32 = 1 << 2;
    pub const WRITE: u32 = 1 << 3;
    pub const LINEAR: u32 = 1 << 4;
}

/// Surface pixel formats the pipe can scan out
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceFormat {
    #[default]
    Xrgb8888 = drm_fourcc::DRM_FORMAT_XRGB8888,
    Argb8888 = drm_fourcc::DRM_FORMAT_ARGB8888,
}

impl SurfaceFormat {
    pub fn fourcc(self) -> u32 {
        self as u32
    }
}

/// Platform-native window handle for the rendering layer
/// (a `struct gbm_surface *` on real hardware)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeWindow(pub *mut c_void);

/// A graphics buffer that can be wrapped in a hardware framebuffer
pub trait ScanoutBuffer {
    fn id(&self) -> BufferId;

    fn desc(&self) -> BufferDesc;
}

/// A renderable surface handing out finished front buffers
pub trait ScanoutSurface {
    type Buffer: ScanoutBuffer;

    fn id(&self) -> SurfaceId;

    fn native_window(&self) -> NativeWindow;

    /// Lock the buffer the renderer just finished as the next front buffer
    fn lock_front_buffer(&mut self) -> Result<Self::Buffer>;

    /// Give a front buffer back to the surface for reuse
    fn release_buffer(&mut self, buffer: Self::Buffer);
}

/// Device-level buffer allocation context
pub trait BufferAllocator {
    type Surface: ScanoutSurface;

    fn is_format_supported(&self, format: SurfaceFormat, usage: u32) -> bool;

    fn create_surface(
        &self,
        width: u32,
        height: u32,
        format: SurfaceFormat,
        usage: u32,
    ) -> Result<Self::Surface>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_format_fourcc() {
        assert_eq!(SurfaceFormat::Xrgb8888.fourcc(), 0x34325258);
        assert_eq!(SurfaceFormat::Argb8888.fourcc(), 0x34325241);
        assert_eq!(SurfaceFormat::default(), SurfaceFormat::Xrgb8888);
    }
}
