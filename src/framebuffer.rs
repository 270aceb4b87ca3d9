//! Buffer -> framebuffer side-table
//!
//! A GBM front buffer has to be wrapped in a DRM framebuffer before it can be
//! scanned out. The wrap is created the first time a buffer is presented and
//! reused every time the surface hands the same buffer back. Bindings live
//! here, owned by the device handle, until the buffer or its surface is
//! reported destroyed or the device closes.

use crate::alloc::ScanoutBuffer;
use crate::device::{BufferId, FramebufferId, KmsDevice, SurfaceId};
use crate::Result;
use std::collections::HashMap;
use tracing::{debug, warn};

const FB_DEPTH: u32 = 24;
const FB_BPP: u32 = 32;

/// A hardware framebuffer wrapping one graphics buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferBinding {
    pub fb: FramebufferId,
    pub buffer: BufferId,
    pub surface: SurfaceId,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

#[derive(Debug, Default)]
pub struct FramebufferCache {
    bindings: HashMap<BufferId, FramebufferBinding>,
}

impl FramebufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Framebuffer for `buffer`, created on first use
    pub fn bind<D, B>(
        &mut self,
        device: &D,
        buffer: &B,
        surface: SurfaceId,
    ) -> Result<FramebufferBinding>
    where
        D: KmsDevice,
        B: ScanoutBuffer,
    {
        let id = buffer.id();
        if let Some(binding) = self.bindings.get(&id) {
            return Ok(*binding);
        }

        let desc = buffer.desc();
        let fb = device.add_framebuffer(&desc, FB_DEPTH, FB_BPP)?;

        debug!(
            fb = fb.0,
            width = desc.width,
            height = desc.height,
            stride = desc.stride,
            buffer = id.0,
            "new DRM framebuffer"
        );

        let binding = FramebufferBinding {
            fb,
            buffer: id,
            surface,
            width: desc.width,
            height: desc.height,
            stride: desc.stride,
        };
        self.bindings.insert(id, binding);
        Ok(binding)
    }

    pub fn get(&self, buffer: BufferId) -> Option<&FramebufferBinding> {
        self.bindings.get(&buffer)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// The rendering side destroyed `buffer`
    pub fn buffer_destroyed<D: KmsDevice>(&mut self, device: &D, buffer: BufferId) {
        if let Some(binding) = self.bindings.remove(&buffer) {
            remove(device, &binding);
        }
    }

    /// `surface` is going away along with every buffer it handed out
    pub fn surface_destroyed<D: KmsDevice>(&mut self, device: &D, surface: SurfaceId) {
        let mut gone = Vec::new();
        self.bindings.retain(|_, binding| {
            if binding.surface == surface {
                gone.push(*binding);
                false
            } else {
                true
            }
        });

        for binding in &gone {
            remove(device, binding);
        }
    }

    /// Drop every binding; called before the device closes
    pub fn release_all<D: KmsDevice>(&mut self, device: &D) {
        for (_, binding) in self.bindings.drain() {
            remove(device, &binding);
        }
    }
}

fn remove<D: KmsDevice>(device: &D, binding: &FramebufferBinding) {
    match device.remove_framebuffer(binding.fb) {
        Ok(()) => debug!(fb = binding.fb.0, "deleted DRM framebuffer"),
        Err(e) => warn!(fb = binding.fb.0, "could not delete DRM framebuffer: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBuffer, MockDevice, MockHardware};

    fn device() -> MockDevice {
        MockDevice::new("/dev/dri/card0", MockHardware::single_pipe())
    }

    #[test]
    fn test_bind_is_idempotent_per_buffer() {
        let dev = device();
        let mut cache = FramebufferCache::new();
        let buffers: Vec<MockBuffer> = (1..=5).map(|i| MockBuffer::standalone(i, 640, 480)).collect();

        let first: Vec<FramebufferBinding> = buffers
            .iter()
            .map(|b| cache.bind(&dev, b, SurfaceId(1)).unwrap())
            .collect();
        let second: Vec<FramebufferBinding> = buffers
            .iter()
            .rev()
            .map(|b| cache.bind(&dev, b, SurfaceId(1)).unwrap())
            .collect();

        assert_eq!(dev.framebuffers_created(), 5);
        assert_eq!(cache.len(), 5);
        for (a, b) in first.iter().zip(second.iter().rev()) {
            assert_eq!(a, b);
        }

        let mut fbs: Vec<u32> = first.iter().map(|b| b.fb.0).collect();
        fbs.sort_unstable();
        fbs.dedup();
        assert_eq!(fbs.len(), 5);
    }

    #[test]
    fn test_bind_records_buffer_geometry() {
        let dev = device();
        let mut cache = FramebufferCache::new();
        let binding = cache
            .bind(&dev, &MockBuffer::standalone(9, 1920, 1080), SurfaceId(3))
            .unwrap();

        assert_eq!((binding.width, binding.height, binding.stride), (1920, 1080, 7680));
        assert_eq!(binding.surface, SurfaceId(3));
        assert_eq!(cache.get(BufferId(9)), Some(&binding));
    }

    #[test]
    fn test_failed_bind_leaves_no_binding() {
        let dev = device();
        dev.fail_add_framebuffer(true);
        let mut cache = FramebufferCache::new();

        assert!(cache.bind(&dev, &MockBuffer::standalone(1, 64, 64), SurfaceId(1)).is_err());
        assert!(cache.is_empty());

        dev.fail_add_framebuffer(false);
        cache.bind(&dev, &MockBuffer::standalone(1, 64, 64), SurfaceId(1)).unwrap();
        assert_eq!(dev.framebuffers_created(), 1);
    }

    #[test]
    fn test_buffer_destroyed_removes_framebuffer() {
        let dev = device();
        let mut cache = FramebufferCache::new();
        let buffer = MockBuffer::standalone(1, 64, 64);
        cache.bind(&dev, &buffer, SurfaceId(1)).unwrap();

        cache.buffer_destroyed(&dev, BufferId(1));
        assert!(cache.is_empty());
        assert_eq!(dev.live_framebuffers(), 0);

        // unknown buffers are ignored
        cache.buffer_destroyed(&dev, BufferId(1));
        assert_eq!(dev.framebuffers_removed(), 1);

        // a fresh binding after destruction gets a new framebuffer
        cache.bind(&dev, &buffer, SurfaceId(1)).unwrap();
        assert_eq!(dev.framebuffers_created(), 2);
    }

    #[test]
    fn test_surface_destroyed_only_touches_its_buffers() {
        let dev = device();
        let mut cache = FramebufferCache::new();
        cache.bind(&dev, &MockBuffer::standalone(1, 64, 64), SurfaceId(1)).unwrap();
        cache.bind(&dev, &MockBuffer::standalone(2, 64, 64), SurfaceId(1)).unwrap();
        cache.bind(&dev, &MockBuffer::standalone(3, 64, 64), SurfaceId(2)).unwrap();

        cache.surface_destroyed(&dev, SurfaceId(1));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(BufferId(3)).is_some());
        assert_eq!(dev.live_framebuffers(), 1);
    }

    #[test]
    fn test_release_all() {
        let dev = device();
        let mut cache = FramebufferCache::new();
        for i in 0..4 {
            cache.bind(&dev, &MockBuffer::standalone(i, 64, 64), SurfaceId(1)).unwrap();
        }

        cache.release_all(&dev);
        assert!(cache.is_empty());
        assert_eq!(dev.framebuffers_removed(), 4);
        assert_eq!(dev.live_framebuffers(), 0);
    }
}
