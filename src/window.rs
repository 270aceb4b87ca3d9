//! Fullscreen window on the claimed pipe
//!
//! A window is one allocation surface sized to the display. The renderer
//! draws into it through [`Window::native_window`]; after each swap
//! [`Window::present`] locks the finished buffer and puts it on screen:
//! mode-set for the first frame, vblank page flips afterwards.
//!
//! Buffer flow per present:
//! ```text
//!   current (on screen)  <-  next (flip queued)  <-  lock_front_buffer()
//!        |
//!   release_buffer()
//! ```

use crate::alloc::{usage, BufferAllocator, NativeWindow, ScanoutSurface, SurfaceFormat};
use crate::device::KmsDevice;
use crate::flip::{wait_for_flip, FlipState};
use crate::framebuffer::FramebufferCache;
use crate::pipe::{DisplayMode, DisplayPipe};
use crate::{Error, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Window<S: ScanoutSurface> {
    surface: S,
    width: u32,
    height: u32,
    format: SurfaceFormat,
    double_buffer: bool,
    crtc_ready: bool,
    flip: FlipState,
    current: Option<S::Buffer>,
    next: Option<S::Buffer>,
    frames: u64,
}

impl<S: ScanoutSurface> Window<S> {
    /// Create a window covering `mode`.
    pub fn create<A>(allocator: &A, mode: &DisplayMode, format: SurfaceFormat, double_buffer: bool) -> Result<Self>
    where
        A: BufferAllocator<Surface = S>,
    {
        let flags = usage::SCANOUT | usage::RENDERING;
        if !allocator.is_format_supported(format, flags) {
            warn!(?format, "GBM surface format not supported, trying anyway");
        }

        let surface = allocator.create_surface(mode.width, mode.height, format, flags)?;

        info!(
            width = mode.width,
            height = mode.height,
            double_buffer,
            "created window"
        );

        Ok(Self {
            surface,
            width: mode.width,
            height: mode.height,
            format,
            double_buffer,
            crtc_ready: false,
            flip: FlipState::Idle,
            current: None,
            next: None,
            frames: 0,
        })
    }

    /// Handle for the rendering layer to create its window surface on
    pub fn native_window(&self) -> NativeWindow {
        self.surface.native_window()
    }

    /// Pixel format of the surface, for picking a matching visual
    pub fn format(&self) -> SurfaceFormat {
        self.format
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn double_buffer(&self) -> bool {
        self.double_buffer
    }

    pub fn flip_state(&self) -> FlipState {
        self.flip
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Frames put on screen so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Put the frame the renderer just finished on screen.
    ///
    /// Waits up to `timeout` for the previous flip first; if it has not
    /// completed the frame is dropped ([`Error::FrameDropped`]) and nothing
    /// changes. The CRTC is mode-set until that succeeds once, page flipped
    /// afterwards. If neither can be queued the new buffer goes back to the
    /// surface and the one on screen stays locked.
    pub fn present<D: KmsDevice>(
        &mut self,
        device: &D,
        framebuffers: &mut FramebufferCache,
        pipe: &DisplayPipe,
        timeout: Option<Duration>,
    ) -> Result<()> {
        wait_for_flip(device, &mut self.flip, timeout)?;

        // `next` only ever holds a buffer that was mode-set or flipped to, so
        // once the wait is over it is on screen and the old front buffer is free
        if let Some(shown) = self.next.take() {
            if let Some(old) = self.current.replace(shown) {
                self.surface.release_buffer(old);
            }
        }

        let next = self.surface.lock_front_buffer()?;
        let binding = match framebuffers.bind(device, &next, self.surface.id()) {
            Ok(binding) => binding,
            Err(e) => {
                self.surface.release_buffer(next);
                return Err(e);
            }
        };

        let queued = if self.crtc_ready {
            device.page_flip(pipe.crtc(), binding.fb)
        } else {
            device.set_crtc(
                pipe.crtc(),
                Some(binding.fb),
                (0, 0),
                &[pipe.connector()],
                Some(pipe.mode()),
            )
        };
        if let Err(e) = queued {
            self.surface.release_buffer(next);
            return Err(e);
        }
        self.next = Some(next);

        if self.crtc_ready {
            self.flip.begin(pipe.crtc(), binding.fb)?;
            if self.double_buffer {
                wait_for_flip(device, &mut self.flip, None)?;
            }
        } else {
            self.crtc_ready = true;
            debug!(crtc = pipe.crtc().0, fb = binding.fb.0, "set CRTC for first frame");
        }

        self.frames += 1;
        Ok(())
    }

    /// Tear the window down.
    ///
    /// Any queued flip is drained first. If the drain fails, the surface's
    /// framebuffers are left in place (the hardware may still scan them out)
    /// and are removed when the device closes.
    pub fn destroy<D: KmsDevice>(mut self, device: &D, framebuffers: &mut FramebufferCache) -> Result<()> {
        let drained = wait_for_flip(device, &mut self.flip, None);

        if let Some(current) = self.current.take() {
            self.surface.release_buffer(current);
        }
        if let Some(next) = self.next.take() {
            self.surface.release_buffer(next);
        }

        if let Err(e) = drained {
            return Err(Error::ProtocolViolation(format!(
                "window destroyed with a page flip still in flight: {}",
                e
            )));
        }

        framebuffers.surface_destroyed(device, self.surface.id());
        debug!(frames = self.frames, "destroyed window");
        Ok(())
    }
}
