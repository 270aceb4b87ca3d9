//! Video device lifecycle
//!
//! [`VideoDevice`] owns the session: it picks the card, opens it, layers the
//! allocation context on it, claims the display pipe, and publishes the
//! single display. Teardown runs the same steps backwards and puts the CRTC
//! back the way it was found.

use crate::alloc::BufferAllocator;
use crate::config::{KmsConfig, MAX_DEVICE_INDEX};
use crate::device::{Backend, BufferId, KmsDevice};
use crate::enumerate::probe;
use crate::framebuffer::FramebufferCache;
use crate::pipe::{negotiate, DisplayMode, DisplayPipe, VideoDisplay};
use crate::window::Window;
use crate::{Error, Result};
use tracing::{debug, info, warn};

/// Surface type handed out by a backend's allocator
pub type SurfaceOf<B> = <<B as Backend>::Allocator as BufferAllocator>::Surface;

/// Collaborators the session starts and stops alongside the display
pub trait SessionHooks {
    fn init_input(&mut self) -> Result<()> {
        Ok(())
    }

    fn quit_input(&mut self) {}

    fn init_cursor(&mut self) -> Result<()> {
        Ok(())
    }

    /// Unload the rendering library, if one was loaded
    fn unload_renderer(&mut self) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl SessionHooks for NoHooks {}

/// The open device, its allocation context, and its framebuffer bindings
pub struct DeviceHandle<B: Backend> {
    framebuffers: FramebufferCache,
    // field order is drop order: allocation context before the device
    allocator: B::Allocator,
    device: B::Device,
}

impl<B: Backend> DeviceHandle<B> {
    fn new(device: B::Device, allocator: B::Allocator) -> Self {
        Self {
            framebuffers: FramebufferCache::new(),
            allocator,
            device,
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn allocator(&self) -> &B::Allocator {
        &self.allocator
    }

    pub fn framebuffers(&self) -> &FramebufferCache {
        &self.framebuffers
    }

    /// Remove every framebuffer, then drop the allocation context, then the device
    fn close(mut self) {
        self.framebuffers.release_all(&self.device);

        let DeviceHandle {
            allocator, device, ..
        } = self;
        drop(allocator);
        debug!(path = %device.path().display(), "closing DRM device");
        drop(device);
    }
}

pub struct VideoDevice<B: Backend, H: SessionHooks = NoHooks> {
    backend: B,
    hooks: H,
    config: KmsConfig,
    index: u32,
    handle: Option<DeviceHandle<B>>,
    pipe: Option<DisplayPipe>,
    displays: Vec<VideoDisplay>,
    input_started: bool,
}

impl<B: Backend, H: SessionHooks> VideoDevice<B, H> {
    /// Pick the device to drive.
    ///
    /// An explicit index must be within `0..=99` and is taken as-is. Without
    /// one, the first mode-setting capable node is used. An index outside
    /// that range, including anything above 99, is rejected with
    /// [`Error::InvalidDeviceIndex`]; it does not fall back to enumeration.
    pub fn create(backend: B, hooks: H, config: KmsConfig) -> Result<Self> {
        let index = match config.device_index {
            Some(index) if (0..=MAX_DEVICE_INDEX).contains(&index) => index as u32,
            Some(index) => return Err(Error::InvalidDeviceIndex(index)),
            None => probe(&backend, &config.dri_path, &config.node_prefix)?,
        };

        debug!(index, "created KMSDRM video device");

        Ok(Self {
            backend,
            hooks,
            config,
            index,
            handle: None,
            pipe: None,
            displays: Vec::new(),
            input_started: false,
        })
    }

    /// Whether any usable device exists
    pub fn available(backend: &B, config: &KmsConfig) -> bool {
        probe(backend, &config.dri_path, &config.node_prefix).is_ok()
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn config(&self) -> &KmsConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&DeviceHandle<B>> {
        self.handle.as_ref()
    }

    pub fn pipe(&self) -> Option<&DisplayPipe> {
        self.pipe.as_ref()
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Open the device, claim the pipe and publish the display.
    ///
    /// On failure everything acquired so far is released again, in reverse.
    pub fn init(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::ProtocolViolation("video device already initialized".into()));
        }

        let path = self.config.node_path(self.index);
        info!(path = %path.display(), "opening DRM device");

        let device = self.backend.open(&path).map_err(|e| {
            Error::unavailable(format!("could not open {}: {}", path.display(), e))
        })?;
        let allocator = self.backend.create_allocator(&device)?;
        let handle = DeviceHandle::<B>::new(device, allocator);

        let pipe = match negotiate(&handle.device) {
            Ok(pipe) => pipe,
            Err(e) => {
                handle.close();
                return Err(e);
            }
        };

        self.displays = vec![pipe.display()];
        self.pipe = Some(pipe);
        self.handle = Some(handle);

        if let Err(e) = self.start_collaborators() {
            warn!("video init failed: {}", e);
            self.quit();
            return Err(e);
        }

        info!(
            path = %path.display(),
            mode = ?self.displays[0].current_mode,
            "KMSDRM video initialized"
        );
        Ok(())
    }

    fn start_collaborators(&mut self) -> Result<()> {
        self.hooks.init_input()?;
        self.input_started = true;
        self.hooks.init_cursor()
    }

    /// Tear the session down. Safe to call at any point, any number of times.
    pub fn quit(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        debug!("KMSDRM video quit");

        self.hooks.unload_renderer();

        if let Some(pipe) = self.pipe.take() {
            pipe.restore(&handle.device);
        }
        self.displays.clear();

        handle.close();

        if self.input_started {
            self.hooks.quit_input();
            self.input_started = false;
        }
    }

    pub fn displays(&self) -> &[VideoDisplay] {
        &self.displays
    }

    /// Only the mode the pipe was claimed in is offered
    pub fn display_modes(&self) -> Vec<DisplayMode> {
        self.displays.iter().map(|d| d.current_mode).collect()
    }

    /// Mode switching is not supported; the request is accepted and ignored.
    pub fn set_display_mode(&mut self, _display: usize, mode: &DisplayMode) -> Result<()> {
        debug!(?mode, "ignoring display mode change");
        Ok(())
    }

    pub fn create_window(&self) -> Result<Window<SurfaceOf<B>>> {
        let (Some(handle), Some(display)) = (self.handle.as_ref(), self.displays.first()) else {
            return Err(not_initialized());
        };

        Window::create(
            &handle.allocator,
            &display.desktop_mode,
            self.config.surface_format,
            self.config.double_buffer,
        )
    }

    /// Present the frame just rendered into `window`
    pub fn present(&mut self, window: &mut Window<SurfaceOf<B>>) -> Result<()> {
        let (Some(handle), Some(pipe)) = (self.handle.as_mut(), self.pipe.as_ref()) else {
            return Err(not_initialized());
        };

        window.present(
            &handle.device,
            &mut handle.framebuffers,
            pipe,
            Some(self.config.flip_timeout()),
        )
    }

    pub fn destroy_window(&mut self, window: Window<SurfaceOf<B>>) -> Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(not_initialized());
        };

        window.destroy(&handle.device, &mut handle.framebuffers)
    }

    /// The rendering side destroyed a buffer it had presented
    pub fn buffer_destroyed(&mut self, buffer: BufferId) {
        if let Some(handle) = self.handle.as_mut() {
            handle.framebuffers.buffer_destroyed(&handle.device, buffer);
        }
    }
}

impl<B: Backend, H: SessionHooks> Drop for VideoDevice<B, H> {
    fn drop(&mut self) {
        self.quit();
    }
}

fn not_initialized() -> Error {
    Error::ProtocolViolation("video device is not initialized".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CrtcId, FramebufferId};
    use crate::pipe::PixelFormat;
    use crate::testing::{MockBackend, MockDevice, MockHardware};
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct RecordingHooks {
        calls: Rc<RefCell<Vec<&'static str>>>,
        fail_cursor: bool,
    }

    impl RecordingHooks {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.borrow().clone()
        }
    }

    impl SessionHooks for RecordingHooks {
        fn init_input(&mut self) -> Result<()> {
            self.calls.borrow_mut().push("init_input");
            Ok(())
        }

        fn quit_input(&mut self) {
            self.calls.borrow_mut().push("quit_input");
        }

        fn init_cursor(&mut self) -> Result<()> {
            self.calls.borrow_mut().push("init_cursor");
            if self.fail_cursor {
                return Err(Error::unavailable("no cursor plane"));
            }
            Ok(())
        }

        fn unload_renderer(&mut self) {
            self.calls.borrow_mut().push("unload_renderer");
        }
    }

    fn config(index: i64) -> KmsConfig {
        KmsConfig {
            dri_path: PathBuf::from("/dev/dri"),
            device_index: Some(index),
            ..KmsConfig::default()
        }
    }

    fn backend() -> (MockBackend, MockDevice) {
        let backend = MockBackend::new();
        let card = backend.add_node("/dev/dri/card0", MockHardware::single_pipe());
        (backend, card)
    }

    #[test]
    fn test_out_of_range_index_opens_nothing() {
        for index in [-1, 100, 1000, i64::MIN] {
            let (backend, _) = backend();
            let err = VideoDevice::create(backend.clone(), NoHooks, config(index)).err().unwrap();
            assert!(matches!(err, Error::InvalidDeviceIndex(i) if i == index));
            assert!(err.is_resource_unavailable());
            assert!(backend.opened().is_empty());
        }
    }

    #[test]
    fn test_explicit_index_is_not_probed() {
        let (backend, _) = backend();
        let video = VideoDevice::create(backend.clone(), NoHooks, config(7)).unwrap();
        assert_eq!(video.index(), 7);
        assert!(backend.opened().is_empty());
    }

    #[test]
    fn test_init_publishes_one_display_one_mode() {
        let (backend, card) = backend();
        let hooks = RecordingHooks::default();
        let mut video = VideoDevice::create(backend, hooks.clone(), config(0)).unwrap();
        video.init().unwrap();

        assert_eq!(video.displays().len(), 1);
        let modes = video.display_modes();
        assert_eq!(modes.len(), 1);
        assert_eq!(modes[0].format, PixelFormat::Argb8888);
        assert_eq!((modes[0].width, modes[0].height), (1920, 1080));
        assert_eq!(video.displays()[0].desktop_mode, modes[0]);
        assert_eq!(hooks.calls(), vec!["init_input", "init_cursor"]);
        // the saved CRTC is the only scoped resource still held
        assert_eq!(card.outstanding(), 1);

        assert!(video.set_display_mode(0, &modes[0]).is_ok());
        assert_eq!(video.display_modes(), modes);
    }

    #[test]
    fn test_init_twice_is_rejected() {
        let (backend, _) = backend();
        let mut video = VideoDevice::create(backend, NoHooks, config(0)).unwrap();
        video.init().unwrap();
        assert!(matches!(video.init(), Err(Error::ProtocolViolation(_))));
        assert!(video.is_initialized());
    }

    #[test]
    fn test_open_failure_is_resource_unavailable() {
        let (backend, _) = backend();
        let mut video = VideoDevice::create(backend, NoHooks, config(3)).unwrap();
        let err = video.init().unwrap_err();
        assert!(err.is_resource_unavailable());
        assert!(!video.is_initialized());
    }

    #[test]
    fn test_allocator_failure_leaves_nothing() {
        let (backend, card) = backend();
        backend.fail_allocator(true);
        let hooks = RecordingHooks::default();
        let mut video = VideoDevice::create(backend, hooks.clone(), config(0)).unwrap();

        assert!(matches!(video.init(), Err(Error::Allocation(_))));
        assert!(!video.is_initialized());
        assert!(video.displays().is_empty());
        assert_eq!(card.outstanding(), 0);
        assert!(hooks.calls().is_empty());
    }

    #[test]
    fn test_negotiation_failure_leaves_nothing() {
        let (backend, card) = backend();
        card.edit(|hw| hw.encoders.clear());
        let mut video = VideoDevice::create(backend, NoHooks, config(0)).unwrap();

        assert!(video.init().is_err());
        assert!(video.pipe().is_none());
        assert_eq!(card.outstanding(), 0);
        assert!(card.set_crtc_calls().is_empty());
    }

    #[test]
    fn test_cursor_failure_unwinds_everything() {
        let (backend, card) = backend();
        let hooks = RecordingHooks {
            fail_cursor: true,
            ..Default::default()
        };
        let mut video = VideoDevice::create(backend, hooks.clone(), config(0)).unwrap();

        assert!(video.init().is_err());
        assert!(!video.is_initialized());
        assert_eq!(card.outstanding(), 0);
        // restored on the way out
        assert_eq!(card.set_crtc_calls().len(), 1);
        assert_eq!(
            hooks.calls(),
            vec!["init_input", "init_cursor", "unload_renderer", "quit_input"]
        );
    }

    #[test]
    fn test_quit_restores_crtc_and_is_idempotent() {
        let (backend, card) = backend();
        let before = card.crtc_state(CrtcId(10)).unwrap();
        let hooks = RecordingHooks::default();
        let mut video = VideoDevice::create(backend, hooks.clone(), config(0)).unwrap();
        video.init().unwrap();

        let mut window = video.create_window().unwrap();
        for _ in 0..4 {
            video.present(&mut window).unwrap();
        }
        assert_ne!(card.crtc_state(CrtcId(10)).unwrap().framebuffer, Some(FramebufferId(42)));
        video.destroy_window(window).unwrap();

        video.quit();
        video.quit();

        assert_eq!(card.crtc_state(CrtcId(10)).unwrap(), before);
        assert_eq!(card.outstanding(), 0);
        assert_eq!(card.live_framebuffers(), 0);
        assert_eq!(
            hooks.calls(),
            vec!["init_input", "init_cursor", "unload_renderer", "quit_input"]
        );
    }

    #[test]
    fn test_quit_removes_framebuffers_of_live_windows() {
        let (backend, card) = backend();
        let mut video = VideoDevice::create(backend, NoHooks, config(0)).unwrap();
        video.init().unwrap();

        let mut window = video.create_window().unwrap();
        video.present(&mut window).unwrap();
        video.present(&mut window).unwrap();
        assert_eq!(card.live_framebuffers(), 2);

        video.quit();
        assert_eq!(card.live_framebuffers(), 0);
        assert!(matches!(
            video.present(&mut window),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_restore_failure_is_not_fatal() {
        let (backend, card) = backend();
        let mut video = VideoDevice::create(backend, NoHooks, config(0)).unwrap();
        video.init().unwrap();
        card.fail_set_crtc(true);

        video.quit();
        assert!(!video.is_initialized());
        assert_eq!(card.outstanding(), 0);
    }

    #[test]
    fn test_drop_runs_quit() {
        let (backend, card) = backend();
        {
            let mut video = VideoDevice::create(backend, NoHooks, config(0)).unwrap();
            video.init().unwrap();
        }
        assert_eq!(card.outstanding(), 0);
        assert_eq!(card.set_crtc_calls().len(), 1);
    }

    #[test]
    fn test_buffer_destroyed_notification() {
        let (backend, card) = backend();
        let mut video = VideoDevice::create(backend, NoHooks, config(0)).unwrap();
        video.init().unwrap();
        let mut window = video.create_window().unwrap();
        video.present(&mut window).unwrap();
        video.present(&mut window).unwrap();

        // second surface buffer (surface 1, slot 1)
        video.buffer_destroyed(BufferId(17));
        assert_eq!(card.live_framebuffers(), 1);
        assert_eq!(video.handle().unwrap().framebuffers().len(), 1);
    }

    #[test]
    fn test_window_needs_initialized_device() {
        let (backend, _) = backend();
        let video = VideoDevice::create(backend, NoHooks, config(0)).unwrap();
        assert!(matches!(video.create_window(), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_auto_select_and_available() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("card0")).unwrap();
        std::fs::File::create(dir.path().join("card1")).unwrap();
        let backend = MockBackend::new();
        backend.add_node(dir.path().join("card0"), MockHardware::empty());
        backend.add_node(dir.path().join("card1"), MockHardware::single_pipe());

        let config = KmsConfig {
            dri_path: dir.path().to_path_buf(),
            ..KmsConfig::default()
        };
        assert!(VideoDevice::<MockBackend, NoHooks>::available(&backend, &config));

        let mut video = VideoDevice::create(backend, NoHooks, config).unwrap();
        assert_eq!(video.index(), 1);
        video.init().unwrap();
        assert_eq!(video.pipe().unwrap().crtc(), CrtcId(10));
    }
}
