//! Scripted in-memory backend
//!
//! Stands in for `/dev/dri/cardN` and GBM in tests. Every device shares its
//! state with the clones handed out, so a test can keep a [`MockDevice`]
//! around and inspect what the pipe did to it after the device has been
//! moved into a `VideoDevice`.
//!
//! Outstanding scoped resources (resource sets, connectors, encoders, CRTCs)
//! are counted, so leaks on error paths show up as a non-zero
//! [`MockDevice::outstanding`].

use crate::alloc::{BufferAllocator, NativeWindow, ScanoutBuffer, ScanoutSurface, SurfaceFormat};
use crate::device::{
    Backend, BufferDesc, BufferId, ConnectionState, ConnectorId, ConnectorInfo, CrtcId, CrtcState,
    DeviceEvent, EncoderId, EncoderInfo, FramebufferId, KmsDevice, ModeInfo, PollOutcome,
    ResourceSet, SurfaceId,
};
use crate::scoped::Scoped;
use crate::{Error, Result};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

/// One scripted answer from [`KmsDevice::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockPoll {
    Readable,
    HangUp,
    TimedOut,
    /// poll(2) itself fails
    Fail,
}

/// A recorded SETCRTC call
#[derive(Debug, Clone, PartialEq)]
pub struct SetCrtcCall {
    pub crtc: CrtcId,
    pub framebuffer: Option<FramebufferId>,
    pub position: (u32, u32),
    pub connectors: Vec<ConnectorId>,
    pub mode: Option<ModeInfo>,
}

/// Mode-setting objects exposed by a mock card
#[derive(Debug, Clone)]
pub struct MockHardware {
    pub resources: ResourceSet,
    pub connectors: Vec<ConnectorInfo>,
    pub encoders: Vec<EncoderInfo>,
    pub crtcs: Vec<CrtcState>,
}

impl MockHardware {
    /// One connected 1920x1080 panel on connector 1, encoder 5, CRTC 10,
    /// currently scanning out framebuffer 42.
    pub fn single_pipe() -> Self {
        let mode = ModeInfo::new(1920, 1080, 60);
        Self {
            resources: ResourceSet {
                connectors: vec![ConnectorId(1)],
                encoders: vec![EncoderId(5)],
                crtcs: vec![CrtcId(10)],
            },
            connectors: vec![ConnectorInfo {
                id: ConnectorId(1),
                state: ConnectionState::Connected,
                modes: vec![mode.clone(), ModeInfo::new(1280, 720, 60)],
                current_encoder: Some(EncoderId(5)),
                encoders: vec![EncoderId(5)],
            }],
            encoders: vec![EncoderInfo {
                id: EncoderId(5),
                crtc: Some(CrtcId(10)),
                possible_crtcs: 0b1,
            }],
            crtcs: vec![CrtcState {
                id: CrtcId(10),
                framebuffer: Some(FramebufferId(42)),
                position: (0, 0),
                size: (1920, 1080),
                mode: Some(mode),
            }],
        }
    }

    /// A card that opens but exposes no mode-setting objects
    pub fn empty() -> Self {
        Self {
            resources: ResourceSet::default(),
            connectors: Vec::new(),
            encoders: Vec::new(),
            crtcs: Vec::new(),
        }
    }
}

#[derive(Default)]
struct DeviceState {
    hardware: Option<MockHardware>,
    next_fb: u32,
    framebuffers: HashMap<FramebufferId, BufferDesc>,
    framebuffers_created: usize,
    framebuffers_removed: usize,
    set_crtc_calls: Vec<SetCrtcCall>,
    flips: Vec<(CrtcId, FramebufferId)>,
    poll_script: VecDeque<MockPoll>,
    polls: usize,
    events: VecDeque<DeviceEvent>,
    frame: u32,
    fail_resources: bool,
    fail_add_framebuffer: bool,
    fail_set_crtc: bool,
    fail_page_flip: bool,
    hold_flip_events: bool,
}

/// A mock DRM card
#[derive(Clone)]
pub struct MockDevice {
    path: PathBuf,
    state: Rc<RefCell<DeviceState>>,
    live: Rc<Cell<usize>>,
}

impl MockDevice {
    pub fn new(path: impl Into<PathBuf>, hardware: MockHardware) -> Self {
        Self {
            path: path.into(),
            state: Rc::new(RefCell::new(DeviceState {
                hardware: Some(hardware),
                next_fb: 100,
                ..Default::default()
            })),
            live: Rc::new(Cell::new(0)),
        }
    }

    fn scoped<T>(&self, value: T) -> Scoped<T> {
        self.live.set(self.live.get() + 1);
        let live = Rc::clone(&self.live);
        Scoped::with_release(value, move || live.set(live.get() - 1))
    }

    fn with_hardware<T>(&self, f: impl FnOnce(&mut MockHardware) -> T) -> T {
        let mut state = self.state.borrow_mut();
        let hardware = state.hardware.get_or_insert_with(MockHardware::empty);
        f(hardware)
    }

    /// Edit the exposed mode-setting objects in place
    pub fn edit(&self, f: impl FnOnce(&mut MockHardware)) {
        self.with_hardware(f)
    }

    /// Scoped resources handed out and not yet dropped
    pub fn outstanding(&self) -> usize {
        self.live.get()
    }

    pub fn framebuffers_created(&self) -> usize {
        self.state.borrow().framebuffers_created
    }

    pub fn framebuffers_removed(&self) -> usize {
        self.state.borrow().framebuffers_removed
    }

    /// Framebuffers currently registered with the device
    pub fn live_framebuffers(&self) -> usize {
        self.state.borrow().framebuffers.len()
    }

    pub fn set_crtc_calls(&self) -> Vec<SetCrtcCall> {
        self.state.borrow().set_crtc_calls.clone()
    }

    pub fn flips(&self) -> Vec<(CrtcId, FramebufferId)> {
        self.state.borrow().flips.clone()
    }

    pub fn polls(&self) -> usize {
        self.state.borrow().polls
    }

    /// Current hardware state of a CRTC
    pub fn crtc_state(&self, id: CrtcId) -> Option<CrtcState> {
        self.with_hardware(|hw| hw.crtcs.iter().find(|c| c.id == id).cloned())
    }

    /// Queue answers for the next polls. With an empty script, poll reports
    /// readable when events are queued and a timeout otherwise.
    pub fn script_polls(&self, polls: impl IntoIterator<Item = MockPoll>) {
        self.state.borrow_mut().poll_script.extend(polls);
    }

    /// Queue a raw event for the next dispatch
    pub fn push_event(&self, event: DeviceEvent) {
        self.state.borrow_mut().events.push_back(event);
    }

    /// Keep page flips from producing completion events (a stuck vblank)
    pub fn hold_flip_events(&self, hold: bool) {
        self.state.borrow_mut().hold_flip_events = hold;
    }

    pub fn fail_resources(&self, fail: bool) {
        self.state.borrow_mut().fail_resources = fail;
    }

    pub fn fail_add_framebuffer(&self, fail: bool) {
        self.state.borrow_mut().fail_add_framebuffer = fail;
    }

    pub fn fail_set_crtc(&self, fail: bool) {
        self.state.borrow_mut().fail_set_crtc = fail;
    }

    pub fn fail_page_flip(&self, fail: bool) {
        self.state.borrow_mut().fail_page_flip = fail;
    }
}

impl KmsDevice for MockDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn resources(&self) -> Result<Scoped<ResourceSet>> {
        if self.state.borrow().fail_resources {
            return Err(Error::unavailable("drmModeGetResources failed"));
        }
        let resources = self.with_hardware(|hw| hw.resources.clone());
        Ok(self.scoped(resources))
    }

    fn connector(&self, id: ConnectorId) -> Result<Scoped<ConnectorInfo>> {
        let info = self.with_hardware(|hw| hw.connectors.iter().find(|c| c.id == id).cloned());
        info.map(|info| self.scoped(info))
            .ok_or_else(|| Error::unavailable(format!("connector {}", id)))
    }

    fn encoder(&self, id: EncoderId) -> Result<Scoped<EncoderInfo>> {
        let info = self.with_hardware(|hw| hw.encoders.iter().find(|e| e.id == id).cloned());
        info.map(|info| self.scoped(info))
            .ok_or_else(|| Error::unavailable(format!("encoder {}", id)))
    }

    fn crtc(&self, id: CrtcId) -> Result<Scoped<CrtcState>> {
        self.crtc_state(id)
            .map(|state| self.scoped(state))
            .ok_or_else(|| Error::unavailable(format!("CRTC {}", id)))
    }

    fn set_crtc(
        &self,
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        position: (u32, u32),
        connectors: &[ConnectorId],
        mode: Option<&ModeInfo>,
    ) -> Result<()> {
        self.state.borrow_mut().set_crtc_calls.push(SetCrtcCall {
            crtc,
            framebuffer,
            position,
            connectors: connectors.to_vec(),
            mode: mode.cloned(),
        });

        if self.state.borrow().fail_set_crtc {
            return Err(Error::ModeSetting(format!("SETCRTC on {} rejected", crtc)));
        }

        self.with_hardware(|hw| match hw.crtcs.iter_mut().find(|c| c.id == crtc) {
            Some(state) => {
                state.framebuffer = framebuffer;
                state.position = position;
                state.size = mode
                    .map(|m| (u32::from(m.width), u32::from(m.height)))
                    .unwrap_or((0, 0));
                state.mode = mode.cloned();
                Ok(())
            }
            None => Err(Error::unavailable(format!("CRTC {}", crtc))),
        })
    }

    fn add_framebuffer(&self, buffer: &BufferDesc, depth: u32, bpp: u32) -> Result<FramebufferId> {
        let mut state = self.state.borrow_mut();
        if state.fail_add_framebuffer || depth != 24 || bpp != 32 {
            return Err(Error::unavailable("drmModeAddFB failed"));
        }
        let fb = FramebufferId(state.next_fb);
        state.next_fb += 1;
        state.framebuffers.insert(fb, *buffer);
        state.framebuffers_created += 1;
        Ok(fb)
    }

    fn remove_framebuffer(&self, fb: FramebufferId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match state.framebuffers.remove(&fb) {
            Some(_) => {
                state.framebuffers_removed += 1;
                Ok(())
            }
            None => Err(Error::unavailable(format!("framebuffer {}", fb))),
        }
    }

    fn page_flip(&self, crtc: CrtcId, fb: FramebufferId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_page_flip {
            return Err(Error::ModeSetting(format!("page flip on {} rejected", crtc)));
        }
        if !state.framebuffers.contains_key(&fb) {
            return Err(Error::ModeSetting(format!("framebuffer {} not found", fb)));
        }
        state.flips.push((crtc, fb));
        if !state.hold_flip_events {
            state.frame += 1;
            let frame = state.frame;
            state.events.push_back(DeviceEvent::PageFlip { crtc, frame });
        }
        Ok(())
    }

    fn poll(&self, _timeout: Option<Duration>) -> Result<PollOutcome> {
        let mut state = self.state.borrow_mut();
        state.polls += 1;
        let outcome = match state.poll_script.pop_front() {
            Some(MockPoll::Readable) => PollOutcome::Readable,
            Some(MockPoll::HangUp) => PollOutcome::HangUp,
            Some(MockPoll::TimedOut) => PollOutcome::TimedOut,
            Some(MockPoll::Fail) => {
                return Err(std::io::Error::from(std::io::ErrorKind::Interrupted).into())
            }
            None if !state.events.is_empty() => PollOutcome::Readable,
            None => PollOutcome::TimedOut,
        };
        Ok(outcome)
    }

    fn dispatch_events(&self) -> Result<Vec<DeviceEvent>> {
        Ok(self.state.borrow_mut().events.drain(..).collect())
    }
}

#[derive(Default)]
struct AllocatorState {
    surfaces_created: usize,
    unsupported: bool,
    fail_surface: bool,
    next_surface: u64,
}

/// Mock GBM device
#[derive(Clone, Default)]
pub struct MockAllocator {
    state: Rc<RefCell<AllocatorState>>,
}

impl MockAllocator {
    pub fn surfaces_created(&self) -> usize {
        self.state.borrow().surfaces_created
    }

    pub fn set_format_unsupported(&self, unsupported: bool) {
        self.state.borrow_mut().unsupported = unsupported;
    }

    pub fn fail_surface(&self, fail: bool) {
        self.state.borrow_mut().fail_surface = fail;
    }
}

impl BufferAllocator for MockAllocator {
    type Surface = MockSurface;

    fn is_format_supported(&self, _format: SurfaceFormat, _usage: u32) -> bool {
        !self.state.borrow().unsupported
    }

    fn create_surface(
        &self,
        width: u32,
        height: u32,
        _format: SurfaceFormat,
        _usage: u32,
    ) -> Result<MockSurface> {
        let mut state = self.state.borrow_mut();
        if state.fail_surface {
            return Err(Error::unavailable("couldn't create gbm surface"));
        }
        state.surfaces_created += 1;
        state.next_surface += 1;
        Ok(MockSurface {
            id: SurfaceId(state.next_surface),
            width,
            height,
            locked: [false; SURFACE_BUFFERS],
            next: 0,
            released: Rc::new(Cell::new(0)),
        })
    }
}

const SURFACE_BUFFERS: usize = 3;

/// Triple-buffered mock surface
pub struct MockSurface {
    id: SurfaceId,
    width: u32,
    height: u32,
    locked: [bool; SURFACE_BUFFERS],
    next: usize,
    released: Rc<Cell<usize>>,
}

impl MockSurface {
    pub const BUFFERS: usize = SURFACE_BUFFERS;

    /// Buffers handed back through `release_buffer` so far
    pub fn released(&self) -> usize {
        self.released.get()
    }

    /// Buffers currently locked as front buffers
    pub fn locked(&self) -> usize {
        self.locked.iter().filter(|l| **l).count()
    }

    fn buffer_id(&self, slot: usize) -> BufferId {
        BufferId(self.id.0 * 16 + slot as u64)
    }
}

impl ScanoutSurface for MockSurface {
    type Buffer = MockBuffer;

    fn id(&self) -> SurfaceId {
        self.id
    }

    fn native_window(&self) -> NativeWindow {
        NativeWindow(self.id.0 as usize as *mut std::os::raw::c_void)
    }

    fn lock_front_buffer(&mut self) -> Result<MockBuffer> {
        let slot = self.next;
        if self.locked[slot] {
            return Err(Error::unavailable("no free buffers on surface"));
        }
        self.locked[slot] = true;
        self.next = (self.next + 1) % Self::BUFFERS;
        Ok(MockBuffer {
            id: self.buffer_id(slot),
            slot,
            desc: BufferDesc {
                width: self.width,
                height: self.height,
                stride: self.width * 4,
                handle: slot as u32 + 1,
            },
        })
    }

    fn release_buffer(&mut self, buffer: MockBuffer) {
        self.locked[buffer.slot] = false;
        self.released.set(self.released.get() + 1);
    }
}

/// A locked mock front buffer
#[derive(Debug)]
pub struct MockBuffer {
    id: BufferId,
    slot: usize,
    desc: BufferDesc,
}

impl MockBuffer {
    /// A free-standing buffer, not locked from any surface
    pub fn standalone(id: u64, width: u32, height: u32) -> Self {
        Self {
            id: BufferId(id),
            slot: 0,
            desc: BufferDesc {
                width,
                height,
                stride: width * 4,
                handle: id as u32,
            },
        }
    }
}

impl ScanoutBuffer for MockBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn desc(&self) -> BufferDesc {
        self.desc
    }
}

/// Mock backend: a set of card nodes by path
#[derive(Clone, Default)]
pub struct MockBackend {
    devices: Rc<RefCell<HashMap<PathBuf, MockDevice>>>,
    opened: Rc<RefCell<Vec<PathBuf>>>,
    allocator: MockAllocator,
    fail_allocator: Rc<Cell<bool>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a card node and get a handle sharing its state
    pub fn add_node(&self, path: impl Into<PathBuf>, hardware: MockHardware) -> MockDevice {
        let path = path.into();
        let device = MockDevice::new(path.clone(), hardware);
        self.devices.borrow_mut().insert(path, device.clone());
        device
    }

    /// Every path `open` was called with, in order
    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened.borrow().clone()
    }

    pub fn allocator(&self) -> MockAllocator {
        self.allocator.clone()
    }

    pub fn fail_allocator(&self, fail: bool) {
        self.fail_allocator.set(fail);
    }
}

impl Backend for MockBackend {
    type Device = MockDevice;
    type Allocator = MockAllocator;

    fn open(&self, path: &Path) -> Result<MockDevice> {
        self.opened.borrow_mut().push(path.to_path_buf());
        self.devices
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound).into())
    }

    fn create_allocator(&self, _device: &MockDevice) -> Result<MockAllocator> {
        if self.fail_allocator.get() {
            return Err(Error::Allocation("couldn't create gbm device".into()));
        }
        Ok(self.allocator.clone())
    }
}
