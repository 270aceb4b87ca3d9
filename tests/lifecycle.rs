//! End-to-end session against the scripted backend

use kmsdrm_pipe::device::{CrtcId, DeviceEvent};
use kmsdrm_pipe::flip::FlipState;
use kmsdrm_pipe::testing::{MockBackend, MockHardware, MockPoll};
use kmsdrm_pipe::{Error, KmsConfig, NoHooks, PixelFormat, VideoDevice};
use std::fs::File;
use std::path::Path;

fn dri_dir(nodes: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for node in nodes {
        File::create(dir.path().join(node)).unwrap();
    }
    dir
}

fn config(dri: &Path) -> KmsConfig {
    KmsConfig {
        dri_path: dri.to_path_buf(),
        flip_timeout_ms: 16,
        ..KmsConfig::default()
    }
}

#[test]
fn test_full_session_restores_display() {
    let dir = dri_dir(&["card0", "card1", "renderD128"]);
    let backend = MockBackend::new();
    backend.add_node(dir.path().join("card0"), MockHardware::empty());
    let card1 = backend.add_node(dir.path().join("card1"), MockHardware::single_pipe());
    let before = card1.crtc_state(CrtcId(10)).unwrap();

    let mut video = VideoDevice::create(backend.clone(), NoHooks, config(dir.path())).unwrap();
    assert_eq!(video.index(), 1);
    video.init().unwrap();

    let modes = video.display_modes();
    assert_eq!(modes.len(), 1);
    assert_eq!(modes[0].format, PixelFormat::Argb8888);

    let mut window = video.create_window().unwrap();
    assert_eq!(window.size(), (modes[0].width, modes[0].height));

    for _ in 0..30 {
        video.present(&mut window).unwrap();
    }
    assert_eq!(window.frames(), 30);
    assert_eq!(card1.set_crtc_calls().len(), 1);
    assert_eq!(card1.flips().len(), 29);
    assert_eq!(card1.framebuffers_created(), 3);

    video.destroy_window(window).unwrap();
    video.quit();

    assert_eq!(card1.crtc_state(CrtcId(10)).unwrap(), before);
    assert_eq!(card1.outstanding(), 0);
    assert_eq!(card1.live_framebuffers(), 0);
}

#[test]
fn test_stuck_vblank_drops_frames_until_flip_lands() {
    let dir = dri_dir(&["card0"]);
    let backend = MockBackend::new();
    let card = backend.add_node(dir.path().join("card0"), MockHardware::single_pipe());

    let mut video = VideoDevice::create(backend, NoHooks, config(dir.path())).unwrap();
    video.init().unwrap();
    let mut window = video.create_window().unwrap();

    video.present(&mut window).unwrap();
    card.hold_flip_events(true);
    video.present(&mut window).unwrap();
    let queued = card.flips();
    assert_eq!(queued.len(), 1);

    card.script_polls([MockPoll::TimedOut, MockPoll::TimedOut]);
    for _ in 0..2 {
        assert!(matches!(video.present(&mut window), Err(Error::FrameDropped)));
        assert!(window.flip_state().is_pending());
    }
    // no second flip was queued behind the stuck one
    assert_eq!(card.flips(), queued);

    card.hold_flip_events(false);
    card.push_event(DeviceEvent::PageFlip {
        crtc: CrtcId(10),
        frame: 1,
    });
    video.present(&mut window).unwrap();
    assert_eq!(card.flips().len(), 2);

    video.destroy_window(window).unwrap();
    assert_eq!(card.live_framebuffers(), 0);
}

#[test]
fn test_double_buffer_keeps_one_flip_at_most() {
    let dir = dri_dir(&["card0"]);
    let backend = MockBackend::new();
    let card = backend.add_node(dir.path().join("card0"), MockHardware::single_pipe());

    let mut cfg = config(dir.path());
    cfg.double_buffer = true;
    let mut video = VideoDevice::create(backend, NoHooks, cfg).unwrap();
    video.init().unwrap();
    let mut window = video.create_window().unwrap();
    assert!(window.double_buffer());

    for _ in 0..5 {
        video.present(&mut window).unwrap();
        assert_eq!(window.flip_state(), FlipState::Idle);
    }
    assert_eq!(card.flips().len(), 4);
}

#[test]
fn test_no_usable_device() {
    let dir = dri_dir(&["card0"]);
    let backend = MockBackend::new();
    backend.add_node(dir.path().join("card0"), MockHardware::empty());

    assert!(!VideoDevice::<MockBackend, NoHooks>::available(&backend, &config(dir.path())));
    let err = VideoDevice::create(backend, NoHooks, config(dir.path())).err().unwrap();
    assert!(matches!(err, Error::NoDevice { .. }));
    assert!(err.is_resource_unavailable());
}
