//! KMS/DRM display pipe
//!
//! Drives a direct-rendering display output without a windowing system:
//! finds a mode-setting capable `/dev/dri/cardN` node, claims one
//! connector -> encoder -> CRTC pipe, wraps rendered GBM front buffers in
//! hardware framebuffers and flips them on vblank so a frame is never shown
//! half-written.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │           Rendering layer (EGL/GLES, not in this crate)     │
//! │        draws into Window::native_window(), then presents    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     kmsdrm-pipe                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐ │
//! │  │ VideoDevice │  │   Window    │  │ FramebufferCache    │ │
//! │  │ (lifecycle) │  │ (present)   │  │ (buffer -> fb)      │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘ │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐ │
//! │  │ enumerate   │  │ negotiate   │  │ FlipState           │ │
//! │  │ (cardN)     │  │ (pipe)      │  │ (vblank wait)       │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                 KmsDevice / BufferAllocator seam
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │          DrmCard + GbmContext (drm-rs, gbm-rs)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Kernel DRM/KMS driver                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use kmsdrm_pipe::{DrmBackend, KmsConfig, NoHooks, VideoDevice};
//!
//! let mut video = VideoDevice::create(DrmBackend, NoHooks, KmsConfig::load())?;
//! video.init()?;
//!
//! let mut window = video.create_window()?;
//! // hand window.native_window() to EGL, render, swap...
//! video.present(&mut window)?;
//!
//! video.destroy_window(window)?;
//! video.quit();
//! ```

pub mod alloc;
pub mod config;
pub mod device;
pub mod drm_device;
pub mod enumerate;
pub mod error;
pub mod flip;
pub mod framebuffer;
pub mod gbm_device;
pub mod pipe;
pub mod scoped;
#[cfg(any(test, feature = "mock"))]
pub mod testing;
pub mod video;
pub mod window;

pub use config::KmsConfig;
pub use drm_device::DrmBackend;
pub use error::Error;
pub use pipe::{DisplayMode, DisplayPipe, PixelFormat, VideoDisplay};
pub use video::{NoHooks, SessionHooks, VideoDevice};
pub use window::Window;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
