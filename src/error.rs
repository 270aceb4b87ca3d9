//! Error types for the KMS/DRM display pipe

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A required hardware resource (device, resource set, connector,
    /// encoder, CRTC, framebuffer, surface) could not be obtained.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("no mode-setting capable device found under {}", dir.display())]
    NoDevice { dir: PathBuf },

    #[error("device index ({0}) must be between 0 and 99")]
    InvalidDeviceIndex(i64),

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DRM device hung up or reported an error")]
    DeviceHangup,

    #[error("frame dropped while waiting for page flip")]
    FrameDropped,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("mode setting failed: {0}")]
    ModeSetting(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for every error that means "the hardware resource is not there",
    /// including bad device selection.
    pub fn is_resource_unavailable(&self) -> bool {
        matches!(
            self,
            Error::ResourceUnavailable(_) | Error::NoDevice { .. } | Error::InvalidDeviceIndex(_)
        )
    }

    pub(crate) fn unavailable(what: impl Into<String>) -> Self {
        Error::ResourceUnavailable(what.into())
    }
}
