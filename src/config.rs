//! Runtime configuration
//!
//! Read from `~/.config/kmsdrm/config.toml`, then overridden from the
//! environment. Everything has a default, so a missing file is fine.

use crate::alloc::SurfaceFormat;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Highest device index that can be selected explicitly
pub const MAX_DEVICE_INDEX: i64 = 99;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    /// Directory holding the DRM device nodes
    pub dri_path: PathBuf,
    /// Node name prefix; nodes are `<prefix><index>`
    pub node_prefix: String,
    /// Explicit device index, `None` to pick the first usable node
    pub device_index: Option<i64>,
    /// Wait for every flip right after queueing it
    pub double_buffer: bool,
    /// How long a present may wait for the previous flip (0 = just poll)
    pub flip_timeout_ms: u64,
    pub surface_format: SurfaceFormat,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            dri_path: PathBuf::from("/dev/dri"),
            node_prefix: "card".to_string(),
            device_index: None,
            double_buffer: false,
            flip_timeout_ms: 0,
            surface_format: SurfaceFormat::Xrgb8888,
        }
    }
}

impl KmsConfig {
    /// Load the config file and apply environment overrides.
    pub fn load() -> Self {
        let path = Self::config_path();
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), "ignoring config file: {}", e);
                Self::default()
            }),
            Err(_) => {
                debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply `KMSDRM_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(index) = lookup("KMSDRM_DEVICE_INDEX") {
            match index.trim().parse::<i64>() {
                Ok(index) => self.device_index = Some(index),
                Err(_) => warn!("KMSDRM_DEVICE_INDEX={:?} is not a number", index),
            }
        }

        if let Some(value) = lookup("KMSDRM_DOUBLE_BUFFER") {
            match parse_bool(&value) {
                Some(double_buffer) => self.double_buffer = double_buffer,
                None => warn!("KMSDRM_DOUBLE_BUFFER={:?} is not a boolean", value),
            }
        }

        if let Some(path) = lookup("KMSDRM_DRI_PATH") {
            if !path.is_empty() {
                self.dri_path = PathBuf::from(path);
            }
        }
    }

    /// Timeout for the flip wait at the start of a present
    pub fn flip_timeout(&self) -> Duration {
        Duration::from_millis(self.flip_timeout_ms)
    }

    /// Path of device node `index`
    pub fn node_path(&self, index: u32) -> PathBuf {
        self.dri_path.join(format!("{}{}", self.node_prefix, index))
    }

    fn config_path() -> PathBuf {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
            .unwrap_or_else(|| PathBuf::from("/etc"));
        base.join("kmsdrm").join("config.toml")
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
