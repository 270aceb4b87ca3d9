//! DRM device enumeration
//!
//! Lists `<prefix><N>` nodes under the DRI directory and picks the first
//! one that exposes at least one connector, encoder and CRTC. Each probe
//! opens and closes the node; nothing is kept open.

use crate::device::{Backend, KmsDevice};
use crate::{Error, Result};
use std::path::Path;
use tracing::{debug, info, warn};

/// Indices of all `<prefix><digits>` entries under `dri_path`, ascending
pub fn candidates(dri_path: &Path, prefix: &str) -> Result<Vec<u32>> {
    let entries = std::fs::read_dir(dri_path)?;

    let mut indices: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let digits = name.to_str()?.strip_prefix(prefix)?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()
        })
        .collect();

    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}

/// Whether the node at `path` opens and can drive a display
pub fn check_modesetting<B: Backend>(backend: &B, path: &Path) -> bool {
    let device = match backend.open(path) {
        Ok(device) => device,
        Err(e) => {
            debug!(path = %path.display(), "cannot open: {}", e);
            return false;
        }
    };

    match device.resources() {
        Ok(resources) => {
            let usable = resources.supports_modesetting();
            debug!(
                path = %path.display(),
                connectors = resources.connectors.len(),
                encoders = resources.encoders.len(),
                crtcs = resources.crtcs.len(),
                usable,
                "probed DRM node"
            );
            usable
        }
        Err(e) => {
            debug!(path = %path.display(), "no mode-setting resources: {}", e);
            false
        }
    }
}

/// Index of the first usable node under `dri_path`
pub fn probe<B: Backend>(backend: &B, dri_path: &Path, prefix: &str) -> Result<u32> {
    if !dri_path.is_dir() {
        warn!(path = %dri_path.display(), "DRI directory missing");
        return Err(Error::NoDevice {
            dir: dri_path.to_path_buf(),
        });
    }

    for index in candidates(dri_path, prefix)? {
        let path = dri_path.join(format!("{}{}", prefix, index));
        if check_modesetting(backend, &path) {
            info!(index, path = %path.display(), "selected DRM device");
            return Ok(index);
        }
    }

    warn!(path = %dri_path.display(), "no mode-setting capable DRM device");
    Err(Error::NoDevice {
        dir: dri_path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, MockHardware};
    use std::fs::File;

    fn dri_dir(nodes: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for node in nodes {
            File::create(dir.path().join(node)).unwrap();
        }
        dir
    }

    #[test]
    fn test_candidates_sorted_and_filtered() {
        let dir = dri_dir(&["card10", "card2", "renderD128", "card", "cardX", "card0", "by-path"]);
        assert_eq!(candidates(dir.path(), "card").unwrap(), vec![0, 2, 10]);
    }

    #[test]
    fn test_probe_skips_node_without_resources() {
        let dir = dri_dir(&["card0", "card1"]);
        let backend = MockBackend::new();
        let card0 = backend.add_node(dir.path().join("card0"), MockHardware::empty());
        let card1 = backend.add_node(dir.path().join("card1"), MockHardware::single_pipe());

        assert_eq!(probe(&backend, dir.path(), "card").unwrap(), 1);
        assert_eq!(
            backend.opened(),
            vec![dir.path().join("card0"), dir.path().join("card1")]
        );
        assert_eq!(card0.outstanding(), 0);
        assert_eq!(card1.outstanding(), 0);
    }

    #[test]
    fn test_probe_skips_node_whose_resources_fail() {
        let dir = dri_dir(&["card0", "card1"]);
        let backend = MockBackend::new();
        let card0 = backend.add_node(dir.path().join("card0"), MockHardware::single_pipe());
        card0.fail_resources(true);
        backend.add_node(dir.path().join("card1"), MockHardware::single_pipe());

        assert!(!check_modesetting(&backend, &dir.path().join("card0")));
        assert_eq!(probe(&backend, dir.path(), "card").unwrap(), 1);
        assert_eq!(card0.outstanding(), 0);
    }

    #[test]
    fn test_probe_rejects_partial_resource_set() {
        let dir = dri_dir(&["card0"]);
        let backend = MockBackend::new();
        let mut hardware = MockHardware::single_pipe();
        hardware.resources.encoders.clear();
        backend.add_node(dir.path().join("card0"), hardware);

        assert!(matches!(
            probe(&backend, dir.path(), "card"),
            Err(Error::NoDevice { .. })
        ));
    }

    #[test]
    fn test_probe_skips_unopenable_node() {
        // card0 exists on disk but the backend refuses to open it
        let dir = dri_dir(&["card0", "card3"]);
        let backend = MockBackend::new();
        backend.add_node(dir.path().join("card3"), MockHardware::single_pipe());

        assert_eq!(probe(&backend, dir.path(), "card").unwrap(), 3);
    }

    #[test]
    fn test_probe_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("dri");
        let err = probe(&MockBackend::new(), &missing, "card").unwrap_err();
        assert!(matches!(err, Error::NoDevice { dir } if dir == missing));
    }
}
