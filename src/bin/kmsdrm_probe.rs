//! Probe the DRM nodes and show which display pipe would be claimed
//!
//! Initializes the selected device, prints the connector/encoder/CRTC chain,
//! the saved CRTC state and the published mode, then quits (restoring the
//! CRTC).

mod common;

use anyhow::{Context, Result};
use clap::Parser;
use common::DeviceArgs;
use kmsdrm_pipe::enumerate::{candidates, check_modesetting};
use kmsdrm_pipe::{DrmBackend, NoHooks, VideoDevice};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kmsdrm-probe")]
#[command(about = "List DRM nodes and the display pipe they offer", long_about = None)]
struct Args {
    #[command(flatten)]
    device: DeviceArgs,

    /// Only list the candidate nodes, don't claim a pipe
    #[arg(short, long)]
    list: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = common::init_logging("kmsdrm-probe", args.device.debug);
    let config = args.device.config();

    let indices = candidates(&config.dri_path, &config.node_prefix)
        .with_context(|| format!("listing {}", config.dri_path.display()))?;

    println!("Nodes under {}:", config.dri_path.display());
    for index in &indices {
        let path = config.node_path(*index);
        let usable = check_modesetting(&DrmBackend, &path);
        println!(
            "  {}  {}",
            path.display(),
            if usable { "mode-setting" } else { "no mode-setting" }
        );
    }

    if args.list {
        return Ok(());
    }

    let mut video = VideoDevice::create(DrmBackend, NoHooks, config)
        .context("no usable DRM device")?;
    video.init().context("failed to initialize video device")?;

    if let Some(pipe) = video.pipe() {
        let saved = pipe.saved_crtc();
        println!("\nDevice: {}", video.config().node_path(video.index()).display());
        println!("  connector {}", pipe.connector());
        println!("  encoder   {}", pipe.encoder());
        println!("  crtc      {}", pipe.crtc());
        println!(
            "  saved     fb {} at ({}, {}) {}x{} mode {}",
            saved.framebuffer.map(|fb| fb.0).unwrap_or(0),
            saved.position.0,
            saved.position.1,
            saved.size.0,
            saved.size.1,
            saved.mode.as_ref().map(|m| m.name.as_str()).unwrap_or("invalid"),
        );
    }

    for display in video.displays() {
        let mode = display.current_mode;
        println!(
            "  display   {} {}x{}@{} {:?}",
            display.name, mode.width, mode.height, mode.refresh_rate, mode.format
        );
    }

    video.quit();
    info!("probe finished");
    Ok(())
}
