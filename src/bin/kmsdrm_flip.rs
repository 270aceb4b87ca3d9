//! Page-flip exerciser
//!
//! Claims the display, creates a fullscreen window and runs a number of
//! present cycles, counting dropped frames. No renderer is attached, so each
//! cycle scans out whatever the surface's front buffer holds.

mod common;

use anyhow::{Context, Result};
use clap::Parser;
use common::DeviceArgs;
use kmsdrm_pipe::{DrmBackend, Error, NoHooks, VideoDevice};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kmsdrm-flip")]
#[command(about = "Flip frames on the claimed display and report drops", long_about = None)]
struct Args {
    #[command(flatten)]
    device: DeviceArgs,

    /// Number of present cycles
    #[arg(short, long, default_value_t = 120)]
    frames: u32,

    /// Flip wait timeout in milliseconds (overrides the config)
    #[arg(short, long)]
    timeout_ms: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = common::init_logging("kmsdrm-flip", args.device.debug);

    let mut config = args.device.config();
    if let Some(timeout) = args.timeout_ms {
        config.flip_timeout_ms = timeout;
    }

    let mut video = VideoDevice::create(DrmBackend, NoHooks, config)
        .context("no usable DRM device")?;
    video.init().context("failed to initialize video device")?;

    let mut window = video.create_window().context("failed to create window")?;
    let (width, height) = window.size();
    info!(width, height, frames = args.frames, "starting flip loop");

    let start = Instant::now();
    let mut dropped = 0u32;
    for _ in 0..args.frames {
        match video.present(&mut window) {
            Ok(()) => {}
            Err(Error::FrameDropped) => dropped += 1,
            Err(e) => {
                warn!("present failed: {}", e);
                break;
            }
        }
    }
    let elapsed = start.elapsed();

    let shown = window.frames();
    video.destroy_window(window).context("failed to destroy window")?;
    video.quit();

    println!(
        "{} frames shown, {} dropped in {:.2?} ({:.1} fps)",
        shown,
        dropped,
        elapsed,
        shown as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}
