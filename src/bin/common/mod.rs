//! Logging and config setup shared by the command-line tools

use kmsdrm_pipe::KmsConfig;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Overrides the tools accept on the command line
#[derive(clap::Args, Debug)]
pub struct DeviceArgs {
    /// Device index (cardN); probes for one when omitted
    #[arg(short = 'i', long)]
    pub device: Option<i64>,

    /// DRI directory holding the card nodes
    #[arg(long)]
    pub dri_path: Option<PathBuf>,

    /// Wait for each page flip right after queueing it
    #[arg(long)]
    pub double_buffer: bool,

    /// Enable verbose debug output
    #[arg(short, long)]
    pub debug: bool,
}

impl DeviceArgs {
    pub fn config(&self) -> KmsConfig {
        let mut config = KmsConfig::load();
        if self.device.is_some() {
            config.device_index = self.device;
        }
        if let Some(path) = &self.dri_path {
            config.dri_path = path.clone();
        }
        if self.double_buffer {
            config.double_buffer = true;
        }
        config
    }
}

fn state_dir() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".local/state")))
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("kmsdrm")
}

/// Install the panic hook and the stderr + rolling file subscriber.
///
/// Keep the returned guard alive for the life of the program, or buffered
/// file output is lost.
pub fn init_logging(tool: &str, debug: bool) -> WorkerGuard {
    let log_dir = state_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let crash_log = log_dir.join("crash.log");
    std::panic::set_hook(Box::new(move |panic_info| {
        eprintln!("PANIC: {}", panic_info);
        if let Ok(mut f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&crash_log)
        {
            use std::io::Write;
            let _ = writeln!(f, "[{}] PANIC: {}", chrono::Local::now(), panic_info);
        }
    }));

    let file_appender = rolling::daily(&log_dir, format!("{}.log", tool));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = if debug {
        "debug"
    } else {
        "warn,kmsdrm_pipe=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    tracing::debug!(log_path = %log_dir.display(), tool, "logging initialized");
    guard
}
