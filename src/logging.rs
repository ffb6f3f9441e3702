use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

static INSTALLED: OnceLock<PathBuf> = OnceLock::new();

/// Install the global subscriber: human-readable lines on stdout plus a plain
/// copy in `path`. Later calls are no-ops.
pub fn init_log_file(path: &Path) -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    let file = open_truncated(path)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if tracing::subscriber::set_global_default(subscriber(filter, file, true)).is_ok() {
        let _ = INSTALLED.set(path.to_path_buf());
    }
    Ok(())
}

fn open_truncated(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    // One log per run.
    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

fn subscriber(
    filter: EnvFilter,
    file: File,
    mirror_to_stdout: bool,
) -> impl tracing::Subscriber + Send + Sync {
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file));
    let stdout_layer = mirror_to_stdout.then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stdout)
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
}
