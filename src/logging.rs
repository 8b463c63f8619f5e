//! tracing subscriber setup shared by both binaries

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn default_directives(debug: bool) -> &'static str {
    if debug {
        "faids=debug,info"
    } else {
        "info"
    }
}

/// `RUST_LOG` when set, otherwise info (debug for this crate with `debug`)
pub fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(debug)))
}

/// Open `path` for appending, creating missing parent directories
pub fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))
}

/// Install the global subscriber: stderr always, plus `log_file` without colours
pub fn init(debug: bool, log_file: Option<&Path>) -> Result<()> {
    init_with(filter(debug), log_file)
}

pub fn init_with(filter: EnvFilter, log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(p) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(open_append(p)?)),
        ),
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(())
}
