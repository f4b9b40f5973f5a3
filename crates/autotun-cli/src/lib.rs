//! Library half of the `autotun` binary: configuration, logging and service control

pub mod config;
pub mod logging;
pub mod service;

pub use config::AppConfig;

use std::path::PathBuf;

/// Directory containing the running executable, falling back to the current directory
pub fn default_work_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}
