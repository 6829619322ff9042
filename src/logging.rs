//! File-based debug log. The interactive loop owns stdout, so diagnostics go
//! to a temp file we can tail while a capture session is running.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use std::{env, fs};

/// Path to the temp log file we rotate between runs.
pub fn log_file_path() -> PathBuf {
    env::temp_dir().join("answerbooth.log")
}

/// Write debug messages to a temp file so we can troubleshoot without
/// interleaving with the interactive prompt.
pub fn log_debug(msg: &str) {
    let log_path = log_file_path();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(log_path) {
        let _ = writeln!(file, "[{timestamp}] {msg}");
    }
}

/// Remove the log file if it grows past 5 MB between runs.
pub fn init_debug_log_file() {
    let log_path = log_file_path();
    if let Ok(metadata) = fs::metadata(&log_path) {
        const MAX_BYTES: u64 = 5 * 1024 * 1024;
        if metadata.len() > MAX_BYTES {
            let _ = fs::remove_file(&log_path);
        }
    }
}
