//! Shared CI log.
//!
//! Every process in the system (dispatcher, runners, observer) appends
//! `[HH:MM:SS.mmm] [tag]` lines to `<results>/ci_log.txt` and echoes the same
//! line to stderr. The file is part of the external contract.

use std::io::Write;
use std::path::Path;

/// Name of the shared append-only log inside the results directory.
pub const LOG_FILE: &str = "ci_log.txt";

/// Appends a tagged line to the shared CI log and echoes it to stderr.
///
/// The `tag` identifies the emitting component ("dispatcher", "assigner",
/// "janitor", "runner", "observer"). Write failures are swallowed: logging
/// must never take the control plane down.
pub fn ci_log(results_dir: &Path, tag: &str, msg: &str) {
    let now = chrono::Local::now().format("%H:%M:%S%.3f");
    let line = format!("[{}] [{}] {}", now, tag, msg);
    eprintln!("{}", line);

    if std::fs::create_dir_all(results_dir).is_err() {
        return;
    }
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(results_dir.join(LOG_FILE))
    {
        let _ = writeln!(file, "{}", line);
    }
}
