use chrono::Local;
use once_cell::sync::Lazy;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Global diagnostic log destination
///
/// When None, diagnostics go to stdout.
/// This is unrelated to the work output sink the workers write to.
pub static LOG_FILE: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// Logs a diagnostic line with a timestamp
///
/// # Example
/// ```text
/// // let _ = log("Begin of main()");
/// ```
pub fn log(message: &str) -> io::Result<()> {
    log_with_tag(message, None)
}

/// Logs a diagnostic line with a timestamp and an optional component tag
///
/// Tags identify the thread that produced the line (`listener`, a worker
/// name, `main`), since several threads log concurrently.
///
/// # Returns
/// * `io::Result<()>` - Ok on success, Err if the log file can't be written
pub fn log_with_tag(message: &str, tag: Option<&str>) -> io::Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let line = match tag {
        Some(tag) => format!("{} [{}] {}\n", timestamp, tag, message),
        None => format!("{} {}\n", timestamp, message),
    };

    // Holding the lock for the write keeps lines from different threads whole
    let guard = LOG_FILE.lock().unwrap_or_else(PoisonError::into_inner);
    match &*guard {
        Some(log_file) => {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)?;
            file.write_all(line.as_bytes())?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(line.as_bytes())?;
            stdout.flush()?;
        }
    }

    Ok(())
}

/// Sets the path for the diagnostic log file
///
/// Subsequent calls to `log` append to this file instead of stdout.
pub fn set_log_file<P: AsRef<Path>>(path: P) {
    let path_str = path.as_ref().to_string_lossy().into_owned();
    *LOG_FILE.lock().unwrap_or_else(PoisonError::into_inner) = Some(path_str);
}

/// Routes diagnostics back to stdout
pub fn clear_log_file() {
    *LOG_FILE.lock().unwrap_or_else(PoisonError::into_inner) = None;
}
