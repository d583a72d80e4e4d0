use crate::logging::log_with_tag;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

/// Cross-thread "please stop" flag
///
/// Cloning shares the same underlying flag. Once requested it stays
/// requested; there is deliberately no way to reset it.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    requested: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop. Safe to call from any thread, any number of times.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Checks whether a stop was requested
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Bridge from OS signals to a `StopFlag`
///
/// A background thread waits for the configured signals and requests a stop
/// on the first one. The signal handler itself only writes to a pipe;
/// logging happens on the bridge thread.
pub struct LocalSignals {
    stop: StopFlag,
    last_signal: Arc<AtomicI32>,
    handle: Handle,
    thread: Option<thread::JoinHandle<()>>,
}

impl LocalSignals {
    /// Listens for SIGINT (Ctrl+C) and SIGTERM
    pub fn install() -> io::Result<Self> {
        Self::install_for(&[SIGINT, SIGTERM])
    }

    /// Listens for an explicit set of signals
    ///
    /// # Errors
    /// Fails if a handler can't be registered (e.g. a forbidden signal).
    pub fn install_for(signals: &[i32]) -> io::Result<Self> {
        let mut signals = Signals::new(signals)?;
        let handle = signals.handle();
        let stop = StopFlag::new();
        let last_signal = Arc::new(AtomicI32::new(0));

        let thread_stop = stop.clone();
        let thread_last = Arc::clone(&last_signal);
        let thread = thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                // forever() ends once the handle is closed
                for sig in signals.forever() {
                    thread_last.store(sig, Ordering::SeqCst);
                    if !thread_stop.is_requested() {
                        let _ = log_with_tag(
                            &format!("Received signal {}, requesting orderly shutdown", sig),
                            Some("signals"),
                        );
                    }
                    thread_stop.request();
                }
            })?;

        Ok(Self {
            stop,
            last_signal,
            handle,
            thread: Some(thread),
        })
    }

    /// The flag this bridge sets when a signal arrives
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// The last signal number received, if any
    pub fn received(&self) -> Option<i32> {
        match self.last_signal.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }

    /// Stops listening for signals and joins the bridge thread
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LocalSignals {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use signal_hook::consts::SIGUSR1;
    use std::time::{Duration, Instant};

    #[test]
    fn test_stop_flag_is_shared_between_clones() {
        let flag = StopFlag::new();
        let other = flag.clone();
        assert!(!other.is_requested());

        flag.request();
        assert!(other.is_requested());

        // Requesting again is harmless and never clears the flag
        other.request();
        assert!(flag.is_requested());
    }

    #[test]
    fn test_stop_flag_visible_across_threads() {
        let flag = StopFlag::new();
        let setter = flag.clone();
        thread::spawn(move || setter.request()).join().unwrap();
        assert!(flag.is_requested());
    }

    #[test]
    #[serial]
    fn test_local_signal_requests_stop() {
        let signals = LocalSignals::install_for(&[SIGUSR1]).unwrap();
        let stop = signals.stop_flag();
        assert!(!stop.is_requested());
        assert_eq!(signals.received(), None);

        unsafe {
            libc::raise(SIGUSR1);
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while !stop.is_requested() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(stop.is_requested());
        assert_eq!(signals.received(), Some(SIGUSR1));

        signals.close();
    }

    #[test]
    #[serial]
    fn test_close_without_signal_joins_thread() {
        let signals = LocalSignals::install_for(&[SIGUSR1]).unwrap();
        let stop = signals.stop_flag();
        signals.close();
        assert!(!stop.is_requested());
    }
}
