use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Cloneable handle to a single append-only line destination
///
/// Every write holds the sink's lock for the whole line (or block), so lines
/// from different workers never interleave. Ordering across workers is
/// whatever order they win the lock in.
#[derive(Clone)]
pub struct SharedSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SharedSink {
    /// Wraps any writer
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Creates (truncating) the output file and takes an exclusive advisory
    /// lock on it, so a second serving instance can't write into the same file.
    ///
    /// # Errors
    /// - The file can't be created
    /// - Another process already holds the lock (`ErrorKind::WouldBlock`)
    pub fn create_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to open output file {}: {}", path.display(), e),
                )
            })?;

        if file.try_lock_exclusive().is_err() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("Output file {} is locked by another instance", path.display()),
            ));
        }

        // Truncate only once the lock is ours
        file.set_len(0)?;

        Ok(Self::new(LockedFile {
            writer: BufWriter::new(file),
        }))
    }

    /// Writes one whole line while holding the lock
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")
    }

    /// Writes several lines as a single uninterrupted block
    pub fn write_block(&self, lines: &[&str]) -> io::Result<()> {
        let mut writer = self.lock();
        for line in lines {
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Flushes buffered lines to the destination
    pub fn flush(&self) -> io::Result<()> {
        self.lock().flush()
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Output file that keeps its advisory lock until dropped
struct LockedFile {
    writer: BufWriter<File>,
}

impl Write for LockedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let _ = self.writer.get_ref().unlock();
    }
}

/// In-memory sink destination, readable while workers are still writing
#[derive(Clone, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `SharedSink` writing into this buffer
    pub fn shared(&self) -> SharedSink {
        SharedSink::new(self.clone())
    }

    /// Everything written so far
    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
