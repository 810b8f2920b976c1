use indicatif::{ProgressBar, ProgressStyle};
use memmap2::Mmap;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Length of the truncated BLAKE3 digest stored per block.
pub const STRONG_HASH_LEN: usize = 16;

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    unsafe {
        Mmap::map(&file).map_err(|e| Error::io(format!("memory-mapping {}", path.display()), e))
    }
}

/// Truncated BLAKE3 hash of a byte slice, used to confirm weak checksum hits.
pub fn strong_hash(data: &[u8]) -> [u8; STRONG_HASH_LEN] {
    let mut out = [0u8; STRONG_HASH_LEN];
    out.copy_from_slice(&blake3::hash(data).as_bytes()[..STRONG_HASH_LEN]);
    out
}

/// Byte progress bar for a long phase; hidden when progress display is off.
pub fn byte_progress(len: u64, message: &str, enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>10} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_message(message.to_string());
    pb
}

/// Writer adapter that counts the bytes passed through it.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Cooperative cancellation signal shared between the CLI and the engines.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with `Error::Cancelled` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_writer() {
        let mut w = CountingWriter::new(Vec::new());
        w.write_all(b"hello").unwrap();
        w.write_all(b" world").unwrap();
        assert_eq!(w.count(), 11);
        assert_eq!(w.inner, b"hello world");
    }

    #[test]
    fn test_strong_hash_is_blake3_prefix() {
        let full = blake3::hash(b"abc");
        assert_eq!(strong_hash(b"abc"), full.as_bytes()[..STRONG_HASH_LEN]);
        assert_ne!(strong_hash(b"abc"), strong_hash(b"abd"));
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        let shared = flag.clone();
        assert!(flag.check().is_ok());
        shared.cancel();
        assert!(matches!(flag.check(), Err(Error::Cancelled)));
    }
}
