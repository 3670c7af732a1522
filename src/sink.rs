use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Shared destination file, written by every worker at disjoint absolute
/// offsets. Positional writes take `&File`, so no lock is needed; the range
/// table guarantees no two workers ever own the same offset.
#[derive(Debug)]
pub(crate) struct FileSink {
    file: File,
}

impl FileSink {
    /// Creates (or truncates) the output file and pre-sizes it to `len`
    /// bytes so workers can write anywhere in it immediately. `set_len`
    /// allocates sparsely where the platform supports it.
    pub(crate) fn create(path: &Path, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self { file })
    }

    /// Writes `buf` at `offset`, returning the number of bytes the kernel
    /// accepted. Callers treat a count short of `buf.len()` as fatal.
    #[cfg(unix)]
    pub(crate) fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.write_at(buf, offset)
    }

    #[cfg(windows)]
    pub(crate) fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_write(buf, offset)
    }

    pub(crate) fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}
