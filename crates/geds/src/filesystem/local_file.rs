use geds_util::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::ReentrantMutex;
use std::cell::Cell;

/// Positional-I/O byte backend over a plain file. A reentrant lock serializes
/// operations and guards the tracked size, mirroring the seek-free
/// pread/pwrite discipline.
pub struct LocalFile {
    path: PathBuf,
    file: File,
    state: ReentrantMutex<Cell<u64>>,
}

impl LocalFile {
    pub fn open(path: &Path, overwrite: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(overwrite)
            .open(path)
            .map_err(|err| {
                Error::Unknown(format!("unable to open {}: {err}", path.display()))
            })?;
        let size = file
            .metadata()
            .map_err(|err| {
                Error::Unknown(format!(
                    "unable to determine size of {}: {err}",
                    path.display()
                ))
            })?
            .len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            state: ReentrantMutex::new(Cell::new(size)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.state.lock().get()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Read up to `buf.len()` bytes at `position`. Returns 0 at or past the
    /// tracked size; short reads only happen at EOF.
    pub fn read_bytes(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let state = self.state.lock();
        let size = state.get();
        if position >= size {
            return Ok(0);
        }
        let length = buf.len().min((size - position) as usize);

        let mut offset = 0usize;
        while offset < length {
            match self.file.read_at(&mut buf[offset..length], position + offset as u64) {
                Ok(0) => break, // EOF
                Ok(n) => offset += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(Error::Unknown(format!(
                        "error reading {}: {err}",
                        self.path.display()
                    )))
                }
            }
        }
        Ok(offset)
    }

    /// Write `buf` at `position`, zero-filling up to `position` first when it
    /// lies past the current end.
    pub fn write_bytes(&self, buf: &[u8], position: u64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let state = self.state.lock();
        if position > 0 && state.get() < position {
            self.truncate(position)?;
        }

        let mut offset = 0usize;
        while offset < buf.len() {
            match self.file.write_at(&buf[offset..], position + offset as u64) {
                Ok(0) => {
                    return Err(Error::Unknown(format!(
                        "write on {} returned an EOF",
                        self.path.display()
                    )))
                }
                Ok(n) => offset += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(Error::Unknown(format!(
                        "error writing {}: {err}",
                        self.path.display()
                    )))
                }
            }
        }
        state.set(state.get().max(position + buf.len() as u64));
        Ok(())
    }

    /// Set both the filesystem size and the tracked size. Idempotent.
    pub fn truncate(&self, target: u64) -> Result<()> {
        let state = self.state.lock();
        self.file.set_len(target).map_err(|err| {
            Error::Unknown(format!(
                "unable to truncate {}: {err}",
                self.path.display()
            ))
        })?;
        state.set(target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, LocalFile) {
        let dir = tempfile::tempdir().unwrap();
        let file = LocalFile::open(&dir.path().join("data.bin"), false).unwrap();
        (dir, file)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, file) = fixture();
        file.write_bytes(b"Hello World!", 0).unwrap();
        assert_eq!(file.size(), 12);

        let mut buf = vec![0u8; 22];
        let n = file.read_bytes(&mut buf, 0).unwrap();
        assert_eq!(n, 12);
        assert_eq!(&buf[..n], b"Hello World!");
    }

    #[test]
    fn reads_at_or_past_size_return_zero() {
        let (_dir, file) = fixture();
        file.write_bytes(b"abc", 0).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(file.read_bytes(&mut buf, 3).unwrap(), 0);
        assert_eq!(file.read_bytes(&mut buf, 100).unwrap(), 0);
        assert_eq!(file.read_bytes(&mut [], 0).unwrap(), 0);
    }

    #[test]
    fn writing_past_the_end_zero_fills() {
        let (_dir, file) = fixture();
        file.write_bytes(b"tail", 8).unwrap();
        assert_eq!(file.size(), 12);

        let mut buf = vec![0xffu8; 12];
        assert_eq!(file.read_bytes(&mut buf, 0).unwrap(), 12);
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert_eq!(&buf[8..], b"tail");
    }

    #[test]
    fn truncate_is_idempotent_and_tracks_size() {
        let (_dir, file) = fixture();
        file.write_bytes(b"0123456789", 0).unwrap();
        file.truncate(4).unwrap();
        file.truncate(4).unwrap();
        assert_eq!(file.size(), 4);

        let mut buf = [0u8; 10];
        assert_eq!(file.read_bytes(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf[..4], b"0123");
    }

    #[test]
    fn zero_length_write_is_a_no_op() {
        let (_dir, file) = fixture();
        file.write_bytes(&[], 100).unwrap();
        assert_eq!(file.size(), 0);
    }
}
