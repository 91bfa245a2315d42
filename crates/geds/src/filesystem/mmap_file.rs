use geds_util::{Error, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

lazy_static::lazy_static! {
    static ref PAGE_SIZE: u64 = {
        // SAFETY: sysconf with a valid name has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page > 0 { page as u64 } else { 4096 }
    };
}

/// A read-only view over a sealed mapping, cheap to clone and safe to hold
/// across sends. Content is immutable once sealed.
#[derive(Clone)]
pub struct SealedView {
    map: Option<Arc<Mmap>>,
    size: u64,
}

impl SealedView {
    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Some(map) => &map[..self.size as usize],
            None => &[],
        }
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

struct MmapState {
    size: u64,
    mmap_size: u64,
    map: Option<MmapMut>,
    sealed: Option<SealedView>,
}

/// Memory-mapped byte backend. The mapping grows in page-rounded increments;
/// the backing file is unlinked on drop.
pub struct MmapFile {
    path: PathBuf,
    file: File,
    state: RwLock<MmapState>,
}

impl MmapFile {
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
        let this = Self {
            path: path.to_path_buf(),
            file,
            state: RwLock::new(MmapState {
                size: 0,
                mmap_size: 0,
                map: None,
                sealed: None,
            }),
        };
        if size > 0 {
            let mut state = this.state.write();
            this.grow(&mut state, size)?;
            state.size = size;
        }
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.state.read().size
    }

    pub fn mmap_size(&self) -> u64 {
        self.state.read().mmap_size
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Extend the file and remap to cover at least `request` bytes.
    fn grow(&self, state: &mut MmapState, request: u64) -> Result<()> {
        if state.mmap_size >= request {
            return Ok(());
        }
        let new_size = request.div_ceil(*PAGE_SIZE) * *PAGE_SIZE;
        self.file.set_len(new_size).map_err(|err| {
            Error::Unknown(format!("unable to extend {}: {err}", self.path.display()))
        })?;
        // The old mapping is dropped before the new one covers the extended
        // range; readers are excluded by the exclusive state lock.
        state.map = None;
        let map = unsafe {
            MmapOptions::new()
                .len(new_size as usize)
                .map_mut(&self.file)
        }
        .map_err(|err| {
            Error::Unknown(format!(
                "failed to map {} with requested size {request}: {err}",
                self.path.display()
            ))
        })?;
        state.map = Some(map);
        state.mmap_size = new_size;
        Ok(())
    }

    pub fn read_bytes(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let state = self.state.read();
        if position >= state.size {
            return Ok(0);
        }
        let n = (state.size - position).min(buf.len() as u64) as usize;
        let map = state
            .map
            .as_ref()
            .ok_or_else(|| Error::Internal("the file is not mapped".to_string()))?;
        buf[..n].copy_from_slice(&map[position as usize..position as usize + n]);
        Ok(n)
    }

    pub fn write_bytes(&self, buf: &[u8], position: u64) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write();
        if state.sealed.is_some() {
            return Err(Error::FailedPrecondition(format!(
                "{} is sealed",
                self.path.display()
            )));
        }
        let new_size = position + buf.len() as u64;
        if new_size > state.mmap_size {
            self.grow(&mut state, new_size)?;
        }
        let map = state
            .map
            .as_mut()
            .ok_or_else(|| Error::Internal("the file is not mapped".to_string()))?;
        map[position as usize..position as usize + buf.len()].copy_from_slice(buf);
        if new_size > state.size {
            state.size = new_size;
        }
        Ok(())
    }

    pub fn truncate(&self, target: u64) -> Result<()> {
        let mut state = self.state.write();
        if state.sealed.is_some() {
            return Err(Error::FailedPrecondition(format!(
                "{} is sealed",
                self.path.display()
            )));
        }
        if target > state.size {
            self.grow(&mut state, target)?;
        }
        state.size = target;
        Ok(())
    }

    /// Freeze the content and build the shareable read-only view.
    pub fn seal(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.sealed.is_some() {
            return Ok(());
        }
        let map = if state.size == 0 {
            None
        } else {
            let map = unsafe {
                MmapOptions::new()
                    .len(state.mmap_size as usize)
                    .map(&self.file)
            }
            .map_err(|err| {
                Error::Unknown(format!(
                    "failed to map {} read-only: {err}",
                    self.path.display()
                ))
            })?;
            Some(Arc::new(map))
        };
        state.sealed = Some(SealedView {
            map,
            size: state.size,
        });
        Ok(())
    }

    /// The zero-copy view. Only available once sealed.
    pub fn raw_view(&self) -> Result<SealedView> {
        self.state.read().sealed.clone().ok_or_else(|| {
            Error::FailedPrecondition(format!(
                "write in progress on {}",
                self.path.display()
            ))
        })
    }
}

impl Drop for MmapFile {
    fn drop(&mut self) {
        let mut state = self.state.write();
        state.map = None;
        state.sealed = None;
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(path = %self.path.display(), %err, "unable to delete mapped file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, MmapFile) {
        let dir = tempfile::tempdir().unwrap();
        let file = MmapFile::open(&dir.path().join("data.mmap"), false).unwrap();
        (dir, file)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, file) = fixture();
        file.write_bytes(b"Hello World!", 0).unwrap();
        assert_eq!(file.size(), 12);

        let mut buf = vec![0u8; 32];
        let n = file.read_bytes(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"Hello World!");
    }

    #[test]
    fn mapping_grows_in_page_rounded_steps() {
        let (_dir, file) = fixture();
        file.write_bytes(&[1u8; 10], 0).unwrap();
        let first = file.mmap_size();
        assert_eq!(first % *PAGE_SIZE, 0);

        // Writing past the mapped region grows it; earlier bytes survive the
        // remap.
        let far = first + 100;
        file.write_bytes(&[2u8; 10], far).unwrap();
        assert!(file.mmap_size() >= far + 10);

        let mut buf = [0u8; 10];
        file.read_bytes(&mut buf, 0).unwrap();
        assert_eq!(buf, [1u8; 10]);
        file.read_bytes(&mut buf, far).unwrap();
        assert_eq!(buf, [2u8; 10]);

        // The gap reads back zero-filled.
        let mut gap = [9u8; 4];
        file.read_bytes(&mut gap, first).unwrap();
        assert_eq!(gap, [0u8; 4]);
    }

    #[test]
    fn raw_view_requires_seal() {
        let (_dir, file) = fixture();
        file.write_bytes(b"payload", 0).unwrap();
        assert!(matches!(
            file.raw_view(),
            Err(Error::FailedPrecondition(_))
        ));

        file.seal().unwrap();
        let view = file.raw_view().unwrap();
        assert_eq!(view.as_slice(), b"payload");

        // Sealed content is immutable.
        assert!(matches!(
            file.write_bytes(b"more", 7),
            Err(Error::FailedPrecondition(_))
        ));
    }

    #[test]
    fn backing_file_is_deleted_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.mmap");
        {
            let file = MmapFile::open(&path, false).unwrap();
            file.write_bytes(b"x", 0).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn zero_byte_file_seals_to_an_empty_view() {
        let (_dir, file) = fixture();
        file.seal().unwrap();
        let view = file.raw_view().unwrap();
        assert!(view.is_empty());
        assert_eq!(view.as_slice(), b"");
    }
}
