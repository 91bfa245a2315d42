//! Local byte backends and storage-root helpers.

mod local_file;
pub use local_file::LocalFile;

mod mmap_file;
pub use mmap_file::MmapFile;

pub use mmap_file::SealedView;

use geds_util::{Error, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

/// The capability set shared by the two byte backends.
pub trait LocalBackend: Send + Sync + Sized + 'static {
    /// Statistics label of the backend.
    const LABEL: &'static str;

    fn open(path: &Path, overwrite: bool) -> Result<Self>;
    fn path(&self) -> &Path;
    fn size(&self) -> u64;
    fn read_bytes(&self, buf: &mut [u8], position: u64) -> Result<usize>;
    fn write_bytes(&self, buf: &[u8], position: u64) -> Result<()>;
    fn truncate(&self, target: u64) -> Result<()>;
    fn raw_fd(&self) -> RawFd;

    /// Freeze content for zero-copy reads. A no-op for backends without a
    /// mapped view.
    fn seal_content(&self) -> Result<()> {
        Ok(())
    }

    fn raw_view(&self) -> Result<SealedView> {
        Err(Error::Unavailable(format!(
            "raw views are not supported by {}",
            Self::LABEL
        )))
    }

    /// Bytes of mapped memory held by the backend.
    fn memory_size(&self) -> u64 {
        0
    }
}

impl LocalBackend for LocalFile {
    const LABEL: &'static str = "LocalFile";

    fn open(path: &Path, overwrite: bool) -> Result<Self> {
        LocalFile::open(path, overwrite)
    }

    fn path(&self) -> &Path {
        LocalFile::path(self)
    }

    fn size(&self) -> u64 {
        LocalFile::size(self)
    }

    fn read_bytes(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        LocalFile::read_bytes(self, buf, position)
    }

    fn write_bytes(&self, buf: &[u8], position: u64) -> Result<()> {
        LocalFile::write_bytes(self, buf, position)
    }

    fn truncate(&self, target: u64) -> Result<()> {
        LocalFile::truncate(self, target)
    }

    fn raw_fd(&self) -> RawFd {
        LocalFile::raw_fd(self)
    }
}

impl LocalBackend for MmapFile {
    const LABEL: &'static str = "MmapFile";

    fn open(path: &Path, overwrite: bool) -> Result<Self> {
        MmapFile::open(path, overwrite)
    }

    fn path(&self) -> &Path {
        MmapFile::path(self)
    }

    fn size(&self) -> u64 {
        MmapFile::size(self)
    }

    fn read_bytes(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        MmapFile::read_bytes(self, buf, position)
    }

    fn write_bytes(&self, buf: &[u8], position: u64) -> Result<()> {
        MmapFile::write_bytes(self, buf, position)
    }

    fn truncate(&self, target: u64) -> Result<()> {
        MmapFile::truncate(self, target)
    }

    fn raw_fd(&self) -> RawFd {
        MmapFile::raw_fd(self)
    }

    fn seal_content(&self) -> Result<()> {
        MmapFile::seal(self)
    }

    fn raw_view(&self) -> Result<SealedView> {
        MmapFile::raw_view(self)
    }

    fn memory_size(&self) -> u64 {
        self.mmap_size()
    }
}

/// Create `path` and any missing parents.
pub fn mkdirs(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|err| Error::Unknown(format!("unable to create {}: {err}", path.display())))
}

pub fn remove_file(path: &Path) -> Result<()> {
    std::fs::remove_file(path)
        .map_err(|err| Error::Unknown(format!("unable to delete {}: {err}", path.display())))
}

/// Resolve the node's storage root. A trailing `XXXXXX` is replaced with a
/// random suffix so concurrent nodes on one host do not collide. The
/// directory is created empty; leftovers from a previous incarnation are
/// discarded.
pub fn create_storage_root(template: &str) -> Result<PathBuf> {
    if let Some(prefix) = template.strip_suffix("XXXXXX") {
        for _ in 0..16 {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(6)
                .map(char::from)
                .collect();
            let candidate = PathBuf::from(format!("{prefix}{suffix}"));
            match std::fs::create_dir_all(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(Error::Unknown(format!(
                        "unable to create storage root {}: {err}",
                        candidate.display()
                    )))
                }
            }
        }
        return Err(Error::Unknown(format!(
            "unable to create a unique storage root from {template}"
        )));
    }

    let root = PathBuf::from(template);
    if root.exists() {
        // Cached state does not survive a restart.
        std::fs::remove_dir_all(&root)
            .map_err(|err| Error::Unknown(format!("unable to clear {template}: {err}")))?;
    }
    mkdirs(&root)?;
    Ok(root)
}

/// Filesystem path backing `bucket/key` under `root`.
pub fn local_path(root: &Path, bucket: &str, key: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    path.push(bucket);
    for segment in key.split('/') {
        path.push(segment);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_root_randomizes_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/geds_XXXXXX", dir.path().display());
        let a = create_storage_root(&template).unwrap();
        let b = create_storage_root(&template).unwrap();
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
        assert!(!a.ends_with("geds_XXXXXX"));
    }

    #[test]
    fn fixed_storage_root_is_discarded_on_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("storage");
        let template = root.to_str().unwrap().to_string();

        let created = create_storage_root(&template).unwrap();
        std::fs::write(created.join("leftover"), b"stale").unwrap();
        let recreated = create_storage_root(&template).unwrap();
        assert_eq!(created, recreated);
        assert!(!recreated.join("leftover").exists());
    }

    #[test]
    fn keys_map_to_nested_paths() {
        let path = local_path(Path::new("/data"), "bucket", "a/b/c.bin");
        assert_eq!(path, PathBuf::from("/data/bucket/a/b/c.bin"));
    }
}
