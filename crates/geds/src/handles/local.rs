//! Writable, sealable handles over the node-local byte backends.

use crate::filesystem::{self, LocalBackend, LocalFile, MmapFile, SealedView};
use crate::handle::{FileHandle, HandleCommon};
use crate::NodeCtx;
use async_trait::async_trait;
use geds_util::stats::IntCounter;
use geds_util::{Error, Result};
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;

pub type LocalFileHandle = LocalHandle<LocalFile>;
pub type MmapFileHandle = LocalHandle<MmapFile>;

#[derive(Clone, Copy, Default)]
struct SealState {
    sealed: bool,
    sealed_size: u64,
}

pub struct LocalHandle<B: LocalBackend> {
    common: HandleCommon,
    ctx: NodeCtx,
    file: B,
    seal_state: Mutex<SealState>,
    read_statistics: IntCounter,
    write_statistics: IntCounter,
}

impl<B: LocalBackend> LocalHandle<B> {
    /// Open or create the backing file at `path`, creating parent
    /// directories as needed.
    pub fn create(
        ctx: NodeCtx,
        bucket: &str,
        key: &str,
        metadata: Option<Vec<u8>>,
        path: &Path,
        overwrite: bool,
    ) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            filesystem::mkdirs(parent)?;
        }
        let file = B::open(path, overwrite)?;
        Ok(Arc::new(Self {
            common: HandleCommon::new(bucket, key, metadata),
            ctx,
            file,
            seal_state: Mutex::new(SealState::default()),
            read_statistics: geds_util::stats::counter(&format!(
                "geds {} handle: bytes read",
                B::LABEL
            )),
            write_statistics: geds_util::stats::counter(&format!(
                "geds {} handle: bytes written",
                B::LABEL
            )),
        }))
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn is_sealed(&self) -> bool {
        self.seal_state.lock().sealed
    }
}

#[async_trait]
impl<B: LocalBackend> FileHandle for LocalHandle<B> {
    fn common(&self) -> &HandleCommon {
        &self.common
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.size())
    }

    fn local_storage_size(&self) -> u64 {
        self.file.size()
    }

    fn local_memory_size(&self) -> u64 {
        self.file.memory_size()
    }

    fn is_writeable(&self) -> bool {
        true
    }

    async fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        let n = self.file.read_bytes(buf, position)?;
        self.read_statistics.inc_by(n as u64);
        Ok(n)
    }

    async fn write_at(&self, buf: &[u8], position: u64) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::FailedPrecondition(format!(
                "{} is sealed",
                self.common.identifier
            )));
        }
        self.file.write_bytes(buf, position)?;
        self.write_statistics.inc_by(buf.len() as u64);
        Ok(())
    }

    async fn truncate(&self, target: u64) -> Result<()> {
        if self.is_sealed() {
            return Err(Error::FailedPrecondition(format!(
                "{} is sealed",
                self.common.identifier
            )));
        }
        self.file.truncate(target)
    }

    /// Publish `(location, size, sealed_offset = size)` to the metadata
    /// service and freeze the content. Idempotent re-seals turn into
    /// updates.
    async fn seal(&self) -> Result<()> {
        let (update, size) = {
            let state = self.seal_state.lock();
            (state.sealed, self.file.size())
        };
        self.ctx.seal_object(&self.common, update, size, None).await?;
        self.file.seal_content()?;
        let mut state = self.seal_state.lock();
        state.sealed = true;
        state.sealed_size = size;
        Ok(())
    }

    async fn set_metadata(&self, metadata: Option<Vec<u8>>, seal: bool) -> Result<()> {
        self.common.set_metadata(metadata);
        if seal {
            return self.seal().await;
        }
        Ok(())
    }

    fn raw_fd(&self) -> Result<RawFd> {
        Ok(self.file.raw_fd())
    }

    fn raw_view(&self) -> Result<SealedView> {
        self.file.raw_view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::GedsFile;

    fn mmap_handle(dir: &tempfile::TempDir) -> Arc<MmapFileHandle> {
        MmapFileHandle::create(
            NodeCtx::detached(),
            "geds-test",
            "unit/msg",
            None,
            &dir.path().join("unit_msg"),
            false,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn write_read_round_trip_through_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let handle = mmap_handle(&dir);
        let file = GedsFile::open(handle.clone());

        let payload = vec![42u8; 409];
        file.write(&payload, 0).await.unwrap();
        assert_eq!(file.size(), 409);

        let mut buf = vec![0u8; 409];
        let n = file.read(&mut buf, 0).await.unwrap();
        assert_eq!(n, 409);
        assert_eq!(buf, payload);
    }

    #[tokio::test]
    async fn sealed_handles_reject_writes() {
        let dir = tempfile::tempdir().unwrap();
        let handle = mmap_handle(&dir);
        handle.write_at(b"payload", 0).await.unwrap();

        // A detached context seals locally without publishing.
        handle.seal().await.unwrap();
        assert!(handle.is_sealed());
        assert!(matches!(
            handle.write_at(b"more", 7).await,
            Err(Error::FailedPrecondition(_))
        ));
        assert!(matches!(
            handle.truncate(0).await,
            Err(Error::FailedPrecondition(_))
        ));
        assert_eq!(handle.raw_view().unwrap().as_slice(), b"payload");
    }

    #[tokio::test]
    async fn local_file_handles_have_no_raw_view() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LocalFileHandle::create(
            NodeCtx::detached(),
            "geds-test",
            "plain",
            None,
            &dir.path().join("plain"),
            false,
        )
        .unwrap();
        handle.write_at(b"abc", 0).await.unwrap();
        assert!(handle.raw_view().is_err());
        assert!(handle.raw_fd().is_ok());
    }
}
