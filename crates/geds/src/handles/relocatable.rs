//! Wrapper that re-resolves its inner handle through the metadata service
//! when a read fails, e.g. after the hosting peer vanished or the object
//! moved.

use crate::filesystem::SealedView;
use crate::handle::{FileHandle, HandleCommon};
use crate::NodeCtx;
use async_trait::async_trait;
use geds_util::Result;
use parking_lot::RwLock;
use std::os::fd::RawFd;
use std::sync::Arc;

pub struct RelocatableHandle {
    common: HandleCommon,
    ctx: NodeCtx,
    inner: RwLock<Arc<dyn FileHandle>>,
    // Serializes re-resolution; readers never hold `inner` across awaits.
    reopen: tokio::sync::Mutex<()>,
}

impl RelocatableHandle {
    pub fn wrap(ctx: NodeCtx, inner: Arc<dyn FileHandle>) -> Arc<Self> {
        let common = HandleCommon::new(
            inner.common().bucket.clone(),
            inner.common().key.clone(),
            inner.common().metadata(),
        );
        Arc::new(Self {
            common,
            ctx,
            inner: RwLock::new(inner),
            reopen: tokio::sync::Mutex::new(()),
        })
    }

    fn current(&self) -> Arc<dyn FileHandle> {
        self.inner.read().clone()
    }
}

#[async_trait]
impl FileHandle for RelocatableHandle {
    fn common(&self) -> &HandleCommon {
        &self.common
    }

    fn size(&self) -> Result<u64> {
        self.current().size()
    }

    fn local_storage_size(&self) -> u64 {
        self.current().local_storage_size()
    }

    fn local_memory_size(&self) -> u64 {
        self.current().local_memory_size()
    }

    fn is_writeable(&self) -> bool {
        self.current().is_writeable()
    }

    fn is_relocatable(&self) -> bool {
        true
    }

    fn is_valid(&self) -> bool {
        self.current().is_valid()
    }

    /// Reads consume one retry: on failure the inner handle is swapped for a
    /// freshly resolved one (forcing a metadata lookup) and the read runs
    /// once more against the replacement.
    async fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        let before = self.current();
        let err = match before.read_at(buf, position).await {
            Ok(n) => return Ok(n),
            Err(err) => err,
        };

        let _guard = self.reopen.lock().await;
        let now = self.current();
        if !Arc::ptr_eq(&now, &before) {
            // Another reader already swapped the handle.
            return now.read_at(buf, position).await;
        }
        tracing::info!(identifier = %self.common.identifier, %err, "reopening file");
        let replacement = match self
            .ctx
            .reopen(&self.common.bucket, &self.common.key, true)
            .await
        {
            Ok(handle) => handle,
            Err(reopen_err) => {
                tracing::info!(
                    identifier = %self.common.identifier,
                    %reopen_err,
                    "unable to reopen file"
                );
                return Err(reopen_err);
            }
        };
        *self.inner.write() = replacement.clone();
        replacement.read_at(buf, position).await
    }

    async fn write_at(&self, buf: &[u8], position: u64) -> Result<()> {
        self.current().write_at(buf, position).await
    }

    async fn truncate(&self, target: u64) -> Result<()> {
        self.current().truncate(target).await
    }

    async fn seal(&self) -> Result<()> {
        self.current().seal().await
    }

    async fn set_metadata(&self, metadata: Option<Vec<u8>>, seal: bool) -> Result<()> {
        self.current().set_metadata(metadata, seal).await
    }

    fn raw_fd(&self) -> Result<RawFd> {
        self.current().raw_fd()
    }

    fn raw_view(&self) -> Result<SealedView> {
        self.current().raw_view()
    }

    fn notify_unused(&self) {
        self.current().notify_unused()
    }
}
