//! The polymorphic file-handle capability set.
//!
//! Every variant embeds a [`HandleCommon`] carrying identity, the atomic
//! open count, validity, and open/release timestamps. [`GedsFile`] is the
//! user-facing accessor: opening bumps the count, dropping releases it, and
//! the transition to zero raises the advisory unused notification.

use crate::filesystem::SealedView;
use async_trait::async_trait;
use geds_util::{Error, Result};
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

pub struct HandleCommon {
    pub bucket: String,
    pub key: String,
    pub identifier: String,
    metadata: Mutex<Option<Vec<u8>>>,
    open_count: AtomicI64,
    valid: AtomicBool,
    last_opened: Mutex<Option<SystemTime>>,
    last_released: Mutex<Option<SystemTime>>,
}

impl HandleCommon {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        metadata: Option<Vec<u8>>,
    ) -> Self {
        let bucket = bucket.into();
        let key = key.into();
        let identifier = format!("{bucket}/{key}");
        tracing::debug!(%identifier, "created file handle");
        Self {
            bucket,
            key,
            identifier,
            metadata: Mutex::new(metadata),
            open_count: AtomicI64::new(0),
            valid: AtomicBool::new(true),
            last_opened: Mutex::new(None),
            last_released: Mutex::new(None),
        }
    }

    pub fn open_count(&self) -> i64 {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Increment the open count. Returns the new count.
    pub fn increase_open_count(&self) -> i64 {
        *self.last_opened.lock() = Some(SystemTime::now());
        self.open_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement the open count. Returns the new count; zero means the
    /// handle became unused.
    pub fn decrease_open_count(&self) -> i64 {
        *self.last_released.lock() = Some(SystemTime::now());
        self.open_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub fn metadata(&self) -> Option<Vec<u8>> {
        self.metadata.lock().clone()
    }

    pub fn set_metadata(&self, metadata: Option<Vec<u8>>) {
        *self.metadata.lock() = metadata;
    }

    pub fn last_opened(&self) -> Option<SystemTime> {
        *self.last_opened.lock()
    }

    pub fn last_released(&self) -> Option<SystemTime> {
        *self.last_released.lock()
    }
}

#[async_trait]
pub trait FileHandle: Send + Sync {
    fn common(&self) -> &HandleCommon;

    fn size(&self) -> Result<u64>;

    /// Bytes of node-local disk consumed by this handle.
    fn local_storage_size(&self) -> u64 {
        0
    }

    /// Bytes of node-local memory (mappings) consumed by this handle.
    fn local_memory_size(&self) -> u64 {
        0
    }

    fn is_writeable(&self) -> bool {
        false
    }

    fn is_relocatable(&self) -> bool {
        false
    }

    fn is_valid(&self) -> bool {
        self.common().is_valid()
    }

    async fn read_at(&self, _buf: &mut [u8], _position: u64) -> Result<usize> {
        Err(Error::Unavailable(
            "read operation is not available".to_string(),
        ))
    }

    async fn write_at(&self, _buf: &[u8], _position: u64) -> Result<()> {
        Err(Error::Unavailable(
            "write operation is not available".to_string(),
        ))
    }

    async fn truncate(&self, _target: u64) -> Result<()> {
        Err(Error::Unavailable("truncate is not available".to_string()))
    }

    async fn seal(&self) -> Result<()> {
        Err(Error::Unavailable(
            "seal operation is not available".to_string(),
        ))
    }

    async fn set_metadata(&self, _metadata: Option<Vec<u8>>, _seal: bool) -> Result<()> {
        Err(Error::Unavailable(
            "cannot set metadata on a read-only file".to_string(),
        ))
    }

    /// Copy `[position, position + length)` into `destination` at
    /// `dest_position`, in bounded chunks. Returns the copied byte count; a
    /// short count means the source ended early.
    async fn download_range(
        &self,
        destination: &dyn FileHandle,
        position: u64,
        length: u64,
        dest_position: u64,
    ) -> Result<u64> {
        let mut buffer = vec![0u8; crate::transport::COPY_BUFFER_SIZE];
        let mut count = 0u64;
        while count < length {
            let chunk = buffer.len().min((length - count) as usize);
            let n = self.read_at(&mut buffer[..chunk], position + count).await?;
            if n == 0 {
                break;
            }
            destination
                .write_at(&buffer[..n], dest_position + count)
                .await?;
            count += n as u64;
        }
        Ok(count)
    }

    /// File descriptor for the zero-copy `sendfile` path.
    fn raw_fd(&self) -> Result<RawFd> {
        Err(Error::Unavailable(
            "raw fds are not supported for this file handle".to_string(),
        ))
    }

    /// Borrowed view for scatter-gather sends; only sealed local mappings
    /// provide one.
    fn raw_view(&self) -> Result<SealedView> {
        Err(Error::Unavailable(
            "raw views are not supported for this file handle".to_string(),
        ))
    }

    /// Advisory: the open count reached zero. The handle may release
    /// resources but must stay reusable.
    fn notify_unused(&self) {
        tracing::debug!(identifier = %self.common().identifier, "file handle is unused");
    }
}

/// A reference-counted accessor over an object, handed out by `open()`.
pub struct GedsFile {
    handle: Arc<dyn FileHandle>,
}

impl GedsFile {
    pub(crate) fn open(handle: Arc<dyn FileHandle>) -> Self {
        handle.common().increase_open_count();
        Self { handle }
    }

    pub fn bucket(&self) -> &str {
        &self.handle.common().bucket
    }

    pub fn key(&self) -> &str {
        &self.handle.common().key
    }

    pub fn identifier(&self) -> &str {
        &self.handle.common().identifier
    }

    pub fn size(&self) -> u64 {
        self.handle.size().unwrap_or(0)
    }

    pub fn is_writeable(&self) -> bool {
        self.handle.is_writeable()
    }

    pub fn metadata(&self) -> Option<Vec<u8>> {
        self.handle.common().metadata()
    }

    pub async fn read(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        self.handle.read_at(buf, position).await
    }

    pub async fn write(&self, buf: &[u8], position: u64) -> Result<()> {
        self.handle.write_at(buf, position).await
    }

    pub async fn truncate(&self, target: u64) -> Result<()> {
        self.handle.truncate(target).await
    }

    pub async fn seal(&self) -> Result<()> {
        self.handle.seal().await
    }

    pub async fn set_metadata(&self, metadata: Option<Vec<u8>>, seal: bool) -> Result<()> {
        self.handle.set_metadata(metadata, seal).await
    }

    pub fn file_handle(&self) -> Arc<dyn FileHandle> {
        self.handle.clone()
    }
}

impl Clone for GedsFile {
    fn clone(&self) -> Self {
        Self::open(self.handle.clone())
    }
}

impl Drop for GedsFile {
    fn drop(&mut self) {
        if self.handle.common().decrease_open_count() == 0 {
            self.handle.notify_unused();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubHandle {
        common: HandleCommon,
    }

    #[async_trait]
    impl FileHandle for StubHandle {
        fn common(&self) -> &HandleCommon {
            &self.common
        }

        fn size(&self) -> Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn open_count_follows_references() {
        let handle: Arc<dyn FileHandle> = Arc::new(StubHandle {
            common: HandleCommon::new("b", "k", None),
        });
        assert_eq!(handle.common().open_count(), 0);

        let file = GedsFile::open(handle.clone());
        assert_eq!(handle.common().open_count(), 1);
        let second = file.clone();
        assert_eq!(handle.common().open_count(), 2);

        drop(file);
        assert_eq!(handle.common().open_count(), 1);
        drop(second);
        assert_eq!(handle.common().open_count(), 0);
        assert!(handle.common().last_released().is_some());
    }

    #[test]
    fn identifier_concatenates_bucket_and_key() {
        let common = HandleCommon::new("bucket", "a/key", None);
        assert_eq!(common.identifier, "bucket/a/key");
    }
}
