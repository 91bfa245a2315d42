//! Blocked view over a remote or backing-store handle.
//!
//! The object is partitioned into fixed-size blocks; each block is hydrated
//! at most once into a sealed local block object under a per-block lock.
//! Reads failing after hydration purge the block and retry once.

use crate::handle::{FileHandle, GedsFile, HandleCommon};
use crate::NodeCtx;
use async_trait::async_trait;
use geds_util::stats::IntCounter;
use geds_util::{Result, CACHE_BLOCK_MARKER};
use std::sync::Arc;

pub struct CachedHandle {
    common: HandleCommon,
    ctx: NodeCtx,
    remote: Arc<dyn FileHandle>,
    remote_size: u64,
    block_size: u64,
    blocks: Vec<tokio::sync::Mutex<Option<GedsFile>>>,
    read_statistics: IntCounter,
    cached_bytes: IntCounter,
    cached_blocks: IntCounter,
    purged_blocks: IntCounter,
}

impl CachedHandle {
    pub fn new(ctx: NodeCtx, remote: Arc<dyn FileHandle>) -> Result<Arc<Self>> {
        let remote_size = remote.size()?;
        let block_size = ctx.cache_block_size().max(1);
        let block_count = remote_size.div_ceil(block_size) as usize;
        let common = HandleCommon::new(
            remote.common().bucket.clone(),
            remote.common().key.clone(),
            remote.common().metadata(),
        );
        Ok(Arc::new(Self {
            common,
            ctx,
            remote,
            remote_size,
            block_size,
            blocks: (0..block_count)
                .map(|_| tokio::sync::Mutex::new(None))
                .collect(),
            read_statistics: geds_util::stats::counter("geds cached handle: bytes read"),
            cached_bytes: geds_util::stats::counter("geds cached handle: local cache size"),
            cached_blocks: geds_util::stats::counter(
                "geds cached handle: number of locally cached blocks",
            ),
            purged_blocks: geds_util::stats::counter(
                "geds cached handle: number of purged blocks",
            ),
        }))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn block_key(&self, index: usize) -> String {
        format!("{CACHE_BLOCK_MARKER}{}_{index}", self.common.key)
    }

    /// Look up or hydrate block `index`. Concurrent readers of one block
    /// wait on its lock, so the remote range is fetched exactly once.
    async fn open_block(&self, index: usize) -> Result<GedsFile> {
        let mut slot = self.blocks[index].lock().await;
        if let Some(file) = slot.as_ref() {
            return Ok(file.clone());
        }

        let cache_key = self.block_key(index);
        // Another handle instance may have hydrated the block already.
        if let Ok(existing) = self.ctx.open_file(&self.common.bucket, &cache_key).await {
            *slot = Some(existing.clone());
            return Ok(existing);
        }

        let block = self.ctx.create_block(&self.common.bucket, &cache_key)?;
        let offset = index as u64 * self.block_size;
        let expected = self.block_size.min(self.remote_size - offset);
        let copied = self
            .remote
            .download_range(block.as_ref(), offset, expected, 0)
            .await?;
        self.cached_bytes.inc_by(copied);
        block.seal().await?;
        self.cached_blocks.inc();

        let file = GedsFile::open(block);
        *slot = Some(file.clone());
        Ok(file)
    }

    /// Drop a block that failed after hydration, unless it was already
    /// replaced.
    async fn purge_block(&self, index: usize, failed: &GedsFile) {
        let mut slot = self.blocks[index].lock().await;
        let Some(current) = slot.as_ref() else {
            return;
        };
        if !Arc::ptr_eq(&current.file_handle(), &failed.file_handle()) {
            return;
        }
        self.purged_blocks.inc();
        *slot = None;
        drop(slot);
        let cache_key = self.block_key(index);
        if let Err(err) = self.ctx.delete_object(&self.common.bucket, &cache_key).await {
            tracing::debug!(block = %cache_key, %err, "unable to delete purged block");
        }
        tracing::info!(block = %cache_key, "purged cache block");
    }
}

#[async_trait]
impl FileHandle for CachedHandle {
    fn common(&self) -> &HandleCommon {
        &self.common
    }

    fn size(&self) -> Result<u64> {
        Ok(self.remote_size)
    }

    fn is_relocatable(&self) -> bool {
        true
    }

    async fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        if position >= self.remote_size || buf.is_empty() {
            return Ok(0);
        }
        let length = (buf.len() as u64).min(self.remote_size - position);

        let mut count = 0u64;
        while count < length {
            let index = ((position + count) / self.block_size) as usize;
            let block_offset = (position + count) % self.block_size;
            let chunk = (length - count).min(self.block_size - block_offset) as usize;

            let mut attempts = 0;
            loop {
                let block = self.open_block(index).await?;
                let target = &mut buf[count as usize..count as usize + chunk];
                match block.read(target, block_offset).await {
                    Ok(n) => {
                        self.read_statistics.inc_by(n as u64);
                        count += n as u64;
                        if n == 0 {
                            // Hydrated block shorter than promised; surface
                            // what we have instead of spinning.
                            return Ok(count as usize);
                        }
                        break;
                    }
                    Err(err) if attempts == 0 => {
                        tracing::info!(
                            identifier = %self.common.identifier,
                            block = index,
                            %err,
                            "block read failed, purging and retrying"
                        );
                        self.purge_block(index, &block).await;
                        attempts += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(count as usize)
    }

    /// Sealing delegates to the underlying remote handle.
    async fn seal(&self) -> Result<()> {
        self.remote.seal().await
    }

    fn local_storage_size(&self) -> u64 {
        // Block objects account for themselves in the handle cache.
        0
    }
}
