//! Handle over an object hosted by a peer node, read through the TCP data
//! plane.

use crate::handle::{FileHandle, HandleCommon};
use crate::transfer::FileTransferService;
use async_trait::async_trait;
use geds_proto::Object;
use geds_util::stats::IntCounter;
use geds_util::{Error, Result};
use std::sync::Arc;

pub struct RemoteHandle {
    common: HandleCommon,
    transfer: Arc<FileTransferService>,
    size: u64,
    read_statistics: IntCounter,
}

impl RemoteHandle {
    /// Build a handle from a `geds://host:port` placement record.
    pub fn new(object: &Object, transfer: Arc<FileTransferService>) -> Arc<Self> {
        Arc::new(Self {
            common: HandleCommon::new(
                object.id.bucket.clone(),
                object.id.key.clone(),
                object.info.metadata.clone(),
            ),
            transfer,
            size: object.info.size,
            read_statistics: geds_util::stats::counter("geds remote handle: bytes read"),
        })
    }

    pub fn parse_location(location: &str) -> Result<&str> {
        let address = location.strip_prefix("geds://").ok_or_else(|| {
            Error::Internal(format!(
                "location {location} has an invalid prefix for a remote handle"
            ))
        })?;
        if address.is_empty() {
            return Err(Error::Unknown(format!("invalid hostname in {location}")));
        }
        Ok(address)
    }
}

#[async_trait]
impl FileHandle for RemoteHandle {
    fn common(&self) -> &HandleCommon {
        &self.common
    }

    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    async fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self
            .transfer
            .read_bytes(&self.common.bucket, &self.common.key, buf, position)
            .await?;
        self.read_statistics.inc_by(n as u64);
        Ok(n)
    }

    async fn seal(&self) -> Result<()> {
        Err(Error::FailedPrecondition(
            "remote files cannot be sealed".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_parsing() {
        assert_eq!(
            RemoteHandle::parse_location("geds://10.0.0.1:4381").unwrap(),
            "10.0.0.1:4381"
        );
        assert!(RemoteHandle::parse_location("geds://").is_err());
        assert!(RemoteHandle::parse_location("s3://bucket/key").is_err());
    }
}
