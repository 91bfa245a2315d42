//! Handle over an object that lives on a backing store.

use crate::handle::{FileHandle, HandleCommon};
use crate::NodeCtx;
use async_trait::async_trait;
use geds_proto::Object;
use geds_s3::Endpoint;
use geds_util::stats::IntCounter;
use geds_util::{Error, Result};
use std::sync::Arc;

pub struct S3Handle {
    common: HandleCommon,
    ctx: NodeCtx,
    endpoint: Arc<Endpoint>,
    s3_bucket: String,
    s3_key: String,
    location: String,
    size: u64,
    read_statistics: IntCounter,
}

impl S3Handle {
    /// Split an `s3://bucket/key` location.
    pub fn parse_location(location: &str) -> Result<(&str, &str)> {
        let rest = location.strip_prefix("s3://").ok_or_else(|| {
            Error::Unknown(format!(
                "object location {location} has an invalid prefix for an s3 handle"
            ))
        })?;
        rest.split_once('/').ok_or_else(|| {
            Error::Unknown(format!("{location} invalid, expected s3://bucket/path"))
        })
    }

    /// Handle for an object whose placement record points at a backing
    /// store. Existence (and the authoritative size) comes from a head
    /// request.
    pub async fn from_object(
        ctx: NodeCtx,
        object: &Object,
        endpoint: Arc<Endpoint>,
    ) -> Result<Arc<Self>> {
        let (s3_bucket, s3_key) = Self::parse_location(&object.info.location)?;
        let status = endpoint.file_status(s3_bucket, s3_key).await?;
        Ok(Arc::new(Self {
            common: HandleCommon::new(
                object.id.bucket.clone(),
                object.id.key.clone(),
                object.info.metadata.clone(),
            ),
            ctx,
            endpoint,
            s3_bucket: s3_bucket.to_string(),
            s3_key: s3_key.to_string(),
            location: object.info.location.clone(),
            size: status.size,
            read_statistics: geds_util::stats::counter("geds s3 handle: bytes read"),
        }))
    }

    /// Handle for a bucket/key addressed directly against its registered
    /// store, used when the metadata service has no placement record.
    pub async fn from_bucket_and_key(
        ctx: NodeCtx,
        bucket: &str,
        key: &str,
        endpoint: Arc<Endpoint>,
    ) -> Result<Arc<Self>> {
        let status = endpoint.file_status(bucket, key).await?;
        Ok(Arc::new(Self {
            common: HandleCommon::new(bucket, key, None),
            ctx,
            endpoint,
            s3_bucket: bucket.to_string(),
            s3_key: key.to_string(),
            location: format!("s3://{bucket}/{key}"),
            size: status.size,
            read_statistics: geds_util::stats::counter("geds s3 handle: bytes read"),
        }))
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

#[async_trait]
impl FileHandle for S3Handle {
    fn common(&self) -> &HandleCommon {
        &self.common
    }

    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    async fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        if !self.common.is_valid() {
            return Err(Error::FailedPrecondition(format!(
                "{} is no longer valid",
                self.common.identifier
            )));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let bytes = match self
            .endpoint
            .read_bytes(&self.s3_bucket, &self.s3_key, position, buf.len() as u64)
            .await
        {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.is_not_found() {
                    self.common.invalidate();
                }
                return Err(err);
            }
        };
        buf[..bytes.len()].copy_from_slice(&bytes);
        self.read_statistics.inc_by(bytes.len() as u64);
        Ok(bytes.len())
    }

    /// Re-publish the backing-store location to the metadata service.
    async fn seal(&self) -> Result<()> {
        self.ctx
            .seal_object(&self.common, false, self.size, Some(self.location.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_parsing() {
        assert_eq!(
            S3Handle::parse_location("s3://backing/deep/key").unwrap(),
            ("backing", "deep/key")
        );
        assert!(S3Handle::parse_location("s3://no-key").is_err());
        assert!(S3Handle::parse_location("geds://host:1").is_err());
    }
}
