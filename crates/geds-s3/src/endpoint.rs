//! S3-compatible backing-store adapter.
//!
//! Credentials are provided explicitly per registered bucket. Path-style
//! addressing keeps the adapter compatible with MinIO and other
//! S3-compatible services.

use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use bytes::Bytes;
use geds_util::stats::IntCounter;
use geds_util::{Error, FileStatus, Result, DIRECTORY_MARKER};
use std::collections::BTreeSet;

/// Batched deletions send at most this many keys per request.
const DELETE_BATCH_SIZE: usize = 1000;

pub struct Endpoint {
    endpoint_url: String,
    client: aws_sdk_s3::Client,
    requests_sent: IntCounter,
    bytes_read: IntCounter,
}

impl Endpoint {
    pub fn new(
        endpoint_url: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        let endpoint_url = endpoint_url.into();
        let credentials =
            Credentials::new(access_key, secret_key, None, None, "geds-object-store");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            // S3-compatible endpoints ignore the region but the client
            // requires one for signing.
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint_url.clone())
            .force_path_style(true)
            .build();
        Self {
            endpoint_url,
            client: aws_sdk_s3::Client::from_conf(config),
            requests_sent: geds_util::stats::counter("geds s3: total requests sent"),
            bytes_read: geds_util::stats::counter("geds s3: bytes read"),
        }
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// List keys starting with `prefix`. With a delimiter, keys containing it
    /// past the prefix fold into directory entries, and explicit
    /// `<delim>_$DirectoryMarker_` keys surface empty folders. The marker of
    /// the listed prefix itself is suppressed.
    pub async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<char>,
    ) -> Result<Vec<FileStatus>> {
        let folder_suffix = delimiter.map(|d| format!("{d}{DIRECTORY_MARKER}"));
        let mut result = BTreeSet::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
            if let Some(d) = delimiter {
                request = request.delimiter(d.to_string());
            }
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            self.requests_sent.inc();
            let output = request
                .send()
                .await
                .map_err(|err| convert_error(err, "list", prefix))?;

            for object in output.contents() {
                let key = object.key().unwrap_or_default();
                let size = object.size().unwrap_or(0).max(0) as u64;
                if let Some(suffix) = &folder_suffix {
                    if let Some(dir) = key.strip_suffix(DIRECTORY_MARKER) {
                        if key.ends_with(suffix.as_str()) {
                            if dir != prefix {
                                result.insert(FileStatus::directory(dir));
                            }
                            continue;
                        }
                    }
                }
                result.insert(FileStatus::file(key, size));
            }
            for common in output.common_prefixes() {
                if let Some(p) = common.prefix() {
                    result.insert(FileStatus::directory(p));
                }
            }

            match output.next_continuation_token() {
                Some(token) if !token.is_empty() => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(result.into_iter().collect())
    }

    pub async fn file_status(&self, bucket: &str, key: &str) -> Result<FileStatus> {
        self.requests_sent.inc();
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| convert_error(err, "head", key))?;
        let size = output.content_length().unwrap_or(0).max(0) as u64;
        Ok(FileStatus::file(key, size))
    }

    /// Folder probe: any key below `key` makes it a directory.
    pub async fn folder_status(
        &self,
        bucket: &str,
        key: &str,
        delimiter: char,
    ) -> Result<FileStatus> {
        self.requests_sent.inc();
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(key)
            .max_keys(1)
            .send()
            .await
            .map_err(|err| convert_error(err, "folder status", key))?;
        let is_root = key.len() == 1 && key.starts_with(delimiter);
        if !output.contents().is_empty() || !output.common_prefixes().is_empty() || is_root {
            return Ok(FileStatus::directory(key));
        }
        Err(Error::NotFound(format!("folder {key} not found")))
    }

    /// Read `length` bytes at `position`. An `InvalidRange` response
    /// re-queries the object size and retries once with a clamped range.
    pub async fn read_bytes(
        &self,
        bucket: &str,
        key: &str,
        position: u64,
        length: u64,
    ) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        self.requests_sent.inc();
        let range = format!("bytes={}-{}", position, position + length - 1);
        let output = match self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .response_content_type("application/octet-stream")
            .range(range)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if err.code() == Some("InvalidRange") => {
                let status = self.file_status(bucket, key).await?;
                if position >= status.size {
                    return Ok(Bytes::new());
                }
                let clamped = status.size - position;
                tracing::debug!(bucket, key, position, clamped, "retrying read with clamped range");
                self.requests_sent.inc();
                let range = format!("bytes={}-{}", position, position + clamped - 1);
                self.client
                    .get_object()
                    .bucket(bucket)
                    .key(key)
                    .response_content_type("application/octet-stream")
                    .range(range)
                    .send()
                    .await
                    .map_err(|err| convert_error(err, "read", key))?
            }
            Err(err) => return Err(convert_error(err, "read", key)),
        };

        let collected = output
            .body
            .collect()
            .await
            .map_err(|err| Error::Unknown(format!("unable to read body of {key}: {err}")))?;
        let mut bytes = collected.into_bytes();
        if bytes.len() as u64 > length {
            bytes.truncate(length as usize);
        }
        self.bytes_read.inc_by(bytes.len() as u64);
        Ok(bytes)
    }

    pub async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.requests_sent.inc();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type("application/octet-stream")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| convert_error(err, "put", key))?;
        Ok(())
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.requests_sent.inc();
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| convert_error(err, "delete object", key))?;
        Ok(())
    }

    pub async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<()> {
        let files = self.list(bucket, prefix, None).await?;
        for chunk in files.chunks(DELETE_BATCH_SIZE) {
            let mut identifiers = Vec::with_capacity(chunk.len());
            for file in chunk {
                let id = ObjectIdentifier::builder()
                    .key(&file.key)
                    .build()
                    .map_err(|err| Error::Internal(err.to_string()))?;
                identifiers.push(id);
            }
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .map_err(|err| Error::Internal(err.to_string()))?;

            self.requests_sent.inc();
            self.client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|err| convert_error(err, "delete prefix", prefix))?;
        }
        Ok(())
    }
}

/// 404/NoSuchKey map to NotFound, 401/AccessDenied to PermissionDenied, and
/// everything else to Unknown with the service message attached.
fn convert_error<E>(err: SdkError<E>, action: &str, subject: &str) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let code = err.code().unwrap_or_default().to_string();
    let http_status = match &err {
        SdkError::ServiceError(ctx) => Some(ctx.raw().status().as_u16()),
        _ => None,
    };
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());

    match (code.as_str(), http_status) {
        ("NoSuchKey" | "NoSuchBucket" | "NotFound", _) | (_, Some(404)) => Error::NotFound(
            format!("unable to {action}: {subject} does not exist: {message}"),
        ),
        ("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch", _)
        | (_, Some(401)) => Error::PermissionDenied(message),
        _ => Error::Unknown(format!("unable to {action} {subject}: {message}")),
    }
}
