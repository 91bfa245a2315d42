use crate::rpc;
use geds_util::{Error, Result};

/// Identifies an object within the bucket/key namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub bucket: String,
    pub key: String,
}

impl ObjectId {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Placement record for an object. `location` is `geds://host:port` for a
/// peer-hosted object, `s3://bucket/key` for a backing-store object, or a
/// local filesystem path. The prefix up to `sealed_offset` is immutable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub location: String,
    pub size: u64,
    pub sealed_offset: u64,
    pub metadata: Option<Vec<u8>>,
}

impl ObjectInfo {
    pub fn sealed(location: impl Into<String>, size: u64) -> Self {
        Self {
            location: location.into(),
            size,
            sealed_offset: size,
            metadata: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    pub id: ObjectId,
    pub info: ObjectInfo,
}

impl From<ObjectId> for rpc::ObjectId {
    fn from(id: ObjectId) -> Self {
        Self {
            bucket: id.bucket,
            key: id.key,
        }
    }
}

impl From<rpc::ObjectId> for ObjectId {
    fn from(id: rpc::ObjectId) -> Self {
        Self {
            bucket: id.bucket,
            key: id.key,
        }
    }
}

impl From<ObjectInfo> for rpc::ObjectInfo {
    fn from(info: ObjectInfo) -> Self {
        Self {
            location: info.location,
            size: info.size,
            sealed_offset: info.sealed_offset,
            metadata: info.metadata,
        }
    }
}

impl From<rpc::ObjectInfo> for ObjectInfo {
    fn from(info: rpc::ObjectInfo) -> Self {
        Self {
            location: info.location,
            size: info.size,
            sealed_offset: info.sealed_offset,
            metadata: info.metadata,
        }
    }
}

impl From<Object> for rpc::Object {
    fn from(obj: Object) -> Self {
        Self {
            id: Some(obj.id.into()),
            info: Some(obj.info.into()),
        }
    }
}

impl TryFrom<rpc::Object> for Object {
    type Error = Error;

    fn try_from(obj: rpc::Object) -> Result<Self> {
        let id = obj
            .id
            .ok_or_else(|| Error::InvalidArgument("object is missing its id".to_string()))?;
        let info = obj
            .info
            .ok_or_else(|| Error::InvalidArgument("object is missing its info".to_string()))?;
        Ok(Self {
            id: id.into(),
            info: info.into(),
        })
    }
}
