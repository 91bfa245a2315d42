use crate::Endpoint;
use geds_util::concurrent::ConcurrentMap;
use geds_util::{Error, Result};
use std::sync::Arc;

/// Credentials and endpoint for a bucket hosted on a backing store.
#[derive(Clone, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    pub endpoint_url: String,
    pub access_key: String,
    pub secret_key: String,
}

impl ObjectStoreConfig {
    pub fn new(
        bucket: impl Into<String>,
        endpoint_url: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint_url: endpoint_url.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    fn conflicts_with(&self, other: &Self) -> bool {
        self.endpoint_url != other.endpoint_url || self.access_key != other.access_key
    }
}

// Credentials stay out of log output.
impl std::fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("bucket", &self.bucket)
            .field("endpoint_url", &self.endpoint_url)
            .finish_non_exhaustive()
    }
}

/// Registered configurations, keyed by bucket. The MDS holds these and hands
/// them out to nodes.
#[derive(Default)]
pub struct ObjectStoreConfigs {
    configs: ConcurrentMap<String, ObjectStoreConfig>,
}

impl ObjectStoreConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert: registering the same `(bucket, url, access_key)`
    /// again is a no-op, different values are AlreadyExists.
    pub fn insert(&self, config: ObjectStoreConfig) -> Result<()> {
        let existing = self
            .configs
            .insert_or_exists(config.bucket.clone(), config.clone());
        if existing.conflicts_with(&config) {
            return Err(Error::AlreadyExists(format!(
                "bucket {} is already mapped to {}",
                config.bucket, existing.endpoint_url
            )));
        }
        Ok(())
    }

    pub fn get(&self, bucket: &str) -> Option<ObjectStoreConfig> {
        self.configs.get(&bucket.to_string())
    }

    pub fn list(&self) -> Vec<ObjectStoreConfig> {
        let mut result = Vec::new();
        self.configs.forall(|_, config| result.push(config.clone()));
        result
    }
}

/// Node-side endpoint registry: lazily built `Endpoint` per registered
/// bucket.
#[derive(Default)]
pub struct ObjectStores {
    configs: ObjectStoreConfigs,
    endpoints: ConcurrentMap<String, Arc<Endpoint>>,
}

impl ObjectStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, config: ObjectStoreConfig) -> Result<()> {
        self.configs.insert(config)
    }

    pub fn is_registered(&self, bucket: &str) -> bool {
        self.configs.get(bucket).is_some()
    }

    pub fn get(&self, bucket: &str) -> Result<Arc<Endpoint>> {
        if let Some(endpoint) = self.endpoints.get(&bucket.to_string()) {
            return Ok(endpoint);
        }
        let config = self.configs.get(bucket).ok_or_else(|| {
            Error::NotFound(format!("no object store is registered for bucket {bucket}"))
        })?;
        let endpoint = Arc::new(Endpoint::new(
            config.endpoint_url,
            config.access_key,
            config.secret_key,
        ));
        Ok(self.endpoints.insert_or_exists(bucket.to_string(), endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ObjectStoreConfig {
        ObjectStoreConfig::new("geds-test", "http://localhost:9000", "access", "secret")
    }

    #[test]
    fn reregistering_identical_config_is_ok() {
        let configs = ObjectStoreConfigs::new();
        configs.insert(config()).unwrap();
        configs.insert(config()).unwrap();
        assert_eq!(configs.list().len(), 1);
    }

    #[test]
    fn conflicting_config_is_already_exists() {
        let configs = ObjectStoreConfigs::new();
        configs.insert(config()).unwrap();
        let mut other = config();
        other.endpoint_url = "http://other:9000".to_string();
        match configs.insert(other) {
            Err(Error::AlreadyExists(_)) => (),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rotating_the_secret_is_not_a_conflict() {
        let configs = ObjectStoreConfigs::new();
        configs.insert(config()).unwrap();
        let mut rotated = config();
        rotated.secret_key = "rotated".to_string();
        configs.insert(rotated).unwrap();
    }

    #[test]
    fn unregistered_bucket_is_not_found() {
        let stores = ObjectStores::new();
        assert!(stores.get("missing-bucket").is_err());
        stores.register(config()).unwrap();
        assert!(stores.get("geds-test").is_ok());
        assert!(stores.is_registered("geds-test"));
    }
}
