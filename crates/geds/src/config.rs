//! Node configuration, settable through string/integer keys.

use geds_util::{Error, Result};

pub const DEFAULT_GEDS_PORT: u16 = 4381;
pub const DEFAULT_HTTP_SERVER_PORT: u16 = 4382;

/// Hadoop S3A uses 32 MiB blocks; the cache uses the same default.
pub const DEFAULT_CACHE_BLOCK_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct GedsConfig {
    /// Address of the metadata service, `{host}:{port}`.
    pub metadata_service_address: String,

    /// Data-plane listening address.
    pub listen_address: String,

    /// Hostname announced to peers. `None` asks the metadata service for the
    /// address it observes.
    pub hostname: Option<String>,

    /// Data-plane listening port.
    pub port: u16,

    /// Web server port (Prometheus endpoint).
    pub http_server_port: u16,

    /// Storage root for files created by this node. A trailing `XXXXXX` is
    /// replaced with a random suffix.
    pub local_storage_path: String,

    /// Block size used by the cached-handle hydration.
    pub cache_block_size: u64,

    /// Capacities reported to the metadata service with each heartbeat.
    pub available_local_storage: u64,
    pub available_local_memory: u64,
}

impl GedsConfig {
    pub fn new(metadata_service_address: impl Into<String>) -> Self {
        Self {
            metadata_service_address: metadata_service_address.into(),
            listen_address: "0.0.0.0".to_string(),
            hostname: None,
            port: DEFAULT_GEDS_PORT,
            http_server_port: DEFAULT_HTTP_SERVER_PORT,
            local_storage_path: "/tmp/geds_XXXXXX".to_string(),
            cache_block_size: DEFAULT_CACHE_BLOCK_SIZE,
            available_local_storage: 100 << 30,
            available_local_memory: 16 << 30,
        }
    }

    pub fn set_string(&mut self, key: &str, value: &str) -> Result<()> {
        tracing::debug!(key, value, "setting configuration key");
        match key {
            "listen_address" => self.listen_address = value.to_string(),
            "hostname" => {
                self.hostname = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "local_storage_path" => self.local_storage_path = value.to_string(),
            _ => return Err(Error::NotFound(format!("key {key} not found"))),
        }
        Ok(())
    }

    pub fn set_int(&mut self, key: &str, value: u64) -> Result<()> {
        tracing::debug!(key, value, "setting configuration key");
        if value == 0 {
            return Err(Error::InvalidArgument(format!(
                "value {value} is out of range for {key}"
            )));
        }
        let port_value = || -> Result<u16> {
            u16::try_from(value).map_err(|_| {
                Error::InvalidArgument(format!("value {value} is out of range for {key}"))
            })
        };
        match key {
            "port" => self.port = port_value()?,
            "http_server_port" => self.http_server_port = port_value()?,
            "cache_block_size" => self.cache_block_size = value,
            _ => return Err(Error::NotFound(format!("key {key} not found"))),
        }
        Ok(())
    }

    pub fn get_string(&self, key: &str) -> Result<String> {
        match key {
            "listen_address" => Ok(self.listen_address.clone()),
            "hostname" => Ok(self.hostname.clone().unwrap_or_default()),
            "local_storage_path" => Ok(self.local_storage_path.clone()),
            _ => Err(Error::NotFound(format!("key {key} not found"))),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<u64> {
        match key {
            "port" => Ok(self.port as u64),
            "http_server_port" => Ok(self.http_server_port as u64),
            "cache_block_size" => Ok(self.cache_block_size),
            _ => Err(Error::NotFound(format!("key {key} not found"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_keys_round_trip() {
        let mut config = GedsConfig::new("localhost:4380");
        config.set_string("listen_address", "127.0.0.1").unwrap();
        config.set_string("hostname", "node-1").unwrap();
        config.set_string("local_storage_path", "/var/tmp/geds").unwrap();
        assert_eq!(config.get_string("listen_address").unwrap(), "127.0.0.1");
        assert_eq!(config.get_string("hostname").unwrap(), "node-1");
        assert_eq!(config.get_string("local_storage_path").unwrap(), "/var/tmp/geds");

        // Clearing the hostname falls back to discovery.
        config.set_string("hostname", "").unwrap();
        assert_eq!(config.hostname, None);

        assert!(config.set_string("unknown_key", "x").unwrap_err().is_not_found());
        assert!(config.get_string("unknown_key").unwrap_err().is_not_found());
    }

    #[test]
    fn integer_keys_validate_ranges() {
        let mut config = GedsConfig::new("localhost:4380");
        config.set_int("port", 4000).unwrap();
        config.set_int("cache_block_size", 1 << 20).unwrap();
        assert_eq!(config.get_int("port").unwrap(), 4000);
        assert_eq!(config.get_int("cache_block_size").unwrap(), 1 << 20);

        assert!(matches!(
            config.set_int("port", 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            config.set_int("port", 70000),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            config.set_int("cache_block_size", 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(config.set_int("unknown_key", 1).unwrap_err().is_not_found());
    }

    #[test]
    fn http_port_is_gated_on_its_own_key() {
        let mut config = GedsConfig::new("localhost:4380");
        let before = config.http_server_port;
        config.set_int("port", 5000).unwrap();
        // Setting `port` must leave `http_server_port` untouched.
        assert_eq!(config.http_server_port, before);
        config.set_int("http_server_port", 5001).unwrap();
        assert_eq!(config.http_server_port, 5001);
        assert_eq!(config.port, 5000);
    }
}
