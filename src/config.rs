//! Cache configuration

use serde::{Deserialize, Serialize};

/// Cache pool configuration.
///
/// `compression` and `serialization` hold method names; they are parsed and
/// validated when the pool is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
  /// Key prefix automatically applied to all records
  #[serde(default)]
  pub prefix: String,

  /// Tags automatically added to every saved entry
  #[serde(default)]
  pub tags: Vec<String>,

  /// Default compression method name
  #[serde(default = "default_compression")]
  pub compression: String,

  /// Minimum serialized size, in bytes, before compression is applied
  #[serde(default = "default_compression_min_bytes")]
  pub compression_min_bytes: usize,

  /// Default serialization method name
  #[serde(default = "default_serialization")]
  pub serialization: String,

  /// Default lock TTL, in seconds
  #[serde(default = "default_lock_ttl")]
  pub lock_ttl: u64,
}

fn default_compression() -> String {
  "gzip".to_string()
}

fn default_compression_min_bytes() -> usize {
  1024
}

fn default_serialization() -> String {
  "json".to_string()
}

fn default_lock_ttl() -> u64 {
  30
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: String::new(),
      tags: Vec::new(),
      compression: default_compression(),
      compression_min_bytes: default_compression_min_bytes(),
      serialization: default_serialization(),
      lock_ttl: default_lock_ttl(),
    }
  }
}

/// Connection settings for the backing Redis server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
  /// Redis host
  #[serde(default = "default_host")]
  pub host: String,

  /// Redis port
  #[serde(default = "default_redis_port")]
  pub port: u16,

  /// Redis password (optional)
  #[serde(default)]
  pub password: Option<String>,

  /// Redis database number
  #[serde(default)]
  pub database: u8,

  /// Enable TLS
  #[serde(default)]
  pub tls_enabled: bool,
}

fn default_host() -> String {
  "localhost".to_string()
}

fn default_redis_port() -> u16 {
  6379
}

impl Default for RedisConfig {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_redis_port(),
      password: None,
      database: 0,
      tls_enabled: false,
    }
  }
}

impl RedisConfig {
  /// Generate the Redis connection URL
  pub fn connection_url(&self) -> String {
    let scheme = if self.tls_enabled { "rediss" } else { "redis" };
    let auth = match &self.password {
      Some(pwd) if !pwd.is_empty() => format!(":{}@", pwd),
      _ => String::new(),
    };
    format!(
      "{}://{}{}:{}/{}",
      scheme, auth, self.host, self.port, self.database
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_config_defaults() {
    let config = CacheConfig::default();
    assert_eq!(config.prefix, "");
    assert!(config.tags.is_empty());
    assert_eq!(config.compression, "gzip");
    assert_eq!(config.compression_min_bytes, 1024);
    assert_eq!(config.serialization, "json");
    assert_eq!(config.lock_ttl, 30);
  }

  #[test]
  fn test_connection_url() {
    let config = RedisConfig {
      host: "cache.internal".to_string(),
      port: 6380,
      password: Some("hunter2".to_string()),
      database: 2,
      tls_enabled: true,
    };
    assert_eq!(
      config.connection_url(),
      "rediss://:hunter2@cache.internal:6380/2"
    );

    let plain = RedisConfig {
      host: "localhost".to_string(),
      port: 6379,
      ..Default::default()
    };
    assert_eq!(plain.connection_url(), "redis://localhost:6379/0");
  }
}
