//! Cross-module behavior that needs no Redis server

use std::collections::HashMap;

use serde_json::json;
use tagcache::{
  codec, validate_key, CacheConfig, CacheEntry, CacheValue, CodecConfig, CompressionMethod,
  KeyScheme, RedisConfig, SerializationMethod, StoredMeta,
};

// ============================================================
// Configuration
// ============================================================

#[test]
fn test_cache_config_defaults_from_empty_json() {
  let config: CacheConfig = serde_json::from_str("{}").unwrap();
  assert_eq!(config.prefix, "");
  assert!(config.tags.is_empty());
  assert_eq!(config.compression, "gzip");
  assert_eq!(config.compression_min_bytes, 1024);
  assert_eq!(config.serialization, "json");
  assert_eq!(config.lock_ttl, 30);
}

#[test]
fn test_cache_config_partial_json() {
  let config: CacheConfig = serde_json::from_str(
    r#"{"prefix": "app:", "compression": "none", "tags": ["env-prod"]}"#,
  )
  .unwrap();
  assert_eq!(config.prefix, "app:");
  assert_eq!(config.compression, "none");
  assert_eq!(config.tags, ["env-prod"]);
  assert_eq!(config.serialization, "json");
}

#[test]
fn test_redis_config_urls() {
  let config = RedisConfig::default();
  assert_eq!(config.connection_url(), "redis://localhost:6379/0");

  let config = RedisConfig {
    host: "cache.internal".to_string(),
    port: 6380,
    password: Some("s3cret".to_string()),
    database: 2,
    tls_enabled: true,
  };
  assert_eq!(
    config.connection_url(),
    "rediss://:s3cret@cache.internal:6380/2"
  );
}

// ============================================================
// Key scheme
// ============================================================

#[test]
fn test_key_namespaces_share_logical_key() {
  let keys = KeyScheme::new("app:".to_string());
  assert_eq!(keys.item_key("user-1"), "app:item|user-1");
  assert_eq!(keys.meta_key("user-1"), "app:meta|user-1");
  assert_eq!(keys.lock_key("user-1"), "app:lock|user-1");
  assert_eq!(keys.tag_key("prod"), "app:tag|prod");
}

#[test]
fn test_logical_key_roundtrip() {
  let keys = KeyScheme::new("app:".to_string());
  let item = keys.item_key("user-1");
  assert_eq!(keys.logical_key(&item), "user-1");
  // Keys from other namespaces pass through unchanged
  assert_eq!(keys.logical_key("app:meta|user-1"), "app:meta|user-1");
  assert_eq!(keys.logical_key("unrelated"), "unrelated");
}

#[test]
fn test_reserved_key_characters_rejected() {
  for key in ["a{b", "a}b", "a(b", "a)b", "a/b", "a\\b", "a@b", "a:b", ""] {
    assert!(validate_key(key).is_err(), "{key:?} should be rejected");
  }
  for key in ["user-1", "user_1", "user.1", "USER 1"] {
    assert!(validate_key(key).is_ok(), "{key:?} should be accepted");
  }
}

// ============================================================
// Codec: persisted config drives decode
// ============================================================

#[test]
fn test_decode_uses_persisted_config_not_defaults() {
  let value = CacheValue::from(json!({"payload": "x".repeat(4096)}));

  // Written by a pool configured for zlib/json
  let (bytes, written) = codec::encode_value(
    &value,
    SerializationMethod::Json,
    CompressionMethod::Zlib,
    1024,
  );
  assert!(written.compressed);
  assert_eq!(written.compression, CompressionMethod::Zlib);

  // Read back by a pool whose defaults have since changed to gzip; the
  // persisted config wins.
  let decoded = codec::decode_value(&bytes, &written);
  assert_eq!(decoded, value);
}

#[test]
fn test_small_values_skip_compression() {
  let value = CacheValue::from("tiny");
  let (bytes, config) = codec::encode_value(
    &value,
    SerializationMethod::Json,
    CompressionMethod::Gzip,
    1024,
  );
  assert!(!config.compressed);
  assert_eq!(bytes, br#""tiny""#);
}

#[test]
fn test_none_methods_store_raw_string() {
  let value = CacheValue::from(42i64);
  let (bytes, config) = codec::encode_value(
    &value,
    SerializationMethod::None,
    CompressionMethod::None,
    0,
  );
  assert!(!config.compressed);
  assert_eq!(bytes, b"42");
  assert_eq!(codec::decode_value(&bytes, &config), value);
}

#[test]
fn test_method_names_parse_and_display() {
  for name in ["none", "gzip", "zlib", "zstd"] {
    let method: CompressionMethod = name.parse().unwrap();
    assert_eq!(method.to_string(), name);
  }
  for name in ["none", "json", "msgpack"] {
    let method: SerializationMethod = name.parse().unwrap();
    assert_eq!(method.to_string(), name);
  }
  assert!("bzip2".parse::<CompressionMethod>().is_err());
  assert!("yaml".parse::<SerializationMethod>().is_err());
}

// ============================================================
// Entry hydration from stored records
// ============================================================

#[test]
fn test_hydration_carries_stored_codec_overrides() {
  let mut fields = HashMap::new();
  fields.insert("tags".to_string(), r#"["reports"]"#.to_string());
  fields.insert("hits".to_string(), "3".to_string());
  fields.insert("created_at".to_string(), "1700000000".to_string());
  fields.insert("last_updated".to_string(), "1700000500".to_string());
  fields.insert("expires_at".to_string(), "1800000000".to_string());
  fields.insert(
    "config".to_string(),
    r#"{"compressed":true,"compression":"zlib","serialization":"json"}"#.to_string(),
  );
  fields.insert("meta".to_string(), r#"{"owner":"ops"}"#.to_string());

  let stored = StoredMeta::from_hash(&fields);
  let entry = CacheEntry::hydrated("report-7", CacheValue::from("v"), stored);

  assert!(entry.is_hit());
  assert_eq!(entry.hits(), 3);
  assert_eq!(entry.tags(), ["reports"]);
  assert_eq!(entry.expiration_timestamp(), Some(1800000000));
  assert_eq!(entry.meta_value("owner"), Some(&json!("ops")));
  // Saving this entry re-encodes with the stored methods, not the pool
  // defaults. The compressed flag is recomputed at save time.
  assert_eq!(entry.compression_method(), Some(CompressionMethod::Zlib));
  assert_eq!(entry.serialization_method(), Some(SerializationMethod::Json));
}

#[test]
fn test_hydration_tolerates_sparse_meta() {
  let stored = StoredMeta::from_hash(&HashMap::new());
  assert_eq!(stored.hits, 0);
  assert_eq!(stored.expires_at, None);
  assert_eq!(stored.config, CodecConfig::default());

  let entry = CacheEntry::hydrated("k", CacheValue::Null, stored);
  assert!(entry.is_hit());
  assert!(!entry.has_expiration());
}
