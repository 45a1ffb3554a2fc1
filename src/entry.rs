//! Cache entry types

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::{CodecConfig, CompressionMethod, SerializationMethod};

/// Cache value types (JSON-compatible)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheValue {
  #[default]
  Null,
  String(String),
  Integer(i64),
  Json(Value),
}

impl CacheValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      CacheValue::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      CacheValue::Integer(i) => Some(*i),
      CacheValue::String(s) => s.parse().ok(),
      _ => None,
    }
  }

  /// Raw string form used by the `none` serialization method
  pub fn to_raw_string(&self) -> String {
    match self {
      CacheValue::Null => String::new(),
      CacheValue::String(s) => s.clone(),
      CacheValue::Integer(i) => i.to_string(),
      CacheValue::Json(v) => v.to_string(),
    }
  }

  /// Rebuild a value from its raw stored bytes, sniffing integers and JSON
  /// structures out of the string form.
  pub fn from_raw(bytes: &[u8]) -> Self {
    CacheValue::from(String::from_utf8_lossy(bytes).into_owned())
  }
}

impl From<String> for CacheValue {
  fn from(s: String) -> Self {
    if let Ok(v) = serde_json::from_str::<Value>(&s) {
      return CacheValue::from(v);
    }
    CacheValue::String(s)
  }
}

impl From<&str> for CacheValue {
  fn from(s: &str) -> Self {
    CacheValue::from(s.to_string())
  }
}

impl From<i64> for CacheValue {
  fn from(i: i64) -> Self {
    CacheValue::Integer(i)
  }
}

impl From<Value> for CacheValue {
  fn from(v: Value) -> Self {
    match v {
      Value::Null => CacheValue::Null,
      Value::Number(n) => {
        if let Some(i) = n.as_i64() {
          CacheValue::Integer(i)
        } else {
          CacheValue::Json(Value::Number(n))
        }
      }
      Value::String(s) => CacheValue::String(s),
      other => CacheValue::Json(other),
    }
  }
}

/// Meta record fields as persisted in the Redis meta hash.
///
/// Parsing is tolerant: missing or malformed fields fall back to defaults,
/// and an empty-string `expires_at` means no expiration (Redis hash fields
/// written as null read back as empty strings).
#[derive(Debug, Clone, Default)]
pub struct StoredMeta {
  pub tags: Vec<String>,
  pub meta: Map<String, Value>,
  pub hits: i64,
  pub created_at: Option<i64>,
  pub last_updated: Option<i64>,
  pub expires_at: Option<i64>,
  pub config: CodecConfig,
}

impl StoredMeta {
  pub fn from_hash(fields: &HashMap<String, String>) -> Self {
    let tags = fields
      .get("tags")
      .and_then(|s| serde_json::from_str(s).ok())
      .unwrap_or_default();
    let meta = fields
      .get("meta")
      .and_then(|s| serde_json::from_str(s).ok())
      .unwrap_or_default();
    let hits = fields.get("hits").and_then(|s| s.parse().ok()).unwrap_or(0);
    let created_at = fields.get("created_at").and_then(|s| s.parse().ok());
    let last_updated = fields.get("last_updated").and_then(|s| s.parse().ok());
    let expires_at = fields
      .get("expires_at")
      .filter(|s| !s.is_empty())
      .and_then(|s| s.parse().ok());
    let config = fields
      .get("config")
      .and_then(|s| serde_json::from_str(s).ok())
      .unwrap_or_default();

    Self {
      tags,
      meta,
      hits,
      created_at,
      last_updated,
      expires_at,
      config,
    }
  }
}

/// One cache record, as held by a caller.
///
/// Constructed as a miss (no value, `is_hit` false) or hydrated from a
/// store read. The logical key is fixed for the entry's lifetime; every
/// other field is mutable. Tag and metadata removals are accumulated as
/// deltas, consumed once by the next save and never persisted themselves.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  key: String,
  value: CacheValue,
  is_hit: bool,
  expires_at: Option<i64>,
  tags: Vec<String>,
  meta: Map<String, Value>,
  hits: i64,
  created_at: Option<i64>,
  last_updated: Option<i64>,
  compression: Option<CompressionMethod>,
  serialization: Option<SerializationMethod>,
  removed_tags: Vec<String>,
  removed_meta: Vec<String>,
}

impl CacheEntry {
  /// Construct a miss entry for a key not (yet) present in the store
  pub fn miss(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      value: CacheValue::Null,
      is_hit: false,
      expires_at: None,
      tags: Vec::new(),
      meta: Map::new(),
      hits: 0,
      created_at: None,
      last_updated: None,
      compression: None,
      serialization: None,
      removed_tags: Vec::new(),
      removed_meta: Vec::new(),
    }
  }

  /// Construct a hit entry from a decoded value and its stored meta record
  pub fn hydrated(key: impl Into<String>, value: CacheValue, stored: StoredMeta) -> Self {
    Self {
      key: key.into(),
      value,
      is_hit: true,
      expires_at: stored.expires_at,
      tags: stored.tags,
      meta: stored.meta,
      hits: stored.hits,
      created_at: stored.created_at,
      last_updated: stored.last_updated,
      compression: Some(stored.config.compression),
      serialization: Some(stored.config.serialization),
      removed_tags: Vec::new(),
      removed_meta: Vec::new(),
    }
  }

  /// Logical (unprefixed) key
  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn value(&self) -> &CacheValue {
    &self.value
  }

  pub fn set_value(&mut self, value: impl Into<CacheValue>) {
    self.value = value.into();
  }

  /// Was this entry materialized from an existing store record?
  pub fn is_hit(&self) -> bool {
    self.is_hit
  }

  // ---------------------------------------------------------------------
  // Expiration
  // ---------------------------------------------------------------------

  /// Expire at an absolute instant; `None` clears the expiration
  pub fn expires_at(&mut self, at: Option<DateTime<Utc>>) {
    self.expires_at = at.map(|dt| dt.timestamp());
  }

  /// Expire after a duration from now; `None` clears the expiration
  pub fn expires_after(&mut self, ttl: Option<Duration>) {
    self.expires_at = ttl.map(|d| Utc::now().timestamp() + d.as_secs() as i64);
  }

  pub fn has_expiration(&self) -> bool {
    self.expires_at.is_some()
  }

  /// Absolute expiration as a unix timestamp, `None` when persistent
  pub fn expiration_timestamp(&self) -> Option<i64> {
    self.expires_at
  }

  /// Seconds until expiration, saturating at zero
  pub fn time_until_expiration(&self) -> Option<Duration> {
    self
      .expires_at
      .map(|at| Duration::from_secs((at - Utc::now().timestamp()).max(0) as u64))
  }

  // ---------------------------------------------------------------------
  // Tags
  // ---------------------------------------------------------------------

  /// Replace the tag set. Tags present before and absent after join the
  /// removal delta.
  pub fn set_tags<I, S>(&mut self, tags: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let new_tags = dedup(tags.into_iter().map(Into::into));
    for old in &self.tags {
      if !new_tags.contains(old) && !self.removed_tags.contains(old) {
        self.removed_tags.push(old.clone());
      }
    }
    self.tags = new_tags;
  }

  pub fn add_tags<I, S>(&mut self, tags: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    for tag in tags {
      let tag = tag.into();
      if !self.tags.contains(&tag) {
        self.tags.push(tag);
      }
    }
  }

  pub fn remove_tags<I, S>(&mut self, tags: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    for tag in tags {
      let tag = tag.into();
      self.tags.retain(|t| t != &tag);
      if !self.removed_tags.contains(&tag) {
        self.removed_tags.push(tag);
      }
    }
  }

  pub fn tags(&self) -> &[String] {
    &self.tags
  }

  /// Tags removed since this entry was last read from the store
  pub fn removed_tags(&self) -> &[String] {
    &self.removed_tags
  }

  pub fn has_tag(&self, tag: &str) -> bool {
    self.tags.iter().any(|t| t == tag)
  }

  pub fn has_any_tags(&self, tags: &[&str]) -> bool {
    tags.iter().any(|tag| self.has_tag(tag))
  }

  pub fn has_all_tags(&self, tags: &[&str]) -> bool {
    tags.iter().all(|tag| self.has_tag(tag))
  }

  // ---------------------------------------------------------------------
  // Caller metadata
  // ---------------------------------------------------------------------

  /// Replace the metadata map. Keys present before and absent after join
  /// the removal delta.
  pub fn set_meta(&mut self, meta: Map<String, Value>) {
    for old in self.meta.keys() {
      if !meta.contains_key(old) && !self.removed_meta.iter().any(|k| k == old) {
        self.removed_meta.push(old.clone());
      }
    }
    self.meta = meta;
  }

  /// Merge keys into the metadata map, overwriting existing values
  pub fn add_meta(&mut self, meta: Map<String, Value>) {
    for (key, value) in meta {
      self.meta.insert(key, value);
    }
  }

  pub fn remove_meta<I, S>(&mut self, keys: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    for key in keys {
      let key = key.into();
      self.meta.remove(&key);
      if !self.removed_meta.contains(&key) {
        self.removed_meta.push(key);
      }
    }
  }

  pub fn meta(&self) -> &Map<String, Value> {
    &self.meta
  }

  /// Look up a metadata value by dot-separated path
  pub fn meta_value(&self, path: &str) -> Option<&Value> {
    let mut parts = path.split('.');
    let mut current = self.meta.get(parts.next()?)?;
    for part in parts {
      current = current.as_object()?.get(part)?;
    }
    Some(current)
  }

  /// Does a top-level metadata key exist?
  pub fn has_meta(&self, key: &str) -> bool {
    self.meta.contains_key(key)
  }

  /// Metadata keys removed since this entry was last read from the store
  pub fn removed_meta_keys(&self) -> &[String] {
    &self.removed_meta
  }

  // ---------------------------------------------------------------------
  // Server bookkeeping
  // ---------------------------------------------------------------------

  /// Hit count as carried by this entry object.
  ///
  /// The counter is incremented server-side by read operations only; a save
  /// writes this value back, freezing any increments other readers made in
  /// the meantime.
  pub fn hits(&self) -> i64 {
    self.hits
  }

  pub fn created_at(&self) -> Option<i64> {
    self.created_at
  }

  pub fn last_updated(&self) -> Option<i64> {
    self.last_updated
  }

  // ---------------------------------------------------------------------
  // Per-entry codec overrides
  // ---------------------------------------------------------------------

  /// Override the compression method for this entry. Unrecognized method
  /// names are silently ignored.
  pub fn set_compression_method(&mut self, method: &str) {
    if let Ok(parsed) = method.parse::<CompressionMethod>() {
      self.compression = Some(parsed);
    }
  }

  pub fn compression_method(&self) -> Option<CompressionMethod> {
    self.compression
  }

  /// Override the serialization method for this entry. Unrecognized method
  /// names are silently ignored.
  pub fn set_serialization_method(&mut self, method: &str) {
    if let Ok(parsed) = method.parse::<SerializationMethod>() {
      self.serialization = Some(parsed);
    }
  }

  pub fn serialization_method(&self) -> Option<SerializationMethod> {
    self.serialization
  }
}

fn dedup(tags: impl Iterator<Item = String>) -> Vec<String> {
  let mut out: Vec<String> = Vec::new();
  for tag in tags {
    if !out.contains(&tag) {
      out.push(tag);
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_miss_entry_defaults() {
    let entry = CacheEntry::miss("user-1");
    assert_eq!(entry.key(), "user-1");
    assert!(!entry.is_hit());
    assert_eq!(entry.value(), &CacheValue::Null);
    assert_eq!(entry.hits(), 0);
    assert!(!entry.has_expiration());
    assert!(entry.tags().is_empty());
  }

  #[test]
  fn test_tag_removal_delta_accumulates() {
    let mut entry = CacheEntry::miss("k");
    entry.set_tags(["a", "b", "c"]);
    assert!(entry.removed_tags().is_empty());

    entry.set_tags(["b"]);
    assert_eq!(entry.removed_tags(), ["a", "c"]);

    entry.remove_tags(["b"]);
    assert!(entry.tags().is_empty());
    assert_eq!(entry.removed_tags(), ["a", "c", "b"]);

    // Deltas deduplicate across mutations
    entry.remove_tags(["a"]);
    assert_eq!(entry.removed_tags(), ["a", "c", "b"]);
  }

  #[test]
  fn test_tags_deduplicated() {
    let mut entry = CacheEntry::miss("k");
    entry.set_tags(["a", "a", "b"]);
    assert_eq!(entry.tags(), ["a", "b"]);

    entry.add_tags(["b", "c"]);
    assert_eq!(entry.tags(), ["a", "b", "c"]);

    assert!(entry.has_tag("a"));
    assert!(entry.has_any_tags(&["z", "c"]));
    assert!(entry.has_all_tags(&["a", "b"]));
    assert!(!entry.has_all_tags(&["a", "z"]));
  }

  #[test]
  fn test_meta_removal_delta() {
    let mut entry = CacheEntry::miss("k");
    let mut meta = Map::new();
    meta.insert("owner".to_string(), Value::String("ops".to_string()));
    meta.insert("ttl_hint".to_string(), Value::from(60));
    entry.set_meta(meta);

    let mut replacement = Map::new();
    replacement.insert("owner".to_string(), Value::String("dev".to_string()));
    entry.set_meta(replacement);
    assert_eq!(entry.removed_meta_keys(), ["ttl_hint"]);

    entry.remove_meta(["owner"]);
    assert!(entry.meta().is_empty());
    assert_eq!(entry.removed_meta_keys(), ["ttl_hint", "owner"]);
  }

  #[test]
  fn test_meta_dot_path() {
    let mut entry = CacheEntry::miss("k");
    let mut meta = Map::new();
    meta.insert(
      "build".to_string(),
      serde_json::json!({"host": {"os": "linux"}}),
    );
    entry.set_meta(meta);

    assert_eq!(
      entry.meta_value("build.host.os"),
      Some(&Value::String("linux".to_string()))
    );
    assert!(entry.meta_value("build.host.arch").is_none());
    assert!(entry.has_meta("build"));
    assert!(!entry.has_meta("host"));
  }

  #[test]
  fn test_expiration_setters() {
    let mut entry = CacheEntry::miss("k");
    entry.expires_after(Some(Duration::from_secs(120)));
    assert!(entry.has_expiration());
    let remaining = entry.time_until_expiration().unwrap();
    assert!(remaining <= Duration::from_secs(120));
    assert!(remaining >= Duration::from_secs(118));

    entry.expires_after(None);
    assert!(!entry.has_expiration());
    assert!(entry.time_until_expiration().is_none());

    let at = Utc::now() + chrono::Duration::hours(1);
    entry.expires_at(Some(at));
    assert_eq!(entry.expiration_timestamp(), Some(at.timestamp()));
  }

  #[test]
  fn test_invalid_codec_overrides_ignored() {
    let mut entry = CacheEntry::miss("k");
    entry.set_compression_method("zstd");
    assert_eq!(entry.compression_method(), Some(CompressionMethod::Zstd));
    entry.set_compression_method("lz77");
    assert_eq!(entry.compression_method(), Some(CompressionMethod::Zstd));

    entry.set_serialization_method("msgpack");
    assert_eq!(
      entry.serialization_method(),
      Some(SerializationMethod::MsgPack)
    );
    entry.set_serialization_method("yaml");
    assert_eq!(
      entry.serialization_method(),
      Some(SerializationMethod::MsgPack)
    );
  }

  #[test]
  fn test_stored_meta_parsing() {
    let mut fields = HashMap::new();
    fields.insert("tags".to_string(), r#"["a","b"]"#.to_string());
    fields.insert("hits".to_string(), "7".to_string());
    fields.insert("created_at".to_string(), "1700000000".to_string());
    fields.insert("last_updated".to_string(), "1700000100".to_string());
    fields.insert("expires_at".to_string(), String::new());
    fields.insert(
      "config".to_string(),
      r#"{"compressed":false,"compression":"gzip","serialization":"json"}"#.to_string(),
    );

    let stored = StoredMeta::from_hash(&fields);
    assert_eq!(stored.tags, ["a", "b"]);
    assert_eq!(stored.hits, 7);
    assert_eq!(stored.created_at, Some(1700000000));
    assert_eq!(stored.expires_at, None);
    assert_eq!(stored.config.compression, CompressionMethod::Gzip);

    let entry = CacheEntry::hydrated("k", CacheValue::from("v"), stored);
    assert!(entry.is_hit());
    assert_eq!(entry.hits(), 7);
    assert_eq!(entry.compression_method(), Some(CompressionMethod::Gzip));
  }

  #[test]
  fn test_value_sniffing() {
    assert_eq!(CacheValue::from_raw(b"42"), CacheValue::Integer(42));
    assert_eq!(
      CacheValue::from_raw(b"plain text"),
      CacheValue::String("plain text".to_string())
    );
    assert_eq!(
      CacheValue::from_raw(br#"{"a":1}"#),
      CacheValue::Json(serde_json::json!({"a": 1}))
    );
    assert_eq!(CacheValue::from_raw(b""), CacheValue::String(String::new()));
  }
}
