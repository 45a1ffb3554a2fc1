//! Cache pool: the public orchestrator over the key scheme, codec,
//! scripts, and locks

use std::collections::HashMap;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{Client, Pipeline, Value};

use crate::codec::{self, CompressionMethod, SerializationMethod};
use crate::config::{CacheConfig, RedisConfig};
use crate::entry::{CacheEntry, StoredMeta};
use crate::error::CacheError;
use crate::keys::{validate_key, KeyScheme};
use crate::lock::LockManager;
use crate::scripts::{item_records, meta_fields, value_bytes, ScriptEngine};

/// Default chunk size for prefix-scoped scans
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Tagged, lockable cache pool backed by a Redis server.
///
/// Reads run through server-side atomic scripts so the hit counter can
/// never be corrupted by concurrent readers. Writes are pipelined (one
/// round trip, no atomicity across the constituent commands) and rejected
/// while an advisory lock is held on the entry's key.
pub struct RedisCachePool {
  conn: ConnectionManager,
  config: CacheConfig,
  compression: CompressionMethod,
  serialization: SerializationMethod,
  keys: KeyScheme,
  locks: LockManager,
  scripts: ScriptEngine,
  deferred: Vec<CacheEntry>,
  delete_all: bool,
}

impl RedisCachePool {
  /// Connect to Redis and build a pool.
  ///
  /// Fails when the configured default compression or serialization method
  /// name is unrecognized.
  pub async fn connect(redis: &RedisConfig, config: CacheConfig) -> Result<Self, CacheError> {
    let client = Client::open(redis.connection_url())?;
    let conn = ConnectionManager::new(client).await?;
    Self::new(conn, config)
  }

  /// Build a pool over an existing connection.
  pub fn new(conn: ConnectionManager, config: CacheConfig) -> Result<Self, CacheError> {
    let compression = config
      .compression
      .parse::<CompressionMethod>()
      .map_err(CacheError::Config)?;
    let serialization = config
      .serialization
      .parse::<SerializationMethod>()
      .map_err(CacheError::Config)?;

    let keys = KeyScheme::new(config.prefix.clone());
    let locks = LockManager::new(conn.clone(), keys.clone(), config.lock_ttl);

    Ok(Self {
      conn,
      config,
      compression,
      serialization,
      keys,
      locks,
      scripts: ScriptEngine::new(),
      deferred: Vec::new(),
      delete_all: false,
    })
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  /// The advisory lock manager for this pool's key space
  pub fn locks(&self) -> &LockManager {
    &self.locks
  }

  // ---------------------------------------------------------------------
  // Reads
  // ---------------------------------------------------------------------

  /// Fetch one entry, incrementing its hit counter atomically when it
  /// exists. Returns a miss entry otherwise.
  pub async fn get_item(&self, key: &str) -> Result<CacheEntry, CacheError> {
    validate_key(key)?;

    let script_keys = vec![self.keys.item_key(key), self.keys.meta_key(key)];
    let mut conn = self.conn.clone();
    let result = self
      .scripts
      .get_item
      .invoke(&mut conn, &script_keys, &[])
      .await?;

    let mut parts = match result {
      Value::Array(parts) => parts.into_iter(),
      _ => return Ok(CacheEntry::miss(key)),
    };
    let value = parts.next().and_then(value_bytes);
    let fields = parts.next().map(meta_fields).unwrap_or_default();

    match value {
      Some(bytes) => Ok(self.hydrate(key, &bytes, &fields)),
      None => Ok(CacheEntry::miss(key)),
    }
  }

  /// Fetch multiple entries, incrementing hit counters atomically.
  ///
  /// Keys with no value record are omitted from the result entirely;
  /// callers needing misses must diff against their request list.
  pub async fn get_items(&self, keys: &[&str]) -> Result<Vec<CacheEntry>, CacheError> {
    if keys.is_empty() {
      return Ok(Vec::new());
    }

    let mut script_keys = Vec::with_capacity(keys.len() * 2);
    for key in keys {
      validate_key(key)?;
      script_keys.push(self.keys.item_key(key));
      script_keys.push(self.keys.meta_key(key));
    }

    let mut conn = self.conn.clone();
    let result = self
      .scripts
      .get_items
      .invoke(&mut conn, &script_keys, &[])
      .await?;

    Ok(self.hydrate_records(result))
  }

  /// Does a value record exist for this key? Does not touch hit counters.
  pub async fn has_item(&self, key: &str) -> Result<bool, CacheError> {
    validate_key(key)?;
    let mut conn = self.conn.clone();
    let exists: bool = redis::cmd("EXISTS")
      .arg(self.keys.item_key(key))
      .query_async(&mut conn)
      .await?;
    Ok(exists)
  }

  // ---------------------------------------------------------------------
  // Writes
  // ---------------------------------------------------------------------

  /// Persist an entry: meta hash, tag index updates, and the encoded value
  /// in one pipelined round trip.
  ///
  /// Returns `Ok(false)` without writing anything when the entry's key is
  /// locked. The pipeline is not a transaction; a connection failure can
  /// leave the constituent writes partially applied.
  pub async fn save(&self, entry: &CacheEntry) -> Result<bool, CacheError> {
    if self.locks.is_locked(entry.key()).await? {
      tracing::debug!("Save rejected, key is locked: {}", entry.key());
      return Ok(false);
    }

    let mut pipe = redis::pipe();
    self.stage_save(&mut pipe, entry);

    let mut conn = self.conn.clone();
    let _: () = pipe.query_async(&mut conn).await?;
    Ok(true)
  }

  /// Queue an entry for the next `commit`.
  pub fn save_deferred(&mut self, entry: CacheEntry) {
    self.deferred.push(entry);
  }

  /// Persist all deferred entries in one pipeline.
  ///
  /// Lock status is re-checked per entry first (the check needs its own
  /// round trip and cannot run inside the pipeline); entries found locked
  /// are silently dropped. The queue is cleared on commit. Returns
  /// `Ok(false)` when every queued entry was dropped.
  pub async fn commit(&mut self) -> Result<bool, CacheError> {
    if self.deferred.is_empty() {
      return Ok(true);
    }

    let queued = std::mem::take(&mut self.deferred);
    let mut pipe = redis::pipe();
    let mut staged = 0usize;

    for entry in &queued {
      if self.locks.is_locked(entry.key()).await? {
        tracing::debug!("Dropping deferred save, key is locked: {}", entry.key());
        continue;
      }
      self.stage_save(&mut pipe, entry);
      staged += 1;
    }

    if staged == 0 {
      return Ok(false);
    }

    let mut conn = self.conn.clone();
    let _: () = pipe.query_async(&mut conn).await?;
    Ok(true)
  }

  // ---------------------------------------------------------------------
  // Deletion
  // ---------------------------------------------------------------------

  /// Remove one entry's value and meta records (non-blocking unlink).
  ///
  /// The tag index is deliberately not updated: that would cost an extra
  /// round trip, and tag sets drift anyway as items expire. Orphaned
  /// members are swept lazily by `get_items_with_tag`.
  pub async fn delete_item(&self, key: &str) -> Result<bool, CacheError> {
    validate_key(key)?;
    let mut conn = self.conn.clone();
    let removed: i64 = redis::cmd("UNLINK")
      .arg(self.keys.item_key(key))
      .arg(self.keys.meta_key(key))
      .query_async(&mut conn)
      .await?;
    Ok(removed > 0)
  }

  /// Remove multiple entries' value and meta records. Same tag index
  /// caveat as `delete_item`.
  pub async fn delete_items(&self, keys: &[&str]) -> Result<bool, CacheError> {
    if keys.is_empty() {
      return Ok(true);
    }
    for key in keys {
      validate_key(key)?;
    }

    let mut cmd = redis::cmd("UNLINK");
    for key in keys {
      cmd.arg(self.keys.item_key(key)).arg(self.keys.meta_key(key));
    }

    let mut conn = self.conn.clone();
    let removed: i64 = cmd.query_async(&mut conn).await?;
    Ok(removed > 0)
  }

  // ---------------------------------------------------------------------
  // Prefix-scoped operations
  // ---------------------------------------------------------------------

  /// Fetch every entry whose logical key starts with `prefix`, in scan
  /// chunks of `batch_size`, incrementing hit counters as usual.
  pub async fn get_items_with_prefix(
    &self,
    prefix: &str,
    batch_size: usize,
  ) -> Result<Vec<CacheEntry>, CacheError> {
    validate_key(prefix)?;

    let pattern = format!("{}*", self.keys.item_key(prefix));
    let mut conn = self.conn.clone();
    let mut items = Vec::new();
    let mut cursor: u64 = 0;

    loop {
      let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(&pattern)
        .arg("COUNT")
        .arg(batch_size)
        .query_async(&mut conn)
        .await?;

      for chunk in page.chunks(batch_size.max(1)) {
        let mut script_keys = Vec::with_capacity(chunk.len() * 2);
        for item_key in chunk {
          let logical = self.keys.logical_key(item_key);
          script_keys.push(item_key.clone());
          script_keys.push(self.keys.meta_key(logical));
        }
        let result = self
          .scripts
          .get_items
          .invoke(&mut conn, &script_keys, &[])
          .await?;
        items.extend(self.hydrate_records(result));
      }

      cursor = next;
      if cursor == 0 {
        break;
      }
    }

    Ok(items)
  }

  /// Unlink every entry whose logical key starts with `prefix`, in scan
  /// chunks of `batch_size`.
  pub async fn delete_items_with_prefix(
    &mut self,
    prefix: &str,
    batch_size: usize,
  ) -> Result<bool, CacheError> {
    // clear() arms a one-shot flag that widens the pattern to the whole
    // keyspace (all four namespaces), skipping prefix validation.
    let pattern = if self.delete_all {
      self.delete_all = false;
      format!("{}*", self.keys.prefix())
    } else {
      validate_key(prefix)?;
      format!("{}*", self.keys.item_key(prefix))
    };

    let mut conn = self.conn.clone();
    let mut cursor: u64 = 0;
    let mut found = false;
    let mut removed: i64 = 0;

    loop {
      let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(&pattern)
        .arg("COUNT")
        .arg(batch_size)
        .query_async(&mut conn)
        .await?;

      for chunk in page.chunks(batch_size.max(1)) {
        if chunk.is_empty() {
          continue;
        }
        found = true;
        let mut cmd = redis::cmd("UNLINK");
        for key in chunk {
          cmd.arg(key);
          // Item keys drag their meta record along; keys from other
          // namespaces (whole-keyspace mode) are unlinked as-is.
          let logical = self.keys.logical_key(key);
          if logical != key.as_str() {
            cmd.arg(self.keys.meta_key(logical));
          }
        }
        let unlinked: i64 = cmd.query_async(&mut conn).await?;
        removed += unlinked;
      }

      cursor = next;
      if cursor == 0 {
        break;
      }
    }

    if !found {
      return Ok(true);
    }
    Ok(removed > 0)
  }

  /// Wipe the pool's entire key space: item, meta, lock, and tag
  /// namespaces under the configured prefix.
  pub async fn clear(&mut self) -> Result<bool, CacheError> {
    tracing::debug!("Clearing cache keyspace, prefix: {:?}", self.keys.prefix());
    self.delete_all = true;
    match self
      .delete_items_with_prefix("", DEFAULT_BATCH_SIZE)
      .await
    {
      Err(CacheError::InvalidKey(_)) => Ok(false),
      result => result,
    }
  }

  // ---------------------------------------------------------------------
  // Tag-scoped operations
  // ---------------------------------------------------------------------

  /// Fetch every entry carrying a tag, incrementing hit counters.
  ///
  /// This is the one place ordinary reads reconcile the tag index: members
  /// whose item record no longer exists are swept out of the tag set.
  pub async fn get_items_with_tag(&self, tag: &str) -> Result<Vec<CacheEntry>, CacheError> {
    let script_keys = vec![self.keys.tag_key(tag)];
    let item_prefix = self.keys.item_key("");
    let meta_prefix = self.keys.meta_key("");

    let mut conn = self.conn.clone();
    let result = self
      .scripts
      .get_items_with_tag
      .invoke(&mut conn, &script_keys, &[&item_prefix, &meta_prefix])
      .await?;

    Ok(self.hydrate_records(result))
  }

  /// Unlink every entry currently in a tag's index set, plus the set
  /// itself.
  pub async fn delete_items_with_tag(&self, tag: &str) -> Result<bool, CacheError> {
    let tag_key = self.keys.tag_key(tag);
    let mut conn = self.conn.clone();
    let members: Vec<String> = redis::cmd("SMEMBERS")
      .arg(&tag_key)
      .query_async(&mut conn)
      .await?;

    let mut cmd = redis::cmd("UNLINK");
    for key in &members {
      cmd.arg(self.keys.item_key(key)).arg(self.keys.meta_key(key));
    }
    cmd.arg(&tag_key);

    let removed: i64 = cmd.query_async(&mut conn).await?;
    Ok(removed > 0)
  }

  /// Remove a tag from the persisted `tags` list of every member of its
  /// index set, then delete the set.
  ///
  /// Returns the number of set members processed. Members that had already
  /// lost the tag, or that have no meta record at all, still count; this is
  /// not a modified-record count.
  pub async fn delete_tag(&self, tag: &str) -> Result<i64, CacheError> {
    let script_keys = vec![self.keys.tag_key(tag)];
    let meta_prefix = self.keys.meta_key("");

    let mut conn = self.conn.clone();
    let result = self
      .scripts
      .delete_tag
      .invoke(&mut conn, &script_keys, &[&meta_prefix, tag])
      .await?;

    match result {
      Value::Int(count) => Ok(count),
      _ => Ok(0),
    }
  }

  // ---------------------------------------------------------------------
  // Internals
  // ---------------------------------------------------------------------

  fn hydrate(
    &self,
    logical_key: &str,
    bytes: &[u8],
    fields: &HashMap<String, String>,
  ) -> CacheEntry {
    let stored = StoredMeta::from_hash(fields);
    let value = codec::decode_value(bytes, &stored.config);
    CacheEntry::hydrated(logical_key, value, stored)
  }

  fn hydrate_records(&self, result: Value) -> Vec<CacheEntry> {
    item_records(result)
      .into_iter()
      .map(|(item_key, bytes, fields)| {
        let logical = self.keys.logical_key(&item_key).to_string();
        self.hydrate(&logical, &bytes, &fields)
      })
      .collect()
  }

  /// Stage one entry's save commands onto a pipeline.
  ///
  /// The entry's absolute expiry is converted to a relative TTL at write
  /// time; a non-positive result produces persistent records. The hit
  /// count is written back exactly as carried by the entry object, which
  /// can freeze increments made by concurrent readers since this entry was
  /// hydrated. That tradeoff is part of the contract.
  fn stage_save(&self, pipe: &mut Pipeline, entry: &CacheEntry) {
    let now = Utc::now().timestamp();
    let ttl = entry.expiration_timestamp().map(|at| (at - now).max(0));
    let expiring_ttl = ttl.filter(|t| *t > 0);

    // Adapter-wide forced tags merge into (and deduplicate against) the
    // entry's own tags.
    let mut tags: Vec<String> = Vec::new();
    for tag in self.config.tags.iter().chain(entry.tags()) {
      if !tags.contains(tag) {
        tags.push(tag.clone());
      }
    }

    let serialization = entry.serialization_method().unwrap_or(self.serialization);
    let compression = entry.compression_method().unwrap_or(self.compression);
    let (payload, codec_config) = codec::encode_value(
      entry.value(),
      serialization,
      compression,
      self.config.compression_min_bytes,
    );

    let mut fields: Vec<(&str, String)> = vec![
      (
        "tags",
        serde_json::to_string(&tags).unwrap_or_else(|_| "[]".to_string()),
      ),
      ("hits", entry.hits().to_string()),
      ("created_at", entry.created_at().unwrap_or(now).to_string()),
      ("last_updated", now.to_string()),
      (
        "expires_at",
        entry
          .expiration_timestamp()
          .map(|at| at.to_string())
          .unwrap_or_default(),
      ),
      (
        "config",
        serde_json::to_string(&codec_config).unwrap_or_else(|_| "{}".to_string()),
      ),
    ];
    if !entry.meta().is_empty() {
      fields.push((
        "meta",
        serde_json::Value::Object(entry.meta().clone()).to_string(),
      ));
    }

    let item_key = self.keys.item_key(entry.key());
    let meta_key = self.keys.meta_key(entry.key());

    pipe.cmd("HSET").arg(&meta_key);
    for (field, value) in &fields {
      pipe.arg(*field).arg(value);
    }
    pipe.ignore();

    if let Some(ttl) = expiring_ttl {
      pipe.cmd("EXPIRE").arg(&meta_key).arg(ttl).ignore();
    } else {
      pipe.cmd("PERSIST").arg(&meta_key).ignore();
    }

    // Tag index holds logical (unprefixed) keys
    for tag in &tags {
      pipe
        .cmd("SADD")
        .arg(self.keys.tag_key(tag))
        .arg(entry.key())
        .ignore();
    }
    for tag in entry.removed_tags() {
      pipe
        .cmd("SREM")
        .arg(self.keys.tag_key(tag))
        .arg(entry.key())
        .ignore();
    }

    if let Some(ttl) = expiring_ttl {
      pipe
        .cmd("SET")
        .arg(&item_key)
        .arg(&payload)
        .arg("EX")
        .arg(ttl)
        .ignore();
    } else {
      pipe.cmd("SET").arg(&item_key).arg(&payload).ignore();
    }
  }
}
