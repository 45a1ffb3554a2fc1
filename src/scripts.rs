//! Server-side atomic scripts
//!
//! Every operation that must not interleave with other callers (read with
//! hit increment, tag-scoped reads with orphan sweeps, tag deletion, lock
//! release/renewal) runs as a Lua script on the Redis server. Execution is
//! attempted by precomputed content hash (`EVALSHA`) first; only on the
//! specific "script not cached" error does it fall back to a single
//! upload-and-execute (`EVAL`). Other transport failures propagate.

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisResult, Value};

/// Read one value and, when present, increment the meta hit counter and
/// return the whole meta hash.
///
/// Returns `[value (or nil), meta field/value pairs]`.
pub const GET_ITEM: &str = r#"
local item_key = KEYS[1]
local meta_key = KEYS[2]
local value = redis.call('GET', item_key)
local meta = {}
if value ~= false then
    redis.call('HINCRBY', meta_key, 'hits', 1)
    meta = redis.call('HGETALL', meta_key)
end
return {value, meta}
"#;

/// Read multiple values by alternating item/meta key pairs, incrementing
/// hit counters for those present.
///
/// Returns a flat list of (item key, value, meta) triples; missing keys are
/// omitted entirely.
pub const GET_ITEMS: &str = r#"
local result = {}
for i = 1, #KEYS, 2 do
    local item_key = KEYS[i]
    local meta_key = KEYS[i + 1]
    local value = redis.call('GET', item_key)
    if value ~= false then
        redis.call('HINCRBY', meta_key, 'hits', 1)
        local meta = redis.call('HGETALL', meta_key)
        table.insert(result, item_key)
        table.insert(result, value)
        table.insert(result, meta)
    end
end
return result
"#;

/// Read every member of a tag set, incrementing hit counters, and sweep
/// members whose item record no longer exists out of the set.
///
/// KEYS[1] = tag set key, ARGV[1] = item key prefix, ARGV[2] = meta key
/// prefix. Orphans are removed in batches of 5000 to bound SREM argument
/// counts. Returns the same flat triple list as the multi-key read.
pub const GET_ITEMS_WITH_TAG: &str = r#"
local tag_key = KEYS[1]
local item_prefix = ARGV[1]
local meta_prefix = ARGV[2]
local members = redis.call('SMEMBERS', tag_key)
local result = {}
local orphaned = {}
for _, member in ipairs(members) do
    local item_key = item_prefix .. member
    local meta_key = meta_prefix .. member
    local value = redis.call('GET', item_key)
    if value == false then
        table.insert(orphaned, member)
    else
        redis.call('HINCRBY', meta_key, 'hits', 1)
        local meta = redis.call('HGETALL', meta_key)
        table.insert(result, item_key)
        table.insert(result, value)
        table.insert(result, meta)
    end
end
if #orphaned > 0 then
    for i = 1, #orphaned, 5000 do
        local batch = {}
        for j = i, math.min(i + 4999, #orphaned) do
            table.insert(batch, orphaned[j])
        end
        redis.call('SREM', tag_key, unpack(batch))
    end
end
return result
"#;

/// Remove a tag from the `tags` meta field of every member of its tag set,
/// then delete the set.
///
/// KEYS[1] = tag set key, ARGV[1] = meta key prefix, ARGV[2] = tag value.
/// Returns the number of members processed, which can exceed the number of
/// meta records actually rewritten.
pub const DELETE_TAG: &str = r#"
local tag_key = KEYS[1]
local meta_prefix = ARGV[1]
local tag_value = ARGV[2]
local members = redis.call('SMEMBERS', tag_key)
for i = 1, #members do
    local meta_key = meta_prefix .. members[i]
    local tags_json = redis.call('HGET', meta_key, 'tags')
    if tags_json then
        local ok, tags = pcall(cjson.decode, tags_json)
        if ok and type(tags) == 'table' then
            local new_tags = {}
            local found = false
            for _, t in ipairs(tags) do
                if t ~= tag_value then
                    table.insert(new_tags, t)
                else
                    found = true
                end
            end
            if found then
                if #new_tags > 0 then
                    redis.call('HSET', meta_key, 'tags', cjson.encode(new_tags))
                else
                    redis.call('HSET', meta_key, 'tags', '[]')
                end
            end
        end
    end
end
redis.call('DEL', tag_key)
return #members
"#;

/// Delete a lock only when the stored token matches. Returns 0 or 1.
pub const RELEASE_LOCK: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Reset a lock's TTL only when the stored token matches. Returns 0 or 1.
pub const RENEW_LOCK: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("expire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// A Lua script body with its SHA-1 content hash precomputed
#[derive(Debug, Clone)]
pub(crate) struct LuaScript {
  body: &'static str,
  hash: String,
}

impl LuaScript {
  pub fn new(body: &'static str) -> Self {
    let hash = redis::Script::new(body).get_hash().to_string();
    Self { body, hash }
  }

  /// Execute by hash, uploading the body and retrying exactly once when the
  /// server reports the script is not cached.
  pub async fn invoke(
    &self,
    conn: &mut ConnectionManager,
    keys: &[String],
    args: &[&str],
  ) -> RedisResult<Value> {
    let mut cmd = redis::cmd("EVALSHA");
    cmd.arg(&self.hash).arg(keys.len());
    for key in keys {
      cmd.arg(key);
    }
    for arg in args {
      cmd.arg(arg);
    }

    match cmd.query_async(conn).await {
      Err(err) if err.kind() == ErrorKind::NoScriptError => {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(self.body).arg(keys.len());
        for key in keys {
          cmd.arg(key);
        }
        for arg in args {
          cmd.arg(arg);
        }
        cmd.query_async(conn).await
      }
      result => result,
    }
  }
}

/// The pool's script set, hashed once at construction
#[derive(Debug, Clone)]
pub(crate) struct ScriptEngine {
  pub get_item: LuaScript,
  pub get_items: LuaScript,
  pub get_items_with_tag: LuaScript,
  pub delete_tag: LuaScript,
}

impl ScriptEngine {
  pub fn new() -> Self {
    Self {
      get_item: LuaScript::new(GET_ITEM),
      get_items: LuaScript::new(GET_ITEMS),
      get_items_with_tag: LuaScript::new(GET_ITEMS_WITH_TAG),
      delete_tag: LuaScript::new(DELETE_TAG),
    }
  }
}

/// Extract raw bytes from a script-returned value slot
pub(crate) fn value_bytes(value: Value) -> Option<Vec<u8>> {
  match value {
    Value::BulkString(bytes) => Some(bytes),
    Value::SimpleString(s) => Some(s.into_bytes()),
    _ => None,
  }
}

/// Flatten an HGETALL-shaped reply (alternating field/value bulk strings)
/// into a string map
pub(crate) fn meta_fields(value: Value) -> HashMap<String, String> {
  let mut fields = HashMap::new();
  if let Value::Array(items) = value {
    let mut iter = items.into_iter();
    while let (Some(field), Some(val)) = (iter.next(), iter.next()) {
      if let (Some(field), Some(val)) = (value_bytes(field), value_bytes(val)) {
        fields.insert(
          String::from_utf8_lossy(&field).into_owned(),
          String::from_utf8_lossy(&val).into_owned(),
        );
      }
    }
  }
  fields
}

/// Split a flat (item key, value, meta) reply into decoded records
pub(crate) fn item_records(value: Value) -> Vec<(String, Vec<u8>, HashMap<String, String>)> {
  let mut records = Vec::new();
  if let Value::Array(items) = value {
    let mut iter = items.into_iter();
    while let (Some(key), Some(val), Some(meta)) = (iter.next(), iter.next(), iter.next()) {
      let Some(key) = value_bytes(key) else {
        continue;
      };
      let Some(val) = value_bytes(val) else {
        continue;
      };
      records.push((
        String::from_utf8_lossy(&key).into_owned(),
        val,
        meta_fields(meta),
      ));
    }
  }
  records
}
