//! Key namespacing scheme
//!
//! A logical (caller-visible) key maps onto four physical Redis keys:
//! `{prefix}item|{key}` for the value record, `{prefix}meta|{key}` for the
//! bookkeeping hash, `{prefix}lock|{key}` for the advisory lock, and
//! `{prefix}tag|{tag}` for each tag index set.

use crate::error::CacheError;

/// Characters that would corrupt the scheme delimiters or collide with
/// Redis pattern syntax.
const RESERVED_KEY_CHARS: [char; 8] = ['{', '}', '(', ')', '/', '\\', '@', ':'];

/// Validate a logical key.
///
/// Rejects empty keys and keys containing any reserved character.
pub fn validate_key(key: &str) -> Result<(), CacheError> {
  if key.is_empty() || key.chars().any(|c| RESERVED_KEY_CHARS.contains(&c)) {
    return Err(CacheError::InvalidKey(key.to_string()));
  }
  Ok(())
}

/// Derives the physical key namespaces from an adapter-wide prefix.
#[derive(Debug, Clone, Default)]
pub struct KeyScheme {
  prefix: String,
}

impl KeyScheme {
  pub fn new(prefix: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
    }
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  /// Physical key of the value record
  pub fn item_key(&self, key: &str) -> String {
    format!("{}item|{}", self.prefix, key)
  }

  /// Physical key of the meta hash
  pub fn meta_key(&self, key: &str) -> String {
    format!("{}meta|{}", self.prefix, key)
  }

  /// Physical key of the advisory lock
  pub fn lock_key(&self, key: &str) -> String {
    format!("{}lock|{}", self.prefix, key)
  }

  /// Physical key of a tag index set
  pub fn tag_key(&self, tag: &str) -> String {
    format!("{}tag|{}", self.prefix, tag)
  }

  /// Recover the logical key from a physical item key.
  ///
  /// Keys outside the item namespace are returned unchanged.
  pub fn logical_key<'a>(&self, item_key: &'a str) -> &'a str {
    let namespace = format!("{}item|", self.prefix);
    item_key.strip_prefix(namespace.as_str()).unwrap_or(item_key)
  }
}
