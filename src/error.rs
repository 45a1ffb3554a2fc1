//! Error types

/// Errors returned by cache operations.
///
/// Expected negative outcomes (lock held at save time, nothing to delete,
/// empty batches) are reported through `Ok(false)` or empty collections,
/// never through this type.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// Invalid pool configuration, raised at construction time only
  #[error("invalid cache configuration: {0}")]
  Config(String),

  /// Malformed logical key
  #[error("invalid key ({0})")]
  InvalidKey(String),

  /// Transport failure, propagated from the Redis client
  #[error(transparent)]
  Redis(#[from] redis::RedisError),
}
