//! Tagged, lockable caching layer over Redis.
//!
//! Entries carry a value record and a meta hash (tags, hit counter,
//! timestamps, caller metadata, codec config) under a shared logical key.
//! Values pass through a serialize-then-conditionally-compress codec whose
//! per-entry config is persisted alongside the value, so reads decode with
//! whatever the writer used rather than the pool's current defaults. Tag
//! membership is indexed in Redis sets, advisory locks gate writes, and
//! read-modify-write sequences on the server run as Lua scripts.

pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod keys;
pub mod lock;
pub mod pool;
mod scripts;

pub use codec::{CodecConfig, CompressionMethod, SerializationMethod};
pub use config::{CacheConfig, RedisConfig};
pub use entry::{CacheEntry, CacheValue, StoredMeta};
pub use error::CacheError;
pub use keys::{validate_key, KeyScheme};
pub use lock::LockManager;
pub use pool::{RedisCachePool, DEFAULT_BATCH_SIZE};
