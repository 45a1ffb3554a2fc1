//! Advisory locks
//!
//! Locks are tokens stored under the lock namespace with a TTL. Possession
//! is proven by token equality, so release and renewal run as atomic
//! compare-and-act scripts on the server; a client-side read-then-write
//! would let a caller steal a lock that expired and was re-acquired in
//! between. Locks are advisory: saves check them, nothing enforces them.

use redis::aio::ConnectionManager;
use redis::Value;
use uuid::Uuid;

use crate::error::CacheError;
use crate::keys::KeyScheme;
use crate::scripts::{LuaScript, RELEASE_LOCK, RENEW_LOCK};

/// Token-based advisory mutual exclusion over logical keys
#[derive(Clone)]
pub struct LockManager {
  conn: ConnectionManager,
  keys: KeyScheme,
  default_ttl: u64,
  release_script: LuaScript,
  renew_script: LuaScript,
}

impl LockManager {
  pub(crate) fn new(conn: ConnectionManager, keys: KeyScheme, default_ttl: u64) -> Self {
    Self {
      conn,
      keys,
      default_ttl,
      release_script: LuaScript::new(RELEASE_LOCK),
      renew_script: LuaScript::new(RENEW_LOCK),
    }
  }

  /// Attempt to acquire the lock for a logical key.
  ///
  /// A token is generated when none is supplied; the configured default TTL
  /// applies when none is given. Returns the token on success, `None` when
  /// the lock is already held or the TTL is zero.
  pub async fn acquire(
    &self,
    key: &str,
    token: Option<String>,
    ttl: Option<u64>,
  ) -> Result<Option<String>, CacheError> {
    let ttl = ttl.unwrap_or(self.default_ttl);
    if ttl == 0 {
      return Ok(None);
    }

    let token = token.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut conn = self.conn.clone();

    let result: Value = redis::cmd("SET")
      .arg(self.keys.lock_key(key))
      .arg(&token)
      .arg("NX")
      .arg("EX")
      .arg(ttl)
      .query_async(&mut conn)
      .await?;

    if matches!(result, Value::Okay) {
      Ok(Some(token))
    } else {
      Ok(None)
    }
  }

  /// Release the lock only when the supplied token matches the stored one.
  /// Returns false (and leaves the lock held) on token mismatch.
  pub async fn release(&self, key: &str, token: &str) -> Result<bool, CacheError> {
    let mut conn = self.conn.clone();
    let lock_key = self.keys.lock_key(key);
    let result = self
      .release_script
      .invoke(&mut conn, &[lock_key], &[token])
      .await?;
    Ok(matches!(result, Value::Int(n) if n > 0))
  }

  /// Reset the lock TTL only when the supplied token matches the stored
  /// one. Fails on token mismatch or a zero TTL.
  pub async fn renew(&self, key: &str, token: &str, ttl: Option<u64>) -> Result<bool, CacheError> {
    let ttl = ttl.unwrap_or(self.default_ttl);
    if ttl == 0 {
      return Ok(false);
    }

    let mut conn = self.conn.clone();
    let lock_key = self.keys.lock_key(key);
    let ttl_arg = ttl.to_string();
    let result = self
      .renew_script
      .invoke(&mut conn, &[lock_key], &[token, &ttl_arg])
      .await?;
    Ok(matches!(result, Value::Int(n) if n > 0))
  }

  /// Unconditionally delete the lock, regardless of who holds it.
  ///
  /// This defeats mutual exclusion for whichever caller believed it held
  /// the lock; it exists as a safety valve for stuck locks only.
  pub async fn force_release(&self, key: &str) -> Result<bool, CacheError> {
    let mut conn = self.conn.clone();
    let deleted: i64 = redis::cmd("DEL")
      .arg(self.keys.lock_key(key))
      .query_async(&mut conn)
      .await?;
    if deleted > 0 {
      tracing::warn!("Lock forcibly released: {}", key);
    }
    Ok(deleted > 0)
  }

  /// Is any lock currently held for this key? Does not reveal or validate
  /// the token.
  pub async fn is_locked(&self, key: &str) -> Result<bool, CacheError> {
    let mut conn = self.conn.clone();
    let exists: bool = redis::cmd("EXISTS")
      .arg(self.keys.lock_key(key))
      .query_async(&mut conn)
      .await?;
    Ok(exists)
  }
}
