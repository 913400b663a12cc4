//! The key-value surface the lock protocol needs from its backing store.
//!
//! [`RedisLockStore`] speaks to a Redis-compatible server through a
//! [`fred::clients::Pool`]; [`crate::coordination::memory::InMemoryLockStore`]
//! keeps everything in process.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::clients::Pool;
use fred::interfaces::{KeysInterface, LuaInterface};
use fred::types::{Expiration, SetOptions};
use tracing::trace;

/// Delete `KEYS[1]` only while it still holds `ARGV[1]`.
const COMPARE_AND_DELETE: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Reset the TTL of `KEYS[1]` to `ARGV[2]` ms only while it still holds
/// `ARGV[1]`.
const COMPARE_AND_PEXPIRE: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('PEXPIRE', KEYS[1], ARGV[2])
    end
    return 0
"#;

/// Single-key operations against a shared keyspace with expiry.
///
/// Every error is a communication failure: the protocol layer never sees a
/// partial result.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// SET `key` to `value` with a TTL only when `key` is absent.  Returns
    /// `true` if the key was created.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Unconditionally SET `key` to `value` with a fresh TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Returns the number of keys removed.
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Atomically delete `key` if its value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Atomically reset the TTL of `key` if its value equals `expected`.
    async fn extend_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;
}

#[async_trait]
impl<T: LockStore + ?Sized> LockStore for Arc<T> {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        (**self).delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        (**self).delete_if_equals(key, expected).await
    }

    async fn extend_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        (**self).extend_if_equals(key, expected, ttl).await
    }
}

/// Millisecond TTL for `PX` / `PEXPIRE`.  Redis rejects zero, so anything
/// shorter than a millisecond is rounded up.
pub(crate) fn ttl_millis(ttl: Duration) -> i64 {
    ttl.as_millis().clamp(1, i64::MAX as u128) as i64
}

// ---------------------------------------------------------------------------
// Redis / KeyDB
// ---------------------------------------------------------------------------

/// [`LockStore`] backed by a fred connection pool.
///
/// Each method issues exactly one command (or one script) on whichever pooled
/// connection fred hands out, and is bounded by `max_wait`.
#[derive(Clone)]
pub struct RedisLockStore {
    pool: Pool,
    max_wait: Duration,
}

impl RedisLockStore {
    pub fn new(pool: Pool, max_wait: Duration) -> Self {
        Self { pool, max_wait }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn bounded<T, E, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>> + Send,
        E: std::error::Error + Send + Sync + 'static,
    {
        match tokio::time::timeout(self.max_wait, fut).await {
            Ok(result) => result.with_context(|| format!("{op} failed")),
            Err(_) => anyhow::bail!("{op} timed out after {:?}", self.max_wait),
        }
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // SET … NX returns "OK" when the key was set, nil otherwise.
        let result: Option<String> = self
            .bounded(
                "SET NX PX",
                self.pool.set(
                    key,
                    value,
                    Some(Expiration::PX(ttl_millis(ttl))),
                    Some(SetOptions::NX),
                    false,
                ),
            )
            .await?;
        trace!(%key, created = result.is_some(), "SET NX PX");
        Ok(result.is_some())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let _: Option<String> = self
            .bounded(
                "SET PX",
                self.pool.set(
                    key,
                    value,
                    Some(Expiration::PX(ttl_millis(ttl))),
                    None,
                    false,
                ),
            )
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.bounded("GET", self.pool.get(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.bounded("EXISTS", self.pool.exists(key)).await
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let removed: i64 = self.bounded("DEL", self.pool.del(key)).await?;
        Ok(removed.max(0) as u64)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let removed: i64 = self
            .bounded(
                "compare-and-delete script",
                self.pool.eval(
                    COMPARE_AND_DELETE,
                    vec![key.to_string()],
                    vec![expected.to_string()],
                ),
            )
            .await?;
        Ok(removed == 1)
    }

    async fn extend_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let updated: i64 = self
            .bounded(
                "compare-and-pexpire script",
                self.pool.eval(
                    COMPARE_AND_PEXPIRE,
                    vec![key.to_string()],
                    vec![expected.to_string(), ttl_millis(ttl).to_string()],
                ),
            )
            .await?;
        Ok(updated == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_up_to_one_millisecond() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_micros(400)), 1);
        assert_eq!(ttl_millis(Duration::from_millis(3000)), 3000);
    }

    #[test]
    fn redis_store_is_a_shareable_lock_store() {
        fn assert_store<T: LockStore + Clone + 'static>() {}
        assert_store::<RedisLockStore>();
        assert_store::<Arc<RedisLockStore>>();
    }

    #[test]
    fn scripts_compare_before_acting() {
        for script in [COMPARE_AND_DELETE, COMPARE_AND_PEXPIRE] {
            let get = script.find("'GET'").unwrap();
            let act = script
                .find("'DEL'")
                .or_else(|| script.find("'PEXPIRE'"))
                .unwrap();
            assert!(get < act);
        }
    }
}
