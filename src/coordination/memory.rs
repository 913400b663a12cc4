//! Process-local [`LockStore`] with millisecond expiry.
//!
//! Expiry follows the tokio clock, so tests running with a paused runtime can
//! advance time instead of sleeping.  The store can be switched into an
//! "unavailable" state in which every command fails, which is how the
//! store-failure paths of the lock are exercised without a server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use super::store::{ttl_millis, LockStore};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: expiry(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

fn expiry(ttl: Duration) -> Instant {
    Instant::now() + Duration::from_millis(ttl_millis(ttl) as u64)
}

#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
    set_if_absent_calls: AtomicU64,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent command fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of conditional writes issued so far, successful or not.
    pub fn set_if_absent_calls(&self) -> u64 {
        self.set_if_absent_calls.load(Ordering::SeqCst)
    }

    /// Remaining lifetime of `key`, or `None` if it is absent or expired.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let mut entries = self.entries();
        live_entry(&mut entries, key).map(|e| e.expires_at - Instant::now())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<()> {
        anyhow::ensure!(
            !self.unavailable.load(Ordering::SeqCst),
            "in-memory lock store is unavailable"
        );
        Ok(())
    }
}

/// Drop `key` if it has expired and return the live entry, if any.
fn live_entry<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.set_if_absent_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;
        let mut entries = self.entries();
        if live_entry(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(true)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        self.entries().insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        let mut entries = self.entries();
        Ok(live_entry(&mut entries, key).map(|e| e.value.clone()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        let mut entries = self.entries();
        Ok(live_entry(&mut entries, key).is_some())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.ensure_available()?;
        let mut entries = self.entries();
        let removed = live_entry(&mut entries, key).is_some();
        entries.remove(key);
        Ok(u64::from(removed))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        self.ensure_available()?;
        let mut entries = self.entries();
        if live_entry(&mut entries, key).is_some_and(|e| e.value == expected) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn extend_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        self.ensure_available()?;
        let mut entries = self.entries();
        match live_entry(&mut entries, key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = expiry(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
