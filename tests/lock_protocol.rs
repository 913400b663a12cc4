use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use globallock::{GlobalLock, InMemoryLockStore, LockConfig, LockStore, OwnershipCheck};

const TTL: Duration = Duration::from_millis(3000);

/// Two lock clients sharing one store, standing in for two processes.
fn two_processes() -> (
    Arc<InMemoryLockStore>,
    GlobalLock<Arc<InMemoryLockStore>>,
    GlobalLock<Arc<InMemoryLockStore>>,
) {
    let store = Arc::new(InMemoryLockStore::new());
    let a = GlobalLock::new(Arc::clone(&store), LockConfig::default());
    let b = GlobalLock::new(Arc::clone(&store), LockConfig::default());
    (store, a, b)
}

#[tokio::test]
async fn job_42_end_to_end() {
    let (store, a, b) = two_processes();
    let storage_key = a.storage_key("job-42").unwrap();

    a.lock("job-42").await.unwrap();
    let t1 = a.holder_token("job-42").unwrap();
    assert_eq!(store.get(&storage_key).await.unwrap(), Some(t1.clone()));

    assert!(!b.lock_no_wait("job-42").await.unwrap());

    assert!(a.unlock("job-42").await.unwrap());
    assert!(!store.exists(&storage_key).await.unwrap());

    assert!(b.lock_no_wait("job-42").await.unwrap());
    let t2 = b.holder_token("job-42").unwrap();
    assert_ne!(t1, t2);
    assert_eq!(store.get(&storage_key).await.unwrap(), Some(t2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocking_lock_is_mutually_exclusive() {
    let store = Arc::new(InMemoryLockStore::new());
    let inside = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for _ in 0..3 {
        // Each client is its own process; each task within it its own context.
        let lock = Arc::new(GlobalLock::new(Arc::clone(&store), LockConfig::default()));
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let entered = Arc::clone(&entered);
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    lock.acquire("counter", TTL).await.unwrap();
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                    entered.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    inside.store(false, Ordering::SeqCst);
                    assert!(lock.release("counter").await.unwrap());
                }
            }));
        }
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(entered.load(Ordering::SeqCst), 3 * 4 * 5);
    assert!(store.is_empty());
}

#[tokio::test]
async fn abandoned_lease_expires_and_unblocks_a_waiter() {
    let (_store, a, b) = two_processes();

    a.lock_for("job", Duration::from_millis(100)).await.unwrap();
    // a never releases.

    let started = tokio::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(5), b.lock("job"))
        .await
        .expect("waiter should get the lock once the lease expires")
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(b.holder_token("job").is_some());
    assert!(!a.unlock("job").await.unwrap());
    assert!(b.unlock("job").await.unwrap());
}

#[tokio::test]
async fn every_acquisition_mints_a_new_token() {
    let (_store, a, b) = two_processes();

    let first = a.try_acquire("job", TTL).await.unwrap().unwrap();
    assert!(a.release("job").await.unwrap());
    let second = a.try_acquire("job", TTL).await.unwrap().unwrap();
    assert!(a.release("job").await.unwrap());
    let third = b.try_acquire("job", TTL).await.unwrap().unwrap();

    assert_ne!(first.token, second.token);
    assert_ne!(second.token, third.token);
    assert_ne!(first.token, third.token);
}

#[tokio::test]
async fn unlock_by_a_non_owner_leaves_the_record() {
    let (store, a, b) = two_processes();
    let storage_key = a.storage_key("job").unwrap();

    a.lock("job").await.unwrap();
    let token = a.holder_token("job");

    // b never locked "job".
    assert!(!b.unlock("job").await.unwrap());
    assert_eq!(store.get(&storage_key).await.unwrap(), token);

    // Another task of the same process is a different context too.
    let a = Arc::new(a);
    let other_task = {
        let a = Arc::clone(&a);
        tokio::spawn(async move { a.unlock("job").await.unwrap() })
    };
    assert!(!other_task.await.unwrap());
    assert_eq!(store.get(&storage_key).await.unwrap(), token);

    assert!(a.unlock("job").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn unlock_after_the_lease_changed_hands_is_refused() {
    let (store, a, b) = two_processes();
    let storage_key = a.storage_key("job").unwrap();

    a.lock("job").await.unwrap();
    tokio::time::advance(TTL).await;
    assert!(b.lock_no_wait("job").await.unwrap());
    let b_token = b.holder_token("job");

    assert!(!a.unlock("job").await.unwrap());
    a.delay_lock("job").await.unwrap();
    assert_eq!(store.get(&storage_key).await.unwrap(), b_token);
    assert_eq!(store.ttl_remaining(&storage_key), Some(TTL));
}

#[tokio::test(start_paused = true)]
async fn delay_lock_keeps_the_token_and_refreshes_the_ttl() {
    let (store, a, _b) = two_processes();
    let storage_key = a.storage_key("job").unwrap();

    a.lock("job").await.unwrap();
    let token = store.get(&storage_key).await.unwrap();

    tokio::time::advance(Duration::from_millis(2500)).await;
    a.delay_lock("job").await.unwrap();
    assert_eq!(store.get(&storage_key).await.unwrap(), token);
    assert_eq!(store.ttl_remaining(&storage_key), Some(TTL));

    a.delay_lock_for("job", Duration::from_secs(60)).await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(store.get(&storage_key).await.unwrap(), token);
}

#[tokio::test]
async fn lock_no_wait_makes_exactly_one_attempt() {
    let (store, a, b) = two_processes();
    let storage_key = a.storage_key("job").unwrap();

    a.lock("job").await.unwrap();
    let token = store.get(&storage_key).await.unwrap();
    let before = store.set_if_absent_calls();

    assert!(!b.lock_no_wait("job").await.unwrap());
    assert_eq!(store.set_if_absent_calls(), before + 1);
    assert_eq!(store.get(&storage_key).await.unwrap(), token);
}

#[tokio::test]
async fn try_lock_reports_availability_without_claiming() {
    let (store, a, b) = two_processes();

    assert!(b.try_lock("job").await.unwrap());
    assert!(store.is_empty());

    a.lock("job").await.unwrap();
    assert!(!b.try_lock("job").await.unwrap());
}

/// Simulates the lease expiring and being taken by `intruder` right after
/// the ownership read.
struct HandoffAfterGet {
    inner: InMemoryLockStore,
}

const INTRUDER: &str = "intruder-token";

#[async_trait]
impl LockStore for HandoffAfterGet {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let current = self.inner.get(key).await?;
        self.inner.set_with_ttl(key, INTRUDER, TTL).await?;
        Ok(current)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.inner.delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        self.inner.delete_if_equals(key, expected).await
    }

    async fn extend_if_equals(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        self.inner.extend_if_equals(key, expected, ttl).await
    }
}

fn racing_lock(check: OwnershipCheck) -> GlobalLock<HandoffAfterGet> {
    GlobalLock::new(
        HandoffAfterGet {
            inner: InMemoryLockStore::new(),
        },
        LockConfig {
            ownership_check: check,
            ..LockConfig::default()
        },
    )
}

#[tokio::test]
async fn two_step_release_can_delete_a_successor_lease() {
    let lock = racing_lock(OwnershipCheck::TwoStep);
    lock.lock("job").await.unwrap();

    // The read still sees our token, so the DEL goes ahead and removes the
    // intruder's lease.
    assert!(lock.unlock("job").await.unwrap());
    assert!(lock.store().inner.is_empty());
}

#[tokio::test]
async fn atomic_release_cannot_delete_a_successor_lease() {
    let lock = racing_lock(OwnershipCheck::Atomic);
    let storage_key = lock.storage_key("job").unwrap();
    lock.lock("job").await.unwrap();

    // Let the handoff happen before the release.
    lock.store().get(&storage_key).await.unwrap();

    assert!(!lock.unlock("job").await.unwrap());
    assert_eq!(
        lock.store().inner.get(&storage_key).await.unwrap().as_deref(),
        Some(INTRUDER)
    );
}
