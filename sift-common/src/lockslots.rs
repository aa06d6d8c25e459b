//! Per-user concurrency slots in the coordination store.
//!
//! A user gets `max_slots` named keys (`lock:user:{uid}:{slot}`), each taken
//! with create-if-absent semantics and a short TTL. A fetch task that can't
//! take a slot reschedules itself instead of blocking; the TTL guarantees
//! eventual release if a worker dies holding one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{info, warn};

// average for all commands is <10ms, check grafana
const REDIS_TIMEOUT_MILLISECS: u64 = 100;

/// The subset of coordination-store commands slot locking needs.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// SET key NX EX: returns true when the key was created by this call.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn release(&self, key: &str) -> Result<()>;
}

pub struct RedisSlotStore {
    client: redis::Client,
}

impl RedisSlotStore {
    pub fn new(addr: String) -> Result<RedisSlotStore> {
        let client = redis::Client::open(addr)?;

        Ok(RedisSlotStore { client })
    }
}

#[async_trait]
impl SlotStore for RedisSlotStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.client.get_async_connection().await?;

        let mut command = redis::cmd("SET");
        command
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1));
        let result: Option<String> = timeout(
            Duration::from_millis(REDIS_TIMEOUT_MILLISECS),
            command.query_async(&mut conn),
        )
        .await??;

        Ok(result.is_some())
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;

        let mut command = redis::cmd("DEL");
        command.arg(key);
        timeout(
            Duration::from_millis(REDIS_TIMEOUT_MILLISECS),
            command.query_async::<_, ()>(&mut conn),
        )
        .await??;

        Ok(())
    }
}

/// In-memory stand-in for tests.
#[derive(Clone, Default)]
pub struct MockSlotStore {
    held: Arc<Mutex<std::collections::HashSet<String>>>,
}

impl MockSlotStore {
    pub fn new() -> MockSlotStore {
        MockSlotStore::default()
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().expect("poisoned slot mutex").len()
    }
}

#[async_trait]
impl SlotStore for MockSlotStore {
    async fn set_if_absent(&self, key: &str, _ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().expect("poisoned slot mutex");
        Ok(held.insert(key.to_owned()))
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut held = self.held.lock().expect("poisoned slot mutex");
        held.remove(key);
        Ok(())
    }
}

/// A slot taken for one user; must be released on every exit path.
pub struct SlotLease {
    key: String,
    store: Arc<dyn SlotStore>,
}

impl SlotLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the slot. Failure is non-fatal: the TTL will clear it.
    pub async fn release(self) {
        match self.store.release(&self.key).await {
            Ok(()) => info!(slot = %self.key, "released user slot"),
            Err(error) => warn!(slot = %self.key, "failed to release user slot, TTL will clear it: {}", error),
        }
    }
}

#[derive(Clone)]
pub struct UserSlots {
    store: Arc<dyn SlotStore>,
    max_slots: u32,
    ttl: Duration,
}

impl UserSlots {
    pub fn new(store: Arc<dyn SlotStore>, max_slots: u32, ttl: Duration) -> Self {
        Self {
            store,
            max_slots,
            ttl,
        }
    }

    /// Try each of the user's slots in order; `None` means all are busy and
    /// the caller should reschedule rather than block.
    pub async fn acquire(&self, user_id: &str) -> Result<Option<SlotLease>> {
        for slot in 0..self.max_slots {
            let key = format!("lock:user:{}:{}", user_id, slot);
            if self.store.set_if_absent(&key, self.ttl).await? {
                info!(slot = %key, "acquired user slot");
                return Ok(Some(SlotLease {
                    key,
                    store: self.store.clone(),
                }));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(max: u32) -> (UserSlots, MockSlotStore) {
        let store = MockSlotStore::new();
        let slots = UserSlots::new(Arc::new(store.clone()), max, Duration::from_secs(6));
        (slots, store)
    }

    #[tokio::test]
    async fn test_slots_bounded_per_user() {
        let (slots, store) = slots(2);

        let first = slots.acquire("user-1").await.unwrap();
        let second = slots.acquire("user-1").await.unwrap();
        assert!(first.is_some());
        assert!(second.is_some());
        assert_eq!(store.held_count(), 2);

        // Third concurrent task for the same user must be told to reschedule.
        assert!(slots.acquire("user-1").await.unwrap().is_none());

        // A different user is unaffected.
        assert!(slots.acquire("user-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_frees_a_slot() {
        let (slots, store) = slots(1);

        let lease = slots.acquire("user-1").await.unwrap().unwrap();
        assert!(slots.acquire("user-1").await.unwrap().is_none());

        lease.release().await;
        assert_eq!(store.held_count(), 0);
        assert!(slots.acquire("user-1").await.unwrap().is_some());
    }
}
