//! [`KeyCache`]: sliding-expiration cache of unwrapped data keys.
//!
//! Entries are keyed by a SHA-256 digest of `(level, context)`. Each slot has
//! its own async mutex, so:
//! - concurrent first-time requests for one slot serialise behind the first
//!   caller's KMS call (single-flight), and
//! - requests for different slots only share the short synchronous map lock.
//!
//! A slot also remembers its last failed generation, so callers that queued
//! behind a failing KMS call share its error instead of repeating the call.
//!
//! Timestamps use [`tokio::time::Instant`] so expiry can be tested with a
//! paused clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{EncryptionContext, FieldError, SensitivityLevel};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::Instant;

use super::key::DataKey;

/// Default sliding lifetime of a cached key (4 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(4 * 60 * 60);

/// Cache slot identifier: the sensitivity level plus a digest of the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    level: SensitivityLevel,
    digest: [u8; 32],
}

impl CacheKey {
    pub fn new(level: SensitivityLevel, context: &EncryptionContext) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(context.aad());
        Self {
            level,
            digest: hasher.finalize().into(),
        }
    }

    pub fn level(&self) -> SensitivityLevel {
        self.level
    }
}

/// A cached key and the last time it was handed out.
pub(crate) struct CachedKey {
    pub(crate) key: Arc<DataKey>,
    last_used: Instant,
}

impl CachedKey {
    pub(crate) fn new(key: Arc<DataKey>, now: Instant) -> Self {
        Self {
            key,
            last_used: now,
        }
    }

    pub(crate) fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_used) >= ttl
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_used = now;
    }
}

/// One cache entry plus the failure history of its generations.
#[derive(Default)]
pub(crate) struct Slot {
    key: AsyncMutex<Option<CachedKey>>,
    failures: AtomicU64,
    last_failure: Mutex<Option<FieldError>>,
}

impl Slot {
    /// Lock the entry. Holding the guard across a KMS call is what makes the
    /// cache single-flight.
    pub(crate) async fn lock(&self) -> AsyncMutexGuard<'_, Option<CachedKey>> {
        self.key.lock().await
    }

    /// Count of failed generations so far. Read before waiting on the lock.
    pub(crate) fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// Record a failed generation. Call while holding the lock.
    pub(crate) fn record_failure(&self, error: FieldError) {
        *self.last_failure.lock() = Some(error);
        self.failures.fetch_add(1, Ordering::Release);
    }

    /// The latest failure, if one was recorded after `seen`.
    pub(crate) fn failure_since(&self, seen: u64) -> Option<FieldError> {
        if self.failures() > seen {
            self.last_failure.lock().clone()
        } else {
            None
        }
    }
}

/// Explicit, injectable cache of data keys with a bounded sliding lifetime.
///
/// Cheaply cloneable; clones share the same slots.
#[derive(Clone)]
pub struct KeyCache {
    ttl: Duration,
    slots: Arc<Mutex<HashMap<CacheKey, Arc<Slot>>>>,
}

impl KeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of slots currently allocated (live or in flight).
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// The slot for `key`, created if needed.
    pub(crate) fn slot(&self, key: CacheKey) -> Arc<Slot> {
        self.slots.lock().entry(key).or_default().clone()
    }

    /// Non-blocking lookup used on the decrypt path. Returns the cached key
    /// only if it is live and its id equals `key_id`. Slots with an
    /// in-flight KMS call are skipped rather than awaited.
    pub fn peek(&self, key: &CacheKey, key_id: &str) -> Option<Arc<DataKey>> {
        let slot = self.slots.lock().get(key).cloned()?;
        let guard = slot.key.try_lock().ok()?;
        let live = guard
            .as_ref()
            .filter(|c| !c.is_expired(Instant::now(), self.ttl) && c.key.key_id() == key_id)
            .map(|c| c.key.clone());
        live
    }

    /// Drop every expired entry and release empty slots. Returns the number
    /// of keys evicted. Evicted material is zeroized once the last in-flight
    /// holder releases it.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let mut evicted = 0;
        slots.retain(|_, slot| {
            let Ok(mut guard) = slot.key.try_lock() else {
                // In flight: leave it alone.
                return true;
            };
            if guard.as_ref().is_some_and(|c| c.is_expired(now, self.ttl)) {
                *guard = None;
                evicted += 1;
            }
            guard.is_some() || Arc::strong_count(slot) > 1
        });
        evicted
    }

    /// Remove every key cached for `level`, waiting for in-flight generations
    /// so none of them survives. Returns the number of keys removed.
    pub async fn invalidate_level(&self, level: SensitivityLevel) -> usize {
        let targets: Vec<Arc<Slot>> = self
            .slots
            .lock()
            .iter()
            .filter(|(k, _)| k.level == level)
            .map(|(_, slot)| slot.clone())
            .collect();
        let mut removed = 0;
        for slot in targets {
            if slot.lock().await.take().is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Remove every cached key. Called before process exit.
    pub async fn clear(&self) -> usize {
        let targets: Vec<Arc<Slot>> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        let mut removed = 0;
        for slot in targets {
            if slot.lock().await.take().is_some() {
                removed += 1;
            }
        }
        removed
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("ttl", &self.ttl)
            .field("slots", &self.len())
            .finish()
    }
}
