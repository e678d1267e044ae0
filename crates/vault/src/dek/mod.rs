//! Data key generation, caching, unwrap, and background rotation.
//!
//! # Lifecycle
//!
//! 1. On the write path, [`KeyProvider::get_or_create_data_key`] returns the
//!    cached key for `(level, context)` or asks the KMS for a fresh one. The
//!    plaintext lives only in memory; the wrapped form travels with every
//!    ciphertext it produces.
//! 2. Each cache hit slides the key's expiry. [`sweep_task`] periodically
//!    evicts expired keys; their material is zeroized when the last holder
//!    drops it.
//! 3. A key that has used up its encryption budget is replaced on the next
//!    request.
//! 4. [`rotation_task`] periodically asks [`KeyRotator`] which levels are due
//!    and rotates their KMS keys. Stored ciphertexts are not touched.
//! 5. On shutdown the daemon calls [`KeyCache::clear`] to scrub every key.
//!
//! # Security invariants
//!
//! - Plaintext data keys are **never** written to disk, logged, or included in traces.
//! - Wrapped keys are bound to their encryption context by the KMS; presenting
//!   one under another context fails.

pub mod cache;
pub mod key;
pub mod provider;
pub mod rotation;

pub use cache::{CacheKey, KeyCache};
pub use key::{DataKey, KeyBytes};
pub use provider::{KeyProvider, KmsKeyIds};
pub use rotation::{KeyRotator, RotationError, RotationResult};

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time;
use tracing::{debug, info, warn};

/// Spawn a background task that rotates every level whose KMS key is due.
///
/// The first check fires after one full interval; the daemon loads the
/// rotation baseline before spawning. On failure the current key stays in
/// service and the next tick retries.
pub fn rotation_task(rotator: Arc<KeyRotator>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        // First tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for scope in rotator.due_scopes(SystemTime::now()) {
                match rotator.rotate(scope).await {
                    Ok(r) => info!(
                        scope = %r.scope,
                        invalidated_keys = r.invalidated_keys,
                        "scheduled key rotation completed"
                    ),
                    Err(e) => warn!(scope = %scope, error = %e, "scheduled key rotation failed; retaining current key"),
                }
            }
        }
    })
}

/// Spawn a background task that evicts expired data keys every `interval`.
pub fn sweep_task(cache: KeyCache, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = cache.evict_expired();
            if evicted > 0 {
                debug!(evicted, remaining = cache.len(), "evicted expired data keys");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::LocalKms;
    use common::{EncryptionContext, SensitivityLevel};

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_idle_keys() {
        let kms = Arc::new(LocalKms::with_key("master"));
        let cache = KeyCache::new(Duration::from_secs(60));
        let keys = KeyProvider::new(kms, KmsKeyIds::new("master")).with_cache(cache.clone());
        let ctx = EncryptionContext::new("User", "42", "svc-a").unwrap();
        keys.get_or_create_data_key(SensitivityLevel::Critical, &ctx)
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);

        let handle = sweep_task(cache.clone(), Duration::from_secs(30));
        time::sleep(Duration::from_secs(95)).await;
        assert!(cache.is_empty());
        handle.abort();
    }
}
