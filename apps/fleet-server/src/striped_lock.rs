use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHasher;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// A named family of stripes. The stripe count fixes how many keys of this
/// category can be held concurrently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LockCategory {
    pub name: &'static str,
    pub stripes: usize,
}

/// Process-wide mutex for integration bootstrap/reconcile passes.
pub(crate) const BOOTSTRAP: LockCategory = LockCategory {
    name: "bootstrap",
    stripes: 1,
};

pub(crate) const INJECT: LockCategory = LockCategory {
    name: "inject",
    stripes: 4096,
};

pub(crate) const PAYLOAD: LockCategory = LockCategory {
    name: "payload",
    stripes: 4096,
};

pub(crate) const DEFAULT_CATEGORIES: &[LockCategory] = &[BOOTSTRAP, INJECT, PAYLOAD];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum LockError {
    #[error("lock category `{0}` is not declared")]
    UnknownCategory(&'static str),
}

/// Held stripe; dropping it releases the stripe.
#[derive(Debug)]
pub(crate) struct StripeGuard {
    category: &'static str,
    stripe: usize,
    _guard: OwnedMutexGuard<()>,
}

impl StripeGuard {
    pub fn stripe(&self) -> usize {
        self.stripe
    }
}

impl Drop for StripeGuard {
    fn drop(&mut self) {
        trace!(
            target: "fleet::lock",
            category = self.category,
            stripe = self.stripe,
            "stripe released"
        );
    }
}

/// Keyed mutual exclusion over a fixed array of mutexes per category.
///
/// Keys hashing to different stripes proceed in parallel; keys sharing a
/// stripe are serialized. Not re-entrant: acquiring a stripe already held by
/// the same task deadlocks.
pub(crate) struct StripedLock {
    categories: HashMap<&'static str, Arc<[Arc<Mutex<()>>]>>,
}

impl StripedLock {
    pub fn new(categories: &[LockCategory]) -> Self {
        let categories = categories
            .iter()
            .map(|category| {
                let stripes: Vec<Arc<Mutex<()>>> = (0..category.stripes.max(1))
                    .map(|_| Arc::new(Mutex::new(())))
                    .collect();
                (category.name, Arc::from(stripes))
            })
            .collect();
        Self { categories }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CATEGORIES)
    }

    fn stripe_for(
        &self,
        category: &LockCategory,
        key: &str,
    ) -> Result<(usize, Arc<Mutex<()>>), LockError> {
        let stripes = self
            .categories
            .get(category.name)
            .ok_or(LockError::UnknownCategory(category.name))?;
        let index = stripe_index(key, stripes.len());
        Ok((index, Arc::clone(&stripes[index])))
    }

    pub async fn acquire(
        &self,
        category: &LockCategory,
        key: &str,
    ) -> Result<StripeGuard, LockError> {
        let (stripe, mutex) = self.stripe_for(category, key)?;
        let guard = mutex.lock_owned().await;
        trace!(target: "fleet::lock", category = category.name, stripe, "stripe acquired");
        Ok(StripeGuard {
            category: category.name,
            stripe,
            _guard: guard,
        })
    }

    /// Waits at most `timeout`; `Ok(None)` means the stripe stayed busy.
    pub async fn try_acquire_for(
        &self,
        category: &LockCategory,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<StripeGuard>, LockError> {
        let (stripe, mutex) = self.stripe_for(category, key)?;
        let guard = if timeout.is_zero() {
            mutex.try_lock_owned().ok()
        } else {
            tokio::time::timeout(timeout, mutex.lock_owned()).await.ok()
        };
        Ok(guard.map(|guard| StripeGuard {
            category: category.name,
            stripe,
            _guard: guard,
        }))
    }
}

fn stripe_index(key: &str, stripes: usize) -> usize {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % stripes as u64) as usize
}
