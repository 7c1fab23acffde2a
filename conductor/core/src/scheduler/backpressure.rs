//! Delivery Backpressure
//!
//! Normal-priority producers must hold a slot from a [`SlotPool`] while their
//! batch is in flight to the executor. The slot is released when the
//! executor has moved the batch into its lane, not when the batch finishes
//! executing, so the pool bounds undelivered batches rather than queue depth.
//!
//! # Levels
//!
//! | available / capacity | level      |
//! |----------------------|------------|
//! | 0                    | `Blocked`  |
//! | < 0.25               | `Heavy`    |
//! | < 0.50               | `Moderate` |
//! | < 0.75               | `Light`    |
//! | otherwise            | `None`     |

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::SchedulerError;

/// Callback run on the executor thread when a slot frees up under light load
pub type ReleaseHandler = Arc<dyn Fn() + Send + Sync>;

/// How congested delivery currently is
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureLevel {
    /// Plenty of slots
    None,
    /// At least half the slots are free
    Light,
    /// At least a quarter of the slots are free
    Moderate,
    /// Fewer than a quarter of the slots are free
    Heavy,
    /// No slots are free; producers block
    Blocked,
}

impl BackpressureLevel {
    /// Classify `available` free slots out of `capacity`
    #[must_use]
    pub fn from_slots(available: usize, capacity: usize) -> Self {
        if available == 0 || capacity == 0 {
            return Self::Blocked;
        }
        let ratio = available as f64 / capacity as f64;
        if ratio < 0.25 {
            Self::Heavy
        } else if ratio < 0.5 {
            Self::Moderate
        } else if ratio < 0.75 {
            Self::Light
        } else {
            Self::None
        }
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Light => "light",
            Self::Moderate => "moderate",
            Self::Heavy => "heavy",
            Self::Blocked => "blocked",
        };
        f.write_str(name)
    }
}

struct PoolInner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    release_handler: RwLock<Option<ReleaseHandler>>,
}

/// Counting resource shared by all normal-priority producers
#[derive(Clone)]
pub struct SlotPool {
    inner: Arc<PoolInner>,
}

impl SlotPool {
    /// Create a pool with `capacity` slots
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                release_handler: RwLock::new(None),
            }),
        }
    }

    /// Total number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots free right now
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Current congestion level
    #[must_use]
    pub fn level(&self) -> BackpressureLevel {
        BackpressureLevel::from_slots(self.available(), self.inner.capacity)
    }

    /// Install the callback run when a slot is released below `Heavy`
    pub fn set_release_handler(&self, handler: Option<ReleaseHandler>) {
        *self.inner.release_handler.write() = handler;
    }

    /// Block the calling thread until a slot is free
    ///
    /// Must not be called from inside an async task; use [`Self::acquire`]
    /// there instead.
    pub fn acquire_blocking(&self) -> Result<SlotPermit, SchedulerError> {
        let permit = futures::executor::block_on(self.inner.semaphore.clone().acquire_owned())
            .map_err(|_| SchedulerError::Shutdown)?;
        Ok(self.wrap(permit))
    }

    /// Wait asynchronously until a slot is free
    pub async fn acquire(&self) -> Result<SlotPermit, SchedulerError> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::Shutdown)?;
        Ok(self.wrap(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<SlotPermit> {
        self.inner
            .semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.wrap(permit))
    }

    /// Wake every waiting producer with [`SchedulerError::Shutdown`]
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> SlotPermit {
        SlotPermit {
            permit: Some(permit),
            pool: self.clone(),
        }
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// One held delivery slot
///
/// Dropping the permit returns the slot exactly once, on every path.
#[must_use = "dropping a permit releases its slot immediately"]
pub struct SlotPermit {
    permit: Option<OwnedSemaphorePermit>,
    pool: SlotPool,
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit").finish_non_exhaustive()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        drop(self.permit.take());

        let level = self.pool.level();
        if level >= BackpressureLevel::Heavy {
            return;
        }
        let handler = self.pool.inner.release_handler.read().clone();
        if let Some(handler) = handler {
            tracing::trace!(%level, "Delivery slot released");
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_level_thresholds() {
        assert_eq!(BackpressureLevel::from_slots(0, 4), BackpressureLevel::Blocked);
        assert_eq!(BackpressureLevel::from_slots(1, 8), BackpressureLevel::Heavy);
        assert_eq!(BackpressureLevel::from_slots(1, 4), BackpressureLevel::Moderate);
        assert_eq!(BackpressureLevel::from_slots(2, 4), BackpressureLevel::Light);
        assert_eq!(BackpressureLevel::from_slots(3, 4), BackpressureLevel::None);
        assert_eq!(BackpressureLevel::from_slots(4, 4), BackpressureLevel::None);
    }

    #[test]
    fn test_permit_releases_once() {
        let pool = SlotPool::new(2);
        let a = pool.acquire_blocking().expect("slot");
        let b = pool.try_acquire().expect("slot");
        assert_eq!(pool.level(), BackpressureLevel::Blocked);
        assert!(pool.try_acquire().is_none());

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_release_handler_skipped_under_heavy_load() {
        let pool = SlotPool::new(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        pool.set_release_handler(Some(Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })));

        let mut held: Vec<_> = (0..8).map(|_| pool.try_acquire().expect("slot")).collect();
        // 1 of 8 free is still heavy
        held.pop();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // 2 of 8 free is moderate
        held.pop();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_fails_waiters() {
        let pool = SlotPool::new(1);
        let _held = pool.try_acquire().expect("slot");
        pool.close();
        assert!(matches!(
            pool.acquire_blocking(),
            Err(SchedulerError::Shutdown)
        ));
    }
}
