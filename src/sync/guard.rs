//! Busy latch shared by the reconciliation task and the host event mirror.
//!
//! Set while a blocking local operation (seek, queue rebuild) is in flight so
//! neither path reinterprets the other's command as an external change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug)]
pub struct SyncGuard {
    /// Generation of the current holder, 0 when free
    owner: AtomicU64,
    next: AtomicU64,
    since: Mutex<Option<Instant>>,
    timeout: Duration,
}

/// Releases the latch on drop, unless it already expired and was taken over
#[derive(Debug)]
pub struct BusyToken {
    guard: Arc<SyncGuard>,
    generation: u64,
}

impl Drop for BusyToken {
    fn drop(&mut self) {
        let mut since = self.guard.since_slot();
        if self
            .guard
            .owner
            .compare_exchange(self.generation, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *since = None;
        }
    }
}

impl SyncGuard {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            owner: AtomicU64::new(0),
            next: AtomicU64::new(1),
            since: Mutex::new(None),
            timeout,
        })
    }

    fn since_slot(&self) -> MutexGuard<'_, Option<Instant>> {
        self.since.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the latch, or `None` when someone else holds it.
    ///
    /// Owner changes happen under the `since` lock so a held latch always
    /// has a start time for `expire_stale`.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BusyToken> {
        let generation = self.next.fetch_add(1, Ordering::SeqCst);
        let mut since = self.since_slot();
        self.owner
            .compare_exchange(0, generation, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        *since = Some(Instant::now());
        drop(since);
        Some(BusyToken {
            guard: Arc::clone(self),
            generation,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.owner.load(Ordering::SeqCst) != 0
    }

    /// Force-release a latch held longer than the timeout. Returns true if it did.
    pub fn expire_stale(&self) -> bool {
        let mut since = self.since_slot();
        let expired = since.is_some_and(|t| t.elapsed() >= self.timeout);
        if expired {
            warn!("sync: busy for more than {:?}, releasing", self.timeout);
            self.owner.store(0, Ordering::SeqCst);
            *since = None;
        }
        expired
    }
}
