//! Reusable storage for tick records.
//!
//! The pool owns every `MarketDataRecord` for the life of the process. `acquire`
//! hands out a `PooledRecord`, which is the only way to reach a slot; dropping it
//! (or passing it to `release`) resets the record and puts the slot back. A handle
//! cannot be copied, so a slot is never aliased and cannot be returned twice.
//! Each slot also carries an ownership tag that is checked on every hand-out and
//! return in debug builds.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::ErrorKind;
use crate::market_data::record::MarketDataRecord;

/// What `acquire` does when no slot is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquirePolicy {
    /// Fixed capacity; wait up to `acquire_timeout` for a release.
    Block,
    /// Allocate new slots on demand up to `ceiling`, then fail.
    Grow,
    /// Fixed capacity; fail immediately.
    Fail,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Slots allocated up front.
    pub capacity: usize,
    /// Hard limit for `Grow`; ignored by the other policies.
    pub ceiling: usize,
    pub policy: AcquirePolicy,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ceiling: 1024,
            policy: AcquirePolicy::Block,
            acquire_timeout: Duration::from_millis(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("record pool exhausted ({in_use} records in use)")]
    Exhausted { in_use: usize },
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Resource
    }
}

struct Slot {
    index: usize,
    record: Box<MarketDataRecord>,
}

struct PoolInner {
    free: Mutex<Vec<Slot>>,
    available: Condvar,
    allocated: AtomicUsize,
    owned: Box<[AtomicBool]>,
    ceiling: usize,
    policy: AcquirePolicy,
    acquire_timeout: Duration,
}

impl PoolInner {
    fn checkout(self: &Arc<Self>, slot: Slot) -> PooledRecord {
        let was_owned = self.owned[slot.index].swap(true, Ordering::AcqRel);
        debug_assert!(!was_owned, "record slot {} handed out while still owned", slot.index);
        PooledRecord { slot: Some(slot), pool: Arc::clone(self) }
    }

    fn put_back(&self, mut slot: Slot) {
        let was_owned = self.owned[slot.index].swap(false, Ordering::AcqRel);
        debug_assert!(was_owned, "record slot {} released without being acquired", slot.index);
        slot.record.reset();
        self.free.lock().push(slot);
        self.available.notify_one();
    }

    // Claim a fresh slot index if the ceiling allows it.
    fn try_grow(&self) -> Option<usize> {
        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            if current >= self.ceiling {
                return None;
            }
            match self.allocated.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }

    fn in_use(&self) -> usize {
        self.allocated.load(Ordering::Acquire).saturating_sub(self.free.lock().len())
    }
}

/// Thread-safe record pool. Cloning shares the same storage.
#[derive(Clone)]
pub struct RecordPool {
    inner: Arc<PoolInner>,
}

impl RecordPool {
    pub fn new(config: PoolConfig) -> Self {
        let capacity = config.capacity.max(1);
        let ceiling = match config.policy {
            AcquirePolicy::Grow => config.ceiling.max(capacity),
            AcquirePolicy::Block | AcquirePolicy::Fail => capacity,
        };

        let free: Vec<Slot> = (0..capacity)
            .map(|index| Slot { index, record: Box::default() })
            .collect();
        let owned: Box<[AtomicBool]> = (0..ceiling).map(|_| AtomicBool::new(false)).collect();

        info!(capacity, ceiling, policy = ?config.policy, "Initialized record pool");
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                available: Condvar::new(),
                allocated: AtomicUsize::new(capacity),
                owned,
                ceiling,
                policy: config.policy,
                acquire_timeout: config.acquire_timeout,
            }),
        }
    }

    /// Take a blank record according to the configured policy.
    pub fn acquire(&self) -> Result<PooledRecord, PoolError> {
        if let Some(slot) = self.inner.free.lock().pop() {
            return Ok(self.inner.checkout(slot));
        }

        match self.inner.policy {
            AcquirePolicy::Fail => Err(self.exhausted()),
            AcquirePolicy::Grow => match self.inner.try_grow() {
                Some(index) => {
                    debug!(index, "Grew record pool");
                    Ok(self.inner.checkout(Slot { index, record: Box::default() }))
                }
                None => Err(self.exhausted()),
            },
            AcquirePolicy::Block => self.acquire_until(Instant::now() + self.inner.acquire_timeout),
        }
    }

    /// Never waits, whatever the policy.
    pub fn try_acquire(&self) -> Option<PooledRecord> {
        let slot = self.inner.free.lock().pop()?;
        Some(self.inner.checkout(slot))
    }

    fn acquire_until(&self, deadline: Instant) -> Result<PooledRecord, PoolError> {
        let mut free = self.inner.free.lock();
        loop {
            if let Some(slot) = free.pop() {
                drop(free);
                return Ok(self.inner.checkout(slot));
            }
            if self.inner.available.wait_until(&mut free, deadline).timed_out() {
                return match free.pop() {
                    Some(slot) => {
                        drop(free);
                        Ok(self.inner.checkout(slot))
                    }
                    None => {
                        drop(free);
                        Err(self.exhausted())
                    }
                };
            }
        }
    }

    /// Return a record to the pool. Equivalent to dropping the handle.
    pub fn release(&self, record: PooledRecord) {
        debug_assert!(Arc::ptr_eq(&self.inner, &record.pool), "record released to a foreign pool");
        drop(record);
    }

    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.inner.in_use()
    }

    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> usize {
        self.inner.ceiling
    }

    fn exhausted(&self) -> PoolError {
        PoolError::Exhausted { in_use: self.in_use() }
    }
}

/// Exclusive handle to one pooled record.
pub struct PooledRecord {
    slot: Option<Slot>,
    pool: Arc<PoolInner>,
}

impl PooledRecord {
    pub fn slot_index(&self) -> usize {
        self.slot().index
    }

    fn slot(&self) -> &Slot {
        self.slot.as_ref().expect("pooled record slot is present until drop")
    }
}

impl Deref for PooledRecord {
    type Target = MarketDataRecord;

    fn deref(&self) -> &MarketDataRecord {
        &self.slot().record
    }
}

impl DerefMut for PooledRecord {
    fn deref_mut(&mut self) -> &mut MarketDataRecord {
        &mut self.slot.as_mut().expect("pooled record slot is present until drop").record
    }
}

impl Drop for PooledRecord {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.put_back(slot);
        }
    }
}

impl std::fmt::Debug for PooledRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledRecord")
            .field("slot", &self.slot_index())
            .field("record", &**self)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::record::{InstrumentId, Level};
    use std::thread;

    fn pool(capacity: usize, ceiling: usize, policy: AcquirePolicy) -> RecordPool {
        RecordPool::new(PoolConfig { capacity, ceiling, policy, acquire_timeout: Duration::from_millis(20) })
    }

    #[test]
    fn test_reacquired_record_is_blank() {
        let pool = pool(1, 1, AcquirePolicy::Fail);
        let mut rec = pool.acquire().unwrap();
        rec.instrument = InstrumentId::new("rb2405").unwrap();
        rec.last_price = 3650.0;
        rec.sequence = 7;
        rec.asks[3] = Level { price: 1.0, volume: 2 };
        pool.release(rec);

        let again = pool.acquire().unwrap();
        assert!(again.is_blank());
        assert_eq!(again.slot_index(), 0);
    }

    #[test]
    fn test_fail_policy_errors_when_empty() {
        let pool = pool(2, 10, AcquirePolicy::Fail);
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert_eq!(pool.acquire().unwrap_err(), PoolError::Exhausted { in_use: 2 });
        assert_eq!(pool.ceiling(), 2);
    }

    #[test]
    fn test_grow_policy_stops_at_ceiling() {
        let pool = pool(1, 3, AcquirePolicy::Grow);
        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.allocated(), 3);
        assert!(pool.acquire().is_err());
        drop(held);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_block_policy_times_out() {
        let pool = pool(1, 1, AcquirePolicy::Block);
        let _held = pool.acquire().unwrap();
        let start = Instant::now();
        assert!(pool.acquire().is_err());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_block_policy_wakes_on_release() {
        let pool = RecordPool::new(PoolConfig {
            capacity: 1,
            ceiling: 1,
            policy: AcquirePolicy::Block,
            acquire_timeout: Duration::from_secs(2),
        });
        let held = pool.acquire().unwrap();
        let releaser = {
            let pool = pool.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                pool.release(held);
            })
        };
        let got = pool.acquire();
        releaser.join().unwrap();
        assert!(got.is_ok());
    }

    #[test]
    fn test_concurrent_acquire_release_keeps_accounting() {
        let pool = pool(8, 8, AcquirePolicy::Block);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        if let Ok(mut rec) = pool.acquire() {
                            assert!(rec.is_blank());
                            rec.volume = (t * 1000 + i) as i64;
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.available(), 8);
        assert_eq!(pool.in_use(), 0);
    }
}
