//! Subscribed-instrument membership.
//!
//! An instrument is present while subscribed and absent once unsubscribed.
//! Marks are optimistic: they change when the request is built, not when the
//! venue acknowledges it. A subscribe that never left the process stays marked
//! but is flagged `Pending` until a later send gets it out.

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::market_data::record::InstrumentId;

/// Instruments per subscribe/unsubscribe call when the venue gives no tighter limit.
pub const DEFAULT_MAX_BATCH: usize = 100;

/// A request batch; stays on the stack for typical sizes.
pub type Batch = SmallVec<[InstrumentId; 16]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    /// Marked subscribed, but the request carrying it failed locally.
    Pending,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: RwLock<AHashMap<InstrumentId, Delivery>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instruments in `requested` that still need a subscribe request, in request
    /// order and without repeats: the unmarked ones plus any left pending. All of
    /// `requested` ends up marked as sent.
    pub fn diff_subscribe(&self, requested: &[InstrumentId]) -> Vec<InstrumentId> {
        let mut topics = self.topics.write();
        let mut net_new = Vec::new();
        for id in requested {
            if topics.insert(*id, Delivery::Sent) != Some(Delivery::Sent) {
                net_new.push(*id);
            }
        }
        net_new
    }

    /// Instruments in `requested` that are currently subscribed; their entries are removed.
    pub fn diff_unsubscribe(&self, requested: &[InstrumentId]) -> Vec<InstrumentId> {
        let mut topics = self.topics.write();
        requested.iter().filter(|id| topics.remove(*id).is_some()).copied().collect()
    }

    /// Flag `ids` whose subscribe request failed. Entries unsubscribed in the
    /// meantime stay gone.
    pub fn mark_pending(&self, ids: &[InstrumentId]) {
        let mut topics = self.topics.write();
        for id in ids {
            if let Some(delivery) = topics.get_mut(id) {
                *delivery = Delivery::Pending;
            }
        }
    }

    /// Put back `ids` whose unsubscribe request failed, so the venue and the
    /// registry agree again. Existing entries are left as they are.
    pub fn restore(&self, ids: &[InstrumentId]) {
        let mut topics = self.topics.write();
        for id in ids {
            topics.entry(*id).or_insert(Delivery::Sent);
        }
    }

    /// Claim every pending instrument for sending, sorted. They are marked as sent.
    pub fn take_pending(&self) -> Vec<InstrumentId> {
        let mut topics = self.topics.write();
        let mut ids = Vec::new();
        for (id, delivery) in topics.iter_mut() {
            if *delivery == Delivery::Pending {
                *delivery = Delivery::Sent;
                ids.push(*id);
            }
        }
        sort(&mut ids);
        ids
    }

    /// Claim everything subscribed for a fresh send, e.g. after a relogin.
    pub fn take_all(&self) -> Vec<InstrumentId> {
        let mut topics = self.topics.write();
        topics.values_mut().for_each(|d| *d = Delivery::Sent);
        let mut ids: Vec<_> = topics.keys().copied().collect();
        sort(&mut ids);
        ids
    }

    pub fn is_subscribed(&self, id: &InstrumentId) -> bool {
        self.topics.read().contains_key(id)
    }

    pub fn is_pending(&self, id: &InstrumentId) -> bool {
        self.topics.read().get(id) == Some(&Delivery::Pending)
    }

    pub fn pending_len(&self) -> usize {
        self.topics.read().values().filter(|d| **d == Delivery::Pending).count()
    }

    /// Everything currently marked subscribed, sorted for stable request order.
    pub fn subscribed(&self) -> Vec<InstrumentId> {
        let mut ids: Vec<_> = self.topics.read().keys().copied().collect();
        sort(&mut ids);
        ids
    }

    pub fn len(&self) -> usize {
        self.topics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sort(ids: &mut [InstrumentId]) {
    ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
}

/// Split `ids` into request batches of at most `max_batch` instruments.
pub fn batches(ids: &[InstrumentId], max_batch: usize) -> impl Iterator<Item = Batch> + '_ {
    ids.chunks(max_batch.max(1)).map(|chunk| chunk.iter().copied().collect())
}
