//! # Routing Table
//!
//! 256 K-buckets indexed by the length of the bit prefix a peer shares with
//! the local identity. Each bucket keeps at most K peers ordered from least to
//! most recently seen.
//!
//! ## Replacement Policy
//!
//! When a new peer lands in a full bucket the least-recently-seen entry is
//! pinged. If it answers it moves to the most-recent position and the new peer
//! is dropped; if it does not, it is evicted and the new peer inserted.
//! Long-lived peers are therefore never displaced by a flood of fresh ones.
//!
//! The ping runs outside the table lock. [`RoutingTable::observe`] reports a
//! [`PendingEviction`] and [`RoutingTable::resolve_eviction`] applies the ping
//! result; [`RoutingTable::add_or_refresh`] does both in one call.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::clock::{Clock, Timestamp};
use crate::identity::{Distance, Key, PeerId, PeerRecord};
use crate::protocols::{PeerNetwork, ping};

pub const BUCKET_COUNT: usize = 256;

#[derive(Debug, Clone)]
struct RoutingBucket {
    /// Oldest first.
    peers: Vec<PeerRecord>,
    last_refresh: Timestamp,
}

impl RoutingBucket {
    fn new(now: Timestamp) -> Self {
        Self {
            peers: Vec::new(),
            last_refresh: now,
        }
    }

    fn position(&self, id: &PeerId) -> Option<usize> {
        self.peers.iter().position(|p| &p.id == id)
    }

    fn touch(&mut self, record: PeerRecord, k: usize, now: Timestamp) -> BucketTouch {
        if let Some(pos) = self.position(&record.id) {
            let mut existing = self.peers.remove(pos);
            existing.merge_from(&record);
            self.peers.push(existing);
            self.last_refresh = now;
            return BucketTouch::Refreshed;
        }

        if self.peers.len() < k {
            self.peers.push(record);
            self.last_refresh = now;
            return BucketTouch::Inserted;
        }

        match self.peers.first() {
            Some(oldest) => BucketTouch::Full {
                oldest: oldest.clone(),
                candidate: record,
            },
            // k == 0: nothing can ever be stored.
            None => BucketTouch::Ignored,
        }
    }

    fn refresh(&mut self, id: &PeerId, now: Timestamp) -> bool {
        match self.position(id) {
            Some(pos) => {
                let mut existing = self.peers.remove(pos);
                existing.last_seen = existing.last_seen.max(now);
                self.peers.push(existing);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        self.position(id).map(|pos| self.peers.remove(pos))
    }
}

enum BucketTouch {
    Inserted,
    Refreshed,
    Ignored,
    Full {
        oldest: PeerRecord,
        candidate: PeerRecord,
    },
}

/// A full bucket waiting on a liveness check of its oldest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEviction {
    pub bucket: usize,
    pub oldest: PeerRecord,
    pub candidate: PeerRecord,
}

/// Immediate result of [`RoutingTable::observe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Inserted,
    Refreshed,
    /// Local identity or an invalid key.
    Ignored,
    Pending(PendingEviction),
}

/// Final result of [`RoutingTable::add_or_refresh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    Refreshed,
    Ignored,
    /// The oldest entry failed its ping and was evicted for the new peer.
    Replaced { evicted: PeerId },
    /// The oldest entry answered; the new peer was dropped.
    Rejected { kept: PeerId },
}

/// Bucket index of `other` relative to `local`.
///
/// Equal identities map to the last bucket; callers never insert the local id.
pub fn bucket_index(local: &PeerId, other: &PeerId) -> usize {
    local
        .key()
        .common_prefix_len(&other.key())
        .min(BUCKET_COUNT - 1)
}

/// A uniformly random key whose bucket relative to `local` is `bucket_idx`.
pub fn random_key_in_bucket(local: &PeerId, bucket_idx: usize) -> Key {
    let bucket_idx = bucket_idx.min(BUCKET_COUNT - 1);
    let mut distance = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut distance);

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;
    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

    let local = local.as_bytes();
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = local[i] ^ distance[i];
    }
    Key::from_bytes(out)
}

pub struct RoutingTable {
    local: PeerId,
    k: usize,
    clock: Arc<dyn Clock>,
    buckets: RwLock<Vec<RoutingBucket>>,
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("local", &self.local)
            .field("k", &self.k)
            .finish_non_exhaustive()
    }
}

impl RoutingTable {
    pub fn new(local: PeerId, k: usize, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let buckets = (0..BUCKET_COUNT).map(|_| RoutingBucket::new(now)).collect();
        Self {
            local,
            k,
            clock,
            buckets: RwLock::new(buckets),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Record that `record` answered us just now.
    ///
    /// Inserts or refreshes immediately where possible. A full bucket yields
    /// [`Observation::Pending`]; the caller pings the oldest entry and hands
    /// the result to [`resolve_eviction`](Self::resolve_eviction).
    pub async fn observe(&self, mut record: PeerRecord) -> Observation {
        if record.id == self.local || !record.id.is_valid() {
            return Observation::Ignored;
        }
        let now = self.clock.now();
        record.last_seen = record.last_seen.max(now);
        let idx = bucket_index(&self.local, &record.id);

        let mut buckets = self.buckets.write().await;
        match buckets[idx].touch(record, self.k, now) {
            BucketTouch::Inserted => Observation::Inserted,
            BucketTouch::Refreshed => Observation::Refreshed,
            BucketTouch::Ignored => Observation::Ignored,
            BucketTouch::Full { oldest, candidate } => Observation::Pending(PendingEviction {
                bucket: idx,
                oldest,
                candidate,
            }),
        }
    }

    pub async fn resolve_eviction(&self, pending: PendingEviction, oldest_alive: bool) -> AddOutcome {
        let now = self.clock.now();
        let mut buckets = self.buckets.write().await;
        let bucket = &mut buckets[pending.bucket];

        if oldest_alive {
            bucket.refresh(&pending.oldest.id, now);
            trace!(
                kept = %pending.oldest.id.short_hex(),
                dropped = %pending.candidate.id.short_hex(),
                "oldest bucket entry alive, dropping candidate"
            );
            return AddOutcome::Rejected {
                kept: pending.oldest.id,
            };
        }

        let evicted = bucket.remove(&pending.oldest.id).is_some();
        if bucket.position(&pending.candidate.id).is_some() {
            return AddOutcome::Refreshed;
        }
        if bucket.peers.len() < self.k {
            bucket.peers.push(pending.candidate.clone());
            bucket.last_refresh = now;
            debug!(
                evicted = %pending.oldest.id.short_hex(),
                inserted = %pending.candidate.id.short_hex(),
                bucket = pending.bucket,
                "replaced unresponsive routing entry"
            );
            if evicted {
                return AddOutcome::Replaced {
                    evicted: pending.oldest.id,
                };
            }
            return AddOutcome::Inserted;
        }
        // Filled concurrently while the ping was in flight.
        AddOutcome::Rejected {
            kept: pending.oldest.id,
        }
    }

    /// Insert or refresh `record`, pinging the oldest entry of a full bucket.
    pub async fn add_or_refresh<N: PeerNetwork + ?Sized>(
        &self,
        record: PeerRecord,
        network: &N,
        ping_timeout: Duration,
    ) -> AddOutcome {
        match self.observe(record).await {
            Observation::Inserted => AddOutcome::Inserted,
            Observation::Refreshed => AddOutcome::Refreshed,
            Observation::Ignored => AddOutcome::Ignored,
            Observation::Pending(pending) => {
                let alive = ping(network, &pending.oldest.id, ping_timeout).await;
                self.resolve_eviction(pending, alive).await
            }
        }
    }

    /// Like [`add_or_refresh`](Self::add_or_refresh) but never waits on the
    /// liveness check: a full bucket's ping runs on a spawned task.
    pub async fn observe_responsive<N: PeerNetwork + ?Sized>(
        self: &Arc<Self>,
        record: PeerRecord,
        network: Arc<N>,
        ping_timeout: Duration,
    ) {
        if let Observation::Pending(pending) = self.observe(record).await {
            let table = Arc::clone(self);
            tokio::spawn(async move {
                let alive = ping(network.as_ref(), &pending.oldest.id, ping_timeout).await;
                table.resolve_eviction(pending, alive).await;
            });
        }
    }

    /// Up to `count` known peers ordered by ascending XOR distance to
    /// `target`, most recently seen first on equal distance.
    pub async fn closest_known(&self, target: &Key, count: usize) -> Vec<PeerRecord> {
        if count == 0 {
            return Vec::new();
        }

        struct Candidate {
            distance: Distance,
            last_seen: Timestamp,
            record: PeerRecord,
        }

        impl Candidate {
            fn rank(&self) -> (Distance, Reverse<Timestamp>) {
                (self.distance, Reverse(self.last_seen))
            }
        }

        impl PartialEq for Candidate {
            fn eq(&self, other: &Self) -> bool {
                self.rank() == other.rank()
            }
        }

        impl Eq for Candidate {}

        impl Ord for Candidate {
            fn cmp(&self, other: &Self) -> Ordering {
                self.rank().cmp(&other.rank())
            }
        }

        impl PartialOrd for Candidate {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let buckets = self.buckets.read().await;
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(count + 1);
        for bucket in buckets.iter() {
            for record in &bucket.peers {
                let candidate = Candidate {
                    distance: record.id.key().distance(target),
                    last_seen: record.last_seen,
                    record: record.clone(),
                };
                if heap.len() < count {
                    heap.push(candidate);
                } else if let Some(worst) = heap.peek()
                    && candidate < *worst
                {
                    heap.push(candidate);
                    heap.pop();
                }
            }
        }

        heap.into_sorted_vec().into_iter().map(|c| c.record).collect()
    }

    pub async fn remove(&self, id: &PeerId) -> Option<PeerRecord> {
        if *id == self.local {
            return None;
        }
        let idx = bucket_index(&self.local, id);
        self.buckets.write().await[idx].remove(id)
    }

    pub async fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        if *id == self.local {
            return None;
        }
        let idx = bucket_index(&self.local, id);
        let buckets = self.buckets.read().await;
        buckets[idx].position(id).map(|pos| buckets[idx].peers[pos].clone())
    }

    pub async fn len(&self) -> usize {
        self.buckets.read().await.iter().map(|b| b.peers.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Entries of one bucket, oldest first.
    pub async fn bucket_entries(&self, idx: usize) -> Vec<PeerRecord> {
        let buckets = self.buckets.read().await;
        buckets.get(idx).map(|b| b.peers.clone()).unwrap_or_default()
    }

    /// Non-empty buckets that have not been touched for `threshold`.
    pub async fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        let now = self.clock.now();
        self.buckets
            .read()
            .await
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                !b.peers.is_empty() && now.saturating_duration_since(b.last_refresh) > threshold
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    pub async fn mark_bucket_refreshed(&self, idx: usize) {
        let now = self.clock.now();
        if let Some(bucket) = self.buckets.write().await.get_mut(idx) {
            bucket.last_refresh = now;
        }
    }
}
