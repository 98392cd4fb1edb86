//! # Record Store
//!
//! In-memory holder for the three kinds of records a node caches:
//!
//! | Map | Key | Bound | Expiry |
//! |-----|-----|-------|--------|
//! | providers | [`ContentId`] | `max_provider_keys` (LRU), `max_providers_per_key` | `now > timestamp + ttl` |
//! | peers | [`PeerId`] | `max_peer_records` (LRU) | `now > stored_at + peer_record_ttl` |
//! | names | [`Name`] | `max_name_records` (LRU) | `now > validity` |
//!
//! Expired entries are dropped lazily on read and in bulk by
//! [`RecordStore::prune_expired`]. The store never renews a record by itself;
//! providers stay alive only while their origin keeps re-announcing. When a
//! map is full the least recently written key is evicted.
//!
//! All three maps sit behind one lock.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::clock::{Clock, Timestamp};
use crate::identity::{ContentId, PeerId, PeerRecord};
use crate::ipns::{Name, NameRecord, PutOutcome, Selection, select_best};

/// A peer announced as able to serve some content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderRecord {
    pub content: ContentId,
    pub provider: PeerRecord,
    /// When the announcement was received.
    pub timestamp: Timestamp,
    pub ttl: Duration,
}

impl ProviderRecord {
    pub fn expires_at(&self) -> Timestamp {
        self.timestamp.saturating_add(self.ttl)
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now > self.expires_at()
    }
}

#[derive(Clone, Debug)]
pub struct StoreLimits {
    pub provider_ttl: Duration,
    pub max_providers_per_key: usize,
    /// Distinct content ids with provider records.
    pub max_provider_keys: usize,
    pub peer_record_ttl: Duration,
    pub max_peer_records: usize,
    pub max_name_records: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            provider_ttl: Duration::from_secs(48 * 60 * 60),
            max_providers_per_key: 20,
            max_provider_keys: 100_000,
            peer_record_ttl: Duration::from_secs(24 * 60 * 60),
            max_peer_records: 10_000,
            max_name_records: 10_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub providers: usize,
    pub peers: usize,
    pub names: usize,
}

impl PruneStats {
    pub fn total(&self) -> usize {
        self.providers + self.peers + self.names
    }
}

#[derive(Clone, Debug)]
struct StoredPeer {
    record: PeerRecord,
    stored_at: Timestamp,
}

struct StoreInner {
    providers: LruCache<ContentId, Vec<ProviderRecord>>,
    peers: LruCache<PeerId, StoredPeer>,
    names: LruCache<Name, NameRecord>,
}

fn bounded<K: Hash + Eq, V>(capacity: usize) -> LruCache<K, V> {
    LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
}

/// Pop every entry of `cache` matching `expired`; returns how many went.
fn pop_where<K: Hash + Eq + Copy, V>(cache: &mut LruCache<K, V>, expired: impl Fn(&V) -> bool) -> usize {
    let keys: Vec<K> = cache
        .iter()
        .filter(|(_, value)| expired(value))
        .map(|(key, _)| *key)
        .collect();
    for key in &keys {
        cache.pop(key);
    }
    keys.len()
}

pub struct RecordStore {
    clock: Arc<dyn Clock>,
    limits: StoreLimits,
    inner: RwLock<StoreInner>,
}

impl RecordStore {
    pub fn new(clock: Arc<dyn Clock>, limits: StoreLimits) -> Self {
        let inner = StoreInner {
            providers: bounded(limits.max_provider_keys),
            peers: bounded(limits.max_peer_records),
            names: bounded(limits.max_name_records),
        };
        Self {
            clock,
            limits,
            inner: RwLock::new(inner),
        }
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Providers
    // ------------------------------------------------------------------

    /// Record `provider` for `content` with the default TTL.
    pub async fn put_provider(&self, content: ContentId, provider: PeerRecord) {
        self.put_provider_with_ttl(content, provider, self.limits.provider_ttl)
            .await
    }

    /// Re-announcing an existing (content, peer) pair refreshes it in place.
    pub async fn put_provider_with_ttl(&self, content: ContentId, provider: PeerRecord, ttl: Duration) {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        if !inner.providers.contains(&content)
            && let Some((evicted, _)) = inner.providers.push(content, Vec::new())
            && evicted != content
        {
            debug!(evicted = %evicted.short_hex(), "provider key capacity reached, evicting least recent");
        }
        let Some(entries) = inner.providers.get_mut(&content) else {
            return;
        };

        if let Some(existing) = entries.iter_mut().find(|r| r.provider.id == provider.id) {
            existing.provider.merge_from(&provider);
            existing.timestamp = now;
            existing.ttl = ttl;
            trace!(content = %content.short_hex(), provider = %provider.id.short_hex(), "provider refreshed");
            return;
        }

        entries.retain(|r| !r.is_expired_at(now));
        entries.push(ProviderRecord {
            content,
            provider,
            timestamp: now,
            ttl,
        });
        while entries.len() > self.limits.max_providers_per_key.max(1) {
            let Some(oldest) = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.timestamp)
                .map(|(idx, _)| idx)
            else {
                break;
            };
            let evicted = entries.remove(oldest);
            debug!(
                content = %content.short_hex(),
                evicted = %evicted.provider.id.short_hex(),
                "provider capacity reached, evicting oldest"
            );
        }
    }

    /// Live providers of `content`, newest announcement first.
    pub async fn get_providers(&self, content: &ContentId) -> Vec<ProviderRecord> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let Some(entries) = inner.providers.peek_mut(content) else {
            return Vec::new();
        };
        entries.retain(|r| !r.is_expired_at(now));
        if entries.is_empty() {
            inner.providers.pop(content);
            return Vec::new();
        }
        let mut out = entries.clone();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out
    }

    // ------------------------------------------------------------------
    // Peer records
    // ------------------------------------------------------------------

    pub async fn put_peer_record(&self, record: PeerRecord) {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        match inner.peers.get_mut(&record.id) {
            Some(stored) => {
                stored.record.merge_from(&record);
                stored.stored_at = now;
            }
            None => {
                inner.peers.put(
                    record.id,
                    StoredPeer {
                        record,
                        stored_at: now,
                    },
                );
            }
        }
    }

    pub async fn get_peer_record(&self, id: &PeerId) -> Option<PeerRecord> {
        let now = self.clock.now();
        let inner = self.inner.read().await;
        inner
            .peers
            .peek(id)
            .filter(|stored| !self.peer_expired(stored, now))
            .map(|stored| stored.record.clone())
    }

    fn peer_expired(&self, stored: &StoredPeer, now: Timestamp) -> bool {
        now > stored.stored_at.saturating_add(self.limits.peer_record_ttl)
    }

    // ------------------------------------------------------------------
    // Name records
    // ------------------------------------------------------------------

    /// The held record for `name` if its validity has not passed.
    pub async fn get_name_record(&self, name: &Name) -> Option<NameRecord> {
        let now = self.clock.now();
        {
            let inner = self.inner.read().await;
            match inner.names.peek(name) {
                None => return None,
                Some(record) if !record.is_expired_at(now) => return Some(record.clone()),
                Some(_) => {}
            }
        }
        let mut inner = self.inner.write().await;
        if inner.names.peek(name).is_some_and(|r| r.is_expired_at(now)) {
            inner.names.pop(name);
        }
        None
    }

    /// Offer an already validated record. Only a record that
    /// [`select_best`] prefers over the held one is kept; an expired held
    /// record counts as absent.
    pub async fn put_name_record(&self, name: Name, record: NameRecord) -> PutOutcome {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let current = inner.names.peek(&name).filter(|r| !r.is_expired_at(now));
        match select_best(&record, current) {
            Selection::Replace => {
                trace!(name = %name.peer_id().short_hex(), sequence = record.sequence, "name record stored");
                if let Some((evicted, _)) = inner.names.push(name, record)
                    && evicted != name
                {
                    debug!(evicted = %evicted.peer_id().short_hex(), "name record capacity reached, evicting least recent");
                }
                PutOutcome::Accepted
            }
            Selection::KeepCurrent => PutOutcome::Stale,
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    pub async fn prune_expired(&self, now: Timestamp) -> PruneStats {
        let mut stats = PruneStats::default();
        let mut inner = self.inner.write().await;

        for (_, entries) in inner.providers.iter_mut() {
            let before = entries.len();
            entries.retain(|r| !r.is_expired_at(now));
            stats.providers += before - entries.len();
        }
        pop_where(&mut inner.providers, |entries| entries.is_empty());
        stats.peers = pop_where(&mut inner.peers, |stored| self.peer_expired(stored, now));
        stats.names = pop_where(&mut inner.names, |record| record.is_expired_at(now));

        if stats.total() > 0 {
            debug!(
                providers = stats.providers,
                peers = stats.peers,
                names = stats.names,
                "pruned expired records"
            );
        }
        stats
    }

    pub async fn provider_key_count(&self) -> usize {
        self.inner.read().await.providers.len()
    }

    pub async fn peer_record_count(&self) -> usize {
        self.inner.read().await.peers.len()
    }

    pub async fn name_record_count(&self) -> usize {
        self.inner.read().await.names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::Keypair;

    const START: Timestamp = Timestamp::from_millis(1_000_000);

    fn setup(limits: StoreLimits) -> (Arc<ManualClock>, RecordStore) {
        let clock = Arc::new(ManualClock::new(START));
        let store = RecordStore::new(clock.clone(), limits);
        (clock, store)
    }

    fn peer() -> PeerRecord {
        PeerRecord::new(Keypair::generate().peer_id(), vec!["127.0.0.1:4001".into()])
    }

    #[tokio::test]
    async fn provider_expires_exactly_after_ttl() {
        let ttl = Duration::from_secs(60);
        let (clock, store) = setup(StoreLimits {
            provider_ttl: ttl,
            ..StoreLimits::default()
        });
        let content = ContentId::for_content(b"block");
        let provider = peer();
        store.put_provider(content, provider.clone()).await;

        clock.set(START.saturating_add(ttl).saturating_sub(Duration::from_millis(1)));
        assert_eq!(store.get_providers(&content).await.len(), 1);
        clock.set(START.saturating_add(ttl));
        assert_eq!(store.get_providers(&content).await.len(), 1);
        clock.set(START.saturating_add(ttl).saturating_add(Duration::from_millis(1)));
        assert!(store.get_providers(&content).await.is_empty());
        assert_eq!(store.provider_key_count().await, 0);
    }

    #[tokio::test]
    async fn reannounce_refreshes_without_duplicating() {
        let ttl = Duration::from_secs(60);
        let (clock, store) = setup(StoreLimits {
            provider_ttl: ttl,
            ..StoreLimits::default()
        });
        let content = ContentId::for_content(b"block");
        let provider = peer();
        store.put_provider(content, provider.clone()).await;
        clock.advance(Duration::from_secs(50));
        store.put_provider(content, provider.clone()).await;
        clock.advance(Duration::from_secs(50));

        let providers = store.get_providers(&content).await;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].provider.id, provider.id);
    }

    #[tokio::test]
    async fn provider_capacity_evicts_oldest() {
        let (clock, store) = setup(StoreLimits {
            max_providers_per_key: 2,
            ..StoreLimits::default()
        });
        let content = ContentId::for_content(b"block");
        let (a, b, c) = (peer(), peer(), peer());
        store.put_provider(content, a.clone()).await;
        clock.advance(Duration::from_secs(1));
        store.put_provider(content, b.clone()).await;
        clock.advance(Duration::from_secs(1));
        store.put_provider(content, c.clone()).await;

        let ids: Vec<PeerId> = store
            .get_providers(&content)
            .await
            .iter()
            .map(|r| r.provider.id)
            .collect();
        assert_eq!(ids, vec![c.id, b.id]);
    }

    #[tokio::test]
    async fn peer_records_merge_and_expire() {
        let ttl = Duration::from_secs(10);
        let (clock, store) = setup(StoreLimits {
            peer_record_ttl: ttl,
            ..StoreLimits::default()
        });
        let mut record = peer();
        store.put_peer_record(record.clone()).await;
        record.addrs = vec!["127.0.0.1:5001".into()];
        store.put_peer_record(record.clone()).await;
        assert_eq!(
            store.get_peer_record(&record.id).await.map(|r| r.addrs),
            Some(vec!["127.0.0.1:5001".to_string()])
        );

        clock.advance(ttl + Duration::from_millis(1));
        assert!(store.get_peer_record(&record.id).await.is_none());
        assert_eq!(store.prune_expired(clock.now()).await.peers, 1);
        assert_eq!(store.peer_record_count().await, 0);
    }

    #[tokio::test]
    async fn peer_records_are_lru_bounded() {
        let (_, store) = setup(StoreLimits {
            max_peer_records: 2,
            ..StoreLimits::default()
        });
        let (a, b, c) = (peer(), peer(), peer());
        store.put_peer_record(a.clone()).await;
        store.put_peer_record(b.clone()).await;
        store.put_peer_record(c.clone()).await;
        assert!(store.get_peer_record(&a.id).await.is_none());
        assert!(store.get_peer_record(&c.id).await.is_some());
    }

    #[tokio::test]
    async fn provider_keys_are_lru_bounded() {
        let (_, store) = setup(StoreLimits {
            max_provider_keys: 2,
            ..StoreLimits::default()
        });
        let (a, b, c) = (
            ContentId::for_content(b"a"),
            ContentId::for_content(b"b"),
            ContentId::for_content(b"c"),
        );
        store.put_provider(a, peer()).await;
        store.put_provider(b, peer()).await;
        // Re-announcing `a` makes `b` the least recent key.
        store.put_provider(a, peer()).await;
        store.put_provider(c, peer()).await;

        assert_eq!(store.provider_key_count().await, 2);
        assert_eq!(store.get_providers(&a).await.len(), 2);
        assert!(store.get_providers(&b).await.is_empty());
        assert_eq!(store.get_providers(&c).await.len(), 1);
    }

    #[tokio::test]
    async fn name_records_are_lru_bounded() {
        let (_, store) = setup(StoreLimits {
            max_name_records: 3,
            ..StoreLimits::default()
        });
        let deadline = START.saturating_add(Duration::from_secs(3600));
        let mut names = Vec::new();
        for _ in 0..5 {
            let kp = Keypair::generate();
            let name = Name::for_keypair(&kp);
            let record = NameRecord::new_signed(&kp, "/ipfs/flood", 1, deadline, Duration::from_secs(60));
            assert_eq!(store.put_name_record(name, record).await, PutOutcome::Accepted);
            names.push(name);
        }

        assert_eq!(store.name_record_count().await, 3);
        assert!(store.get_name_record(&names[0]).await.is_none());
        assert!(store.get_name_record(&names[1]).await.is_none());
        assert!(store.get_name_record(&names[4]).await.is_some());
    }

    #[tokio::test]
    async fn name_records_follow_selection_rules() {
        let (_, store) = setup(StoreLimits::default());
        let kp = Keypair::generate();
        let name = Name::for_keypair(&kp);
        let deadline = START.saturating_add(Duration::from_secs(3600));
        let five = NameRecord::new_signed(&kp, "/ipfs/five", 5, deadline, Duration::from_secs(60));
        let six = NameRecord::new_signed(&kp, "/ipfs/six", 6, deadline, Duration::from_secs(60));

        assert_eq!(store.put_name_record(name, six.clone()).await, PutOutcome::Accepted);
        assert_eq!(store.put_name_record(name, five).await, PutOutcome::Stale);
        assert_eq!(store.put_name_record(name, six.clone()).await, PutOutcome::Stale);
        assert_eq!(store.get_name_record(&name).await, Some(six));
    }

    #[tokio::test]
    async fn expired_name_record_is_dropped_on_read() {
        let (clock, store) = setup(StoreLimits::default());
        let kp = Keypair::generate();
        let name = Name::for_keypair(&kp);
        let deadline = START.saturating_add(Duration::from_secs(10));
        let rec = NameRecord::new_signed(&kp, "/ipfs/x", 1, deadline, Duration::from_secs(60));
        store.put_name_record(name, rec.clone()).await;

        clock.set(deadline);
        assert_eq!(store.get_name_record(&name).await, Some(rec));
        clock.advance(Duration::from_millis(1));
        assert_eq!(store.get_name_record(&name).await, None);
    }

    #[tokio::test]
    async fn prune_removes_every_expired_kind() {
        let ttl = Duration::from_secs(5);
        let (clock, store) = setup(StoreLimits {
            provider_ttl: ttl,
            peer_record_ttl: ttl,
            ..StoreLimits::default()
        });
        let kp = Keypair::generate();
        let name = Name::for_keypair(&kp);
        store.put_provider(ContentId::for_content(b"a"), peer()).await;
        store.put_peer_record(peer()).await;
        store
            .put_name_record(
                name,
                NameRecord::new_signed(&kp, "/ipfs/x", 1, START.saturating_add(ttl), ttl),
            )
            .await;

        assert_eq!(store.prune_expired(clock.now()).await.total(), 0);
        clock.advance(ttl + Duration::from_millis(1));
        let stats = store.prune_expired(clock.now()).await;
        assert_eq!(
            stats,
            PruneStats {
                providers: 1,
                peers: 1,
                names: 1
            }
        );
    }
}
