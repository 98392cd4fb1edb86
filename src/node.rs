//! # DHT Node
//!
//! A [`DhtNode`] owns the shared routing table and record store of one local
//! identity. It answers inbound DHT requests, publishes provider and name
//! records to the peers closest to their keys, and runs the background
//! maintenance loops:
//!
//! | Loop | Interval | Work |
//! |------|----------|------|
//! | prune | `prune_interval_secs` | drop expired records |
//! | reprovide | `reprovide_interval_secs` | re-announce provided content |
//! | refresh | `bucket_refresh_interval_secs` | random lookup in each stale bucket |
//!
//! All loops stop when [`DhtNode::shutdown`] is called.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::config::DhtConfig;
use crate::error::DhtError;
use crate::identity::{ContentId, Key, PeerId, PeerRecord};
use crate::ipns::{Name, NameRecord, PutOutcome, validate};
use crate::lookup::{LookupEngine, LookupParams};
use crate::messages::{DhtRequest, DhtResponse, MAX_CONTACTS_PER_RESPONSE};
use crate::protocols::{DhtHandler, PeerNetwork};
use crate::routing::{RoutingTable, random_key_in_bucket};
use crate::store::RecordStore;

pub struct DhtNode<N: PeerNetwork + ?Sized> {
    local: PeerRecord,
    config: DhtConfig,
    clock: Arc<dyn Clock>,
    routing: Arc<RoutingTable>,
    store: Arc<RecordStore>,
    lookup: LookupEngine<N>,
    provided: Arc<RwLock<HashSet<ContentId>>>,
    shutdown: CancellationToken,
}

impl<N: PeerNetwork + ?Sized> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
            routing: Arc::clone(&self.routing),
            store: Arc::clone(&self.store),
            lookup: self.lookup.clone(),
            provided: Arc::clone(&self.provided),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<N: PeerNetwork + ?Sized> DhtNode<N> {
    pub fn new(local: PeerRecord, network: Arc<N>, config: DhtConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(RecordStore::new(Arc::clone(&clock), config.store_limits()));
        Self::with_store(local, network, config, clock, store)
    }

    /// Build a node around an existing record store.
    pub fn with_store(
        local: PeerRecord,
        network: Arc<N>,
        config: DhtConfig,
        clock: Arc<dyn Clock>,
        store: Arc<RecordStore>,
    ) -> Self {
        let routing = Arc::new(RoutingTable::new(local.id, config.k, Arc::clone(&clock)));
        Self::from_parts(local, network, config, clock, store, routing)
    }

    /// Build a node around a record store and routing table that the
    /// transport shares for address resolution.
    pub fn from_parts(
        local: PeerRecord,
        network: Arc<N>,
        config: DhtConfig,
        clock: Arc<dyn Clock>,
        store: Arc<RecordStore>,
        routing: Arc<RoutingTable>,
    ) -> Self {
        let lookup = LookupEngine::new(
            Arc::clone(&routing),
            Arc::clone(&store),
            network,
            LookupParams::from_config(&config),
            Arc::clone(&clock),
        );
        Self {
            local,
            config,
            clock,
            routing,
            store,
            lookup,
            provided: Arc::new(RwLock::new(HashSet::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.local.id
    }

    /// This node's own record, stamped with the current time.
    pub fn local_record(&self) -> PeerRecord {
        self.local.clone().with_last_seen(self.clock.now())
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn lookup(&self) -> &LookupEngine<N> {
        &self.lookup
    }

    /// Cancelled by [`shutdown`](Self::shutdown); lookups may derive child tokens.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // ------------------------------------------------------------------
    // Joining the network
    // ------------------------------------------------------------------

    /// Contact `seeds` and look up our own identity to populate the routing
    /// table. Returns the number of peers known afterwards.
    pub async fn bootstrap(&self, seeds: Vec<PeerRecord>) -> Result<usize, DhtError> {
        let mut reachable = Vec::new();
        for seed in seeds {
            if seed.id == self.local.id {
                continue;
            }
            match self.lookup.query_peer(&seed, DhtRequest::Ping).await {
                Ok(DhtResponse::Pong) => reachable.push(seed),
                Ok(other) => warn!(peer = %seed.id.short_hex(), response = other.kind(), "unexpected bootstrap response"),
                Err(err) => warn!(peer = %seed.id.short_hex(), error = %err, "bootstrap peer unreachable"),
            }
        }
        if reachable.is_empty() && self.routing.is_empty().await {
            return Err(DhtError::NotFound);
        }

        let cancel = self.shutdown.child_token();
        match self
            .lookup
            .find_closest_peers_from(self.local.id.key(), reachable, &cancel)
            .await
        {
            Ok(found) => debug!(found = found.len(), "self lookup complete"),
            Err(DhtError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let known = self.routing.len().await;
        info!(peers = known, "bootstrap complete");
        Ok(known)
    }

    // ------------------------------------------------------------------
    // Providing content
    // ------------------------------------------------------------------

    /// Record ourselves as a provider of `content` and announce it to the K
    /// closest peers. The content is re-announced until
    /// [`stop_providing`](Self::stop_providing). Returns how many peers
    /// acknowledged.
    pub async fn provide(&self, content: ContentId) -> Result<usize, DhtError> {
        self.provided.write().await.insert(content);
        self.store.put_provider(content, self.local_record()).await;
        self.announce(content).await
    }

    pub async fn stop_providing(&self, content: &ContentId) {
        self.provided.write().await.remove(content);
    }

    async fn announce(&self, content: ContentId) -> Result<usize, DhtError> {
        let cancel = self.shutdown.child_token();
        let closest = match self.lookup.find_closest_peers(content.key(), &cancel).await {
            Ok(closest) => closest,
            Err(DhtError::NotFound) => {
                debug!(content = %content.short_hex(), "no peers to announce provider record to");
                return Ok(0);
            }
            Err(err) => return Err(err),
        };

        let request = DhtRequest::AddProvider {
            content,
            provider: self.local_record(),
        };
        let acked = self.send_to_all(closest, request).await;
        debug!(content = %content.short_hex(), acked, "provider record announced");
        Ok(acked)
    }

    // ------------------------------------------------------------------
    // Name records
    // ------------------------------------------------------------------

    /// Push a name record to the K closest peers of its key. Returns how many
    /// acknowledged.
    pub async fn forward_name_record(&self, name: Name, record: NameRecord) -> Result<usize, DhtError> {
        let cancel = self.shutdown.child_token();
        let closest = match self.lookup.find_closest_peers(name.key(), &cancel).await {
            Ok(closest) => closest,
            Err(DhtError::NotFound) => return Ok(0),
            Err(err) => return Err(err),
        };
        let acked = self
            .send_to_all(closest, DhtRequest::PutValue { name, record })
            .await;
        debug!(name = %name.peer_id().short_hex(), acked, "name record forwarded");
        Ok(acked)
    }

    async fn send_to_all(&self, peers: Vec<PeerRecord>, request: DhtRequest) -> usize {
        let mut join_set = JoinSet::new();
        for peer in peers.into_iter().take(self.config.k) {
            let lookup = self.lookup.clone();
            let request = request.clone();
            join_set.spawn(async move { lookup.query_peer(&peer, request).await });
        }
        let mut acked = 0;
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Ok(DhtResponse::Ack)) = joined {
                acked += 1;
            }
        }
        acked
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Prune expired records once. Also run periodically by the maintenance
    /// task.
    pub async fn prune(&self) {
        self.store.prune_expired(self.clock.now()).await;
    }

    /// Re-announce every content this node provides.
    pub async fn reprovide(&self) {
        let provided: Vec<ContentId> = self.provided.read().await.iter().copied().collect();
        for content in provided {
            self.store.put_provider(content, self.local_record()).await;
            if let Err(err) = self.announce(content).await {
                debug!(content = %content.short_hex(), error = %err, "reprovide failed");
            }
        }
    }

    /// Random lookups into every bucket untouched for a refresh interval.
    pub async fn refresh_buckets(&self) {
        let stale = self
            .routing
            .stale_buckets(self.config.bucket_refresh_interval())
            .await;
        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), "refreshing stale routing buckets");
        for bucket in stale {
            let target = random_key_in_bucket(&self.local.id, bucket);
            let cancel = self.shutdown.child_token();
            if let Err(err) = self.lookup.find_closest_peers(target, &cancel).await {
                trace!(bucket, error = %err, "bucket refresh lookup failed");
            }
            self.routing.mark_bucket_refreshed(bucket).await;
        }
    }

    /// Spawn the prune, reprovide and bucket-refresh loops.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let mut prune = interval_at(start + node.config.prune_interval(), nonzero(node.config.prune_interval()));
            let mut reprovide =
                interval_at(start + node.config.reprovide_interval(), nonzero(node.config.reprovide_interval()));
            let mut refresh = interval_at(
                start + node.config.bucket_refresh_interval(),
                nonzero(node.config.bucket_refresh_interval()),
            );
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => {
                        debug!("maintenance loop stopped");
                        break;
                    }
                    _ = prune.tick() => node.prune().await,
                    _ = reprovide.tick() => node.reprovide().await,
                    _ = refresh.tick() => node.refresh_buckets().await,
                }
            }
        })
    }

    async fn closer_peers(&self, target: &Key) -> Vec<PeerRecord> {
        let limit = self.config.k.min(MAX_CONTACTS_PER_RESPONSE);
        self.routing.closest_known(target, limit).await
    }
}

fn nonzero(period: Duration) -> Duration {
    period.max(Duration::from_millis(1))
}

#[async_trait]
impl<N: PeerNetwork + ?Sized> DhtHandler for DhtNode<N> {
    async fn handle_request(&self, from: PeerRecord, request: DhtRequest) -> DhtResponse {
        trace!(peer = %from.id.short_hex(), request = request.kind(), "inbound request");
        if from.id != self.local.id {
            if !from.addrs.is_empty() {
                self.store.put_peer_record(from.clone()).await;
            }
            self.routing
                .observe_responsive(
                    from.clone(),
                    Arc::clone(self.lookup.network()),
                    self.lookup.params().ping_timeout,
                )
                .await;
        }

        match request {
            DhtRequest::Ping => DhtResponse::Pong,
            DhtRequest::FindNode { target } => DhtResponse::Nodes(self.closer_peers(&target).await),
            DhtRequest::GetProviders { content } => {
                let providers = self
                    .store
                    .get_providers(&content)
                    .await
                    .into_iter()
                    .map(|r| r.provider)
                    .take(MAX_CONTACTS_PER_RESPONSE)
                    .collect();
                DhtResponse::Providers {
                    providers,
                    closer: self.closer_peers(&content.key()).await,
                }
            }
            DhtRequest::AddProvider { content, provider } => {
                if provider.id != from.id {
                    return DhtResponse::Error {
                        message: "provider record must describe the sender".into(),
                    };
                }
                self.store.put_provider(content, provider).await;
                DhtResponse::Ack
            }
            DhtRequest::GetValue { name } => DhtResponse::Value {
                record: self.store.get_name_record(&name).await,
                closer: self.closer_peers(&name.key()).await,
            },
            DhtRequest::PutValue { name, record } => {
                if let Err(err) = validate(&name, &record, self.clock.now()) {
                    debug!(peer = %from.id.short_hex(), error = %err, "rejected name record");
                    return DhtResponse::Error {
                        message: err.to_string(),
                    };
                }
                if self.store.put_name_record(name, record).await == PutOutcome::Stale {
                    trace!(name = %name.peer_id().short_hex(), "ignoring stale name record");
                }
                DhtResponse::Ack
            }
        }
    }
}
