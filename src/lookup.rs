//! # Iterative Lookup Engine
//!
//! One Kademlia lookup loop shared by every query kind. What differs between
//! peer, provider and name-record lookups is captured by a
//! [`ResponseInterpreter`]: which request to send and how to split a response
//! into closer peers and found values.
//!
//! ## Rounds
//!
//! 1. Seed the frontier with the K closest peers from the routing table.
//! 2. Query up to `alpha` unqueried frontier peers concurrently, each with its
//!    own timeout and a bounded number of retries.
//! 3. Merge returned peers (never the local node, never a peer already seen),
//!    keep the K closest, and cache their addresses in the record store.
//! 4. Repeat until the interpreter's stop rule fires, the frontier has no
//!    unqueried peer left, or `max_rounds` is reached.
//!
//! Rounds are strictly sequential. A peer that fails is dropped from this
//! lookup only; eviction from the routing table is left to the bucket
//! replacement policy. Every responder is reported to the routing table.
//!
//! ## Outcomes
//!
//! | Situation | Result |
//! |-----------|--------|
//! | nothing discovered | [`DhtError::NotFound`] |
//! | `lookup_timeout` elapsed | [`DhtError::Timeout`] |
//! | cancellation token fired | [`DhtError::Cancelled`] |

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, Timestamp};
use crate::config::DhtConfig;
use crate::error::{DhtError, QueryError};
use crate::identity::{ContentId, Distance, Key, PeerId, PeerRecord};
use crate::ipns::{Name, NameRecord, validate};
use crate::messages::{DhtRequest, DhtResponse};
use crate::protocols::{PeerNetwork, query_with_timeout};
use crate::routing::RoutingTable;
use crate::store::{ProviderRecord, RecordStore};
use crate::stream::{DEFAULT_STREAM_BUFFER, ResultSender, ResultStream};

#[derive(Clone, Debug)]
pub struct LookupParams {
    pub k: usize,
    pub alpha: usize,
    pub query_timeout: Duration,
    /// Extra attempts per peer after a timeout or transport failure.
    pub query_retries: u32,
    pub lookup_timeout: Duration,
    pub max_rounds: usize,
    pub ping_timeout: Duration,
    pub provider_ttl: Duration,
}

impl LookupParams {
    pub fn from_config(config: &DhtConfig) -> Self {
        Self {
            k: config.k,
            alpha: config.alpha,
            query_timeout: config.query_timeout(),
            query_retries: config.query_retries,
            lookup_timeout: config.lookup_timeout(),
            max_rounds: config.max_rounds,
            ping_timeout: config.ping_timeout(),
            provider_ttl: config.provider_ttl(),
        }
    }
}

impl Default for LookupParams {
    fn default() -> Self {
        Self::from_config(&DhtConfig::default())
    }
}

/// When a lookup may stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupMode {
    /// Stop once a round brings nothing strictly closer than the best known.
    Peers,
    /// Stop after the first round that produced a value, or when the frontier
    /// is exhausted.
    Value,
}

/// What one response contributed to the lookup.
#[derive(Debug)]
pub struct Interpretation<V> {
    pub closer: Vec<PeerRecord>,
    pub values: Vec<V>,
    /// Abort the outstanding queries and finish right away.
    pub done: bool,
}

impl<V> Interpretation<V> {
    pub fn closer(closer: Vec<PeerRecord>) -> Self {
        Self {
            closer,
            values: Vec::new(),
            done: false,
        }
    }
}

pub trait ResponseInterpreter: Send {
    type Value: Send + 'static;

    fn mode(&self) -> LookupMode;

    fn request(&self) -> DhtRequest;

    fn interpret(
        &mut self,
        from: &PeerRecord,
        response: DhtResponse,
    ) -> Result<Interpretation<Self::Value>, QueryError>;
}

fn refused(response: DhtResponse) -> QueryError {
    match response {
        DhtResponse::Error { message } => QueryError::Malformed(format!("peer refused: {message}")),
        other => QueryError::Malformed(format!("unexpected {} response", other.kind())),
    }
}

/// Closest-peers lookup.
pub struct FindPeers {
    target: Key,
}

impl ResponseInterpreter for FindPeers {
    type Value = ();

    fn mode(&self) -> LookupMode {
        LookupMode::Peers
    }

    fn request(&self) -> DhtRequest {
        DhtRequest::FindNode {
            target: self.target,
        }
    }

    fn interpret(&mut self, _from: &PeerRecord, response: DhtResponse) -> Result<Interpretation<()>, QueryError> {
        match response {
            DhtResponse::Nodes(nodes) => Ok(Interpretation::closer(nodes)),
            other => Err(refused(other)),
        }
    }
}

/// Provider lookup; yields each provider once.
pub struct FindProviders {
    content: ContentId,
    ttl: Duration,
    now: Timestamp,
    yielded: HashSet<PeerId>,
}

impl ResponseInterpreter for FindProviders {
    type Value = ProviderRecord;

    fn mode(&self) -> LookupMode {
        LookupMode::Value
    }

    fn request(&self) -> DhtRequest {
        DhtRequest::GetProviders {
            content: self.content,
        }
    }

    fn interpret(
        &mut self,
        _from: &PeerRecord,
        response: DhtResponse,
    ) -> Result<Interpretation<ProviderRecord>, QueryError> {
        match response {
            DhtResponse::Providers { providers, closer } => {
                let values = providers
                    .into_iter()
                    .filter(|p| self.yielded.insert(p.id))
                    .map(|provider| ProviderRecord {
                        content: self.content,
                        provider,
                        timestamp: self.now,
                        ttl: self.ttl,
                    })
                    .collect();
                Ok(Interpretation {
                    closer,
                    values,
                    done: false,
                })
            }
            other => Err(refused(other)),
        }
    }
}

/// Name record lookup; the first valid record ends it.
pub struct FindNameRecord {
    name: Name,
    now: Timestamp,
}

impl ResponseInterpreter for FindNameRecord {
    type Value = NameRecord;

    fn mode(&self) -> LookupMode {
        LookupMode::Value
    }

    fn request(&self) -> DhtRequest {
        DhtRequest::GetValue { name: self.name }
    }

    fn interpret(
        &mut self,
        from: &PeerRecord,
        response: DhtResponse,
    ) -> Result<Interpretation<NameRecord>, QueryError> {
        match response {
            DhtResponse::Value { record, closer } => {
                let Some(record) = record else {
                    return Ok(Interpretation::closer(closer));
                };
                match validate(&self.name, &record, self.now) {
                    Ok(()) => Ok(Interpretation {
                        closer,
                        values: vec![record],
                        done: true,
                    }),
                    Err(err) => {
                        debug!(
                            peer = %from.id.short_hex(),
                            name = %self.name.peer_id().short_hex(),
                            error = %err,
                            "discarding invalid name record"
                        );
                        Ok(Interpretation::closer(closer))
                    }
                }
            }
            other => Err(refused(other)),
        }
    }
}

/// Where found values go.
pub enum ValueSink<'a, V> {
    Collect(&'a mut Vec<V>),
    Stream(&'a ResultSender<V>),
}

impl<V> ValueSink<'_, V> {
    /// `false` once a streaming consumer has gone away.
    async fn deliver(&mut self, values: Vec<V>) -> bool {
        match self {
            ValueSink::Collect(out) => {
                out.extend(values);
                true
            }
            ValueSink::Stream(tx) => {
                for value in values {
                    if !tx.send(Ok(value)).await {
                        return false;
                    }
                }
                true
            }
        }
    }
}

/// Aggregate result of a lookup that did not fail.
#[derive(Clone, Debug, Default)]
pub struct LookupSummary {
    /// K closest peers that responded or were never queried.
    pub closest: Vec<PeerRecord>,
    pub responded: usize,
    pub failed: usize,
    pub values: usize,
    pub rounds: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PeerState {
    Unqueried,
    InFlight,
    Responded,
}

struct FrontierEntry {
    record: PeerRecord,
    distance: Distance,
    state: PeerState,
}

/// Transient per-lookup candidate set. Holds records by value only.
struct Frontier {
    target: Key,
    local: PeerId,
    k: usize,
    entries: Vec<FrontierEntry>,
    seen: HashSet<PeerId>,
    failed: HashSet<PeerId>,
}

impl Frontier {
    fn new(target: Key, local: PeerId, k: usize) -> Self {
        Self {
            target,
            local,
            k: k.max(1),
            entries: Vec::new(),
            seen: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    fn best_distance(&self) -> Option<Distance> {
        self.entries.first().map(|e| e.distance)
    }

    /// Merge `records`; `true` if any of them is strictly closer than the
    /// best entry before the merge.
    fn merge(&mut self, records: Vec<PeerRecord>) -> bool {
        let best_before = self.best_distance();
        let mut closer = false;
        for record in records {
            if record.id == self.local || !self.seen.insert(record.id) {
                continue;
            }
            let distance = record.id.key().distance(&self.target);
            if best_before.is_none_or(|best| distance < best) {
                closer = true;
            }
            self.entries.push(FrontierEntry {
                record,
                distance,
                state: PeerState::Unqueried,
            });
        }
        self.entries.sort_by(|a, b| a.distance.cmp(&b.distance));
        self.entries.truncate(self.k);
        closer
    }

    fn next_batch(&mut self, alpha: usize) -> Vec<PeerRecord> {
        self.entries
            .iter_mut()
            .filter(|e| e.state == PeerState::Unqueried)
            .take(alpha.max(1))
            .map(|e| {
                e.state = PeerState::InFlight;
                e.record.clone()
            })
            .collect()
    }

    fn mark_responded(&mut self, id: &PeerId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| &e.record.id == id) {
            entry.state = PeerState::Responded;
        }
    }

    fn mark_failed(&mut self, id: &PeerId) {
        self.failed.insert(*id);
        self.entries.retain(|e| &e.record.id != id);
    }

    fn has_unqueried(&self) -> bool {
        self.entries.iter().any(|e| e.state == PeerState::Unqueried)
    }

    fn closest(&self) -> Vec<PeerRecord> {
        self.entries
            .iter()
            .filter(|e| e.state != PeerState::InFlight)
            .map(|e| e.record.clone())
            .collect()
    }
}

pub struct LookupEngine<N: PeerNetwork + ?Sized> {
    local: PeerId,
    routing: Arc<RoutingTable>,
    store: Arc<RecordStore>,
    network: Arc<N>,
    params: LookupParams,
    clock: Arc<dyn Clock>,
}

impl<N: PeerNetwork + ?Sized> Clone for LookupEngine<N> {
    fn clone(&self) -> Self {
        Self {
            local: self.local,
            routing: Arc::clone(&self.routing),
            store: Arc::clone(&self.store),
            network: Arc::clone(&self.network),
            params: self.params.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

type QueryOutcome = (PeerRecord, Result<DhtResponse, QueryError>);

impl<N: PeerNetwork + ?Sized> LookupEngine<N> {
    pub fn new(
        routing: Arc<RoutingTable>,
        store: Arc<RecordStore>,
        network: Arc<N>,
        params: LookupParams,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local: routing.local_id(),
            routing,
            store,
            network,
            params,
            clock,
        }
    }

    pub fn params(&self) -> &LookupParams {
        &self.params
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    /// The K closest peers to `target` that the network knows about.
    pub async fn find_closest_peers(
        &self,
        target: Key,
        cancel: &CancellationToken,
    ) -> Result<Vec<PeerRecord>, DhtError> {
        self.find_closest_peers_from(target, Vec::new(), cancel).await
    }

    /// As [`find_closest_peers`](Self::find_closest_peers), with extra seeds
    /// for an empty routing table.
    pub async fn find_closest_peers_from(
        &self,
        target: Key,
        seeds: Vec<PeerRecord>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PeerRecord>, DhtError> {
        let mut interp = FindPeers { target };
        let mut sink = Vec::new();
        let summary = self
            .run(target, seeds, &mut interp, ValueSink::Collect(&mut sink), cancel)
            .await?;
        if summary.responded == 0 || summary.closest.is_empty() {
            return Err(DhtError::NotFound);
        }
        Ok(summary.closest)
    }

    /// Providers of `content`, streamed as they are discovered.
    ///
    /// The stream ends when the lookup finishes. A lookup that finds nothing
    /// ends with a single [`DhtError::NotFound`] item. Dropping the stream
    /// stops the lookup.
    pub fn find_providers(&self, content: ContentId, cancel: CancellationToken) -> ResultStream<ProviderRecord>
    where
        N: 'static,
    {
        let (tx, stream) = ResultStream::channel(DEFAULT_STREAM_BUFFER);
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interp = FindProviders {
                content,
                ttl: engine.params.provider_ttl,
                now: engine.clock.now(),
                yielded: HashSet::new(),
            };
            let lookup_cancel = cancel.child_token();
            let result = tokio::select! {
                result = engine.run(content.key(), Vec::new(), &mut interp, ValueSink::Stream(&tx), &lookup_cancel) => result,
                _ = tx.closed() => {
                    lookup_cancel.cancel();
                    return;
                }
            };
            match result {
                Ok(summary) if summary.values == 0 => {
                    tx.send(Err(DhtError::NotFound)).await;
                }
                Ok(_) => {}
                Err(err) => {
                    tx.send(Err(err)).await;
                }
            }
        });
        stream
    }

    /// First valid record for `name` found in the network.
    pub async fn find_name_record(&self, name: Name, cancel: &CancellationToken) -> Result<NameRecord, DhtError> {
        let mut interp = FindNameRecord {
            name,
            now: self.clock.now(),
        };
        let mut found = Vec::new();
        self.run(name.key(), Vec::new(), &mut interp, ValueSink::Collect(&mut found), cancel)
            .await?;
        found.into_iter().next().ok_or(DhtError::NotFound)
    }

    /// One request to one peer, failures reported verbatim.
    pub async fn query_peer(&self, peer: &PeerRecord, request: DhtRequest) -> Result<DhtResponse, DhtError> {
        let (_, result) = query_with_retries(
            Arc::clone(&self.network),
            peer.clone(),
            request,
            self.params.query_timeout,
            self.params.query_retries,
        )
        .await;
        let response = result?;
        self.routing
            .observe_responsive(peer.clone(), Arc::clone(&self.network), self.params.ping_timeout)
            .await;
        Ok(response)
    }

    /// The shared iterative algorithm.
    pub async fn run<I: ResponseInterpreter>(
        &self,
        target: Key,
        seeds: Vec<PeerRecord>,
        interp: &mut I,
        mut sink: ValueSink<'_, I::Value>,
        cancel: &CancellationToken,
    ) -> Result<LookupSummary, DhtError> {
        let deadline = Instant::now() + self.params.lookup_timeout;
        let mut frontier = Frontier::new(target, self.local, self.params.k);
        frontier.merge(self.routing.closest_known(&target, self.params.k).await);
        frontier.merge(seeds);

        let mut summary = LookupSummary::default();
        if frontier.entries.is_empty() {
            debug!(target = %target.short_hex(), "lookup has no candidates");
            return Err(DhtError::NotFound);
        }

        let request = interp.request();
        let kind = request.kind();

        while frontier.has_unqueried() {
            if summary.rounds >= self.params.max_rounds {
                warn!(target = %target.short_hex(), rounds = summary.rounds, kind, "lookup reached round limit");
                break;
            }
            summary.rounds += 1;

            let batch = frontier.next_batch(self.params.alpha);
            trace!(target = %target.short_hex(), round = summary.rounds, queries = batch.len(), kind, "lookup round");

            let mut join_set: JoinSet<QueryOutcome> = JoinSet::new();
            for peer in batch {
                join_set.spawn(query_with_retries(
                    Arc::clone(&self.network),
                    peer,
                    request.clone(),
                    self.params.query_timeout,
                    self.params.query_retries,
                ));
            }

            let mut any_closer = false;
            let mut round_values = 0;
            loop {
                let joined = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        join_set.abort_all();
                        debug!(target = %target.short_hex(), kind, "lookup cancelled");
                        return Err(DhtError::Cancelled);
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        join_set.abort_all();
                        debug!(target = %target.short_hex(), kind, "lookup deadline elapsed");
                        return Err(DhtError::Timeout);
                    }
                    joined = join_set.join_next() => joined,
                };
                let Some(joined) = joined else {
                    break;
                };
                let (peer, result) = match joined {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        return Err(DhtError::Internal(format!("query task failed: {err}")));
                    }
                };

                let interpreted = result.and_then(|response| interp.interpret(&peer, response));
                let interpretation = match interpreted {
                    Ok(interpretation) => interpretation,
                    Err(err) => {
                        trace!(peer = %peer.id.short_hex(), error = %err, kind, "lookup query failed");
                        frontier.mark_failed(&peer.id);
                        summary.failed += 1;
                        continue;
                    }
                };

                summary.responded += 1;
                frontier.mark_responded(&peer.id);
                self.routing
                    .observe_responsive(peer, Arc::clone(&self.network), self.params.ping_timeout)
                    .await;

                for record in &interpretation.closer {
                    if record.id != self.local && !record.addrs.is_empty() {
                        self.store.put_peer_record(record.clone()).await;
                    }
                }
                any_closer |= frontier.merge(interpretation.closer);

                let produced = interpretation.values.len();
                round_values += produced;
                summary.values += produced;
                if produced > 0 && !sink.deliver(interpretation.values).await {
                    join_set.abort_all();
                    summary.closest = frontier.closest();
                    return Ok(summary);
                }
                if interpretation.done {
                    join_set.abort_all();
                    summary.closest = frontier.closest();
                    return Ok(summary);
                }
            }

            let stop = match interp.mode() {
                LookupMode::Peers => !any_closer,
                LookupMode::Value => round_values > 0,
            };
            if stop {
                break;
            }
        }

        summary.closest = frontier.closest();
        debug!(
            target = %target.short_hex(),
            kind,
            rounds = summary.rounds,
            responded = summary.responded,
            failed = summary.failed,
            values = summary.values,
            "lookup finished"
        );
        if summary.responded == 0 && summary.values == 0 {
            return Err(DhtError::NotFound);
        }
        Ok(summary)
    }
}

async fn query_with_retries<N: PeerNetwork + ?Sized>(
    network: Arc<N>,
    peer: PeerRecord,
    request: DhtRequest,
    timeout: Duration,
    retries: u32,
) -> QueryOutcome {
    let mut attempt = 0;
    loop {
        let result = query_with_timeout(network.as_ref(), &peer.id, request.clone(), timeout).await;
        match result {
            Err(QueryError::Timeout | QueryError::Unreachable(_)) if attempt < retries => {
                attempt += 1;
                trace!(peer = %peer.id.short_hex(), attempt, "retrying peer query");
            }
            other => return (peer, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::Keypair;
    use crate::memory::{MemoryNetwork, MemoryRegistry};
    use crate::store::StoreLimits;

    struct Pong;

    #[async_trait::async_trait]
    impl crate::protocols::DhtHandler for Pong {
        async fn handle_request(&self, _from: PeerRecord, _request: DhtRequest) -> DhtResponse {
            DhtResponse::Pong
        }
    }

    /// An engine whose only neighbour answers pings; retries set per test.
    async fn engine_with_retries(retries: u32) -> (LookupEngine<MemoryNetwork>, Arc<MemoryNetwork>, PeerRecord) {
        let registry = MemoryRegistry::new();
        let remote = record(Keypair::generate().peer_id());
        registry.register(remote.id, Arc::new(Pong)).await;

        let local = record(Keypair::generate().peer_id());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let routing = Arc::new(RoutingTable::new(local.id, 20, Arc::clone(&clock)));
        let store = Arc::new(RecordStore::new(Arc::clone(&clock), StoreLimits::default()));
        let network = Arc::new(MemoryNetwork::new(registry, local));
        let params = LookupParams {
            query_retries: retries,
            ..LookupParams::default()
        };
        let engine = LookupEngine::new(routing, store, Arc::clone(&network), params, clock);
        (engine, network, remote)
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let (engine, network, remote) = engine_with_retries(1).await;
        network.fail_next(remote.id, 1).await;

        assert_eq!(engine.query_peer(&remote, DhtRequest::Ping).await, Ok(DhtResponse::Pong));
        assert_eq!(network.ping_calls().await, vec![remote.id, remote.id]);
    }

    #[tokio::test]
    async fn retries_stop_at_the_budget() {
        let (engine, network, remote) = engine_with_retries(1).await;
        network.fail_next(remote.id, 2).await;

        assert!(engine.query_peer(&remote, DhtRequest::Ping).await.is_err());
        assert_eq!(network.request_log().await.len(), 2);

        // Budget spent; the failure counter is exhausted too.
        assert_eq!(engine.query_peer(&remote, DhtRequest::Ping).await, Ok(DhtResponse::Pong));
        assert_eq!(network.request_log().await.len(), 3);
    }

    #[tokio::test]
    async fn no_retries_by_default() {
        let (engine, network, remote) = engine_with_retries(0).await;
        network.fail_next(remote.id, 1).await;

        assert!(engine.query_peer(&remote, DhtRequest::Ping).await.is_err());
        assert_eq!(network.request_log().await.len(), 1);
    }

    fn record(id: PeerId) -> PeerRecord {
        PeerRecord::new(id, vec!["127.0.0.1:1".into()])
    }

    #[test]
    fn frontier_keeps_k_closest_and_skips_local() {
        let local = Keypair::generate().peer_id();
        let target = Key::from_bytes([0u8; 32]);
        let mut frontier = Frontier::new(target, local, 3);
        let mut records: Vec<PeerRecord> = (0..10).map(|_| record(Keypair::generate().peer_id())).collect();
        records.push(record(local));
        assert!(frontier.merge(records.clone()));

        assert_eq!(frontier.entries.len(), 3);
        assert!(frontier.entries.iter().all(|e| e.record.id != local));
        let mut expected: Vec<Distance> = records
            .iter()
            .filter(|r| r.id != local)
            .map(|r| r.id.key().distance(&target))
            .collect();
        expected.sort();
        let kept: Vec<Distance> = frontier.entries.iter().map(|e| e.distance).collect();
        assert_eq!(kept, expected[..3].to_vec());

        // Re-merging the same peers discovers nothing new.
        assert!(!frontier.merge(records));
    }

    #[test]
    fn frontier_batches_are_disjoint() {
        let target = Key::from_bytes([0u8; 32]);
        let mut frontier = Frontier::new(target, Keypair::generate().peer_id(), 20);
        frontier.merge((0..5).map(|_| record(Keypair::generate().peer_id())).collect());
        let first = frontier.next_batch(3);
        let second = frontier.next_batch(3);
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|a| second.iter().all(|b| a.id != b.id)));
        assert!(!frontier.has_unqueried());
    }

    #[test]
    fn failed_peers_are_never_readmitted() {
        let target = Key::from_bytes([0u8; 32]);
        let mut frontier = Frontier::new(target, Keypair::generate().peer_id(), 20);
        let peer = record(Keypair::generate().peer_id());
        frontier.merge(vec![peer.clone()]);
        frontier.next_batch(1);
        frontier.mark_failed(&peer.id);
        assert!(frontier.closest().is_empty());
        frontier.merge(vec![peer]);
        assert!(frontier.entries.is_empty());
    }

    #[test]
    fn name_interpreter_discards_invalid_records() {
        let owner = Keypair::generate();
        let name = Name::for_keypair(&owner);
        let now = Timestamp::from_millis(10);
        let mut interp = FindNameRecord { name, now };
        let from = record(Keypair::generate().peer_id());

        let mut forged = NameRecord::new_signed(&owner, "/ipfs/a", 9, Timestamp::from_millis(100), Duration::ZERO);
        forged.value = "/ipfs/forged".into();
        let out = interp
            .interpret(
                &from,
                DhtResponse::Value {
                    record: Some(forged),
                    closer: vec![],
                },
            )
            .expect("interpret");
        assert!(out.values.is_empty());
        assert!(!out.done);

        let good = NameRecord::new_signed(&owner, "/ipfs/a", 9, Timestamp::from_millis(100), Duration::ZERO);
        let out = interp
            .interpret(
                &from,
                DhtResponse::Value {
                    record: Some(good.clone()),
                    closer: vec![],
                },
            )
            .expect("interpret");
        assert_eq!(out.values, vec![good]);
        assert!(out.done);
    }

    #[test]
    fn provider_interpreter_dedups_across_responses() {
        let content = ContentId::for_content(b"x");
        let mut interp = FindProviders {
            content,
            ttl: Duration::from_secs(1),
            now: Timestamp::ZERO,
            yielded: HashSet::new(),
        };
        let from = record(Keypair::generate().peer_id());
        let provider = record(Keypair::generate().peer_id());
        let response = DhtResponse::Providers {
            providers: vec![provider.clone()],
            closer: vec![],
        };
        assert_eq!(interp.interpret(&from, response.clone()).expect("first").values.len(), 1);
        assert!(interp.interpret(&from, response).expect("second").values.is_empty());
        assert!(interp.interpret(&from, DhtResponse::Ack).is_err());
    }
}
