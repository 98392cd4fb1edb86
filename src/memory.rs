//! In-process [`PeerNetwork`] for simulations and tests.
//!
//! Nodes register their [`DhtHandler`] in a shared [`MemoryRegistry`]; each
//! node queries the others through its own [`MemoryNetwork`], which can inject
//! per-peer failures and latency.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

use crate::error::QueryError;
use crate::identity::{PeerId, PeerRecord};
use crate::messages::{DhtRequest, DhtResponse};
use crate::protocols::{DhtHandler, PeerNetwork};

#[derive(Default)]
pub struct MemoryRegistry {
    handlers: RwLock<HashMap<PeerId, Arc<dyn DhtHandler>>>,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, id: PeerId, handler: Arc<dyn DhtHandler>) {
        self.handlers.write().await.insert(id, handler);
    }

    pub async fn unregister(&self, id: &PeerId) {
        self.handlers.write().await.remove(id);
    }

    async fn get(&self, id: &PeerId) -> Option<Arc<dyn DhtHandler>> {
        self.handlers.read().await.get(id).cloned()
    }
}

pub struct MemoryNetwork {
    registry: Arc<MemoryRegistry>,
    local: PeerRecord,
    failures: Mutex<HashSet<PeerId>>,
    transient: Mutex<HashMap<PeerId, usize>>,
    latencies: Mutex<HashMap<PeerId, Duration>>,
    pings: Mutex<Vec<PeerId>>,
    requests: Mutex<Vec<(PeerId, &'static str)>>,
}

impl MemoryNetwork {
    /// Network handle for the node described by `local`.
    pub fn new(registry: Arc<MemoryRegistry>, local: PeerRecord) -> Self {
        Self {
            registry,
            local,
            failures: Mutex::new(HashSet::new()),
            transient: Mutex::new(HashMap::new()),
            latencies: Mutex::new(HashMap::new()),
            pings: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn local(&self) -> &PeerRecord {
        &self.local
    }

    /// Make every query to `peer` fail as unreachable.
    pub async fn set_failure(&self, peer: PeerId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(peer);
        } else {
            failures.remove(&peer);
        }
    }

    /// Make the next `count` queries to `peer` fail as unreachable.
    pub async fn fail_next(&self, peer: PeerId, count: usize) {
        self.transient.lock().await.insert(peer, count);
    }

    /// Delay every answer from `peer`.
    pub async fn set_latency(&self, peer: PeerId, latency: Duration) {
        self.latencies.lock().await.insert(peer, latency);
    }

    pub async fn ping_calls(&self) -> Vec<PeerId> {
        self.pings.lock().await.clone()
    }

    /// Every query sent, as (peer, request kind).
    pub async fn request_log(&self) -> Vec<(PeerId, &'static str)> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl PeerNetwork for MemoryNetwork {
    async fn query(
        &self,
        peer: &PeerId,
        request: DhtRequest,
        timeout: Duration,
    ) -> Result<DhtResponse, QueryError> {
        self.requests.lock().await.push((*peer, request.kind()));
        if matches!(request, DhtRequest::Ping) {
            self.pings.lock().await.push(*peer);
        }
        if self.failures.lock().await.contains(peer) {
            return Err(QueryError::Unreachable("injected network failure".into()));
        }
        if let Some(remaining) = self.transient.lock().await.get_mut(peer)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(QueryError::Unreachable("injected transient failure".into()));
        }
        let Some(handler) = self.registry.get(peer).await else {
            return Err(QueryError::Unreachable("peer not registered".into()));
        };
        let latency = self.latencies.lock().await.get(peer).copied();
        let from = self.local.clone();

        let exchange = async move {
            if let Some(delay) = latency {
                sleep(delay).await;
            }
            handler.handle_request(from, request).await
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| QueryError::Timeout)
    }
}
