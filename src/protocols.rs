//! # Protocol Traits
//!
//! The seams between the routing core and the outside world:
//!
//! - [`PeerNetwork`]: outbound, send one DHT request to one peer
//! - [`DhtHandler`]: inbound, answer a DHT request from a peer
//! - [`ContentRouter`]: the stateless routing surface served over HTTP and
//!   consumed by [`RoutingClient`](crate::client::RoutingClient)
//!
//! The TCP transport and the in-memory test network both implement
//! [`PeerNetwork`], so the lookup engine never knows which one it is using.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DhtError, QueryError};
use crate::identity::{ContentId, PeerId, PeerRecord};
use crate::ipns::{Name, NameRecord, PutOutcome};
use crate::messages::{DhtRequest, DhtResponse};
use crate::stream::ResultStream;

/// Outbound DHT queries.
#[async_trait]
pub trait PeerNetwork: Send + Sync + 'static {
    /// Send `request` to `peer` and wait at most `timeout` for the response.
    ///
    /// Implementations must return [`QueryError::Timeout`] rather than block
    /// past the deadline.
    async fn query(
        &self,
        peer: &PeerId,
        request: DhtRequest,
        timeout: Duration,
    ) -> Result<DhtResponse, QueryError>;
}

/// Query with the deadline enforced on the caller's side as well.
pub async fn query_with_timeout<N: PeerNetwork + ?Sized>(
    network: &N,
    peer: &PeerId,
    request: DhtRequest,
    timeout: Duration,
) -> Result<DhtResponse, QueryError> {
    match tokio::time::timeout(timeout, network.query(peer, request, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(QueryError::Timeout),
    }
}

/// Liveness check: `true` only on a `Pong`.
pub async fn ping<N: PeerNetwork + ?Sized>(network: &N, peer: &PeerId, timeout: Duration) -> bool {
    matches!(
        query_with_timeout(network, peer, DhtRequest::Ping, timeout).await,
        Ok(DhtResponse::Pong)
    )
}

/// Inbound DHT requests.
#[async_trait]
pub trait DhtHandler: Send + Sync + 'static {
    async fn handle_request(&self, from: PeerRecord, request: DhtRequest) -> DhtResponse;
}

/// Provider, peer and name-record routing.
#[async_trait]
pub trait ContentRouter: Send + Sync + 'static {
    /// Peers that can serve `content`. Finite; ends when discovery is done.
    async fn get_providers(&self, content: ContentId) -> ResultStream<PeerRecord>;

    /// Zero or one record for `peer`.
    async fn get_peer_info(&self, peer: PeerId) -> ResultStream<PeerRecord>;

    async fn get_name_record(&self, name: Name) -> Result<NameRecord, DhtError>;

    async fn put_name_record(&self, name: Name, record: NameRecord)
    -> Result<PutOutcome, DhtError>;
}
