//! # Protocol Adapter
//!
//! [`ProtocolAdapter`] answers the four routing operations for one
//! [`DhtNode`], preferring what the node already holds and falling back to
//! the network:
//!
//! | Operation | Local source | Network fallback |
//! |-----------|--------------|------------------|
//! | get-providers | record store | provider lookup (always, merged) |
//! | get-peer-info | routing table, record store | peer lookup |
//! | get-name-record | record store | value lookup, result cached |
//! | put-name-record | record store | background forward to K closest |

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::DhtError;
use crate::identity::{ContentId, PeerId, PeerRecord};
use crate::ipns::{Name, NameRecord, PutOutcome, validate};
use crate::node::DhtNode;
use crate::protocols::{ContentRouter, PeerNetwork};
use crate::stream::{DEFAULT_STREAM_BUFFER, ResultStream};

pub struct ProtocolAdapter<N: PeerNetwork + ?Sized> {
    node: DhtNode<N>,
}

impl<N: PeerNetwork + ?Sized> ProtocolAdapter<N> {
    pub fn new(node: DhtNode<N>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &DhtNode<N> {
        &self.node
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl<N: PeerNetwork + ?Sized> ContentRouter for ProtocolAdapter<N> {
    async fn get_providers(&self, content: ContentId) -> ResultStream<PeerRecord> {
        let local: Vec<PeerRecord> = self
            .node
            .store()
            .get_providers(&content)
            .await
            .into_iter()
            .map(|r| r.provider)
            .collect();

        let (tx, stream) = ResultStream::channel(DEFAULT_STREAM_BUFFER);
        let mut remote = self
            .node
            .lookup()
            .find_providers(content, self.node.shutdown_token().child_token());

        tokio::spawn(async move {
            let mut yielded = HashSet::new();
            for provider in local {
                if yielded.insert(provider.id) && !tx.send(Ok(provider)).await {
                    return;
                }
            }
            loop {
                let item = tokio::select! {
                    item = remote.next() => item,
                    _ = tx.closed() => return,
                };
                match item {
                    None => break,
                    Some(Ok(record)) => {
                        if yielded.insert(record.provider.id) && !tx.send(Ok(record.provider)).await {
                            return;
                        }
                    }
                    Some(Err(DhtError::NotFound)) => break,
                    Some(Err(err)) if !yielded.is_empty() => {
                        debug!(content = %content.short_hex(), error = %err, "provider lookup ended early");
                        break;
                    }
                    Some(Err(err)) => {
                        tx.send(Err(err)).await;
                        return;
                    }
                }
            }
            trace!(content = %content.short_hex(), providers = yielded.len(), "provider stream finished");
        });
        stream
    }

    async fn get_peer_info(&self, peer: PeerId) -> ResultStream<PeerRecord> {
        if peer == self.node.peer_id() {
            return ResultStream::from_vec(vec![self.node.local_record()]);
        }
        if let Some(record) = self.node.routing().get(&peer).await {
            return ResultStream::from_vec(vec![record]);
        }
        if let Some(record) = self.node.store().get_peer_record(&peer).await {
            return ResultStream::from_vec(vec![record]);
        }

        let cancel = self.node.shutdown_token().child_token();
        match self.node.lookup().find_closest_peers(peer.key(), &cancel).await {
            Ok(closest) => {
                let found: Vec<PeerRecord> = closest.into_iter().filter(|r| r.id == peer).collect();
                ResultStream::from_vec(found)
            }
            Err(DhtError::NotFound) => ResultStream::empty(),
            Err(err) => ResultStream::from_error(err),
        }
    }

    async fn get_name_record(&self, name: Name) -> Result<NameRecord, DhtError> {
        if let Some(record) = self.node.store().get_name_record(&name).await {
            return Ok(record);
        }

        let cancel = self.node.shutdown_token().child_token();
        let record = self.node.lookup().find_name_record(name, &cancel).await?;
        self.node.store().put_name_record(name, record.clone()).await;
        Ok(record)
    }

    async fn put_name_record(&self, name: Name, record: NameRecord) -> Result<PutOutcome, DhtError> {
        validate(&name, &record, self.node.clock().now())?;

        let outcome = self.node.store().put_name_record(name, record.clone()).await;
        if outcome == PutOutcome::Accepted {
            let node = self.node.clone();
            tokio::spawn(async move {
                if let Err(err) = node.forward_name_record(name, record).await {
                    debug!(name = %name.peer_id().short_hex(), error = %err, "name record forwarding failed");
                }
            });
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, Timestamp};
    use crate::config::DhtConfig;
    use crate::error::ValidationError;
    use crate::identity::Keypair;
    use crate::memory::{MemoryNetwork, MemoryRegistry};
    use std::time::Duration;

    fn adapter() -> ProtocolAdapter<MemoryNetwork> {
        let local = PeerRecord::new(Keypair::generate().peer_id(), vec!["mem:1".into()]);
        let network = Arc::new(MemoryNetwork::new(MemoryRegistry::new(), local.clone()));
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        ProtocolAdapter::new(DhtNode::new(local, network, DhtConfig::default(), clock))
    }

    #[tokio::test]
    async fn local_providers_are_served_without_peers() {
        let adapter = adapter();
        let content = ContentId::for_content(b"local");
        let provider = PeerRecord::new(Keypair::generate().peer_id(), vec!["mem:9".into()]);
        adapter.node().store().put_provider(content, provider.clone()).await;

        let providers = adapter.get_providers(content).await.read_all().await.expect("providers");
        assert_eq!(providers.iter().map(|p| p.id).collect::<Vec<_>>(), vec![provider.id]);
    }

    #[tokio::test]
    async fn unknown_content_yields_empty_stream() {
        let adapter = adapter();
        let providers = adapter
            .get_providers(ContentId::for_content(b"nothing"))
            .await
            .read_all()
            .await;
        assert_eq!(providers, Ok(vec![]));
    }

    #[tokio::test]
    async fn peer_info_for_self_and_unknown() {
        let adapter = adapter();
        let own = adapter.node().peer_id();
        let records = adapter.get_peer_info(own).await.read_all().await.expect("self");
        assert_eq!(records.len(), 1);
        assert!(!records[0].addrs.is_empty());

        let unknown = adapter
            .get_peer_info(Keypair::generate().peer_id())
            .await
            .read_all()
            .await;
        assert_eq!(unknown, Ok(vec![]));
    }

    #[tokio::test]
    async fn put_then_get_name_record_on_lonely_node() {
        let adapter = adapter();
        let owner = Keypair::generate();
        let name = Name::for_keypair(&owner);
        let record = NameRecord::new_signed(
            &owner,
            "/ipfs/bafylonely",
            1,
            Timestamp::from_millis(10_000_000),
            Duration::from_secs(60),
        );

        assert_eq!(adapter.put_name_record(name, record.clone()).await, Ok(PutOutcome::Accepted));
        assert_eq!(adapter.put_name_record(name, record.clone()).await, Ok(PutOutcome::Stale));
        assert_eq!(adapter.get_name_record(name).await, Ok(record));
    }

    #[tokio::test]
    async fn put_surfaces_validation_errors() {
        let adapter = adapter();
        let owner = Keypair::generate();
        let other = Name::for_keypair(&Keypair::generate());
        let record = NameRecord::new_signed(
            &owner,
            "/ipfs/x",
            1,
            Timestamp::from_millis(10_000_000),
            Duration::from_secs(60),
        );
        assert_eq!(
            adapter.put_name_record(other, record).await,
            Err(DhtError::Validation(ValidationError::NameMismatch))
        );
    }

    #[tokio::test]
    async fn missing_name_record_is_not_found() {
        let adapter = adapter();
        let name = Name::for_keypair(&Keypair::generate());
        assert_eq!(adapter.get_name_record(name).await, Err(DhtError::NotFound));
    }
}
