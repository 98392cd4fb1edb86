//! Plain TCP transport for DHT messages.
//!
//! One request per connection: the client writes a length-prefixed
//! [`RpcEnvelope`], the server answers with a length-prefixed
//! [`DhtResponse`] and both sides close. Frames are a big-endian `u32` length
//! followed by the bincode body, capped at [`MAX_MESSAGE_SIZE`].
//!
//! Peer addresses are resolved through the [`RecordStore`], which the lookup
//! engine keeps filled with every peer it hears about, and the
//! [`RoutingTable`], which keeps the addresses of its live contacts for as
//! long as they stay in a bucket. The transport neither authenticates nor
//! encrypts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::QueryError;
use crate::identity::{PeerId, PeerRecord};
use crate::messages::{DhtRequest, DhtResponse, MAX_MESSAGE_SIZE, RpcEnvelope, deserialize_bounded, serialize};
use crate::protocols::{DhtHandler, PeerNetwork};
use crate::routing::RoutingTable;
use crate::store::RecordStore;

/// How long an inbound connection may take to deliver its request.
const INBOUND_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct TcpNetwork {
    local: PeerRecord,
    store: Arc<RecordStore>,
    routing: Arc<RoutingTable>,
}

impl TcpNetwork {
    pub fn new(local: PeerRecord, store: Arc<RecordStore>, routing: Arc<RoutingTable>) -> Self {
        Self { local, store, routing }
    }

    /// Every address known for `peer`, cached record first.
    async fn resolve(&self, peer: &PeerId) -> Vec<String> {
        let mut addrs = self
            .store
            .get_peer_record(peer)
            .await
            .map(|r| r.addrs)
            .unwrap_or_default();
        if let Some(contact) = self.routing.get(peer).await {
            for addr in contact.addrs {
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }
        addrs
    }

    async fn exchange(&self, addr: &str, envelope: &RpcEnvelope) -> Result<DhtResponse, QueryError> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| QueryError::Unreachable(format!("{addr}: {e}")))?;
        let body = serialize(envelope).map_err(|e| QueryError::Malformed(e.to_string()))?;
        write_frame(&mut stream, &body)
            .await
            .map_err(|e| QueryError::Unreachable(e.to_string()))?;
        let frame = read_frame(&mut stream)
            .await
            .map_err(|e| QueryError::Unreachable(e.to_string()))?;
        deserialize_bounded(&frame).map_err(|e| QueryError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl PeerNetwork for TcpNetwork {
    async fn query(
        &self,
        peer: &PeerId,
        request: DhtRequest,
        timeout: Duration,
    ) -> Result<DhtResponse, QueryError> {
        let addrs = self.resolve(peer).await;
        if addrs.is_empty() {
            return Err(QueryError::Unreachable(format!("no known address for {}", peer.short_hex())));
        }
        let envelope = RpcEnvelope {
            from: self.local.clone(),
            request,
        };

        let attempt = async {
            let mut last_err = QueryError::Unreachable("peer has no addresses".into());
            for addr in &addrs {
                match self.exchange(addr, &envelope).await {
                    Ok(response) => return Ok(response),
                    Err(err) => {
                        trace!(peer = %peer.short_hex(), addr = %addr, error = %err, "address failed");
                        last_err = err;
                    }
                }
            }
            Err(last_err)
        };
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| QueryError::Timeout)?
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&len| u64::from(len) <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if u64::from(len) > MAX_MESSAGE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Source of inbound connections for [`serve`].
#[async_trait]
trait Acceptor: Send + Sync {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Accept DHT connections on `listener` until `shutdown` fires. A failed
/// accept is logged and retried after a short pause.
pub async fn serve<H: DhtHandler>(listener: TcpListener, handler: Arc<H>, shutdown: CancellationToken) -> Result<()> {
    serve_on(listener, handler, shutdown).await
}

async fn serve_on<A: Acceptor, H: DhtHandler>(listener: A, handler: Arc<H>, shutdown: CancellationToken) -> Result<()> {
    let local = listener.local_addr().context("listener has no local address")?;
    info!(addr = %local, "DHT listener started");
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(addr = %local, error = %err, "accept failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                }
            }
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, handler).await {
                debug!(remote = %remote, error = %err, "DHT connection failed");
            }
        });
    }
    info!(addr = %local, "DHT listener stopped");
    Ok(())
}

async fn handle_connection<H: DhtHandler>(mut stream: TcpStream, handler: Arc<H>) -> Result<()> {
    let frame = tokio::time::timeout(INBOUND_READ_TIMEOUT, read_frame(&mut stream))
        .await
        .context("request read timed out")?
        .context("failed to read request")?;
    let envelope: RpcEnvelope = deserialize_bounded(&frame).context("malformed request")?;
    let response = handler.handle_request(envelope.from, envelope.request).await;
    let body = serialize(&response).context("failed to encode response")?;
    write_frame(&mut stream, &body).await.context("failed to write response")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::{Clock, ManualClock, SystemClock, Timestamp};
    use crate::identity::Keypair;
    use crate::routing::{AddOutcome, bucket_index};
    use crate::store::StoreLimits;

    struct Pong;

    #[async_trait]
    impl DhtHandler for Pong {
        async fn handle_request(&self, _from: PeerRecord, request: DhtRequest) -> DhtResponse {
            match request {
                DhtRequest::Ping => DhtResponse::Pong,
                other => DhtResponse::Error {
                    message: format!("unsupported {}", other.kind()),
                },
            }
        }
    }

    fn local() -> PeerRecord {
        PeerRecord::new(Keypair::generate().peer_id(), vec![])
    }

    fn network_with(clock: Arc<dyn Clock>, limits: StoreLimits, k: usize) -> TcpNetwork {
        let local = local();
        let store = Arc::new(RecordStore::new(Arc::clone(&clock), limits));
        let routing = Arc::new(RoutingTable::new(local.id, k, clock));
        TcpNetwork::new(local, store, routing)
    }

    fn network() -> TcpNetwork {
        network_with(Arc::new(SystemClock::new()), StoreLimits::default(), 20)
    }

    async fn pong_listener() -> (String, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Arc::new(Pong), shutdown.clone()));
        (addr, shutdown, server)
    }

    #[tokio::test]
    async fn frames_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"hello").await.expect("write");
        assert_eq!(read_frame(&mut b).await.expect("read"), b"hello".to_vec());
    }

    #[tokio::test]
    async fn oversized_frame_header_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.expect("write");
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn query_reaches_listener() {
        let (addr, shutdown, server) = pong_listener().await;
        let remote = PeerRecord::new(Keypair::generate().peer_id(), vec![addr]);
        let network = network();
        network.store.put_peer_record(remote.clone()).await;

        let response = network
            .query(&remote.id, DhtRequest::Ping, Duration::from_secs(5))
            .await;
        assert_eq!(response, Ok(DhtResponse::Pong));

        shutdown.cancel();
        server.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let result = network()
            .query(&Keypair::generate().peer_id(), DhtRequest::Ping, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(QueryError::Unreachable(_))));
    }

    #[tokio::test]
    async fn routing_contact_stays_reachable_after_cached_record_expires() {
        let (addr, shutdown, server) = pong_listener().await;
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));
        let ttl = Duration::from_secs(10);
        let network = network_with(
            clock.clone(),
            StoreLimits {
                peer_record_ttl: ttl,
                ..StoreLimits::default()
            },
            1,
        );
        let live = PeerRecord::new(Keypair::generate().peer_id(), vec![addr]);
        network.store.put_peer_record(live.clone()).await;
        network.routing.observe(live.clone()).await;

        clock.advance(ttl + Duration::from_secs(1));
        assert!(network.store.get_peer_record(&live.id).await.is_none());
        let response = network
            .query(&live.id, DhtRequest::Ping, Duration::from_secs(5))
            .await;
        assert_eq!(response, Ok(DhtResponse::Pong));

        // The full bucket pings its live occupant and keeps it.
        let local_id = network.routing.local_id();
        let bucket = bucket_index(&local_id, &live.id);
        let candidate = std::iter::repeat_with(|| Keypair::generate().peer_id())
            .find(|id| bucket_index(&local_id, id) == bucket)
            .expect("candidate in the same bucket");
        let outcome = network
            .routing
            .add_or_refresh(
                PeerRecord::new(candidate, vec!["127.0.0.1:1".into()]),
                &network,
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(outcome, AddOutcome::Rejected { kept: live.id });

        shutdown.cancel();
        server.await.expect("join").expect("serve");
    }

    /// Fails the first `failures` accepts, then hands out real connections.
    struct FlakyListener {
        inner: TcpListener,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Acceptor for FlakyListener {
        async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(std::io::Error::other("too many open files"));
            }
            self.inner.accept().await
        }

        fn local_addr(&self) -> std::io::Result<SocketAddr> {
            self.inner.local_addr()
        }
    }

    #[tokio::test]
    async fn listener_survives_accept_errors() {
        let inner = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = inner.local_addr().expect("addr").to_string();
        let listener = FlakyListener {
            inner,
            failures: AtomicUsize::new(3),
        };
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_on(listener, Arc::new(Pong), shutdown.clone()));

        let remote = PeerRecord::new(Keypair::generate().peer_id(), vec![addr]);
        let network = network();
        network.store.put_peer_record(remote.clone()).await;
        let response = network
            .query(&remote.id, DhtRequest::Ping, Duration::from_secs(5))
            .await;
        assert_eq!(response, Ok(DhtResponse::Pong));
        assert!(!server.is_finished());

        shutdown.cancel();
        server.await.expect("join").expect("serve");
    }
}
