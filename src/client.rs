//! HTTP client for the routing API.
//!
//! [`RoutingClient`] implements [`ContentRouter`] against a remote endpoint,
//! so code written against the trait works the same whether it runs inside a
//! DHT node or talks to one over HTTP. Listings are requested as NDJSON and
//! parsed line by line as they arrive; records with an unknown schema are
//! skipped. Name records fetched from the server are signature-checked before
//! they are returned.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{StatusCode, header};
use tracing::{debug, trace};

use crate::error::{DhtError, ValidationError};
use crate::http::{NAME_RECORD_CONTENT_TYPE, NDJSON, PeersResponse, ProvidersResponse, WirePeerRecord};
use crate::identity::{ContentId, PeerId, PeerRecord};
use crate::ipns::{Name, NameRecord, PutOutcome, validate_structure};
use crate::protocols::ContentRouter;
use crate::stream::{DEFAULT_STREAM_BUFFER, ResultSender, ResultStream};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest NDJSON line buffered while waiting for its newline.
const MAX_NDJSON_LINE: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct RoutingClient {
    base: String,
    http: reqwest::Client,
}

impl RoutingClient {
    /// Client for the endpoint at `base`, e.g. `http://127.0.0.1:8080`.
    pub fn new(base: impl Into<String>) -> Result<Self, DhtError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| DhtError::Internal(format!("http client: {e}")))?;
        Ok(Self::with_client(base, http))
    }

    pub fn with_client(base: impl Into<String>, http: reqwest::Client) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self { base, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/routing/v1/{}", self.base, path)
    }

    /// Alias of [`ContentRouter::get_peer_info`] named after the endpoint.
    pub async fn get_peers(&self, peer: PeerId) -> ResultStream<PeerRecord> {
        self.get_peer_info(peer).await
    }

    async fn list(&self, path: String, kind: ListKind) -> ResultStream<PeerRecord> {
        let response = match self
            .http
            .get(self.url(&path))
            .header(header::ACCEPT, format!("{NDJSON}, application/json"))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return ResultStream::from_error(transport_error(err)),
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return ResultStream::empty(),
            status => {
                let body = response.text().await.unwrap_or_default();
                return ResultStream::from_error(status_error(status, body));
            }
        }

        let is_ndjson = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with(NDJSON));

        if !is_ndjson {
            let bytes = match response.bytes().await {
                Ok(bytes) => bytes,
                Err(err) => return ResultStream::from_error(transport_error(err)),
            };
            let records = match kind {
                ListKind::Providers => serde_json::from_slice::<ProvidersResponse>(&bytes).map(|r| r.providers),
                ListKind::Peers => serde_json::from_slice::<PeersResponse>(&bytes).map(|r| r.peers),
            };
            return match records {
                Ok(records) => {
                    ResultStream::from_vec(records.into_iter().filter_map(WirePeerRecord::into_peer_record).collect())
                }
                Err(err) => ResultStream::from_error(DhtError::Malformed(err.to_string())),
            };
        }

        let (tx, stream) = ResultStream::channel(DEFAULT_STREAM_BUFFER);
        let body = response.bytes_stream().map(|chunk| chunk.map_err(transport_error));
        tokio::spawn(forward_ndjson(body, tx));
        stream
    }
}

/// Split an NDJSON body into records as chunks arrive. A line longer than
/// [`MAX_NDJSON_LINE`] ends the stream with [`DhtError::Malformed`].
async fn forward_ndjson<S, B>(body: S, tx: ResultSender<PeerRecord>)
where
    S: futures::Stream<Item = Result<B, DhtError>>,
    B: AsRef<[u8]>,
{
    let mut body = std::pin::pin!(body);
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            _ = tx.closed() => return,
        };
        match chunk {
            None => break,
            Some(Ok(chunk)) => {
                buffer.extend_from_slice(chunk.as_ref());
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if !emit_line(&tx, &line).await {
                        return;
                    }
                }
                if buffer.len() > MAX_NDJSON_LINE {
                    debug!(buffered = buffer.len(), "ndjson line exceeds limit");
                    tx.send(Err(DhtError::Malformed(format!(
                        "ndjson line longer than {MAX_NDJSON_LINE} bytes"
                    ))))
                    .await;
                    return;
                }
            }
            Some(Err(err)) => {
                tx.send(Err(err)).await;
                return;
            }
        }
    }
    emit_line(&tx, &buffer).await;
}

#[derive(Clone, Copy)]
enum ListKind {
    Providers,
    Peers,
}

/// Parse one NDJSON line and forward it. `false` once the consumer is gone.
async fn emit_line(tx: &ResultSender<PeerRecord>, line: &[u8]) -> bool {
    let line = line.trim_ascii();
    if line.is_empty() {
        return true;
    }
    match serde_json::from_slice::<WirePeerRecord>(line) {
        Ok(wire) => match wire.into_peer_record() {
            Some(record) => tx.send(Ok(record)).await,
            None => {
                trace!("skipping record with unknown schema");
                true
            }
        },
        Err(err) => {
            debug!(error = %err, "skipping malformed ndjson line");
            true
        }
    }
}

fn transport_error(err: reqwest::Error) -> DhtError {
    if err.is_timeout() {
        DhtError::Timeout
    } else {
        DhtError::Unreachable(err.to_string())
    }
}

fn status_error(status: StatusCode, body: String) -> DhtError {
    match status {
        StatusCode::NOT_FOUND => DhtError::NotFound,
        StatusCode::BAD_REQUEST => DhtError::Validation(ValidationError::Remote(body)),
        StatusCode::GATEWAY_TIMEOUT => DhtError::Timeout,
        status => DhtError::Unreachable(format!("unexpected status {status}: {body}")),
    }
}

#[async_trait]
impl ContentRouter for RoutingClient {
    async fn get_providers(&self, content: ContentId) -> ResultStream<PeerRecord> {
        self.list(format!("providers/{content}"), ListKind::Providers).await
    }

    async fn get_peer_info(&self, peer: PeerId) -> ResultStream<PeerRecord> {
        self.list(format!("peers/{peer}"), ListKind::Peers).await
    }

    async fn get_name_record(&self, name: Name) -> Result<NameRecord, DhtError> {
        let response = self
            .http
            .get(self.url(&format!("ipns/{name}")))
            .header(header::ACCEPT, NAME_RECORD_CONTENT_TYPE)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }
        let bytes = response.bytes().await.map_err(transport_error)?;
        let record = NameRecord::from_bytes(&bytes)?;
        validate_structure(&name, &record)?;
        Ok(record)
    }

    async fn put_name_record(&self, name: Name, record: NameRecord) -> Result<PutOutcome, DhtError> {
        let blob = record.to_bytes()?;
        let response = self
            .http
            .put(self.url(&format!("ipns/{name}")))
            .header(header::CONTENT_TYPE, NAME_RECORD_CONTENT_TYPE)
            .body(blob)
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            StatusCode::OK => Ok(PutOutcome::Accepted),
            StatusCode::CONFLICT => Ok(PutOutcome::Stale),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(status_error(status, body))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let client = RoutingClient::with_client("http://example.test/", reqwest::Client::new());
        assert_eq!(
            client.url("providers/abc"),
            "http://example.test/routing/v1/providers/abc"
        );
    }

    #[test]
    fn statuses_map_to_error_kinds() {
        assert_eq!(status_error(StatusCode::NOT_FOUND, String::new()), DhtError::NotFound);
        assert_eq!(status_error(StatusCode::GATEWAY_TIMEOUT, String::new()), DhtError::Timeout);
        assert_eq!(
            status_error(StatusCode::BAD_REQUEST, "bad signature".into()),
            DhtError::Validation(ValidationError::Remote("bad signature".into()))
        );
    }

    #[tokio::test]
    async fn ndjson_lines_skip_unknown_schemas() {
        let (tx, stream) = ResultStream::channel(8);
        let id = crate::identity::Keypair::generate().peer_id();
        let known = format!(r#"{{"Schema":"peer","ID":"{id}","Addrs":["/ip4/1.2.3.4/tcp/1"]}}"#);
        assert!(emit_line(&tx, known.as_bytes()).await);
        assert!(emit_line(&tx, br#"{"Schema":"bitswap","ID":"x"}"#).await);
        assert!(emit_line(&tx, b"not json\n").await);
        assert!(emit_line(&tx, b"  \n").await);
        drop(tx);

        let records = stream.read_all().await.expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].addrs, vec!["/ip4/1.2.3.4/tcp/1".to_string()]);
    }

    #[tokio::test]
    async fn ndjson_is_split_across_chunks() {
        let id = crate::identity::Keypair::generate().peer_id();
        let line = format!("{{\"Schema\":\"peer\",\"ID\":\"{id}\",\"Addrs\":[]}}\n");
        let (head, tail) = line.split_at(10);
        let chunks: Vec<Result<Vec<u8>, DhtError>> = vec![Ok(head.into()), Ok(tail.into()), Ok(line.clone().into())];

        let (tx, stream) = ResultStream::channel(8);
        forward_ndjson(futures::stream::iter(chunks), tx).await;
        let records = stream.read_all().await.expect("records");
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![id, id]);
    }

    #[tokio::test]
    async fn endless_ndjson_line_is_malformed() {
        let chunk = vec![b'x'; 16 * 1024];
        let chunks: Vec<Result<Vec<u8>, DhtError>> = std::iter::repeat_n(chunk, 8).map(Ok).collect();

        let (tx, stream) = ResultStream::channel(8);
        forward_ndjson(futures::stream::iter(chunks), tx).await;
        assert!(matches!(stream.read_all().await, Err(DhtError::Malformed(_))));
    }
}
