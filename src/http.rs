//! # Routing HTTP API
//!
//! Serves any [`ContentRouter`] over HTTP:
//!
//! ```text
//! /routing/v1
//! ├── GET /providers/{content-id}   providers of a content id
//! ├── GET /peers/{peer-id}          addresses of a peer
//! ├── GET /ipns/{name}              signed name record blob
//! └── PUT /ipns/{name}              publish a name record blob
//! ```
//!
//! Record listings are JSON objects (`{"Providers": [...]}`,
//! `{"Peers": [...]}`) by default, or newline-delimited JSON streamed as the
//! lookup progresses when the request accepts `application/x-ndjson`. An
//! empty listing is a 404 in both forms.
//!
//! | Outcome | Status |
//! |---------|--------|
//! | found / accepted | 200 |
//! | malformed id or body, invalid record | 400 |
//! | nothing found | 404 |
//! | stale name record | 409 |
//! | lookup timed out | 504 |

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DhtError;
use crate::identity::{ContentId, PeerId, PeerRecord};
use crate::ipns::{Name, NameRecord, PutOutcome};
use crate::protocols::ContentRouter;
use crate::stream::ResultStream;

pub const NDJSON: &str = "application/x-ndjson";
pub const NAME_RECORD_CONTENT_TYPE: &str = "application/vnd.ipfs.ipns-record";
pub const PEER_SCHEMA: &str = "peer";

/// A peer record as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePeerRecord {
    #[serde(rename = "Schema")]
    pub schema: String,
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Addrs", default)]
    pub addrs: Vec<String>,
    #[serde(rename = "Protocols", default)]
    pub protocols: Vec<String>,
}

impl From<&PeerRecord> for WirePeerRecord {
    fn from(record: &PeerRecord) -> Self {
        Self {
            schema: PEER_SCHEMA.to_string(),
            id: record.id.to_hex(),
            addrs: record.addrs.clone(),
            protocols: record.protocols.iter().cloned().collect(),
        }
    }
}

impl WirePeerRecord {
    /// `None` for unknown schemas or unparsable ids.
    pub fn into_peer_record(self) -> Option<PeerRecord> {
        if self.schema != PEER_SCHEMA {
            return None;
        }
        let id: PeerId = self.id.parse().ok()?;
        let mut record = PeerRecord::new(id, self.addrs);
        record.protocols = self.protocols.into_iter().collect();
        Some(record)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvidersResponse {
    #[serde(rename = "Providers")]
    pub providers: Vec<WirePeerRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeersResponse {
    #[serde(rename = "Peers")]
    pub peers: Vec<WirePeerRecord>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Conflict,
    Dht(DhtError),
}

impl From<DhtError> for ApiError {
    fn from(err: DhtError) -> Self {
        ApiError::Dht(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Conflict => (
                StatusCode::CONFLICT,
                "a record at least as recent is already held".to_string(),
            ),
            ApiError::Dht(err) => {
                let status = match &err {
                    DhtError::NotFound => StatusCode::NOT_FOUND,
                    DhtError::Validation(_) | DhtError::Malformed(_) => StatusCode::BAD_REQUEST,
                    DhtError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    DhtError::Unreachable(_) => StatusCode::BAD_GATEWAY,
                    DhtError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                    DhtError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };
        (status, message).into_response()
    }
}

/// Routes for `router`, ready to be merged into an application or served.
pub fn routing_router<R: ContentRouter>(router: Arc<R>) -> Router {
    Router::new()
        .route("/routing/v1/providers/{content_id}", get(get_providers::<R>))
        .route("/routing/v1/peers/{peer_id}", get(get_peers::<R>))
        .route(
            "/routing/v1/ipns/{name}",
            get(get_name_record::<R>).put(put_name_record::<R>),
        )
        .with_state(router)
}

fn wants_ndjson(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(NDJSON))
}

async fn get_providers<R: ContentRouter>(
    State(router): State<Arc<R>>,
    Path(content_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let content: ContentId = content_id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid content id: {e}")))?;
    let stream = router.get_providers(content).await;
    records_response(stream, &headers, |providers| {
        Json(ProvidersResponse { providers }).into_response()
    })
    .await
}

async fn get_peers<R: ContentRouter>(
    State(router): State<Arc<R>>,
    Path(peer_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let peer: PeerId = peer_id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid peer id: {e}")))?;
    let stream = router.get_peer_info(peer).await;
    records_response(stream, &headers, |peers| Json(PeersResponse { peers }).into_response()).await
}

async fn records_response(
    mut stream: ResultStream<PeerRecord>,
    headers: &HeaderMap,
    as_json: impl FnOnce(Vec<WirePeerRecord>) -> Response,
) -> Result<Response, ApiError> {
    // The first item decides the status line.
    let first = match stream.next().await {
        None => return Err(DhtError::NotFound.into()),
        Some(item) => item?,
    };

    if !wants_ndjson(headers) {
        let mut records = vec![WirePeerRecord::from(&first)];
        records.extend(stream.read_all().await?.iter().map(WirePeerRecord::from));
        return Ok(as_json(records));
    }

    let head = futures::stream::once(async move { Ok(first) });
    let lines = head.chain(stream.into_stream()).filter_map(|item| async move {
        match item {
            Ok(record) => match serde_json::to_vec(&WirePeerRecord::from(&record)) {
                Ok(mut line) => {
                    line.push(b'\n');
                    Some(Ok::<_, std::io::Error>(Bytes::from(line)))
                }
                Err(err) => {
                    warn!(error = %err, "failed to encode record");
                    None
                }
            },
            Err(err) => {
                debug!(error = %err, "record stream ended with error");
                None
            }
        }
    });

    let mut response = Body::from_stream(lines).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON));
    Ok(response)
}

fn parse_name(name: &str) -> Result<Name, ApiError> {
    name.parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid name: {e}")))
}

async fn get_name_record<R: ContentRouter>(
    State(router): State<Arc<R>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let name = parse_name(&name)?;
    let record = router.get_name_record(name).await?;
    let blob = record
        .to_bytes()
        .map_err(|e| ApiError::Dht(DhtError::Internal(e.to_string())))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, NAME_RECORD_CONTENT_TYPE)],
        blob,
    )
        .into_response())
}

async fn put_name_record<R: ContentRouter>(
    State(router): State<Arc<R>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let name = parse_name(&name)?;
    let record = NameRecord::from_bytes(&body)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    match router.put_name_record(name, record).await? {
        PutOutcome::Accepted => Ok(StatusCode::OK),
        PutOutcome::Stale => Err(ApiError::Conflict),
    }
}
