//! # DHT Wire Messages
//!
//! Requests and responses exchanged between DHT peers. Every request travels
//! in an [`RpcEnvelope`] carrying the sender's [`PeerRecord`], so the receiver
//! can add the sender to its routing table.
//!
//! Messages are bincode encoded with a fixed-int layout. Deserialization is
//! always bounded by [`MAX_MESSAGE_SIZE`] to keep a hostile peer from making
//! us allocate without limit.
//!
//! | Request | Response |
//! |---------|----------|
//! | `Ping` | `Pong` |
//! | `FindNode` | `Nodes` |
//! | `GetProviders` | `Providers` |
//! | `AddProvider` | `Ack` |
//! | `GetValue` | `Value` |
//! | `PutValue` | `Ack` |
//!
//! Any request may be answered with `Error` when the receiver refuses it.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::{ContentId, Key, PeerRecord};
use crate::ipns::{Name, NameRecord};

/// Upper bound on a single encoded envelope or response.
pub const MAX_MESSAGE_SIZE: u64 = 1024 * 1024;

/// Peers returned in one `Nodes`/`Providers` response.
pub const MAX_CONTACTS_PER_RESPONSE: usize = 100;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    codec().serialize(value)
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    codec().deserialize(bytes)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping,
    FindNode {
        target: Key,
    },
    GetProviders {
        content: ContentId,
    },
    AddProvider {
        content: ContentId,
        provider: PeerRecord,
    },
    GetValue {
        name: Name,
    },
    PutValue {
        name: Name,
        record: NameRecord,
    },
}

impl DhtRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            DhtRequest::Ping => "ping",
            DhtRequest::FindNode { .. } => "find_node",
            DhtRequest::GetProviders { .. } => "get_providers",
            DhtRequest::AddProvider { .. } => "add_provider",
            DhtRequest::GetValue { .. } => "get_value",
            DhtRequest::PutValue { .. } => "put_value",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtResponse {
    Pong,
    Nodes(Vec<PeerRecord>),
    Providers {
        providers: Vec<PeerRecord>,
        closer: Vec<PeerRecord>,
    },
    Value {
        record: Option<NameRecord>,
        closer: Vec<PeerRecord>,
    },
    Ack,
    Error {
        message: String,
    },
}

impl DhtResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            DhtResponse::Pong => "pong",
            DhtResponse::Nodes(_) => "nodes",
            DhtResponse::Providers { .. } => "providers",
            DhtResponse::Value { .. } => "value",
            DhtResponse::Ack => "ack",
            DhtResponse::Error { .. } => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub from: PeerRecord,
    pub request: DhtRequest,
}
