//! # kadroute - Content and Peer Routing over Kademlia
//!
//! kadroute finds which peers provide a piece of content, where a peer can be
//! reached, and the current value of mutable signed names. The same four
//! operations are available to DHT participants directly and to remote
//! clients over a stateless HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! HTTP client ──► http ──► adapter ──► lookup ──► PeerNetwork (tcp | memory)
//!                             │           │
//!                             ▼           ▼
//!                           store ◄──── routing
//! ```
//!
//! The routing table and record store are explicitly constructed, `Arc`
//! shared and internally locked; nothing in the crate is a global.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Peer/content ids, XOR distance, keypairs, peer records |
//! | `ipns` | Signed name records: validation and selection |
//! | `routing` | K-bucket routing table with ping-before-evict |
//! | `store` | Provider, peer and name record caches with expiry |
//! | `lookup` | Iterative lookups with pluggable response interpreters |
//! | `node` | Inbound request handling, publishing, maintenance loops |
//! | `adapter` | The four routing operations over a node |
//! | `http` | axum routes for `/routing/v1` |
//! | `client` | reqwest client for `/routing/v1` |
//! | `tcp` | Length-prefixed bincode transport |
//! | `memory` | In-process transport for simulations and tests |
//! | `protocols` | `PeerNetwork`, `DhtHandler`, `ContentRouter` traits |
//! | `messages` | DHT wire messages |
//! | `stream` | Finite result streams |
//! | `config` | Policy constants |
//! | `clock` | Time source |
//! | `crypto` | Domain-separated signatures |
//! | `error` | Error types |

pub mod adapter;
pub mod client;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod http;
pub mod identity;
pub mod ipns;
pub mod lookup;
pub mod memory;
pub mod messages;
pub mod node;
pub mod protocols;
pub mod routing;
pub mod store;
pub mod stream;
pub mod tcp;

pub use adapter::ProtocolAdapter;
pub use client::RoutingClient;
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::DhtConfig;
pub use error::{DhtError, QueryError, ValidationError};
pub use identity::{ContentId, Key, Keypair, PeerId, PeerRecord};
pub use ipns::{Name, NameRecord, PutOutcome};
pub use node::DhtNode;
pub use protocols::{ContentRouter, DhtHandler, PeerNetwork};
pub use stream::ResultStream;
