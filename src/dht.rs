//! Mainline Distributed Hash Table (BEP-5)
//!
//! A Kademlia DHT over UDP used by BitTorrent for trackerless peer discovery.
//! [`DhtEngine`] is the entry point; the routing table, codec and transport
//! pieces are public for callers that want to drive them directly.

mod config;
mod driver;
mod engine;
mod error;
mod handler;
mod listener;
mod main_loop;
mod message;
mod message_loop;
mod node;
mod peers;
mod routing;
mod task;
mod timeout;
mod token;

pub use config::{DhtConfig, COMPACT_NODE_LEN, COMPACT_PEER_LEN, K};
pub use engine::{DhtEngine, DhtEvent, DhtState};
pub use error::{DhtError, ErrorCode};
pub use listener::{Listener, ReceiveQueue, UdpListener};
pub use main_loop::{LoopHandle, MainLoop};
pub use message::{Body, DhtMessage, Query, QueryKind, Response, TransactionId};
pub use node::{
    compact_peer, encode_compact_nodes, parse_compact_nodes, peer_from_compact, Node, NodeId,
    NodeState,
};
pub use peers::PeerStore;
pub use routing::{Bucket, Insertion, RoutingTable};
pub use timeout::{TimeoutDispatcher, TimeoutId};
pub use token::TokenManager;
