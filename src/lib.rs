//! mldht - A BitTorrent Mainline DHT node
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`dht`] - BEP-5 Distributed Hash Table: routing, KRPC, lookups and announces

pub mod bencode;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{DhtConfig, DhtEngine, DhtError, DhtEvent, DhtMessage, DhtState, Node, NodeId, RoutingTable};
