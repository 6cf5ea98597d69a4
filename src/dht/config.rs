use super::node::NodeId;
use bytes::Bytes;
use std::time::Duration;

/// Bucket capacity.
pub const K: usize = 8;
/// Failed queries after which a node is Bad.
pub const MAX_FAILURES: u32 = 4;
/// A node seen within this window is Good.
pub const GOOD_NODE_WINDOW: Duration = Duration::from_secs(15 * 60);

pub const HASH_LENGTH: usize = 20;
pub const COMPACT_NODE_LEN: usize = 26;
pub const COMPACT_PEER_LEN: usize = 6;

pub const DEFAULT_BOOTSTRAP_ROUTERS: &[&str] = &["router.bittorrent.com:6881"];
pub const CLIENT_VERSION: &[u8] = b"RB01";

/// Tunables of a [`DhtEngine`](super::DhtEngine).
///
/// The defaults follow BEP-5 and mainline client behaviour.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Fixed local id; a random one is generated when `None`.
    pub node_id: Option<NodeId>,
    pub query_timeout: Duration,
    /// Send attempts per query before the target is charged a failure.
    pub query_retries: u32,
    pub tick_interval: Duration,
    /// Minimum spacing between two datagrams handed to the listener.
    pub send_spacing: Duration,
    pub max_in_flight_sends: usize,
    pub bucket_refresh_interval: Duration,
    pub maintenance_interval: Duration,
    pub token_rotation: Duration,
    /// A bucket's oldest node seen more recently than this is not pinged
    /// for replacement.
    pub replace_recheck: Duration,
    pub peer_lifetime: Duration,
    pub max_peers_per_hash: usize,
    /// Below this many nodes after a seeded bootstrap, bootstrap again
    /// through the routers.
    pub min_bootstrap_nodes: usize,
    pub bootstrap_routers: Vec<String>,
    /// Written as `v` in every outgoing message.
    pub client_version: Option<Bytes>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            query_timeout: Duration::from_secs(15),
            query_retries: 3,
            tick_interval: Duration::from_millis(5),
            send_spacing: Duration::from_millis(5),
            max_in_flight_sends: 5,
            bucket_refresh_interval: Duration::from_secs(15 * 60),
            maintenance_interval: Duration::from_secs(1),
            token_rotation: Duration::from_secs(5 * 60),
            replace_recheck: Duration::from_secs(3 * 60),
            peer_lifetime: Duration::from_secs(30 * 60),
            max_peers_per_hash: 1000,
            min_bootstrap_nodes: 10,
            bootstrap_routers: DEFAULT_BOOTSTRAP_ROUTERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            client_version: Some(Bytes::from_static(CLIENT_VERSION)),
        }
    }
}
