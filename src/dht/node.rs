use super::config::{COMPACT_NODE_LEN, COMPACT_PEER_LEN, GOOD_NODE_WINDOW, HASH_LENGTH, MAX_FAILURES};
use super::error::DhtError;
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng as _;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;

/// A 160-bit identifier of a node or an info-hash.
///
/// Ordering is that of the big-endian unsigned integer, so ranges of the
/// keyspace can be expressed with plain comparisons.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; HASH_LENGTH]);

impl NodeId {
    pub const MIN: NodeId = NodeId([0; HASH_LENGTH]);
    pub const MAX: NodeId = NodeId([0xff; HASH_LENGTH]);

    pub fn generate() -> Self {
        let mut id = [0u8; HASH_LENGTH];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; HASH_LENGTH] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// XOR distance; comparing two distances compares closeness.
    pub fn xor(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; HASH_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(out)
    }

    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0;
        for byte in &self.0 {
            zeros += byte.leading_zeros();
            if *byte != 0 {
                break;
            }
        }
        zeros
    }

    /// `(a + b) / 2`, rounded down, without overflowing 160 bits.
    pub fn midpoint(a: &NodeId, b: &NodeId) -> NodeId {
        let mut sum = [0u8; HASH_LENGTH];
        let mut carry = 0u16;
        for i in (0..HASH_LENGTH).rev() {
            let total = u16::from(a.0[i]) + u16::from(b.0[i]) + carry;
            sum[i] = total as u8;
            carry = total >> 8;
        }

        let mut out = [0u8; HASH_LENGTH];
        let mut high = carry as u8;
        for i in 0..HASH_LENGTH {
            out[i] = (high << 7) | (sum[i] >> 1);
            high = sum[i] & 1;
        }
        NodeId(out)
    }

    /// Random id inside `[min, max)`.
    ///
    /// The bits shared by `min` and `max - 1` are kept and the rest are
    /// randomized, which covers the whole range for bucket-aligned bounds.
    /// Falls back to `min` when the draw lands outside the range.
    pub fn random_in_range(min: &NodeId, max: &NodeId) -> NodeId {
        let prefix = min.xor(&max.predecessor()).leading_zeros() as usize;
        let mut id = NodeId::generate();
        for (i, byte) in id.0.iter_mut().enumerate() {
            let fixed_bits = prefix.saturating_sub(i * 8).min(8);
            let mask = match fixed_bits {
                0 => 0,
                8 => 0xff,
                n => 0xffu8 << (8 - n),
            };
            *byte = (min.0[i] & mask) | (*byte & !mask);
        }

        if id < *min || id >= *max {
            *min
        } else {
            id
        }
    }

    fn predecessor(&self) -> NodeId {
        let mut out = self.0;
        for byte in out.iter_mut().rev() {
            let (value, borrow) = byte.overflowing_sub(1);
            *byte = value;
            if !borrow {
                break;
            }
        }
        NodeId(out)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<[u8; HASH_LENGTH]> for NodeId {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

/// Liveness of a remote node, derived from its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Never answered us.
    Unknown,
    /// Answered within the last 15 minutes.
    Good,
    /// Answered before, but not recently.
    Questionable,
    /// Failed too many queries in a row.
    Bad,
}

#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    addr: SocketAddr,
    last_seen: Option<Instant>,
    failed_count: u32,
    token: Option<Bytes>,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: None,
            failed_count: 0,
            token: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    /// Last token this node issued to us in a `get_peers` response.
    pub fn token(&self) -> Option<&Bytes> {
        self.token.as_ref()
    }

    pub fn set_token(&mut self, token: Bytes) {
        self.token = Some(token);
    }

    /// Records an answer from the node.
    pub fn seen(&mut self, now: Instant) {
        self.last_seen = Some(now);
        self.failed_count = 0;
    }

    pub fn fail(&mut self) {
        self.failed_count = self.failed_count.saturating_add(1);
    }

    pub fn state(&self) -> NodeState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> NodeState {
        if self.failed_count >= MAX_FAILURES {
            return NodeState::Bad;
        }
        match self.last_seen {
            None => NodeState::Unknown,
            Some(seen) if now.saturating_duration_since(seen) < GOOD_NODE_WINDOW => NodeState::Good,
            Some(_) => NodeState::Questionable,
        }
    }

    pub fn is_bad(&self) -> bool {
        self.failed_count >= MAX_FAILURES
    }

    /// 26-byte `id ‖ ip ‖ port` record; IPv6 nodes have none.
    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let peer = compact_peer(&self.addr)?;
        let mut compact = [0u8; COMPACT_NODE_LEN];
        compact[..HASH_LENGTH].copy_from_slice(&self.id.0);
        compact[HASH_LENGTH..].copy_from_slice(&peer);
        Some(compact)
    }

    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_LEN {
            return None;
        }
        let id = NodeId::from_bytes(&data[..HASH_LENGTH]).ok()?;
        let addr = peer_from_compact(&data[HASH_LENGTH..])?;
        Some(Self::new(id, addr))
    }
}

/// Parses concatenated compact node records, ignoring a trailing partial one.
pub fn parse_compact_nodes(data: &[u8]) -> Vec<Node> {
    data.chunks_exact(COMPACT_NODE_LEN)
        .filter_map(Node::from_compact)
        .collect()
}

/// Concatenates the compact records of `nodes`, skipping IPv6 ones.
pub fn encode_compact_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Bytes {
    let mut buf = BytesMut::new();
    for compact in nodes.into_iter().filter_map(Node::to_compact) {
        buf.put_slice(&compact);
    }
    buf.freeze()
}

/// 6-byte `ip ‖ port` form of an IPv4 endpoint.
pub fn compact_peer(addr: &SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut compact = [0u8; COMPACT_PEER_LEN];
            compact[..4].copy_from_slice(&v4.ip().octets());
            compact[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(compact)
        }
        SocketAddr::V6(_) => None,
    }
}

pub fn peer_from_compact(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Address bytes keyed into announce tokens.
pub(crate) fn address_key(addr: &SocketAddr) -> Vec<u8> {
    let mut key = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    key.extend_from_slice(&addr.port().to_be_bytes());
    key
}
