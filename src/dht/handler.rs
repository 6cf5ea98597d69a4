use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use super::driver::Dht;
use super::error::ErrorCode;
use super::message::{DhtMessage, Query, Response, TransactionId};
use super::node::{compact_peer, encode_compact_nodes, parse_compact_nodes, NodeId};

impl Dht {
    /// Answers an incoming query.
    pub(crate) fn handle_query(
        &mut self,
        transaction_id: TransactionId,
        query: Query,
        addr: SocketAddr,
        now: Instant,
    ) {
        let response = match query {
            Query::Ping => Response::Ping,
            Query::FindNode { target } => {
                let nodes = match self.routing_table.find_node(&target) {
                    Some(node) => encode_compact_nodes([node]),
                    None => encode_compact_nodes(&self.routing_table.get_closest(&target)),
                };
                Response::FindNode { nodes }
            }
            Query::GetPeers { info_hash } => {
                let token = self.tokens.generate_token(&addr, now);
                let peers = self.peer_store.get_peers(&info_hash, now);
                if peers.is_empty() {
                    let closest = self.routing_table.get_closest(&info_hash);
                    Response::GetPeers {
                        token: Some(token),
                        values: None,
                        nodes: Some(encode_compact_nodes(&closest)),
                    }
                } else {
                    let values = peers
                        .iter()
                        .filter_map(compact_peer)
                        .map(|c| Bytes::copy_from_slice(&c))
                        .collect();
                    Response::GetPeers {
                        token: Some(token),
                        values: Some(values),
                        nodes: None,
                    }
                }
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if !self.tokens.verify_token(&addr, &token, now) {
                    debug!("rejecting announce_peer from {}: bad token", addr);
                    let error = DhtMessage::error(
                        transaction_id,
                        ErrorCode::Protocol,
                        "Invalid or expired token received",
                    );
                    self.message_loop.enqueue_response(error, addr);
                    return;
                }
                let port = if implied_port { addr.port() } else { port };
                debug!("{} announced {} on port {}", addr, info_hash, port);
                self.peer_store
                    .add_peer(info_hash, SocketAddr::new(addr.ip(), port), now);
                Response::AnnouncePeer
            }
        };

        let reply = DhtMessage::response(transaction_id, self.local_id(), response);
        self.message_loop.enqueue_response(reply, addr);
    }

    /// Applies what a response tells us about the network: nodes it names are
    /// pinged, and a `get_peers` token is kept on the sender.
    pub(crate) fn handle_response(&mut self, sender: NodeId, response: &Response, now: Instant) {
        match response {
            Response::FindNode { nodes } => {
                for node in parse_compact_nodes(nodes) {
                    self.ping_node(node, now);
                }
            }
            Response::GetPeers { token, nodes, .. } => {
                if let Some(token) = token {
                    if let Some(node) = self.routing_table.find_node_mut(&sender) {
                        node.set_token(token.clone());
                    }
                }
                for node in nodes.iter().flat_map(|n| parse_compact_nodes(n)) {
                    self.ping_node(node, now);
                }
            }
            Response::Ping | Response::AnnouncePeer => {}
        }
    }
}
