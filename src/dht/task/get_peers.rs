use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::debug;

use super::{finish, ClosestSet, SendQueryTask, Task, TaskEvent, TaskId, TaskOutcome, TaskState};
use crate::dht::config::K;
use crate::dht::driver::Dht;
use crate::dht::message::{DhtMessage, Response};
use crate::dht::message_loop::QueryOutcome;
use crate::dht::node::{parse_compact_nodes, peer_from_compact, Node, NodeId};

/// Iterative `get_peers` lookup converging on the nodes nearest an info-hash.
pub(crate) struct GetPeersTask {
    info_hash: NodeId,
    closest: ClosestSet,
    /// Queried nodes keyed by distance; entries leave on failure or when
    /// they answer outside the nearest `K`.
    responders: BTreeMap<NodeId, Node>,
    active: usize,
    peers: Vec<SocketAddr>,
    state: TaskState,
}

impl GetPeersTask {
    pub(crate) fn new(info_hash: NodeId) -> Self {
        Self {
            info_hash,
            closest: ClosestSet::new(info_hash, K),
            responders: BTreeMap::new(),
            active: 0,
            peers: Vec::new(),
            state: TaskState::Idle,
        }
    }

    fn query(&mut self, id: TaskId, dht: &mut Dht, node: Node, now: Instant) {
        if node.id() == dht.local_id() || !self.closest.admit(node.id()) {
            return;
        }
        self.responders
            .insert(node.id().xor(&self.info_hash), node.clone());
        self.active += 1;
        let message = DhtMessage::get_peers(dht.local_id(), self.info_hash);
        let retries = dht.config.query_retries;
        dht.spawn_task(
            Box::new(SendQueryTask::new(message, node, retries)),
            Some(id),
            now,
        );
    }

    fn complete(&mut self, id: TaskId, dht: &mut Dht) {
        debug!(
            "get_peers for {} finished with {} peers",
            self.info_hash,
            self.peers.len()
        );
        let outcome = TaskOutcome::Lookup {
            info_hash: self.info_hash,
            closest: self.responders.values().take(K).cloned().collect(),
            peers: self.peers.clone(),
        };
        finish(&mut self.state, id, dht, outcome);
    }
}

impl Task for GetPeersTask {
    fn execute(&mut self, id: TaskId, dht: &mut Dht, now: Instant) {
        if self.state != TaskState::Idle {
            return;
        }
        self.state = TaskState::Active;

        for node in dht.routing_table.get_closest(&self.info_hash) {
            self.query(id, dht, node, now);
        }
        if self.active == 0 {
            self.complete(id, dht);
        }
    }

    fn handle(&mut self, id: TaskId, event: TaskEvent, dht: &mut Dht, now: Instant) {
        let TaskEvent::Child {
            outcome: TaskOutcome::Query { node, outcome },
            ..
        } = event
        else {
            return;
        };
        if self.state != TaskState::Active {
            return;
        }
        self.active = self.active.saturating_sub(1);

        let distance = node.id().xor(&self.info_hash);
        match outcome {
            QueryOutcome::Response {
                response:
                    Response::GetPeers {
                        token,
                        values,
                        nodes,
                    },
                ..
            } => {
                if self.responders.range(..distance).count() >= K {
                    self.responders.remove(&distance);
                } else if let Some(responder) = self.responders.get_mut(&distance) {
                    responder.seen(now);
                    if let Some(token) = token {
                        responder.set_token(token);
                    }
                }

                let mut found = Vec::new();
                for peer in values.iter().flatten().filter_map(|v| peer_from_compact(v)) {
                    if !self.peers.contains(&peer) {
                        self.peers.push(peer);
                        found.push(peer);
                    }
                }
                if !found.is_empty() {
                    dht.raise_peers_found(self.info_hash, found);
                }

                // a reply carrying values ends this branch of the search
                if values.is_none() {
                    if let Some(nodes) = nodes {
                        for node in parse_compact_nodes(&nodes) {
                            self.query(id, dht, node, now);
                        }
                    }
                }
            }
            _ => {
                self.responders.remove(&distance);
            }
        }

        if self.active == 0 {
            self.complete(id, dht);
        }
    }

    fn state(&self) -> TaskState {
        self.state
    }
}
