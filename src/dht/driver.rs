use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use super::config::DhtConfig;
use super::engine::{DhtEvent, DhtState};
use super::error::DhtError;
use super::listener::Listener;
use super::message::{Body, DhtMessage};
use super::message_loop::{MessageLoop, QueryCompletion, QueryOutcome};
use super::node::{Node, NodeId};
use super::peers::PeerStore;
use super::routing::{Insertion, RoutingTable};
use super::task::{InitialiseTask, RefreshBucketTask, ReplaceNodeTask, SendQueryTask, TaskEvent, TaskSet};
use super::token::TokenManager;
use crate::bencode::{encode, Value};

/// All engine state, owned by the main loop.
///
/// Every method runs on the loop; time is passed in so the engine can be
/// driven deterministically.
pub(crate) struct Dht {
    pub(crate) config: DhtConfig,
    local_id: NodeId,
    pub(crate) routing_table: RoutingTable,
    pub(crate) tokens: TokenManager,
    pub(crate) peer_store: PeerStore,
    pub(crate) message_loop: MessageLoop,
    pub(crate) tasks: TaskSet,
    /// Resolved addresses of the bootstrap routers.
    pub(crate) bootstrap_addrs: Vec<SocketAddr>,
    /// Buckets with a replacement in progress, by lower bound.
    replacing: HashSet<NodeId>,
    state: DhtState,
    started: bool,
    disposed: bool,
    events: broadcast::Sender<DhtEvent>,
}

impl Dht {
    pub(crate) fn new(
        config: DhtConfig,
        listener: Arc<dyn Listener>,
        events: broadcast::Sender<DhtEvent>,
    ) -> Self {
        let local_id = config.node_id.unwrap_or_else(NodeId::generate);

        let mut routing_table = RoutingTable::new(local_id);
        let added = events.clone();
        routing_table.set_node_added(move |node| {
            trace!("node {} added to routing table", node.id());
            let _ = added.send(DhtEvent::NodeAdded(node.id()));
        });

        Self {
            tokens: TokenManager::new(config.token_rotation),
            peer_store: PeerStore::new(config.peer_lifetime, config.max_peers_per_hash),
            message_loop: MessageLoop::new(listener, &config),
            tasks: TaskSet::default(),
            bootstrap_addrs: Vec::new(),
            replacing: HashSet::new(),
            state: DhtState::NotReady,
            started: false,
            disposed: false,
            routing_table,
            local_id,
            config,
            events,
        }
    }

    pub(crate) fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub(crate) fn state(&self) -> DhtState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DhtState) {
        if self.state != state {
            info!("DHT state changed to {:?}", state);
            self.state = state;
            let _ = self.events.send(DhtEvent::StateChanged(state));
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub(crate) fn check_disposed(&self) -> Result<(), DhtError> {
        if self.disposed {
            Err(DhtError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Starts listening and bootstraps, seeded with `initial` when non-empty.
    ///
    /// Returns true on the first start, when periodic work must be scheduled.
    pub(crate) fn start(&mut self, initial: Vec<Node>, now: Instant) -> Result<bool, DhtError> {
        self.check_disposed()?;
        self.message_loop.start()?;
        info!("DHT node {} starting with {} saved nodes", self.local_id, initial.len());

        let first = !self.started;
        self.started = true;
        self.set_state(DhtState::Initialising);
        let task = InitialiseTask::new(self.local_id, initial);
        self.spawn_task(Box::new(task), None, now);
        Ok(first)
    }

    pub(crate) fn stop(&mut self) {
        self.message_loop.stop();
        self.set_state(DhtState::NotReady);
    }

    pub(crate) fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.message_loop.stop();
        self.tasks.clear();
        self.disposed = true;
        debug!("DHT node {} disposed", self.local_id);
    }

    /// One message-loop step: send, receive, expire, then run task events.
    pub(crate) fn tick(&mut self, now: Instant) {
        if self.disposed {
            return;
        }
        self.message_loop.send_next(now);
        if let Some((data, addr)) = self.message_loop.next_datagram() {
            self.receive(&data, addr, now);
        }
        if let Some(completion) = self.message_loop.expire_next(now) {
            self.complete_query(completion);
        }
        self.run_task_events(now);
    }

    /// Periodic upkeep: refresh quiet buckets and drop expired peers.
    pub(crate) fn maintain(&mut self, now: Instant) {
        if self.disposed {
            return;
        }
        let interval = self.config.bucket_refresh_interval;
        let stale: Vec<NodeId> = self
            .routing_table
            .buckets()
            .iter()
            .filter(|b| now.saturating_duration_since(b.last_changed()) > interval)
            .map(|b| b.min())
            .collect();

        for min in stale {
            let Some(bucket) = self.routing_table.bucket_mut(&min) else {
                continue;
            };
            bucket.touch(now);
            let task = RefreshBucketTask::new(bucket);
            self.spawn_task(Box::new(task), None, now);
        }

        self.peer_store.prune(now);
        self.run_task_events(now);
    }

    fn receive(&mut self, data: &[u8], addr: SocketAddr, now: Instant) {
        let (message, claimed) = match self.message_loop.decode(data, addr) {
            Ok(decoded) => decoded,
            Err(DhtError::Protocol {
                transaction_id,
                code,
                message,
            }) => {
                debug!("answering {} with error {}: {}", addr, code, message);
                let error = DhtMessage::error(transaction_id, code, message);
                self.message_loop.enqueue_response(error, addr);
                return;
            }
            Err(e) => {
                debug!("dropping datagram from {}: {}", addr, e);
                return;
            }
        };

        let transaction_id = message.transaction_id.unwrap_or_default();
        match message.body {
            Body::Query { id, query } => {
                trace!("{} query from {}", query.kind().name(), addr);
                self.observe(id, addr, now);
                self.handle_query(transaction_id, query, addr, now);
            }
            Body::Response { id, response } => {
                self.observe(id, addr, now);
                self.handle_response(id, &response, now);
                if let Some(pending) = claimed {
                    self.complete_query(pending.complete(QueryOutcome::Response { id, response }));
                }
            }
            Body::Error { code, message } => {
                debug!("error {} from {}: {}", code, addr, message);
                if let Some(pending) = claimed {
                    self.complete_query(pending.complete(QueryOutcome::Error { code, message }));
                }
            }
        }
    }

    /// Marks the sender seen, adding it to the routing table if it is new.
    fn observe(&mut self, id: NodeId, addr: SocketAddr, now: Instant) {
        if let Some(node) = self.routing_table.find_node_mut(&id) {
            node.seen(now);
            return;
        }
        let mut node = Node::new(id, addr);
        node.seen(now);
        self.insert_node(node, now);
    }

    /// Adds `node`, starting a replacement when its bucket is full.
    pub(crate) fn insert_node(&mut self, node: Node, now: Instant) {
        if let Insertion::Rejected { bucket } = self.routing_table.insert(node.clone(), now) {
            if self.replacing.insert(bucket) {
                let task = ReplaceNodeTask::new(bucket, node);
                self.spawn_task(Box::new(task), None, now);
            }
        }
    }

    pub(crate) fn replacement_done(&mut self, bucket: &NodeId) {
        self.replacing.remove(bucket);
    }

    /// Pings a node we do not know yet; it joins the table if it answers.
    pub(crate) fn ping_node(&mut self, node: Node, now: Instant) {
        if node.id() == self.local_id || self.routing_table.find_node(&node.id()).is_some() {
            return;
        }
        let message = DhtMessage::ping(self.local_id);
        let task = SendQueryTask::new(message, node, self.config.query_retries);
        self.spawn_task(Box::new(task), None, now);
    }

    fn complete_query(&mut self, completion: QueryCompletion) {
        if let Some(owner) = completion.owner {
            self.tasks.push_event(owner, TaskEvent::Query(completion));
        }
    }

    pub(crate) fn raise_peers_found(&self, info_hash: NodeId, peers: Vec<SocketAddr>) {
        debug!("found {} peers for {}", peers.len(), info_hash);
        let _ = self.events.send(DhtEvent::PeersFound { info_hash, peers });
    }

    /// Bencoded list of compact records of every usable node, replacement
    /// candidates included.
    pub(crate) fn save_nodes(&self) -> Bytes {
        let mut records = Vec::new();
        for bucket in self.routing_table.buckets() {
            let nodes = bucket.nodes().iter().chain(bucket.replacement());
            for node in nodes.filter(|n| !n.is_bad()) {
                if let Some(compact) = node.to_compact() {
                    records.push(Value::from(&compact[..]));
                }
            }
        }
        encode(&Value::List(records))
    }
}

/// Parses a blob produced by [`Dht::save_nodes`].
pub(crate) fn parse_node_blob(blob: &[u8]) -> Result<Vec<Node>, DhtError> {
    let value = crate::bencode::decode(blob)?;
    let records = value
        .as_list()
        .ok_or_else(|| DhtError::InvalidMessage("saved nodes must be a list".into()))?;
    Ok(records
        .iter()
        .filter_map(Value::as_bytes)
        .filter_map(|record| Node::from_compact(record))
        .collect())
}
