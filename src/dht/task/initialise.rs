use std::time::Instant;

use tracing::info;

use super::{finish, ClosestSet, SendQueryTask, Task, TaskEvent, TaskId, TaskOutcome, TaskState};
use crate::dht::config::K;
use crate::dht::driver::Dht;
use crate::dht::engine::DhtState;
use crate::dht::message::{DhtMessage, Response};
use crate::dht::message_loop::QueryOutcome;
use crate::dht::node::{parse_compact_nodes, Node, NodeId};

/// Bootstrap: converges on the local id with `find_node` to fill the
/// routing table.
///
/// Seeded with known nodes it pings them into the table first; without seeds
/// it starts from the bootstrap routers.
pub(crate) struct InitialiseTask {
    initial: Vec<Node>,
    closest: ClosestSet,
    active: usize,
    state: TaskState,
}

impl InitialiseTask {
    pub(crate) fn new(local_id: NodeId, initial: Vec<Node>) -> Self {
        Self {
            initial,
            closest: ClosestSet::new(local_id, K),
            active: 0,
            state: TaskState::Idle,
        }
    }

    fn find_nodes(&mut self, id: TaskId, dht: &mut Dht, nodes: Vec<Node>, now: Instant) {
        let local_id = dht.local_id();
        let retries = dht.config.query_retries;
        for node in nodes {
            if node.id() == local_id || !self.closest.admit(node.id()) {
                continue;
            }
            self.active += 1;
            let message = DhtMessage::find_node(local_id, local_id);
            dht.spawn_task(
                Box::new(SendQueryTask::new(message, node, retries)),
                Some(id),
                now,
            );
        }
    }

    fn complete(&mut self, id: TaskId, dht: &mut Dht, now: Instant) {
        let known = dht.routing_table.node_count();
        if !self.initial.is_empty() && known < dht.config.min_bootstrap_nodes {
            info!(
                "only {} nodes known after bootstrapping from saved nodes, trying the routers",
                known
            );
            let retry = InitialiseTask::new(dht.local_id(), Vec::new());
            dht.spawn_task(Box::new(retry), None, now);
        } else {
            info!("DHT bootstrap finished with {} nodes", known);
            dht.set_state(DhtState::Ready);
        }
        finish(&mut self.state, id, dht, TaskOutcome::Done);
    }
}

impl Task for InitialiseTask {
    fn execute(&mut self, id: TaskId, dht: &mut Dht, now: Instant) {
        if self.state != TaskState::Idle {
            return;
        }
        self.state = TaskState::Active;

        let seeds = if self.initial.is_empty() {
            dht.bootstrap_addrs
                .iter()
                .map(|addr| Node::new(NodeId::generate(), *addr))
                .collect()
        } else {
            for node in &self.initial {
                dht.ping_node(node.clone(), now);
            }
            self.initial.clone()
        };
        self.find_nodes(id, dht, seeds, now);

        if self.active == 0 {
            self.complete(id, dht, now);
        }
    }

    fn handle(&mut self, id: TaskId, event: TaskEvent, dht: &mut Dht, now: Instant) {
        let TaskEvent::Child {
            outcome: TaskOutcome::Query { outcome, .. },
            ..
        } = event
        else {
            return;
        };
        if self.state != TaskState::Active {
            return;
        }
        self.active = self.active.saturating_sub(1);

        if let QueryOutcome::Response {
            response: Response::FindNode { nodes },
            ..
        } = outcome
        {
            self.find_nodes(id, dht, parse_compact_nodes(&nodes), now);
        }

        if self.active == 0 {
            self.complete(id, dht, now);
        }
    }

    fn state(&self) -> TaskState {
        self.state
    }
}
