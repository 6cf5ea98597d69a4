use std::time::Instant;

use tracing::{debug, trace};

use super::{finish, Task, TaskEvent, TaskId, TaskOutcome, TaskState};
use crate::dht::driver::Dht;
use crate::dht::message::DhtMessage;
use crate::dht::message_loop::QueryOutcome;
use crate::dht::node::Node;

/// Sends one query, resending it on timeout until `retries` attempts have
/// been made.
///
/// Exhausting the attempts charges the node a single failure.
pub(crate) struct SendQueryTask {
    message: DhtMessage,
    node: Node,
    retries: u32,
    attempts: u32,
    state: TaskState,
}

impl SendQueryTask {
    pub(crate) fn new(message: DhtMessage, node: Node, retries: u32) -> Self {
        Self {
            message,
            node,
            retries: retries.max(1),
            attempts: 0,
            state: TaskState::Idle,
        }
    }

    fn send(&mut self, id: TaskId, dht: &mut Dht) {
        self.attempts += 1;
        let transaction_id =
            dht.message_loop
                .enqueue_query(self.message.clone(), self.node.addr(), Some(id));
        self.message.transaction_id = Some(transaction_id);
    }

    fn name(&self) -> &'static str {
        self.message.query_kind().map_or("query", |kind| kind.name())
    }
}

impl Task for SendQueryTask {
    fn execute(&mut self, id: TaskId, dht: &mut Dht, _now: Instant) {
        if self.state != TaskState::Idle {
            return;
        }
        self.state = TaskState::Active;
        self.send(id, dht);
    }

    fn handle(&mut self, id: TaskId, event: TaskEvent, dht: &mut Dht, now: Instant) {
        let TaskEvent::Query(completion) = event else {
            return;
        };
        if self.state != TaskState::Active {
            return;
        }

        match &completion.outcome {
            QueryOutcome::TimedOut if self.attempts < self.retries => {
                trace!(
                    "resending {} to {} (attempt {})",
                    self.name(),
                    self.node.addr(),
                    self.attempts + 1
                );
                self.send(id, dht);
                return;
            }
            QueryOutcome::TimedOut => {
                debug!(
                    "{} to {} unanswered after {} attempts",
                    self.name(),
                    self.node.addr(),
                    self.attempts
                );
                self.node.fail();
                if let Some(node) = dht.routing_table.find_node_mut(&self.node.id()) {
                    node.fail();
                }
            }
            QueryOutcome::Response { .. } | QueryOutcome::Error { .. } => {
                self.node.seen(now);
                if let Some(node) = dht.routing_table.find_node_mut(&self.node.id()) {
                    node.seen(now);
                }
            }
        }

        let outcome = TaskOutcome::Query {
            node: self.node.clone(),
            outcome: completion.outcome,
        };
        finish(&mut self.state, id, dht, outcome);
    }

    fn state(&self) -> TaskState {
        self.state
    }
}
