use std::cmp::Reverse;
use std::time::Instant;

use tracing::trace;

use super::{finish, SendQueryTask, Task, TaskEvent, TaskId, TaskOutcome, TaskState};
use crate::dht::driver::Dht;
use crate::dht::message::DhtMessage;
use crate::dht::message_loop::QueryOutcome;
use crate::dht::node::{Node, NodeId};
use crate::dht::routing::Bucket;

/// Probes a quiet bucket, most recently seen node first, with a `find_node`
/// for a random id in its range. Stops at the first answer.
pub(crate) struct RefreshBucketTask {
    min: NodeId,
    max: NodeId,
    candidates: Vec<Node>,
    next: usize,
    state: TaskState,
}

impl RefreshBucketTask {
    pub(crate) fn new(bucket: &Bucket) -> Self {
        let mut candidates = bucket.nodes().to_vec();
        candidates.sort_by_key(|n| Reverse(n.last_seen()));
        Self {
            min: bucket.min(),
            max: bucket.max(),
            candidates,
            next: 0,
            state: TaskState::Idle,
        }
    }

    fn query_next(&mut self, id: TaskId, dht: &mut Dht, now: Instant) -> bool {
        while let Some(node) = self.candidates.get(self.next).cloned() {
            self.next += 1;
            if dht.routing_table.find_node(&node.id()).is_none() {
                continue;
            }
            let target = NodeId::random_in_range(&self.min, &self.max);
            trace!("refreshing bucket {} via {}", self.min, node.addr());
            let message = DhtMessage::find_node(dht.local_id(), target);
            let retries = dht.config.query_retries;
            dht.spawn_task(
                Box::new(SendQueryTask::new(message, node, retries)),
                Some(id),
                now,
            );
            return true;
        }
        false
    }
}

impl Task for RefreshBucketTask {
    fn execute(&mut self, id: TaskId, dht: &mut Dht, now: Instant) {
        if self.state != TaskState::Idle {
            return;
        }
        self.state = TaskState::Active;
        if !self.query_next(id, dht, now) {
            finish(&mut self.state, id, dht, TaskOutcome::Done);
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
        if matches!(outcome, QueryOutcome::TimedOut) && self.query_next(id, dht, now) {
            return;
        }
        finish(&mut self.state, id, dht, TaskOutcome::Done);
    }

    fn state(&self) -> TaskState {
        self.state
    }
}
