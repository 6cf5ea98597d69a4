use std::time::Instant;

use tracing::debug;

use super::{finish, SendQueryTask, Task, TaskEvent, TaskId, TaskOutcome, TaskState};
use crate::dht::driver::Dht;
use crate::dht::message::DhtMessage;
use crate::dht::message_loop::QueryOutcome;
use crate::dht::node::{Node, NodeId};
use crate::dht::routing::Bucket;

/// Makes room in a full bucket for `candidate` by pinging the bucket's least
/// recently seen node and evicting it if it stays silent.
pub(crate) struct ReplaceNodeTask {
    bucket: NodeId,
    candidate: Node,
    state: TaskState,
}

impl ReplaceNodeTask {
    /// `bucket` is the lower bound of the bucket's range.
    pub(crate) fn new(bucket: NodeId, candidate: Node) -> Self {
        Self {
            bucket,
            candidate,
            state: TaskState::Idle,
        }
    }

    fn complete(&mut self, id: TaskId, dht: &mut Dht) {
        dht.replacement_done(&self.bucket);
        finish(&mut self.state, id, dht, TaskOutcome::Done);
    }
}

impl Task for ReplaceNodeTask {
    fn execute(&mut self, id: TaskId, dht: &mut Dht, now: Instant) {
        if self.state != TaskState::Idle {
            return;
        }
        self.state = TaskState::Active;

        let recheck = dht.config.replace_recheck;
        let oldest = dht.routing_table.bucket_mut(&self.bucket).and_then(|bucket| {
            bucket.touch(now);
            bucket.sort_by_seen();
            bucket.nodes().first().cloned()
        });
        let Some(oldest) = oldest else {
            return self.complete(id, dht);
        };
        let recently_seen = oldest
            .last_seen()
            .is_some_and(|seen| now.saturating_duration_since(seen) < recheck);
        if recently_seen {
            return self.complete(id, dht);
        }

        let message = DhtMessage::ping(dht.local_id());
        let retries = dht.config.query_retries;
        dht.spawn_task(
            Box::new(SendQueryTask::new(message, oldest, retries)),
            Some(id),
            now,
        );
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

        if matches!(outcome, QueryOutcome::TimedOut) {
            let candidate = dht
                .routing_table
                .bucket_mut(&self.bucket)
                .and_then(Bucket::take_replacement)
                .unwrap_or_else(|| self.candidate.clone());
            let candidate_id = candidate.id();
            if dht.routing_table.replace(&node.id(), candidate.clone(), now) {
                debug!("replaced silent node {} with {}", node.id(), candidate_id);
            } else {
                dht.routing_table.insert(candidate, now);
            }
        }
        self.complete(id, dht);
    }

    fn state(&self) -> TaskState {
        self.state
    }
}
