use std::time::Instant;

use tracing::debug;

use super::{finish, GetPeersTask, SendQueryTask, Task, TaskEvent, TaskId, TaskOutcome, TaskState};
use crate::dht::driver::Dht;
use crate::dht::message::DhtMessage;
use crate::dht::message_loop::QueryOutcome;
use crate::dht::node::NodeId;

/// Looks up the nodes nearest an info-hash, then announces to each of them
/// that handed out a token.
pub(crate) struct AnnounceTask {
    info_hash: NodeId,
    port: u16,
    lookup: Option<TaskId>,
    active: usize,
    announced: usize,
    state: TaskState,
}

impl AnnounceTask {
    pub(crate) fn new(info_hash: NodeId, port: u16) -> Self {
        Self {
            info_hash,
            port,
            lookup: None,
            active: 0,
            announced: 0,
            state: TaskState::Idle,
        }
    }

    fn complete(&mut self, id: TaskId, dht: &mut Dht) {
        debug!(
            "announced {} on port {} to {} nodes",
            self.info_hash, self.port, self.announced
        );
        let outcome = TaskOutcome::Announced {
            info_hash: self.info_hash,
            nodes: self.announced,
        };
        finish(&mut self.state, id, dht, outcome);
    }
}

impl Task for AnnounceTask {
    fn execute(&mut self, id: TaskId, dht: &mut Dht, now: Instant) {
        if self.state != TaskState::Idle {
            return;
        }
        self.state = TaskState::Active;
        let lookup = dht.spawn_task(Box::new(GetPeersTask::new(self.info_hash)), Some(id), now);
        self.lookup = Some(lookup);
    }

    fn handle(&mut self, id: TaskId, event: TaskEvent, dht: &mut Dht, now: Instant) {
        let TaskEvent::Child { child, outcome } = event else {
            return;
        };
        if self.state != TaskState::Active {
            return;
        }

        match outcome {
            TaskOutcome::Lookup { closest, .. } if self.lookup == Some(child) => {
                let retries = dht.config.query_retries;
                for node in closest {
                    let Some(token) = node.token().cloned() else {
                        continue;
                    };
                    let message =
                        DhtMessage::announce_peer(dht.local_id(), self.info_hash, self.port, token);
                    self.active += 1;
                    dht.spawn_task(
                        Box::new(SendQueryTask::new(message, node, retries)),
                        Some(id),
                        now,
                    );
                }
            }
            TaskOutcome::Query { outcome, .. } => {
                self.active = self.active.saturating_sub(1);
                if matches!(outcome, QueryOutcome::Response { .. }) {
                    self.announced += 1;
                }
            }
            _ => return,
        }

        if self.active == 0 {
            self.complete(id, dht);
        }
    }

    fn state(&self) -> TaskState {
        self.state
    }
}
