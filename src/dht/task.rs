//! Multi-step DHT operations.
//!
//! A task is a state machine (`Idle → Active → Completed`) living in the
//! engine's [`TaskSet`]. Tasks never call each other directly: query
//! completions and child-task outcomes are queued as [`TaskEvent`]s and
//! delivered one by one after the current step returns, so a task is never
//! re-entered while it is running.

mod announce;
mod get_peers;
mod initialise;
mod refresh_bucket;
mod replace_node;
mod send_query;

pub(crate) use announce::AnnounceTask;
pub(crate) use get_peers::GetPeersTask;
pub(crate) use initialise::InitialiseTask;
pub(crate) use refresh_bucket::RefreshBucketTask;
pub(crate) use replace_node::ReplaceNodeTask;
pub(crate) use send_query::SendQueryTask;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::oneshot;

use super::driver::Dht;
use super::message_loop::{QueryCompletion, QueryOutcome};
use super::node::{Node, NodeId};

pub(crate) type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Idle,
    Active,
    Completed,
}

#[derive(Debug, Clone)]
pub(crate) enum TaskOutcome {
    Query {
        node: Node,
        outcome: QueryOutcome,
    },
    Lookup {
        info_hash: NodeId,
        /// Closest nodes that answered, nearest first, with their tokens.
        closest: Vec<Node>,
        peers: Vec<SocketAddr>,
    },
    Announced {
        info_hash: NodeId,
        nodes: usize,
    },
    Done,
}

#[derive(Debug)]
pub(crate) enum TaskEvent {
    Query(QueryCompletion),
    Child { child: TaskId, outcome: TaskOutcome },
}

pub(crate) trait Task: Send {
    /// Starts the task. Only the first call on an idle task has an effect.
    fn execute(&mut self, id: TaskId, dht: &mut Dht, now: Instant);

    fn handle(&mut self, id: TaskId, event: TaskEvent, dht: &mut Dht, now: Instant);

    fn state(&self) -> TaskState;
}

/// Marks `state` completed and publishes `outcome`, at most once.
pub(crate) fn finish(state: &mut TaskState, id: TaskId, dht: &mut Dht, outcome: TaskOutcome) {
    if *state == TaskState::Completed {
        return;
    }
    *state = TaskState::Completed;
    dht.complete_task(id, outcome);
}

struct Entry {
    /// `None` while the task is being stepped.
    task: Option<Box<dyn Task>>,
    parent: Option<TaskId>,
}

/// Arena of live tasks plus the queue of events addressed to them.
#[derive(Default)]
pub(crate) struct TaskSet {
    next_id: TaskId,
    entries: HashMap<TaskId, Entry>,
    events: VecDeque<(TaskId, TaskEvent)>,
    waiters: HashMap<TaskId, oneshot::Sender<TaskOutcome>>,
}

impl TaskSet {
    fn insert(&mut self, task: Box<dyn Task>, parent: Option<TaskId>) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                task: Some(task),
                parent,
            },
        );
        id
    }

    pub(crate) fn push_event(&mut self, id: TaskId, event: TaskEvent) {
        self.events.push_back((id, event));
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops every task; pending waiters observe a closed channel.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.events.clear();
        self.waiters.clear();
    }
}

impl Dht {
    pub(crate) fn spawn_task(
        &mut self,
        task: Box<dyn Task>,
        parent: Option<TaskId>,
        now: Instant,
    ) -> TaskId {
        let id = self.tasks.insert(task, parent);
        self.step_task(id, |task, dht| task.execute(id, dht, now));
        id
    }

    /// Spawns a root task whose outcome is delivered on the returned channel.
    pub(crate) fn spawn_task_waiting(
        &mut self,
        task: Box<dyn Task>,
        now: Instant,
    ) -> oneshot::Receiver<TaskOutcome> {
        let (tx, rx) = oneshot::channel();
        let id = self.tasks.insert(task, None);
        self.tasks.waiters.insert(id, tx);
        self.step_task(id, |task, dht| task.execute(id, dht, now));
        rx
    }

    pub(crate) fn complete_task(&mut self, id: TaskId, outcome: TaskOutcome) {
        if let Some(waiter) = self.tasks.waiters.remove(&id) {
            let _ = waiter.send(outcome.clone());
        }
        let parent = self.tasks.entries.get(&id).and_then(|e| e.parent);
        if let Some(parent) = parent {
            self.tasks
                .push_event(parent, TaskEvent::Child { child: id, outcome });
        }
    }

    /// Delivers queued events until none are left.
    pub(crate) fn run_task_events(&mut self, now: Instant) {
        while let Some((id, event)) = self.tasks.events.pop_front() {
            self.step_task(id, |task, dht| task.handle(id, event, dht, now));
        }
    }

    fn step_task(&mut self, id: TaskId, step: impl FnOnce(&mut dyn Task, &mut Dht)) {
        let Some(mut task) = self.tasks.entries.get_mut(&id).and_then(|e| e.task.take()) else {
            return;
        };
        step(task.as_mut(), self);
        if task.state() == TaskState::Completed {
            self.tasks.entries.remove(&id);
            self.tasks.waiters.remove(&id);
        } else if let Some(entry) = self.tasks.entries.get_mut(&id) {
            entry.task = Some(task);
        }
    }
}

/// Bounded set of the ids nearest to a target.
///
/// An id is admitted if it is new and either the set has room or it is closer
/// than the furthest member, which it then evicts.
pub(crate) struct ClosestSet {
    target: NodeId,
    capacity: usize,
    members: BTreeMap<NodeId, NodeId>,
}

impl ClosestSet {
    pub(crate) fn new(target: NodeId, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            members: BTreeMap::new(),
        }
    }

    pub(crate) fn admit(&mut self, id: NodeId) -> bool {
        let distance = id.xor(&self.target);
        if self.members.contains_key(&distance) {
            return false;
        }
        if self.members.len() >= self.capacity {
            match self.members.last_key_value() {
                Some((&furthest, _)) if distance < furthest => {
                    self.members.remove(&furthest);
                }
                _ => return false,
            }
        }
        self.members.insert(distance, id);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.members.values()
    }
}

#[cfg(test)]
mod tests;
