use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::Instant;

use super::config::K;
use super::node::{Node, NodeId};

/// A contiguous slice `[min, max)` of the keyspace holding at most [`K`] nodes.
#[derive(Debug, Clone)]
pub struct Bucket {
    min: NodeId,
    max: NodeId,
    nodes: Vec<Node>,
    replacement: Option<Node>,
    last_changed: Instant,
}

impl Bucket {
    pub fn new(min: NodeId, max: NodeId) -> Self {
        Self::with_last_changed(min, max, Instant::now())
    }

    fn with_last_changed(min: NodeId, max: NodeId, last_changed: Instant) -> Self {
        Self {
            min,
            max,
            nodes: Vec::with_capacity(K),
            replacement: None,
            last_changed,
        }
    }

    pub fn min(&self) -> NodeId {
        self.min
    }

    pub fn max(&self) -> NodeId {
        self.max
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Candidate waiting for a stale node of this bucket to be evicted.
    pub fn replacement(&self) -> Option<&Node> {
        self.replacement.as_ref()
    }

    pub fn last_changed(&self) -> Instant {
        self.last_changed
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.min <= *id && *id < self.max
    }

    pub fn find(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == *id)
    }

    pub(crate) fn find_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id() == *id)
    }

    /// Appends while there is room, otherwise takes the place of a Bad node.
    pub(crate) fn add(&mut self, node: Node, now: Instant) -> bool {
        if self.nodes.len() < K {
            self.nodes.push(node);
        } else if let Some(slot) = self.nodes.iter().rposition(Node::is_bad) {
            self.nodes[slot] = node;
        } else {
            return false;
        }
        self.last_changed = now;
        true
    }

    /// Swaps `old` for `node`, returning false if `old` is no longer here.
    pub(crate) fn replace(&mut self, old: &NodeId, node: Node, now: Instant) -> bool {
        match self.nodes.iter().position(|n| n.id() == *old) {
            Some(slot) => {
                self.nodes[slot] = node;
                self.last_changed = now;
                true
            }
            None => false,
        }
    }

    /// Least recently seen first; never-seen nodes lead.
    pub(crate) fn sort_by_seen(&mut self) {
        self.nodes.sort_by_key(Node::last_seen);
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_changed = now;
    }

    pub(crate) fn take_replacement(&mut self) -> Option<Node> {
        self.replacement.take()
    }
}

/// Result of [`RoutingTable::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Added,
    /// A node with this id is already in the table.
    Exists,
    /// The owning bucket is full and cannot split; the node is kept as the
    /// bucket's replacement candidate.
    Rejected { bucket: NodeId },
    /// The local id, or an id outside every bucket.
    Ignored,
}

type NodeAddedHandler = Box<dyn FnMut(&Node) + Send>;

/// Buckets partitioning `[NodeId::MIN, NodeId::MAX)` in ascending order.
///
/// Only the bucket covering the local id is ever split, so the table keeps
/// fine-grained knowledge of the local neighbourhood and coarse knowledge of
/// the rest of the keyspace.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    node_added: Option<NodeAddedHandler>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: vec![Bucket::new(NodeId::MIN, NodeId::MAX)],
            node_added: None,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Installs the callback run for every node that enters the table.
    pub fn set_node_added(&mut self, handler: impl FnMut(&Node) + Send + 'static) {
        self.node_added = Some(Box::new(handler));
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flat_map(|b| b.nodes.iter())
    }

    /// Back to a single empty bucket.
    pub fn clear(&mut self) {
        self.buckets = vec![Bucket::new(NodeId::MIN, NodeId::MAX)];
    }

    pub fn add(&mut self, node: Node) -> bool {
        self.insert(node, Instant::now()) == Insertion::Added
    }

    pub fn insert(&mut self, node: Node, now: Instant) -> Insertion {
        let id = node.id();
        if id == self.local_id {
            return Insertion::Ignored;
        }

        loop {
            let Some(index) = self.bucket_index(&id) else {
                return Insertion::Ignored;
            };

            let bucket = &mut self.buckets[index];
            if bucket.find(&id).is_some() {
                return Insertion::Exists;
            }
            if bucket.add(node.clone(), now) {
                if let Some(handler) = self.node_added.as_mut() {
                    handler(&node);
                }
                return Insertion::Added;
            }

            let splittable = bucket.contains(&self.local_id);
            if !splittable || !self.split(index, now) {
                let bucket = &mut self.buckets[index];
                bucket.replacement = Some(node);
                return Insertion::Rejected { bucket: bucket.min };
            }
        }
    }

    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        let index = self.buckets.partition_point(|b| b.max <= *id);
        self.buckets
            .get(index)
            .filter(|b| b.contains(id))
            .map(|_| index)
    }

    fn split(&mut self, index: usize, now: Instant) -> bool {
        let (min, max) = (self.buckets[index].min, self.buckets[index].max);
        let mid = NodeId::midpoint(&min, &max);
        if mid == min {
            return false;
        }

        let old = self.buckets.remove(index);
        let mut lower = Bucket::with_last_changed(min, mid, now);
        let mut upper = Bucket::with_last_changed(mid, max, now);
        for node in old.nodes {
            if node.id() < mid {
                lower.nodes.push(node);
            } else {
                upper.nodes.push(node);
            }
        }
        if let Some(candidate) = old.replacement {
            if candidate.id() < mid {
                lower.replacement = Some(candidate);
            } else {
                upper.replacement = Some(candidate);
            }
        }

        self.buckets.insert(index, upper);
        self.buckets.insert(index, lower);
        true
    }

    pub fn bucket_containing(&self, id: &NodeId) -> Option<&Bucket> {
        self.bucket_index(id).map(|i| &self.buckets[i])
    }

    /// Bucket whose range starts at `min`.
    pub fn bucket(&self, min: &NodeId) -> Option<&Bucket> {
        self.bucket_index(min)
            .map(|i| &self.buckets[i])
            .filter(|b| b.min == *min)
    }

    pub(crate) fn bucket_mut(&mut self, min: &NodeId) -> Option<&mut Bucket> {
        let index = self.bucket_index(min)?;
        Some(&mut self.buckets[index]).filter(|b| b.min == *min)
    }

    pub fn find_node(&self, id: &NodeId) -> Option<&Node> {
        self.bucket_containing(id)?.find(id)
    }

    pub(crate) fn find_node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        let index = self.bucket_index(id)?;
        self.buckets[index].find_mut(id)
    }

    /// Evicts `old` in favour of `node`; returns false if `old` is gone.
    pub(crate) fn replace(&mut self, old: &NodeId, node: Node, now: Instant) -> bool {
        let Some(index) = self.bucket_index(old) else {
            return false;
        };
        if !self.buckets[index].contains(&node.id()) || self.buckets[index].find(&node.id()).is_some() {
            return false;
        }
        if !self.buckets[index].replace(old, node.clone(), now) {
            return false;
        }
        if let Some(handler) = self.node_added.as_mut() {
            handler(&node);
        }
        true
    }

    /// Up to [`K`] nodes ordered by XOR distance to `target`, nearest first.
    pub fn get_closest(&self, target: &NodeId) -> Vec<Node> {
        struct ByDistance<'a> {
            distance: NodeId,
            node: &'a Node,
        }

        impl PartialEq for ByDistance<'_> {
            fn eq(&self, other: &Self) -> bool {
                self.distance == other.distance
            }
        }

        impl Eq for ByDistance<'_> {}

        impl Ord for ByDistance<'_> {
            fn cmp(&self, other: &Self) -> Ordering {
                self.distance.cmp(&other.distance)
            }
        }

        impl PartialOrd for ByDistance<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<ByDistance<'_>> = BinaryHeap::with_capacity(K + 1);
        for node in self.nodes() {
            let distance = node.id().xor(target);
            if heap.len() < K {
                heap.push(ByDistance { distance, node });
            } else if heap.peek().is_some_and(|far| distance < far.distance) {
                heap.push(ByDistance { distance, node });
                heap.pop();
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|entry| entry.node.clone())
            .collect()
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTable")
            .field("local_id", &self.local_id)
            .field("buckets", &self.buckets.len())
            .field("nodes", &self.node_count())
            .finish()
    }
}
