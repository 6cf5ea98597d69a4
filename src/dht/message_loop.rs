use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{trace, warn};

use super::config::DhtConfig;
use super::error::DhtError;
use super::listener::{Listener, ReceiveQueue};
use super::message::{Body, DhtMessage, Query, Response, TransactionId};
use super::node::NodeId;
use super::task::TaskId;

struct Outgoing {
    message: DhtMessage,
    addr: SocketAddr,
}

/// A query that has been handed to the message loop and not yet answered.
#[derive(Debug, Clone)]
pub(crate) struct PendingQuery {
    pub transaction_id: TransactionId,
    pub query: Query,
    pub addr: SocketAddr,
    pub owner: Option<TaskId>,
    sent_at: Option<Instant>,
}

impl PendingQuery {
    pub(crate) fn complete(self, outcome: QueryOutcome) -> QueryCompletion {
        QueryCompletion {
            owner: self.owner,
            transaction_id: self.transaction_id,
            addr: self.addr,
            query: self.query,
            outcome,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum QueryOutcome {
    Response { id: NodeId, response: Response },
    Error { code: i64, message: String },
    TimedOut,
}

#[derive(Debug, Clone)]
pub(crate) struct QueryCompletion {
    pub owner: Option<TaskId>,
    pub transaction_id: TransactionId,
    pub addr: SocketAddr,
    pub query: Query,
    pub outcome: QueryOutcome,
}

/// Datagram plumbing between the listener and the engine.
///
/// Owns the outgoing queue, the transaction registry and the list of queries
/// waiting for an answer, oldest first. Each `Dht::tick` sends at most one
/// message, receives at most one datagram and expires at most one query.
pub(crate) struct MessageLoop {
    listener: Arc<dyn Listener>,
    received: Arc<ReceiveQueue>,
    send_queue: VecDeque<Outgoing>,
    pending: HashMap<TransactionId, PendingQuery>,
    waiting: VecDeque<TransactionId>,
    next_transaction: u16,
    last_sent: Option<Instant>,
    query_timeout: Duration,
    send_spacing: Duration,
    max_in_flight: usize,
    version: Option<Bytes>,
}

impl MessageLoop {
    pub(crate) fn new(listener: Arc<dyn Listener>, config: &DhtConfig) -> Self {
        Self {
            listener,
            received: Arc::new(ReceiveQueue::new()),
            send_queue: VecDeque::new(),
            pending: HashMap::new(),
            waiting: VecDeque::new(),
            next_transaction: 0,
            last_sent: None,
            query_timeout: config.query_timeout,
            send_spacing: config.send_spacing,
            max_in_flight: config.max_in_flight_sends,
            version: config.client_version.clone(),
        }
    }

    pub(crate) fn start(&self) -> Result<(), DhtError> {
        if self.listener.is_listening() {
            return Ok(());
        }
        self.listener.start(Arc::clone(&self.received))
    }

    pub(crate) fn stop(&self) {
        self.listener.stop();
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.listener.is_listening()
    }

    /// Queues a query and registers it under a fresh transaction id, or under
    /// its previous id when that id is free again (a retry).
    pub(crate) fn enqueue_query(
        &mut self,
        mut message: DhtMessage,
        addr: SocketAddr,
        owner: Option<TaskId>,
    ) -> TransactionId {
        let transaction_id = match message.transaction_id.take() {
            Some(id) if !self.pending.contains_key(&id) => id,
            _ => self.allocate_transaction_id(),
        };
        message.transaction_id = Some(transaction_id.clone());

        if let Body::Query { query, .. } = &message.body {
            self.pending.insert(
                transaction_id.clone(),
                PendingQuery {
                    transaction_id: transaction_id.clone(),
                    query: query.clone(),
                    addr,
                    owner,
                    sent_at: None,
                },
            );
        }
        self.send_queue.push_back(Outgoing { message, addr });
        transaction_id
    }

    /// Queues a response or error; these are never registered.
    pub(crate) fn enqueue_response(&mut self, message: DhtMessage, addr: SocketAddr) {
        self.send_queue.push_back(Outgoing { message, addr });
    }

    fn allocate_transaction_id(&mut self) -> TransactionId {
        let mut id = Bytes::new();
        for _ in 0..=u16::MAX {
            id = Bytes::copy_from_slice(&self.next_transaction.to_le_bytes());
            self.next_transaction = self.next_transaction.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                break;
            }
        }
        id
    }

    fn can_send(&self, now: Instant) -> bool {
        !self.send_queue.is_empty()
            && self.listener.in_flight() < self.max_in_flight
            && self
                .last_sent
                .map_or(true, |last| now.saturating_duration_since(last) >= self.send_spacing)
    }

    pub(crate) fn send_next(&mut self, now: Instant) {
        if !self.can_send(now) {
            return;
        }
        let Some(Outgoing { mut message, addr }) = self.send_queue.pop_front() else {
            return;
        };
        if message.version.is_none() {
            message.version = self.version.clone();
        }

        match message.encode() {
            Ok(data) => {
                trace!("sending {} bytes to {}", data.len(), addr);
                self.listener.send(data, addr);
            }
            Err(e) => warn!("failed to encode message for {}: {}", addr, e),
        }
        self.last_sent = Some(now);

        if let Some(transaction_id) = message.transaction_id {
            if let Some(pending) = self.pending.get_mut(&transaction_id) {
                if pending.sent_at.is_none() {
                    pending.sent_at = Some(now);
                    self.waiting.push_back(transaction_id);
                }
            }
        }
    }

    pub(crate) fn next_datagram(&self) -> Option<(Bytes, SocketAddr)> {
        self.received.pop()
    }

    /// Decodes a datagram and claims the pending query it answers, if any.
    ///
    /// A response only matches a query sent to the same address it came from.
    pub(crate) fn decode(
        &mut self,
        data: &[u8],
        addr: SocketAddr,
    ) -> Result<(DhtMessage, Option<PendingQuery>), DhtError> {
        let pending = &self.pending;
        let message = DhtMessage::decode(data, |id| {
            pending
                .get(id)
                .filter(|p| p.addr == addr)
                .map(|p| p.query.kind())
        })?;

        let claimed = match (&message.body, &message.transaction_id) {
            (Body::Query { .. }, _) | (_, None) => None,
            (_, Some(id)) => self.claim(id, addr),
        };
        Ok((message, claimed))
    }

    fn claim(&mut self, transaction_id: &TransactionId, addr: SocketAddr) -> Option<PendingQuery> {
        if self.pending.get(transaction_id)?.addr != addr {
            return None;
        }
        self.waiting.retain(|id| id != transaction_id);
        self.pending.remove(transaction_id)
    }

    /// Expires the oldest waiting query once it has outlived the timeout.
    pub(crate) fn expire_next(&mut self, now: Instant) -> Option<QueryCompletion> {
        loop {
            let transaction_id = self.waiting.front()?.clone();
            let Some(sent_at) = self.pending.get(&transaction_id).and_then(|p| p.sent_at) else {
                self.waiting.pop_front();
                continue;
            };
            if now.saturating_duration_since(sent_at) < self.query_timeout {
                return None;
            }

            self.waiting.pop_front();
            let pending = self.pending.remove(&transaction_id)?;
            trace!(
                "{} to {} timed out",
                pending.query.kind().name(),
                pending.addr
            );
            return Some(pending.complete(QueryOutcome::TimedOut));
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn queued_count(&self) -> usize {
        self.send_queue.len()
    }
}
