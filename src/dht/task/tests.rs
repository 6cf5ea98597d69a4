use super::*;
use crate::bencode::{encode, Value};
use crate::dht::engine::DhtState;
use crate::dht::message::{Body, DhtMessage, Query, Response};
use crate::dht::node::{compact_peer, encode_compact_nodes};
use crate::dht::tests::{addr, id_with_prefix, test_dht, TestListener};
use crate::dht::{DhtConfig, DhtEngine, UdpListener};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Drives a [`Dht`] over a [`TestListener`] with a manual clock.
struct Harness {
    dht: Dht,
    listener: Arc<TestListener>,
    now: Instant,
}

/// A query the engine put on the wire.
struct Sent {
    to: SocketAddr,
    transaction_id: Bytes,
    query: Query,
}

impl Harness {
    fn new(local_id: NodeId) -> Self {
        let (mut dht, listener) = test_dht(local_id);
        let now = Instant::now();
        dht.message_loop.start().unwrap();
        Self { dht, listener, now }
    }

    fn tick(&mut self) {
        self.now += Duration::from_millis(10);
        self.dht.tick(self.now);
    }

    /// Ticks until the outgoing queue is empty, then returns the queries sent.
    fn flush(&mut self) -> Vec<Sent> {
        while self.dht.message_loop.queued_count() > 0 {
            self.tick();
        }
        self.listener
            .take_sent()
            .into_iter()
            .filter_map(|(data, to)| {
                let msg = DhtMessage::decode(&data, |_| None).ok()?;
                match msg.body {
                    Body::Query { query, .. } => Some(Sent {
                        to,
                        transaction_id: msg.transaction_id?,
                        query,
                    }),
                    _ => None,
                }
            })
            .collect()
    }

    /// Lets every query on the wire reach its deadline, then returns what
    /// was sent in reaction (retries, follow-up queries).
    fn time_out(&mut self) -> Vec<Sent> {
        self.now += self.dht.config.query_timeout + Duration::from_secs(1);
        // one expiry per tick
        for _ in 0..self.dht.message_loop.pending_count() {
            self.tick();
        }
        self.flush()
    }

    fn reply(&mut self, sent: &Sent, from: NodeId, response: Response) {
        let msg = DhtMessage::response(sent.transaction_id.clone(), from, response);
        self.listener.inject(msg.encode().unwrap(), sent.to);
        self.tick();
    }

    fn add_node(&mut self, id: NodeId, addr: SocketAddr) -> Node {
        let node = Node::new(id, addr);
        self.dht.routing_table.insert(node.clone(), self.now);
        node
    }
}

fn peer_values(peers: &[SocketAddr]) -> Vec<Bytes> {
    peers
        .iter()
        .filter_map(compact_peer)
        .map(|c| Bytes::copy_from_slice(&c))
        .collect()
}

#[test]
fn test_send_query_retries_then_fails_node() {
    let mut h = Harness::new(id_with_prefix(0x55, 0));
    let node = h.add_node(id_with_prefix(1, 0), addr(1, 6881));

    let task = SendQueryTask::new(DhtMessage::ping(h.dht.local_id()), node.clone(), 3);
    let mut rx = h.dht.spawn_task_waiting(Box::new(task), h.now);

    let first = h.flush();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].to, node.addr());

    let second = h.time_out();
    let third = h.time_out();
    assert_eq!(second.len(), 1);
    assert_eq!(third.len(), 1);
    assert_eq!(second[0].transaction_id, first[0].transaction_id);
    assert!(rx.try_recv().is_err());

    assert!(h.time_out().is_empty());
    match rx.try_recv() {
        Ok(TaskOutcome::Query {
            outcome: QueryOutcome::TimedOut,
            ..
        }) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }
    let stored = h.dht.routing_table.find_node(&node.id()).unwrap();
    assert_eq!(stored.failed_count(), 1);
    assert_eq!(h.dht.tasks.len(), 0);
}

#[test]
fn test_send_query_response_marks_node_seen() {
    let mut h = Harness::new(id_with_prefix(0x55, 0));
    let node = h.add_node(id_with_prefix(1, 0), addr(1, 6881));

    let task = SendQueryTask::new(DhtMessage::ping(h.dht.local_id()), node.clone(), 3);
    let mut rx = h.dht.spawn_task_waiting(Box::new(task), h.now);
    let sent = h.flush();
    h.reply(&sent[0], node.id(), Response::Ping);

    match rx.try_recv() {
        Ok(TaskOutcome::Query {
            outcome: QueryOutcome::Response { id, .. },
            ..
        }) => assert_eq!(id, node.id()),
        other => panic!("unexpected outcome: {:?}", other),
    }
    let stored = h.dht.routing_table.find_node(&node.id()).unwrap();
    assert!(stored.last_seen().is_some());
    assert_eq!(h.dht.message_loop.pending_count(), 0);
}

#[test]
fn test_response_from_wrong_address_is_ignored() {
    let mut h = Harness::new(id_with_prefix(0x55, 0));
    let node = h.add_node(id_with_prefix(1, 0), addr(1, 6881));

    let task = SendQueryTask::new(DhtMessage::ping(h.dht.local_id()), node.clone(), 3);
    let mut rx = h.dht.spawn_task_waiting(Box::new(task), h.now);
    let mut sent = h.flush();
    sent[0].to = addr(2, 6881);
    h.reply(&sent[0], node.id(), Response::Ping);

    assert!(rx.try_recv().is_err());
    assert_eq!(h.dht.message_loop.pending_count(), 1);
}

#[test]
fn test_error_reply_completes_query() {
    let mut h = Harness::new(id_with_prefix(0x55, 0));
    let node = h.add_node(id_with_prefix(1, 0), addr(1, 6881));

    let task = SendQueryTask::new(DhtMessage::ping(h.dht.local_id()), node.clone(), 3);
    let mut rx = h.dht.spawn_task_waiting(Box::new(task), h.now);
    let sent = h.flush();
    let error = DhtMessage::error(
        sent[0].transaction_id.clone(),
        crate::dht::ErrorCode::Server,
        "busy",
    );
    h.listener.inject(error.encode().unwrap(), sent[0].to);
    h.tick();

    match rx.try_recv() {
        Ok(TaskOutcome::Query {
            outcome: QueryOutcome::Error { code, message },
            ..
        }) => {
            assert_eq!(code, 202);
            assert_eq!(message, "busy");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_transaction_ids_are_sequential() {
    let mut h = Harness::new(id_with_prefix(0x55, 0));
    let local = h.dht.local_id();
    for i in 1..=3u8 {
        h.dht
            .message_loop
            .enqueue_query(DhtMessage::ping(local), addr(i, 6881), None);
    }
    let sent = h.flush();
    let ids: Vec<&[u8]> = sent.iter().map(|s| s.transaction_id.as_ref()).collect();
    assert_eq!(ids, vec![&[0u8, 0][..], &[1, 0][..], &[2, 0][..]]);
}

#[test]
fn test_get_peers_converges() {
    let mut h = Harness::new(id_with_prefix(0x55, 0));
    let info_hash = id_with_prefix(0x10, 0x10);
    let a = h.add_node(id_with_prefix(0x11, 0), addr(1, 6881));
    let b = h.add_node(id_with_prefix(0x12, 0), addr(2, 6881));
    let c = Node::new(id_with_prefix(0x10, 0x11), addr(3, 6881));

    let mut rx = h
        .dht
        .spawn_task_waiting(Box::new(GetPeersTask::new(info_hash)), h.now);
    let sent = h.flush();
    assert_eq!(sent.len(), 2);
    assert!(sent
        .iter()
        .all(|s| matches!(s.query, Query::GetPeers { info_hash: hash } if hash == info_hash)));

    for s in &sent {
        if s.to == a.addr() {
            h.reply(
                s,
                a.id(),
                Response::GetPeers {
                    token: Some(Bytes::from_static(b"token-a")),
                    values: Some(peer_values(&[addr(100, 1000)])),
                    nodes: None,
                },
            );
        } else {
            // b points back at a, already queried, and at c, which is new
            h.reply(
                s,
                b.id(),
                Response::GetPeers {
                    token: Some(Bytes::from_static(b"token-b")),
                    values: None,
                    nodes: Some(encode_compact_nodes([&a, &c])),
                },
            );
        }
    }

    let sent = h.flush();
    let to_c: Vec<&Sent> = sent
        .iter()
        .filter(|s| s.to == c.addr() && matches!(s.query, Query::GetPeers { .. }))
        .collect();
    assert_eq!(to_c.len(), 1);
    h.reply(
        to_c[0],
        c.id(),
        Response::GetPeers {
            token: Some(Bytes::from_static(b"token-c")),
            values: Some(peer_values(&[addr(100, 1000), addr(101, 1001)])),
            nodes: None,
        },
    );

    match rx.try_recv() {
        Ok(TaskOutcome::Lookup {
            closest, peers, ..
        }) => {
            assert_eq!(peers, vec![addr(100, 1000), addr(101, 1001)]);
            assert_eq!(closest.len(), 3);
            assert_eq!(closest[0].id(), c.id());
            assert_eq!(
                closest[0].token().map(|t| t.as_ref()),
                Some(&b"token-c"[..])
            );
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_get_peers_values_reply_ends_branch() {
    let mut h = Harness::new(id_with_prefix(0x55, 0));
    let info_hash = id_with_prefix(0x10, 0x10);
    let a = h.add_node(id_with_prefix(0x11, 0), addr(1, 6881));
    let c = Node::new(id_with_prefix(0x10, 0x11), addr(3, 6881));

    let mut rx = h
        .dht
        .spawn_task_waiting(Box::new(GetPeersTask::new(info_hash)), h.now);
    let sent = h.flush();
    assert_eq!(sent.len(), 1);
    h.reply(
        &sent[0],
        a.id(),
        Response::GetPeers {
            token: Some(Bytes::from_static(b"token-a")),
            values: Some(peer_values(&[addr(100, 1000)])),
            nodes: Some(encode_compact_nodes([&c])),
        },
    );

    let sent = h.flush();
    assert!(!sent
        .iter()
        .any(|s| s.to == c.addr() && matches!(s.query, Query::GetPeers { .. })));
    match rx.try_recv() {
        Ok(TaskOutcome::Lookup { peers, .. }) => assert_eq!(peers, vec![addr(100, 1000)]),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_get_peers_with_empty_table_completes() {
    let mut h = Harness::new(id_with_prefix(0x55, 0));
    let mut rx = h
        .dht
        .spawn_task_waiting(Box::new(GetPeersTask::new(id_with_prefix(1, 1))), h.now);
    match rx.try_recv() {
        Ok(TaskOutcome::Lookup { closest, peers, .. }) => {
            assert!(closest.is_empty());
            assert!(peers.is_empty());
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_announce_uses_tokens() {
    let mut h = Harness::new(id_with_prefix(0x55, 0));
    let info_hash = id_with_prefix(0x20, 0);
    let a = h.add_node(id_with_prefix(0x21, 0), addr(1, 6881));
    let b = h.add_node(id_with_prefix(0x22, 0), addr(2, 6881));

    let mut rx = h
        .dht
        .spawn_task_waiting(Box::new(AnnounceTask::new(info_hash, 7000)), h.now);
    let lookups = h.flush();
    assert_eq!(lookups.len(), 2);
    for s in &lookups {
        let (id, token) = if s.to == a.addr() {
            (a.id(), "ta")
        } else {
            (b.id(), "tb")
        };
        h.reply(
            s,
            id,
            Response::GetPeers {
                token: Some(Bytes::from(token)),
                values: None,
                nodes: Some(Bytes::new()),
            },
        );
    }

    let announces = h.flush();
    assert_eq!(announces.len(), 2);
    for s in &announces {
        match &s.query {
            Query::AnnouncePeer {
                info_hash: hash,
                port,
                token,
                ..
            } => {
                assert_eq!(*hash, info_hash);
                assert_eq!(*port, 7000);
                let expected: &[u8] = if s.to == a.addr() { b"ta" } else { b"tb" };
                assert_eq!(token.as_ref(), expected);
            }
            other => panic!("unexpected query: {:?}", other),
        }
    }

    h.reply(&announces[0], id_for(&announces[0], &a, &b), Response::AnnouncePeer);
    assert!(rx.try_recv().is_err());
    h.reply(&announces[1], id_for(&announces[1], &a, &b), Response::AnnouncePeer);

    match rx.try_recv() {
        Ok(TaskOutcome::Announced { nodes, .. }) => assert_eq!(nodes, 2),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

fn id_for(sent: &Sent, a: &Node, b: &Node) -> NodeId {
    if sent.to == a.addr() {
        a.id()
    } else {
        b.id()
    }
}

#[test]
fn test_initialise_from_router() {
    let local = id_with_prefix(0x55, 0);
    let mut h = Harness::new(local);
    let router = addr(200, 6881);
    h.dht.bootstrap_addrs = vec![router];
    let found = [
        Node::new(id_with_prefix(0x50, 0), addr(1, 6881)),
        Node::new(id_with_prefix(0x51, 0), addr(2, 6881)),
    ];

    assert!(h.dht.start(Vec::new(), h.now).unwrap());
    assert_eq!(h.dht.state(), DhtState::Initialising);

    let sent = h.flush();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, router);
    assert!(matches!(sent[0].query, Query::FindNode { target } if target == local));
    h.reply(
        &sent[0],
        id_with_prefix(0xEE, 0),
        Response::FindNode {
            nodes: encode_compact_nodes(&found),
        },
    );

    // find_node from the bootstrap plus a ping from the response handler
    let mut rounds = 0;
    while h.dht.state() != DhtState::Ready {
        rounds += 1;
        assert!(rounds < 10, "bootstrap did not finish");
        for s in h.flush() {
            let from = found.iter().find(|n| n.addr() == s.to).unwrap();
            let response = match s.query {
                Query::Ping => Response::Ping,
                _ => Response::FindNode { nodes: Bytes::new() },
            };
            h.reply(&s, from.id(), response);
        }
    }

    assert_eq!(h.dht.routing_table.node_count(), 3);
    assert!(h.dht.routing_table.find_node(&found[0].id()).is_some());
}

#[test]
fn test_initialise_falls_back_to_routers() {
    let local = id_with_prefix(0x55, 0);
    let mut h = Harness::new(local);
    let router = addr(200, 6881);
    h.dht.bootstrap_addrs = vec![router];
    let saved = Node::new(id_with_prefix(0x50, 0), addr(1, 6881));

    h.dht.start(vec![saved.clone()], h.now).unwrap();
    let sent = h.flush();
    assert!(sent.iter().all(|s| s.to == saved.addr()));
    assert_eq!(sent.len(), 2);

    // saved node never answers; too few nodes, so the routers are tried
    let mut to_router = Vec::new();
    for _ in 0..3 {
        to_router.extend(h.time_out().into_iter().filter(|s| s.to == router));
    }
    assert_eq!(to_router.len(), 1);
    assert_eq!(h.dht.state(), DhtState::Initialising);
}

#[test]
fn test_replace_silent_node() {
    let mut h = Harness::new(NodeId::MIN);
    for i in 0..8u8 {
        h.add_node(id_with_prefix(0x80 + i, 0), addr(i, 6881));
    }
    let oldest = id_with_prefix(0x80, 0);
    let candidate = Node::new(id_with_prefix(0x90, 0), addr(50, 6881));

    h.dht.insert_node(candidate.clone(), h.now);
    assert!(h.dht.routing_table.find_node(&candidate.id()).is_none());
    // a second candidate for the same bucket does not start another probe
    h.dht
        .insert_node(Node::new(id_with_prefix(0x91, 0), addr(51, 6881)), h.now);
    assert_eq!(h.dht.tasks.len(), 2);

    let sent = h.flush();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, addr(0, 6881));
    assert!(matches!(sent[0].query, Query::Ping));

    h.time_out();
    h.time_out();
    h.time_out();

    assert!(h.dht.routing_table.find_node(&oldest).is_none());
    assert!(h
        .dht
        .routing_table
        .find_node(&id_with_prefix(0x91, 0))
        .is_some());
    assert_eq!(h.dht.tasks.len(), 0);
}

#[test]
fn test_replace_keeps_responsive_node() {
    let mut h = Harness::new(NodeId::MIN);
    for i in 0..8u8 {
        h.add_node(id_with_prefix(0x80 + i, 0), addr(i, 6881));
    }
    let oldest = id_with_prefix(0x80, 0);
    let candidate = Node::new(id_with_prefix(0x90, 0), addr(50, 6881));

    h.dht.insert_node(candidate.clone(), h.now);
    let sent = h.flush();
    h.reply(&sent[0], oldest, Response::Ping);

    assert!(h.dht.routing_table.find_node(&oldest).is_some());
    assert!(h.dht.routing_table.find_node(&candidate.id()).is_none());
    assert_eq!(h.dht.tasks.len(), 0);
}

#[test]
fn test_refresh_queries_stale_bucket() {
    let mut h = Harness::new(id_with_prefix(0x55, 0));
    let node = h.add_node(id_with_prefix(0x11, 0), addr(1, 6881));

    h.now += h.dht.config.bucket_refresh_interval + Duration::from_secs(1);
    h.dht.maintain(h.now);

    let sent = h.flush();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, node.addr());
    assert!(matches!(sent[0].query, Query::FindNode { .. }));

    // refreshed buckets are left alone until they go quiet again
    h.dht.maintain(h.now);
    assert!(h.flush().is_empty());
}

#[test]
fn test_closest_set() {
    let target = NodeId::MIN;
    let mut set = ClosestSet::new(target, 2);
    assert!(set.admit(id_with_prefix(4, 0)));
    assert!(!set.admit(id_with_prefix(4, 0)));
    assert!(set.admit(id_with_prefix(8, 0)));
    assert!(!set.admit(id_with_prefix(9, 0)));
    assert!(set.admit(id_with_prefix(1, 0)));
    assert_eq!(set.len(), 2);

    let ids: Vec<NodeId> = set.ids().copied().collect();
    assert_eq!(ids, vec![id_with_prefix(1, 0), id_with_prefix(4, 0)]);
}

fn loopback_config() -> DhtConfig {
    DhtConfig {
        bootstrap_routers: Vec::new(),
        ..DhtConfig::default()
    }
}

async fn wait_for_nodes(engine: &DhtEngine, count: usize) {
    for _ in 0..200 {
        if engine.node_count().await.unwrap() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("engine never learned {} nodes", count);
}

#[tokio::test]
async fn test_engines_announce_and_find_over_udp() {
    let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener_a = Arc::new(UdpListener::new(local));
    let listener_b = Arc::new(UdpListener::new(local));
    let a = DhtEngine::new(listener_a.clone(), loopback_config());
    let b = DhtEngine::new(listener_b.clone(), loopback_config());

    let mut events = a.subscribe();
    a.start(None).await.unwrap();
    b.start(None).await.unwrap();
    assert_eq!(a.state().await.unwrap(), DhtState::Ready);

    let addr_a = listener_a.local_addr().unwrap();
    let blob = encode(&Value::List(vec![Value::from(
        &Node::new(a.local_id(), addr_a).to_compact().unwrap()[..],
    )]));
    b.add(&blob).await.unwrap();

    wait_for_nodes(&a, 1).await;
    wait_for_nodes(&b, 1).await;

    let info_hash = NodeId::generate();
    assert_eq!(a.announce(info_hash, 7000).await.unwrap(), 1);

    let peers = a.get_peers(info_hash).await.unwrap();
    assert_eq!(peers, vec!["127.0.0.1:7000".parse::<SocketAddr>().unwrap()]);

    let mut saw_state = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, crate::dht::DhtEvent::StateChanged(DhtState::Ready)) {
            saw_state = true;
        }
    }
    assert!(saw_state);

    let saved = b.save_nodes().await.unwrap();
    assert_eq!(saved, blob);

    b.dispose().await.unwrap();
    assert!(matches!(
        b.get_peers(info_hash).await,
        Err(crate::dht::DhtError::Disposed)
    ));
}
