use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};
use tracing::warn;

use super::config::DhtConfig;
use super::driver::{parse_node_blob, Dht};
use super::error::DhtError;
use super::listener::{Listener, UdpListener};
use super::main_loop::MainLoop;
use super::node::NodeId;
use super::task::{AnnounceTask, GetPeersTask, TaskOutcome};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtState {
    NotReady,
    Initialising,
    Ready,
}

/// Notifications published by a [`DhtEngine`].
#[derive(Debug, Clone)]
pub enum DhtEvent {
    StateChanged(DhtState),
    /// Peers returned by a node during a lookup; raised once per response.
    PeersFound {
        info_hash: NodeId,
        peers: Vec<SocketAddr>,
    },
    NodeAdded(NodeId),
}

/// A Mainline DHT node ([BEP-5]).
///
/// All state lives on a single-writer [`MainLoop`]; every method here posts a
/// closure to it and awaits the result.
///
/// # Examples
///
/// ```no_run
/// use mldht::dht::{DhtEngine, NodeId};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dht = DhtEngine::udp(([0, 0, 0, 0], 6881).into(), Default::default());
/// dht.start(None).await?;
///
/// let info_hash = NodeId([0u8; 20]);
/// let peers = dht.get_peers(info_hash).await?;
/// dht.announce(info_hash, 6881).await?;
///
/// let saved = dht.save_nodes().await?;
/// # Ok(())
/// # }
/// ```
///
/// [BEP-5]: http://bittorrent.org/beps/bep_0005.html
pub struct DhtEngine {
    main_loop: MainLoop<Dht>,
    events: broadcast::Sender<DhtEvent>,
    local_id: NodeId,
    config: DhtConfig,
}

impl DhtEngine {
    /// Creates an engine over `listener`. Must be called within a tokio
    /// runtime; nothing is sent until [`start`](Self::start).
    pub fn new(listener: Arc<dyn Listener>, config: DhtConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let dht = Dht::new(config.clone(), listener, events.clone());
        let local_id = dht.local_id();
        Self {
            main_loop: MainLoop::spawn(dht),
            events,
            local_id,
            config,
        }
    }

    /// Creates an engine on a UDP socket bound to `bind_addr` at start.
    pub fn udp(bind_addr: SocketAddr, config: DhtConfig) -> Self {
        Self::new(Arc::new(UdpListener::new(bind_addr)), config)
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DhtEvent> {
        self.events.subscribe()
    }

    /// Starts listening and bootstraps, from `saved_nodes` (a blob from
    /// [`save_nodes`](Self::save_nodes)) when given, otherwise from the
    /// configured routers.
    pub async fn start(&self, saved_nodes: Option<&[u8]>) -> Result<(), DhtError> {
        let nodes = match saved_nodes {
            Some(blob) => parse_node_blob(blob)?,
            None => Vec::new(),
        };
        let routers = resolve_routers(&self.config.bootstrap_routers).await;

        let first = self
            .main_loop
            .queue_wait(move |dht| {
                dht.bootstrap_addrs = routers;
                let now = Instant::now();
                let first = dht.start(nodes, now);
                dht.run_task_events(now);
                first
            })
            .await??;

        if first {
            self.main_loop.queue_timeout(self.config.tick_interval, |dht| {
                dht.tick(Instant::now());
                !dht.is_disposed()
            });
            self.main_loop
                .queue_timeout(self.config.maintenance_interval, |dht| {
                    dht.maintain(Instant::now());
                    !dht.is_disposed()
                });
        }
        Ok(())
    }

    /// Stops the listener; the routing table is kept for a later `start`.
    pub async fn stop(&self) -> Result<(), DhtError> {
        self.main_loop
            .queue_wait(|dht| {
                dht.check_disposed()?;
                dht.stop();
                Ok(())
            })
            .await?
    }

    /// Pings every node of a saved-nodes blob; those that answer join the
    /// routing table.
    pub async fn add(&self, nodes: &[u8]) -> Result<(), DhtError> {
        let nodes = parse_node_blob(nodes)?;
        self.main_loop
            .queue_wait(move |dht| {
                dht.check_disposed()?;
                let now = Instant::now();
                for node in nodes {
                    dht.ping_node(node, now);
                }
                dht.run_task_events(now);
                Ok(())
            })
            .await?
    }

    /// Runs a full lookup and returns every peer found for `info_hash`.
    pub async fn get_peers(&self, info_hash: NodeId) -> Result<Vec<SocketAddr>, DhtError> {
        match self.run_task(move || Box::new(GetPeersTask::new(info_hash))).await? {
            TaskOutcome::Lookup { peers, .. } => Ok(peers),
            _ => Ok(Vec::new()),
        }
    }

    /// Announces that we serve `info_hash` on `port` to the nodes nearest it.
    /// Returns how many nodes accepted the announce.
    pub async fn announce(&self, info_hash: NodeId, port: u16) -> Result<usize, DhtError> {
        match self.run_task(move || Box::new(AnnounceTask::new(info_hash, port))).await? {
            TaskOutcome::Announced { nodes, .. } => Ok(nodes),
            _ => Ok(0),
        }
    }

    async fn run_task<F>(&self, make: F) -> Result<TaskOutcome, DhtError>
    where
        F: FnOnce() -> Box<dyn super::task::Task> + Send + 'static,
    {
        let rx: oneshot::Receiver<TaskOutcome> = self
            .main_loop
            .queue_wait(move |dht| {
                dht.check_disposed()?;
                let now = Instant::now();
                let rx = dht.spawn_task_waiting(make(), now);
                dht.run_task_events(now);
                Ok::<_, DhtError>(rx)
            })
            .await??;
        rx.await.map_err(|_| DhtError::Disposed)
    }

    pub async fn save_nodes(&self) -> Result<Bytes, DhtError> {
        self.main_loop
            .queue_wait(|dht| {
                dht.check_disposed()?;
                Ok(dht.save_nodes())
            })
            .await?
    }

    pub async fn state(&self) -> Result<DhtState, DhtError> {
        self.main_loop.queue_wait(|dht| dht.state()).await
    }

    pub async fn node_count(&self) -> Result<usize, DhtError> {
        self.main_loop
            .queue_wait(|dht| dht.routing_table.node_count())
            .await
    }

    /// Stops the engine for good; later calls fail with
    /// [`DhtError::Disposed`] and running lookups are abandoned.
    pub async fn dispose(&self) -> Result<(), DhtError> {
        self.main_loop.clear_timeouts();
        self.main_loop.queue_wait(Dht::dispose).await
    }
}

impl Drop for DhtEngine {
    fn drop(&mut self) {
        let _ = self.main_loop.queue(Dht::dispose);
    }
}

async fn resolve_routers(routers: &[String]) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    for router in routers {
        match tokio::net::lookup_host(router.as_str()).await {
            Ok(resolved) => addrs.extend(resolved.filter(SocketAddr::is_ipv4)),
            Err(e) => warn!("failed to resolve bootstrap router {}: {}", router, e),
        }
    }
    addrs
}
