use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::error::DhtError;

const MAX_DATAGRAM: usize = 65_535;

/// Datagrams received by a [`Listener`] and not yet processed by the engine.
pub type ReceiveQueue = SegQueue<(Bytes, SocketAddr)>;

/// Datagram transport beneath the engine.
///
/// `send` never blocks and never fails: transport errors are logged by the
/// implementation and surface to the engine as query timeouts.
pub trait Listener: Send + Sync + 'static {
    /// Starts delivering inbound datagrams into `queue`.
    fn start(&self, queue: Arc<ReceiveQueue>) -> Result<(), DhtError>;

    fn stop(&self);

    fn send(&self, data: Bytes, addr: SocketAddr);

    fn is_listening(&self) -> bool;

    /// Datagrams handed to `send` that have not reached the wire yet.
    fn in_flight(&self) -> usize {
        0
    }
}

struct Running {
    local_addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    tasks: [JoinHandle<()>; 2],
}

/// [`Listener`] over a tokio UDP socket, with one receive and one send task.
///
/// `start` must be called from within a tokio runtime.
pub struct UdpListener {
    bind_addr: SocketAddr,
    running: Mutex<Option<Running>>,
    in_flight: Arc<AtomicUsize>,
}

impl UdpListener {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            running: Mutex::new(None),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The bound address while listening; resolves port 0 to the real port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }
}

impl Listener for UdpListener {
    fn start(&self, queue: Arc<ReceiveQueue>) -> Result<(), DhtError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let std_socket = std::net::UdpSocket::bind(self.bind_addr)?;
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local_addr = socket.local_addr()?;
        info!("DHT listener bound to {}", local_addr);

        let recv_socket = Arc::clone(&socket);
        let receiver = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, addr)) => {
                        trace!("received {} bytes from {}", len, addr);
                        queue.push((Bytes::copy_from_slice(&buf[..len]), addr));
                    }
                    Err(e) => debug!("DHT receive error: {}", e),
                }
            }
        });

        let (outgoing, mut rx) = mpsc::unbounded_channel::<(Bytes, SocketAddr)>();
        let in_flight = Arc::clone(&self.in_flight);
        let sender = tokio::spawn(async move {
            while let Some((data, addr)) = rx.recv().await {
                if let Err(e) = socket.send_to(&data, addr).await {
                    debug!("DHT send to {} failed: {}", addr, e);
                }
                release(&in_flight);
            }
        });

        *running = Some(Running {
            local_addr,
            outgoing,
            tasks: [receiver, sender],
        });
        Ok(())
    }

    fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            for task in &running.tasks {
                task.abort();
            }
            self.in_flight.store(0, Ordering::Release);
            info!("DHT listener on {} stopped", running.local_addr);
        }
    }

    fn send(&self, data: Bytes, addr: SocketAddr) {
        let running = self.running.lock();
        let Some(running) = running.as_ref() else {
            trace!("dropping datagram to {}: listener stopped", addr);
            return;
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if running.outgoing.send((data, addr)).is_err() {
            release(&self.in_flight);
        }
    }

    fn is_listening(&self) -> bool {
        self.running.lock().is_some()
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

fn release(in_flight: &AtomicUsize) {
    let _ = in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.stop();
    }
}
