use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::trace;

use super::node::address_key;

const SECRET_LEN: usize = 10;

/// Issues and checks the opaque tokens that gate `announce_peer`.
///
/// A token is `SHA1(address ‖ secret)`. The secret rotates lazily, at most
/// once per rotation period, and the previous secret stays valid, so a token
/// is honoured for between one and two periods. After two idle periods both
/// secrets are replaced.
#[derive(Debug)]
pub struct TokenManager {
    current: [u8; SECRET_LEN],
    previous: [u8; SECRET_LEN],
    last_rotation: Option<Instant>,
    rotation: Duration,
}

impl TokenManager {
    pub fn new(rotation: Duration) -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
            last_rotation: None,
            rotation,
        }
    }

    pub fn generate_token(&mut self, addr: &SocketAddr, now: Instant) -> Bytes {
        self.rotate_if_due(now);
        token_for(addr, &self.current)
    }

    pub fn verify_token(&mut self, addr: &SocketAddr, token: &[u8], now: Instant) -> bool {
        self.rotate_if_due(now);
        token_for(addr, &self.current) == token || token_for(addr, &self.previous) == token
    }

    fn rotate_if_due(&mut self, now: Instant) {
        let idle = self.last_rotation.map(|at| now.saturating_duration_since(at));
        match idle {
            Some(idle) if idle <= self.rotation => {}
            // both secrets are stale after two quiet periods
            Some(idle) if idle > self.rotation * 2 => {
                self.previous = rand::random();
                self.current = rand::random();
                self.last_rotation = Some(now);
                trace!("token secrets replaced after {:?} idle", idle);
            }
            _ => {
                self.previous = self.current;
                self.current = rand::random();
                self.last_rotation = Some(now);
                trace!("token secret rotated");
            }
        }
    }
}

fn token_for(addr: &SocketAddr, secret: &[u8; SECRET_LEN]) -> Bytes {
    let mut hasher = Sha1::new();
    hasher.update(address_key(addr));
    hasher.update(secret);
    Bytes::copy_from_slice(&hasher.finalize())
}
