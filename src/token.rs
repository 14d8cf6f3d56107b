//! Write tokens handed out with `findValue` responses and required by `store`.

use crate::{bits::Bitmap, stop::StopGroup};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::time::{self, Instant};

const SECRET_LEN: usize = 64;

type Secret = [u8; SECRET_LEN];

/// Issues tokens bound to a node id and address. A token stays valid until the secret it was
/// made with is rotated out, i.e. for one to two rotation intervals.
pub(crate) struct TokenManager {
    secrets: Arc<RwLock<Secrets>>,
    stop: StopGroup,
}

struct Secrets {
    current: Secret,
    prev: Secret,
}

impl Secrets {
    fn rotate(&mut self) {
        self.prev = self.current;
        self.current = random_secret();
    }
}

impl TokenManager {
    pub fn new() -> Self {
        Self {
            secrets: Arc::new(RwLock::new(Secrets {
                current: random_secret(),
                prev: random_secret(),
            })),
            stop: StopGroup::new(),
        }
    }

    /// Draws fresh secrets and starts rotating them every `interval`.
    pub fn start(&self, interval: Duration) {
        {
            let mut secrets = self.secrets.write();
            secrets.current = random_secret();
            secrets.prev = random_secret();
        }

        let secrets = self.secrets.clone();
        self.stop.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                secrets.write().rotate();
            }
        });
    }

    pub async fn stop(&self) {
        self.stop.stop_and_wait().await;
    }

    pub fn get(&self, node_id: &Bitmap, addr: &SocketAddr) -> Vec<u8> {
        token(node_id, addr, &self.secrets.read().current)
    }

    pub fn verify(&self, token: &[u8], node_id: &Bitmap, addr: &SocketAddr) -> bool {
        let secrets = self.secrets.read();
        token == &self::token(node_id, addr, &secrets.current)[..]
            || token == &self::token(node_id, addr, &secrets.prev)[..]
    }

    #[cfg(test)]
    pub(crate) fn rotate(&self) {
        self.secrets.write().rotate();
    }
}

fn token(node_id: &Bitmap, addr: &SocketAddr, secret: &Secret) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(node_id);

    match addr.ip() {
        IpAddr::V4(ip) => hasher.update(ip.octets()),
        IpAddr::V6(ip) => hasher.update(ip.octets()),
    }

    hasher.update(addr.port().to_string());
    hasher.update(secret);
    hasher.finalize().to_vec()
}

fn random_secret() -> Secret {
    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn positive_verify_within_two_rotations() {
        let tokens = TokenManager::new();
        let id = Bitmap::rand();
        let addr = (Ipv4Addr::new(1, 2, 3, 4), 4444).into();

        let token = tokens.get(&id, &addr);
        assert_eq!(token.len(), 32);
        assert!(tokens.verify(&token, &id, &addr));

        tokens.rotate();
        assert!(tokens.verify(&token, &id, &addr));

        tokens.rotate();
        assert!(!tokens.verify(&token, &id, &addr));
    }

    #[test]
    fn negative_verify_other_sender() {
        let tokens = TokenManager::new();
        let id = Bitmap::rand();
        let addr: SocketAddr = (Ipv4Addr::new(1, 2, 3, 4), 4444).into();
        let token = tokens.get(&id, &addr);

        assert!(!tokens.verify(&token, &Bitmap::rand(), &addr));
        assert!(!tokens.verify(&token, &id, &(Ipv4Addr::new(1, 2, 3, 5), 4444).into()));
        assert!(!tokens.verify(&token, &id, &(Ipv4Addr::new(1, 2, 3, 4), 4445).into()));
        assert!(!tokens.verify(b"", &id, &addr));
    }

    #[tokio::test]
    async fn positive_ticker_rotates() {
        let tokens = TokenManager::new();
        let id = Bitmap::rand();
        let addr = (Ipv4Addr::LOCALHOST, 4444).into();

        tokens.start(Duration::from_millis(10));
        let token = tokens.get(&id, &addr);

        time::sleep(Duration::from_millis(100)).await;
        assert!(!tokens.verify(&token, &id, &addr));

        tokens.stop().await;
    }
}
