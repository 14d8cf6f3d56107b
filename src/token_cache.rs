use crate::{
    bits::Bitmap,
    contact::Contact,
    message::Request,
    node::{Node, SendOptions},
    stop::StopGroup,
};
use parking_lot::RwLock;
use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;

struct Entry {
    token: Vec<u8>,
    received_at: Instant,
}

/// Store tokens handed out by remote nodes, so announcing several hashes to the same node
/// costs one `findValue` per expiration period.
pub(crate) struct TokenCache {
    tokens: RwLock<HashMap<Contact, Entry>>,
    expiration: Duration,
}

impl TokenCache {
    pub fn new(expiration: Duration) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            expiration,
        }
    }

    /// Token for storing at `contact`. Asks the contact for a fresh one if the cached one
    /// is missing or expired. Empty if the contact did not answer or `stop` fired first.
    pub async fn get(
        &self,
        node: &Node,
        contact: Contact,
        hash: Bitmap,
        stop: &StopGroup,
    ) -> Vec<u8> {
        if let Some(entry) = self.tokens.read().get(&contact) {
            if entry.received_at.elapsed() < self.expiration {
                return entry.token.clone();
            }
        }

        let response = tokio::select! {
            response = node.send(contact, Request::find_value(hash), SendOptions::default()) => {
                response
            }
            _ = stop.stopped() => return Vec::new(),
        };

        let token = match response.as_ref().and_then(|response| response.token()) {
            Some(token) => token.to_vec(),
            None => return Vec::new(),
        };

        self.insert(contact, token.clone());
        token
    }

    /// Expired entries go whenever a new one comes in.
    fn insert(&self, contact: Contact, token: Vec<u8>) {
        let now = Instant::now();
        let mut tokens = self.tokens.write();

        tokens.retain(|_, entry| {
            now.saturating_duration_since(entry.received_at) < self.expiration
        });
        tokens.insert(
            contact,
            Entry {
                token,
                received_at: now,
            },
        );
    }
}
