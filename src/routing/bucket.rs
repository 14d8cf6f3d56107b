use super::peer::Peer;
use crate::{bits::Range, contact::Contact, BUCKET_SIZE, MAX_PEER_FAILS};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Peers whose distance from the local id falls within `range`, least recently seen first.
pub(crate) struct Bucket {
    pub range: Range,
    state: Mutex<BucketState>,
}

#[derive(Default)]
struct BucketState {
    peers: Vec<Peer>,
    last_update: Option<Instant>,
}

impl Bucket {
    pub fn new(range: Range) -> Self {
        Self {
            range,
            state: Mutex::new(BucketState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= BUCKET_SIZE
    }

    pub fn has(&self, contact: &Contact) -> bool {
        self.state
            .lock()
            .peers
            .iter()
            .any(|peer| peer.contact.id == contact.id)
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.state
            .lock()
            .peers
            .iter()
            .map(|peer| peer.contact)
            .collect()
    }

    /// Touches the peer and moves it to the back if present. Otherwise, when `insert_if_new`,
    /// appends it, evicting the first bad peer if the bucket is full.
    ///
    /// Returns `false` if the peer was new but found no room.
    pub fn update_peer(&self, peer: Peer, insert_if_new: bool) -> bool {
        debug_assert!(self.range.contains(&peer.distance));

        let mut state = self.state.lock();

        if let Some(index) = state
            .peers
            .iter()
            .position(|p| p.contact.id == peer.contact.id)
        {
            let mut existing = state.peers.remove(index);
            existing.contact = peer.contact;
            existing.touch();
            state.peers.push(existing);
            state.last_update = Some(Instant::now());
            return true;
        }

        if !insert_if_new {
            return true;
        }

        if state.peers.len() >= BUCKET_SIZE {
            match state.peers.iter().position(|p| p.is_bad(MAX_PEER_FAILS)) {
                Some(index) => {
                    state.peers.remove(index);
                }
                None => return false,
            }
        }

        state.peers.push(peer);
        state.last_update = Some(Instant::now());

        true
    }

    pub fn fail_contact(&self, contact: &Contact) {
        let mut state = self.state.lock();
        if let Some(peer) = state
            .peers
            .iter_mut()
            .find(|peer| peer.contact.id == contact.id)
        {
            peer.fail();
        }
    }

    /// A bucket never updated always needs a refresh.
    pub fn needs_refresh(&self, interval: Duration) -> bool {
        self.state
            .lock()
            .last_update
            .map(|last_update| last_update.elapsed() > interval)
            .unwrap_or(true)
    }

    /// Splits the bucket in two halves and distributes its peers among them. If that leaves
    /// one half empty, the other half is split again and its outer piece stretched back to
    /// this bucket's boundary.
    pub fn split(self) -> (Bucket, Bucket) {
        let range = self.range;
        let state = self.state.into_inner();
        let num_peers = state.peers.len();

        let left = Bucket::new(range.interval_p(1, 2));
        let right = Bucket::new(range.interval_p(2, 2));

        {
            let mut left_state = left.state.lock();
            let mut right_state = right.state.lock();
            left_state.last_update = state.last_update;
            right_state.last_update = state.last_update;

            for peer in state.peers {
                if left.range.contains(&peer.distance) {
                    left_state.peers.push(peer);
                } else {
                    right_state.peers.push(peer);
                }
            }
        }

        if num_peers > 1 {
            if left.is_empty() {
                let (mut left, right) = right.split();
                left.range.start = range.start;
                return (left, right);
            }

            if right.is_empty() {
                let (left, mut right) = left.split();
                right.range.end = range.end;
                return (left, right);
            }
        }

        (left, right)
    }
}
