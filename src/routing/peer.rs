use crate::{bits::Bitmap, contact::Contact};
use std::time::Duration;
use tokio::time::Instant;

/// Contact as tracked by the routing table (and by bootstrap nodes).
#[derive(Clone, Debug)]
pub(crate) struct Peer {
    pub contact: Contact,
    /// XOR distance from the owning node's id.
    pub distance: Bitmap,
    last_activity: Instant,
    failures: usize,
}

impl Peer {
    pub fn new(contact: Contact, distance: Bitmap) -> Self {
        Self {
            contact,
            distance,
            last_activity: Instant::now(),
            failures: 0,
        }
    }

    /// Record activity from the peer. Clears its failures.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.failures = 0;
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn is_bad(&self, max_failures: usize) -> bool {
        self.failures >= max_failures
    }

    pub fn active_in_last(&self, d: Duration) -> bool {
        self.last_activity.elapsed() < d
    }
}
