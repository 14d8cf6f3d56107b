//! Kademlia distributed hash table with 384-bit identifiers.
//!
//! Peers announce the content blobs they host (keyed by 48-byte hashes) at the nodes closest
//! to each hash and look up, for a given hash, the peers that announced it.
//!
//! ```no_run
//! # async fn run() -> Result<(), lbry_dht::Error> {
//! let dht = lbry_dht::Dht::builder()
//!     .set_address("0.0.0.0:4444".parse().unwrap())
//!     .start()
//!     .await?;
//!
//! dht.wait_until_joined().await;
//! let peers = dht.get(lbry_dht::Bitmap::rand()).await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

mod announce;
mod bits;
mod bootstrap;
mod builder;
mod compact;
mod contact;
mod dht;
mod error;
mod finder;
mod message;
mod node;
mod rate;
mod routing;
pub mod rpc;
mod socket;
mod stop;
mod store;
mod token;
mod token_cache;

pub use crate::announce::{AnnounceAction, AnnounceNotification};
pub use crate::bits::{Bitmap, BitmapError, Range, NUM_BITS, NUM_BYTES};
pub use crate::bootstrap::BootstrapNode;
pub use crate::builder::DhtBuilder;
pub use crate::contact::Contact;
pub use crate::dht::Dht;
pub use crate::error::Error;
pub use crate::message::DecodeError;
pub use crate::socket::SocketTrait;

/// Number of parallel probes in an iterative lookup.
pub const ALPHA: usize = 3;
/// Maximum number of contacts per bucket (Kademlia's k).
pub const BUCKET_SIZE: usize = 8;
/// Failures after which a peer is considered bad.
pub const MAX_PEER_FAILS: usize = 3;

/// Number of delivery attempts per request.
pub const UDP_RETRY: usize = 1;
/// How long to wait for a response to each attempt.
pub const UDP_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after a failed socket read or accept, so a broken socket does not spin.
pub const SOCKET_ERROR_BACKOFF: Duration = Duration::from_millis(100);
/// Largest datagram read or written.
pub const UDP_MAX_MESSAGE_LEN: usize = 4096;
/// Deadline for writing a datagram.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Buckets not updated within this interval get refreshed. Grooming runs five times per
/// interval.
pub const T_REFRESH: Duration = Duration::from_secs(60 * 60);
/// How often token secrets rotate. Also the lifetime of cached remote tokens.
pub const TOKEN_SECRET_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_PORT: u16 = 4444;
pub const DEFAULT_PEER_PORT: u16 = 3333;
/// Announces per second.
pub const DEFAULT_ANNOUNCE_RATE: u32 = 10;
/// Seconds worth of announces that may be sent back to back.
pub const DEFAULT_ANNOUNCE_BURST: u32 = 1;
pub const DEFAULT_REANNOUNCE_TIME: Duration = Duration::from_secs(50 * 60);
/// Recheck interval of a bootstrap node's peer list.
pub const DEFAULT_BOOTSTRAP_CHECK_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub const SEED_NODES: &[&str] = &[
    "lbrynet1.lbry.io:4444",
    "lbrynet2.lbry.io:4444",
    "lbrynet3.lbry.io:4444",
];
