//! Periodic, rate limited announcing of the blobs this node hosts.

use crate::{
    bits::Bitmap,
    contact::Contact,
    error::Error,
    finder,
    message::{Request, StoreArgs, StoreArgsValue, STORE_SUCCESS_RESPONSE},
    node::{Node, SendOptions},
    rate::RateLimiter,
    stop::StopGroup,
    token_cache::TokenCache,
    BUCKET_SIZE, TOKEN_SECRET_ROTATION_INTERVAL,
};
use futures_util::future;
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AnnounceAction {
    Started,
    Finished,
}

/// Progress report of a single announce, sent to the channel configured with
/// `DhtBuilder::announce_notifications`.
#[derive(Clone, Debug)]
pub struct AnnounceNotification {
    pub hash: Bitmap,
    pub action: AnnounceAction,
    /// Why the announce failed. Only ever set on `Finished`.
    pub error: Option<String>,
}

pub(crate) struct AnnounceConfig {
    /// Announces per second.
    pub rate: u32,
    /// How many seconds worth of announces may go out at once.
    pub burst: u32,
    pub reannounce_time: Duration,
    pub peer_port: u16,
    pub notifications: Option<mpsc::UnboundedSender<AnnounceNotification>>,
}

enum Command {
    Add(Bitmap),
    Remove(Bitmap),
}

/// Handle to the announcer task.
#[derive(Clone)]
pub(crate) struct Announcer {
    tx: mpsc::UnboundedSender<Command>,
}

impl Announcer {
    pub fn start(node: Node, config: AnnounceConfig, stop: &StopGroup) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let actor = Actor {
            context: Arc::new(Context {
                node,
                tokens: TokenCache::new(TOKEN_SECRET_ROTATION_INTERVAL),
                config,
            }),
            queue: VecDeque::new(),
            hashes: HashSet::new(),
            stop: stop.clone(),
        };
        stop.spawn(actor.run(rx));

        Self { tx }
    }

    /// Starts announcing `hash`. No-op if it is announced already.
    pub fn add(&self, hash: Bitmap) {
        self.tx.send(Command::Add(hash)).ok();
    }

    /// Stops announcing `hash`. No-op if it is not announced.
    pub fn remove(&self, hash: Bitmap) {
        self.tx.send(Command::Remove(hash)).ok();
    }
}

struct Context {
    node: Node,
    tokens: TokenCache,
    config: AnnounceConfig,
}

impl Context {
    fn notify(&self, hash: Bitmap, action: AnnounceAction, error: Option<String>) {
        if let Some(tx) = &self.config.notifications {
            tx.send(AnnounceNotification {
                hash,
                action,
                error,
            })
            .ok();
        }
    }
}

struct Entry {
    hash: Bitmap,
    last_announce: Option<Instant>,
}

/// When the next announce happens.
#[derive(Copy, Clone, PartialEq, Eq)]
enum Next {
    /// Nothing to announce.
    Idle,
    /// The head of the queue is due, as soon as the rate limiter allows.
    Limited,
    /// Once the head of the queue is due again.
    At(Instant),
}

struct Actor {
    context: Arc<Context>,
    /// Announce order. The head is announced next.
    queue: VecDeque<Entry>,
    hashes: HashSet<Bitmap>,
    stop: StopGroup,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let config = &self.context.config;
        let mut limiter =
            RateLimiter::new(config.rate, config.rate.saturating_mul(config.burst.max(1)));
        let mut maintenance =
            time::interval_at(Instant::now() + MAINTENANCE_INTERVAL, MAINTENANCE_INTERVAL);
        let mut next = Next::Idle;

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Add(hash)) => {
                        if self.hashes.insert(hash) {
                            // New hashes jump the queue.
                            self.queue.push_front(Entry {
                                hash,
                                last_announce: None,
                            });
                            next = self.schedule();
                        }
                    }
                    Some(Command::Remove(hash)) => {
                        if self.hashes.remove(&hash) {
                            self.queue.retain(|entry| entry.hash != hash);
                            next = self.schedule();
                        }
                    }
                    None => break,
                },
                _ = maintenance.tick() => self.warn_if_overloaded(),
                _ = wait(next, &mut limiter) => {
                    if next == Next::Limited {
                        self.announce_head();
                    }
                    next = self.schedule();
                }
            }
        }
    }

    fn warn_if_overloaded(&self) {
        let config = &self.context.config;
        let max = max_announces(config.rate, config.reannounce_time);

        if self.hashes.len() > max {
            log::warn!(
                "[{}] announcing {} hashes, but can only announce {} hashes in the {:?} reannounce window. Raise the announce rate or spawn more nodes.",
                self.context.node.id().hex_short(),
                self.hashes.len(),
                max,
                config.reannounce_time
            );
        }
    }

    /// Only a due head of the queue waits for the rate limiter.
    fn schedule(&self) -> Next {
        let entry = match self.queue.front() {
            Some(entry) => entry,
            None => return Next::Idle,
        };

        match entry.last_announce {
            Some(last) if last + self.context.config.reannounce_time > Instant::now() => {
                Next::At(last + self.context.config.reannounce_time)
            }
            _ => Next::Limited,
        }
    }

    fn announce_head(&mut self) {
        let entry = match self.queue.front_mut() {
            Some(entry) => entry,
            None => return,
        };

        entry.last_announce = Some(Instant::now());
        let hash = entry.hash;
        self.queue.rotate_left(1);

        self.context.notify(hash, AnnounceAction::Started, None);

        let context = self.context.clone();
        let stop = self.stop.clone();
        self.stop.spawn(async move {
            let result = announce(
                &context.node,
                &context.tokens,
                hash,
                context.config.peer_port,
                &stop,
            )
            .await;

            let error = match result {
                Ok(()) => None,
                Err(error) => {
                    log::error!(
                        "[{}] announce of {} failed: {}",
                        context.node.id().hex_short(),
                        hash.hex_short(),
                        error
                    );
                    Some(error.to_string())
                }
            };

            context.notify(hash, AnnounceAction::Finished, error);
        });
    }
}

async fn wait(next: Next, limiter: &mut RateLimiter) {
    match next {
        Next::Idle => future::pending().await,
        Next::Limited => limiter.acquire().await,
        Next::At(when) => time::sleep_until(when).await,
    }
}

/// How many hashes can be announced within one reannounce window.
fn max_announces(rate: u32, reannounce_time: Duration) -> usize {
    rate as usize * reannounce_time.as_secs() as usize
}

/// Stores `hash` at the `BUCKET_SIZE` nodes closest to it, ourselves included if we are
/// among them.
pub(crate) async fn announce(
    node: &Node,
    tokens: &TokenCache,
    hash: Bitmap,
    peer_port: u16,
    stop: &StopGroup,
) -> Result<(), Error> {
    let own = node.contact().ok_or(Error::Shutdown)?;
    let (mut contacts, _) = finder::find_contacts(node, hash, false, Some(stop)).await?;

    if contacts.len() < BUCKET_SIZE {
        contacts.push(own);
    } else if hash.closer(&own.id, &contacts[BUCKET_SIZE - 1].id) {
        contacts[BUCKET_SIZE - 1] = own;
    }

    log::debug!(
        "[{}] announcing {} to {} contacts",
        own.id.hex_short(),
        hash.hex_short(),
        contacts.len()
    );

    future::join_all(
        contacts
            .into_iter()
            .map(|contact| store(node, tokens, hash, contact, own, peer_port, stop)),
    )
    .await;

    Ok(())
}

async fn store(
    node: &Node,
    tokens: &TokenCache,
    hash: Bitmap,
    contact: Contact,
    own: Contact,
    peer_port: u16,
    stop: &StopGroup,
) {
    if contact.id == own.id {
        node.store().upsert(hash, own.with_peer_port(peer_port));
        return;
    }

    let token = tokens.get(node, contact, hash, stop).await;
    let request = Request::store(StoreArgs {
        blob_hash: hash,
        value: StoreArgsValue {
            token,
            lbry_id: own.id,
            port: peer_port,
        },
        node_id: own.id,
        self_store: false,
    });

    let response = tokio::select! {
        response = node.send(contact, request, SendOptions::default()) => response,
        _ = stop.stopped() => return,
    };

    match response {
        Some(response) if response.data() == Some(STORE_SUCCESS_RESPONSE) => (),
        Some(_) => log::debug!(
            "[{}] unexpected store response from {}",
            own.id.hex_short(),
            contact
        ),
        None => (),
    }
}
