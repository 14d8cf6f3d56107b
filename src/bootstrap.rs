//! Entry point node for joining the network.

use crate::{
    bits::Bitmap,
    contact::Contact,
    error::Error,
    message::{Method, Payload, Request, RequestArgs, Response, PING_SUCCESS_RESPONSE},
    node::{Node, RequestHandler, SendOptions},
    routing::Peer,
    socket::{Socket, SocketTrait},
    BUCKET_SIZE,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::UdpSocket,
    time::{self, Instant},
};

/// Node that only introduces newcomers to each other.
///
/// It has neither a routing table nor a contact store. Instead it remembers everyone who
/// contacted it and answered a ping, answers `findNode` with random picks from that list
/// and periodically re-pings the ones it has not heard from in a while.
pub struct BootstrapNode {
    node: Node,
    peers: Arc<Peers>,
    check_interval: Duration,
}

impl BootstrapNode {
    /// `initial_ping_interval` is how long to wait before pinging a node that contacted us.
    /// Peers silent for `check_interval` get pinged again and dropped if they do not answer.
    pub fn new(id: Bitmap, initial_ping_interval: Duration, check_interval: Duration) -> Self {
        let peers = Arc::new(Peers::new(id));
        let handler = Arc::new(BootstrapHandler {
            peers: peers.clone(),
            initial_ping_interval,
        });

        Self {
            node: Node::with_handler(id, handler),
            peers,
            check_interval,
        }
    }

    pub fn id(&self) -> Bitmap {
        self.node.id()
    }

    /// Our own contact, once connected.
    pub fn contact(&self) -> Option<Contact> {
        self.node.contact()
    }

    /// Binds a UDP socket to `addr` and starts serving on it.
    pub async fn bind(&self, addr: SocketAddr) -> Result<(), Error> {
        let socket = UdpSocket::bind(addr).await?;
        self.connect(socket)
    }

    /// Starts serving on `socket`.
    pub fn connect<S: SocketTrait + Send + Sync + 'static>(&self, socket: S) -> Result<(), Error> {
        self.node.connect(Socket::new(socket)?);

        log::debug!("[{}] bootstrap: node connected", self.id().hex_short());

        let node = self.node.clone();
        let peers = self.peers.clone();
        let check_interval = self.check_interval;
        let period = check_interval / 5;

        self.node.stop_group().spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;

                for contact in peers.inactive(check_interval) {
                    let pinger = node.clone();
                    let peers = peers.clone();
                    node.stop_group()
                        .spawn(async move { ping(&pinger, &peers, contact).await });
                }
            }
        });

        Ok(())
    }

    /// Adds a contact by hand.
    pub fn add(&self, contact: Contact) {
        self.peers.upsert(contact);
    }

    /// Everyone currently known.
    pub fn contacts(&self) -> Vec<Contact> {
        self.peers.all()
    }

    pub async fn shutdown(&self) {
        self.node.shutdown().await;
    }
}

struct Peers {
    id: Bitmap,
    list: RwLock<Vec<Peer>>,
}

impl Peers {
    fn new(id: Bitmap) -> Self {
        Self {
            id,
            list: RwLock::new(Vec::new()),
        }
    }

    /// Adds the contact, or marks it active if it is known already.
    fn upsert(&self, contact: Contact) {
        let mut list = self.list.write();

        if let Some(peer) = list.iter_mut().find(|peer| peer.contact.id == contact.id) {
            log::debug!(
                "[{}] bootstrap: touching contact {}",
                self.id.hex_short(),
                contact.id.hex_short()
            );
            peer.touch();
            return;
        }

        log::debug!(
            "[{}] bootstrap: adding new contact {}",
            self.id.hex_short(),
            contact.id.hex_short()
        );
        list.push(Peer::new(contact, contact.id ^ self.id));
    }

    fn remove(&self, contact: &Contact) {
        let mut list = self.list.write();
        let before = list.len();
        list.retain(|peer| peer.contact.id != contact.id);

        if list.len() < before {
            log::debug!(
                "[{}] bootstrap: removing contact {}",
                self.id.hex_short(),
                contact.id.hex_short()
            );
        }
    }

    /// Up to `limit` random contacts.
    fn random(&self, limit: usize) -> Vec<Contact> {
        self.list
            .read()
            .choose_multiple(&mut rand::thread_rng(), limit)
            .map(|peer| peer.contact)
            .collect()
    }

    fn inactive(&self, interval: Duration) -> Vec<Contact> {
        self.list
            .read()
            .iter()
            .filter(|peer| !peer.active_in_last(interval))
            .map(|peer| peer.contact)
            .collect()
    }

    fn all(&self) -> Vec<Contact> {
        self.list.read().iter().map(|peer| peer.contact).collect()
    }
}

/// Keeps the contact if it answers the ping, forgets it otherwise.
async fn ping(node: &Node, peers: &Peers, contact: Contact) {
    let response = node
        .send(contact, Request::ping(), SendOptions::default())
        .await;

    if node.stop_group().is_stopped() {
        return;
    }

    match response {
        Some(response) if response.data() == Some(PING_SUCCESS_RESPONSE) => {
            peers.upsert(contact)
        }
        _ => peers.remove(&contact),
    }
}

struct BootstrapHandler {
    peers: Arc<Peers>,
    initial_ping_interval: Duration,
}

#[async_trait]
impl RequestHandler for BootstrapHandler {
    async fn handle_request(&self, node: &Node, addr: SocketAddr, request: Request) {
        let id = node.id();

        match (request.method, &request.args) {
            (Method::Ping, _) => {
                let pong = Payload::Data(PING_SUCCESS_RESPONSE.to_owned());
                node.reply(addr, Response::new(&request, id, pong).into())
                    .await;
            }
            (Method::FindNode, RequestArgs::Target(_)) => {
                let contacts = self.peers.random(BUCKET_SIZE);
                node.reply(addr, Response::new(&request, id, Payload::Contacts(contacts)).into())
                    .await;
            }
            (Method::FindNode, _) => {
                log::error!(
                    "[{}] bootstrap: findNode from {} is missing its target",
                    id.hex_short(),
                    addr
                );
                return;
            }
            _ => (),
        }

        log::debug!(
            "[{}] bootstrap: queuing {} to ping",
            id.hex_short(),
            request.node_id.hex_short()
        );

        let contact = Contact::new(request.node_id, addr);
        let delay = self.initial_ping_interval;
        let peers = self.peers.clone();
        let pinger = node.clone();

        node.stop_group().spawn(async move {
            time::sleep(delay).await;
            ping(&pinger, &peers, contact).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::Message,
        test::{self, TestRemote, TestSocket},
    };
    use std::net::Ipv4Addr;

    fn start_bootstrap(initial_ping: Duration) -> (BootstrapNode, TestRemote) {
        let (socket, remote) = TestSocket::new((Ipv4Addr::LOCALHOST, 4444).into());
        let bootstrap = BootstrapNode::new(Bitmap::rand(), initial_ping, Duration::from_secs(60));
        bootstrap.connect(socket).unwrap();
        (bootstrap, remote)
    }

    fn inject(remote: &TestRemote, message: impl Into<Message>, from: SocketAddr) {
        remote
            .incoming
            .send((message.into().encode().unwrap(), from))
            .unwrap();
    }

    async fn next_sent(remote: &mut TestRemote) -> (Message, SocketAddr) {
        let (data, addr) = time::timeout(Duration::from_secs(5), remote.outgoing.recv())
            .await
            .unwrap()
            .unwrap();
        (Message::decode(&data).unwrap(), addr)
    }

    fn from(mut request: Request, contact: &Contact) -> Request {
        request.node_id = contact.id;
        request
    }

    #[test]
    fn positive_upsert_remove() {
        let peers = Peers::new(Bitmap::rand());
        let a = test::dummy_contact();
        let b = test::dummy_contact();

        peers.upsert(a);
        peers.upsert(b);
        peers.upsert(a);
        assert_eq!(peers.all(), vec![a, b]);

        peers.remove(&a);
        peers.remove(&a);
        assert_eq!(peers.all(), vec![b]);
    }

    #[test]
    fn positive_random_is_bounded() {
        let peers = Peers::new(Bitmap::rand());
        for _ in 0..20 {
            peers.upsert(test::dummy_contact());
        }

        let picked = peers.random(BUCKET_SIZE);
        assert_eq!(picked.len(), BUCKET_SIZE);
        let all = peers.all();
        assert!(picked.iter().all(|contact| all.contains(contact)));

        assert_eq!(Peers::new(Bitmap::rand()).random(BUCKET_SIZE), vec![]);
    }

    #[tokio::test]
    async fn positive_requester_is_added_after_pong() {
        let _ = pretty_env_logger::try_init();
        let (bootstrap, mut remote) = start_bootstrap(Duration::ZERO);
        let requester = test::dummy_contact();

        inject(&remote, from(Request::find_node(requester.id), &requester), requester.addr());

        match next_sent(&mut remote).await.0 {
            Message::Response(response) => assert_eq!(response.payload, Payload::Contacts(vec![])),
            other => panic!("unexpected message {:?}", other),
        }

        let (message, addr) = next_sent(&mut remote).await;
        assert_eq!(addr, requester.addr());
        let ping = match message {
            Message::Request(request) if request.method == Method::Ping => request,
            other => panic!("unexpected message {:?}", other),
        };

        inject(
            &remote,
            Response::new(&ping, requester.id, Payload::Data(PING_SUCCESS_RESPONSE.to_owned())),
            requester.addr(),
        );

        time::timeout(Duration::from_secs(5), async {
            while bootstrap.contacts().is_empty() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(bootstrap.contacts(), vec![requester]);

        // The newcomer is handed out to the next one asking.
        let other = test::dummy_contact();
        inject(&remote, from(Request::find_node(other.id), &other), other.addr());

        match next_sent(&mut remote).await.0 {
            Message::Response(response) => {
                assert_eq!(response.payload, Payload::Contacts(vec![requester]))
            }
            other => panic!("unexpected message {:?}", other),
        }

        bootstrap.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn negative_silent_requester_is_not_added() {
        let (bootstrap, mut remote) = start_bootstrap(Duration::ZERO);
        let requester = test::dummy_contact();
        bootstrap.add(requester);

        inject(&remote, from(Request::ping(), &requester), requester.addr());

        match next_sent(&mut remote).await.0 {
            Message::Response(response) => {
                assert_eq!(response.data(), Some(PING_SUCCESS_RESPONSE))
            }
            other => panic!("unexpected message {:?}", other),
        }

        // Our ping goes unanswered.
        let (message, _) = next_sent(&mut remote).await;
        assert!(matches!(message, Message::Request(_)));

        time::timeout(Duration::from_secs(10), async {
            while !bootstrap.contacts().is_empty() {
                time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .unwrap();

        bootstrap.shutdown().await;
    }
}
