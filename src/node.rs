use crate::{
    bits::Bitmap,
    contact::Contact,
    finder,
    message::{
        ErrorMessage, Message, MessageId, Method, Payload, Request, RequestArgs, Response,
        PING_SUCCESS_RESPONSE, STORE_SUCCESS_RESPONSE,
    },
    routing::RoutingTable,
    socket::Socket,
    stop::StopGroup,
    store::ContactStore,
    token::TokenManager,
    BUCKET_SIZE, SOCKET_ERROR_BACKOFF, T_REFRESH, TOKEN_SECRET_ROTATION_INTERVAL,
    UDP_MAX_MESSAGE_LEN, UDP_RETRY, UDP_TIMEOUT,
};
use async_trait::async_trait;
use futures_util::future;
use parking_lot::Mutex;
use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant},
};

/// Datagrams read but not yet dispatched.
const READ_QUEUE_LEN: usize = 256;

pub(crate) const INVALID_TOKEN_ERROR: &str = "invalid-token";
pub(crate) const MISSING_ARGUMENT_ERROR: &str = "missing-argument";

/// Answers requests coming from other nodes.
#[async_trait]
pub(crate) trait RequestHandler: Send + Sync {
    async fn handle_request(&self, node: &Node, addr: SocketAddr, request: Request);
}

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct SendOptions {
    /// Accept the response from whoever answers at the contact's address. Used when the
    /// contact's id is not known yet.
    pub skip_id_check: bool,
}

struct Transaction {
    contact: Contact,
    skip_id_check: bool,
    tx: mpsc::Sender<Response>,
}

impl Transaction {
    fn accepts(&self, response: &Response, addr: &SocketAddr) -> bool {
        self.skip_id_check
            || (self.contact.id == response.node_id
                && self.contact.ip == addr.ip()
                && self.contact.port == addr.port())
    }
}

/// Removes the transaction whichever way the send ends.
struct TransactionGuard<'a> {
    transactions: &'a Mutex<HashMap<MessageId, Transaction>>,
    id: MessageId,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.transactions.lock().remove(&self.id);
    }
}

/// DHT protocol endpoint: talks to other nodes over a socket, answers their requests and
/// keeps its routing table fresh.
#[derive(Clone)]
pub(crate) struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    id: Bitmap,
    socket: Mutex<Option<Socket>>,
    routing_table: RoutingTable,
    store: ContactStore,
    tokens: TokenManager,
    transactions: Mutex<HashMap<MessageId, Transaction>>,
    handler: Arc<dyn RequestHandler>,
    /// Whether the routing table is maintained at all.
    routing: bool,
    stop: StopGroup,
}

impl Node {
    pub fn new(id: Bitmap) -> Self {
        Self::with_routing_table(RoutingTable::new(id))
    }

    pub fn with_routing_table(routing_table: RoutingTable) -> Self {
        Self::build(routing_table, Arc::new(DefaultHandler), true)
    }

    /// Node whose requests are answered by `handler`. Such a node keeps no routing table:
    /// it is neither updated by traffic nor groomed.
    pub fn with_handler(id: Bitmap, handler: Arc<dyn RequestHandler>) -> Self {
        Self::build(RoutingTable::new(id), handler, false)
    }

    fn build(routing_table: RoutingTable, handler: Arc<dyn RequestHandler>, routing: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: routing_table.id(),
                socket: Mutex::new(None),
                routing_table,
                store: ContactStore::new(),
                tokens: TokenManager::new(),
                transactions: Mutex::new(HashMap::new()),
                handler,
                routing,
                stop: StopGroup::new(),
            }),
        }
    }

    pub fn id(&self) -> Bitmap {
        self.inner.id
    }

    /// Our own contact, once connected.
    pub fn contact(&self) -> Option<Contact> {
        self.socket()
            .map(|socket| Contact::new(self.inner.id, socket.local_addr()))
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.inner.routing_table
    }

    pub fn store(&self) -> &ContactStore {
        &self.inner.store
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    pub fn stop_group(&self) -> &StopGroup {
        &self.inner.stop
    }

    fn socket(&self) -> Option<Socket> {
        self.inner.socket.lock().clone()
    }

    /// Starts serving on the socket: the reader, the dispatcher and, unless requests are
    /// handled by a custom handler, the routing table groomer.
    pub fn connect(&self, socket: Socket) {
        log::debug!(
            "[{}] listening on {}",
            self.inner.id.hex_short(),
            socket.local_addr()
        );

        *self.inner.socket.lock() = Some(socket.clone());
        self.inner.tokens.start(TOKEN_SECRET_ROTATION_INTERVAL);

        let (packet_tx, mut packet_rx) = mpsc::channel(READ_QUEUE_LEN);

        let id = self.inner.id;
        self.inner.stop.spawn(async move {
            let mut buffer = [0u8; UDP_MAX_MESSAGE_LEN];
            loop {
                match socket.recv(&mut buffer).await {
                    Ok((len, addr)) => {
                        if packet_tx.send((buffer[..len].to_vec(), addr)).await.is_err() {
                            break;
                        }
                    }
                    // An ICMP error from an earlier send, not a problem with the socket.
                    Err(error) if error.kind() == io::ErrorKind::ConnectionReset => {
                        log::trace!("[{}] socket read: {}", id.hex_short(), error);
                    }
                    Err(error) => {
                        log::warn!("[{}] socket read failed: {}", id.hex_short(), error);
                        time::sleep(SOCKET_ERROR_BACKOFF).await;
                    }
                }
            }
        });

        let node = self.clone();
        self.inner.stop.spawn(async move {
            while let Some((data, addr)) = packet_rx.recv().await {
                node.handle_packet(&data, addr).await;
            }
        });

        if self.inner.routing {
            let node = self.clone();
            self.inner.stop.spawn(async move {
                let period = T_REFRESH / 5;
                let mut ticker = time::interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    node.refresh_routing_table(T_REFRESH).await;
                }
            });
        }
    }

    /// Looks up a random id in every bucket not updated within `interval`.
    pub async fn refresh_routing_table(&self, interval: Duration) {
        let ids = self.inner.routing_table.get_ids_for_refresh(interval);
        if ids.is_empty() {
            return;
        }

        log::debug!(
            "[{}] refreshing {} buckets",
            self.inner.id.hex_short(),
            ids.len()
        );

        let lookups = ids.into_iter().map(|id| async move {
            if let Err(error) =
                finder::find_contacts(self, id, false, Some(self.stop_group())).await
            {
                log::debug!(
                    "[{}] refresh of {} failed: {}",
                    self.inner.id.hex_short(),
                    id.hex_short(),
                    error
                );
            }
        });

        future::join_all(lookups).await;
    }

    async fn handle_packet(&self, data: &[u8], addr: SocketAddr) {
        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(error) => {
                log::debug!(
                    "[{}] dropping packet from {}: {}",
                    self.inner.id.hex_short(),
                    addr,
                    error
                );
                return;
            }
        };

        match message {
            Message::Request(request) => {
                log::trace!(
                    "[{}] {} <- {}@{}",
                    self.inner.id.hex_short(),
                    request,
                    request.node_id.hex_short(),
                    addr
                );

                let sender = Contact::new(request.node_id, addr);
                self.inner
                    .handler
                    .clone()
                    .handle_request(self, addr, request)
                    .await;
                if self.inner.routing {
                    self.inner.routing_table.fresh(sender);
                }
            }
            Message::Response(response) => self.handle_response(response, addr),
            Message::Error(error) => {
                log::debug!(
                    "[{}] error from {}@{}: {} {:?}",
                    self.inner.id.hex_short(),
                    error.node_id.hex_short(),
                    addr,
                    error.exception_type,
                    error.response
                );
                if self.inner.routing {
                    self.inner
                        .routing_table
                        .fresh(Contact::new(error.node_id, addr));
                }
            }
        }
    }

    fn handle_response(&self, response: Response, addr: SocketAddr) {
        let tx = {
            let mut transactions = self.inner.transactions.lock();
            match transactions.get(&response.id) {
                Some(transaction) if transaction.accepts(&response, &addr) => {
                    transactions.remove(&response.id).map(|t| t.tx)
                }
                _ => None,
            }
        };

        let tx = match tx {
            Some(tx) => tx,
            None => {
                log::trace!(
                    "[{}] unexpected response {:?} from {}",
                    self.inner.id.hex_short(),
                    response.id,
                    addr
                );
                return;
            }
        };

        let sender = Contact::new(response.node_id, addr);
        if tx.try_send(response).is_ok() && self.inner.routing {
            self.inner.routing_table.update(sender);
        }
    }

    /// Sends a reply. Failures are logged only.
    pub async fn reply(&self, addr: SocketAddr, message: Message) {
        let socket = match self.socket() {
            Some(socket) => socket,
            None => return,
        };

        if let Err(error) = socket.send(&message, addr).await {
            log::debug!(
                "[{}] failed to reply to {}: {}",
                self.inner.id.hex_short(),
                addr,
                error
            );
        }
    }

    /// Sends the request and waits for the matching response. Returns `None` if none arrived
    /// in time, in which case the contact is marked as failed.
    pub async fn send(
        &self,
        contact: Contact,
        mut request: Request,
        options: SendOptions,
    ) -> Option<Response> {
        if contact.id == self.inner.id {
            log::error!(
                "[{}] refusing to send {} to self",
                self.inner.id.hex_short(),
                request
            );
            return None;
        }

        let socket = self.socket()?;

        request.id = MessageId::rand();
        request.node_id = self.inner.id;

        let (tx, mut rx) = mpsc::channel(1);
        self.inner.transactions.lock().insert(
            request.id,
            Transaction {
                contact,
                skip_id_check: options.skip_id_check,
                tx,
            },
        );
        let _guard = TransactionGuard {
            transactions: &self.inner.transactions,
            id: request.id,
        };

        log::trace!(
            "[{}] {} -> {}",
            self.inner.id.hex_short(),
            request,
            contact
        );

        let message = Message::Request(request);

        for _ in 0..UDP_RETRY {
            if let Err(error) = socket.send(&message, contact.addr()).await {
                log::debug!(
                    "[{}] failed to send to {}: {}",
                    self.inner.id.hex_short(),
                    contact,
                    error
                );
                continue;
            }

            tokio::select! {
                response = rx.recv() => {
                    if response.is_some() {
                        return response;
                    }
                }
                _ = time::sleep(UDP_TIMEOUT) => (),
                _ = self.inner.stop.stopped() => return None,
            }
        }

        log::debug!(
            "[{}] no response from {}",
            self.inner.id.hex_short(),
            contact
        );
        if self.inner.routing {
            self.inner.routing_table.fail(&contact);
        }

        None
    }

    /// Like `send` but in the background. The receiver is closed without a value if no
    /// response arrived.
    pub fn send_async(
        &self,
        contact: Contact,
        request: Request,
        options: SendOptions,
    ) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        let node = self.clone();

        self.inner.stop.spawn(async move {
            if let Some(response) = node.send(contact, request, options).await {
                tx.send(response).ok();
            }
        });

        rx
    }

    pub async fn shutdown(&self) {
        log::debug!("[{}] shutting down", self.inner.id.hex_short());

        self.inner.stop.stop_and_wait().await;
        self.inner.socket.lock().take();
        self.inner.tokens.stop().await;
    }

    /// Number of requests awaiting a response.
    pub fn transaction_count(&self) -> usize {
        self.inner.transactions.lock().len()
    }
}

/// Serves the four protocol methods from the routing table and the contact store.
struct DefaultHandler;

#[async_trait]
impl RequestHandler for DefaultHandler {
    async fn handle_request(&self, node: &Node, addr: SocketAddr, request: Request) {
        let id = node.id();

        let reply: Message = match (request.method, &request.args) {
            (Method::Ping, _) => {
                Response::new(&request, id, Payload::Data(PING_SUCCESS_RESPONSE.to_owned())).into()
            }
            (Method::Store, RequestArgs::Store(args)) => {
                if node
                    .tokens()
                    .verify(&args.value.token, &request.node_id, &addr)
                {
                    let contact = Contact::new(args.node_id, addr).with_peer_port(args.value.port);
                    node.store().upsert(args.blob_hash, contact);
                    Response::new(
                        &request,
                        id,
                        Payload::Data(STORE_SUCCESS_RESPONSE.to_owned()),
                    )
                    .into()
                } else {
                    log::debug!(
                        "[{}] invalid store token from {}",
                        id.hex_short(),
                        addr
                    );
                    ErrorMessage::new(&request, id, INVALID_TOKEN_ERROR).into()
                }
            }
            (Method::FindNode, RequestArgs::Target(target)) => {
                let contacts = node.routing_table().get_closest(target, BUCKET_SIZE);
                Response::new(&request, id, Payload::Contacts(contacts)).into()
            }
            (Method::FindValue, RequestArgs::Target(target)) => {
                let token = node.tokens().get(&request.node_id, &addr);
                let stored = node.store().get(target);

                let payload = if stored.is_empty() {
                    Payload::Closest {
                        contacts: node.routing_table().get_closest(target, BUCKET_SIZE),
                        token,
                    }
                } else {
                    Payload::Value {
                        key: *target,
                        contacts: stored,
                        token,
                    }
                };

                Response::new(&request, id, payload).into()
            }
            _ => {
                log::debug!(
                    "[{}] {} from {} is missing its argument",
                    id.hex_short(),
                    request.method,
                    addr
                );
                ErrorMessage::new(&request, id, MISSING_ARGUMENT_ERROR).into()
            }
        };

        node.reply(addr, reply).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{StoreArgs, StoreArgsValue},
        routing::sort_by_distance,
        test::{self, TestRemote, TestSocket},
        MAX_PEER_FAILS,
    };
    use std::{
        net::Ipv4Addr,
        sync::atomic::{AtomicUsize, Ordering},
    };

    /// Socket whose every read fails.
    struct BrokenSocket {
        reads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl crate::socket::SocketTrait for BrokenSocket {
        async fn send_to(&self, _buf: &[u8], _target: &SocketAddr) -> io::Result<()> {
            Ok(())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "broken"))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok((Ipv4Addr::LOCALHOST, 4444).into())
        }
    }

    fn start_node() -> (Node, TestRemote) {
        let (socket, remote) = TestSocket::new((Ipv4Addr::LOCALHOST, 4444).into());
        let node = Node::new(Bitmap::rand());
        node.connect(Socket::new(socket).unwrap());
        (node, remote)
    }

    fn inject(remote: &TestRemote, message: impl Into<Message>, from: SocketAddr) {
        remote
            .incoming
            .send((message.into().encode().unwrap(), from))
            .unwrap();
    }

    async fn next_sent(remote: &mut TestRemote) -> (Vec<u8>, Message, SocketAddr) {
        let (data, addr) = time::timeout(Duration::from_secs(5), remote.outgoing.recv())
            .await
            .unwrap()
            .unwrap();
        let message = Message::decode(&data).unwrap();
        (data, message, addr)
    }

    fn request_from(mut request: Request, node_id: Bitmap) -> Request {
        request.node_id = node_id;
        request
    }

    #[tokio::test]
    async fn positive_ping_reply() {
        let _ = pretty_env_logger::try_init();
        let (node, mut remote) = start_node();
        let requester = test::dummy_contact();

        let request = request_from(Request::ping(), requester.id);
        inject(&remote, request.clone(), requester.addr());

        let (data, message, addr) = next_sent(&mut remote).await;
        assert_eq!(addr, requester.addr());

        let mut expected = b"d1:0i1e1:1".to_vec();
        expected.extend(serde_bencode::to_bytes(&request.id).unwrap());
        expected.extend(b"1:2");
        expected.extend(serde_bencode::to_bytes(&node.id()).unwrap());
        expected.extend(b"1:34:ponge");
        assert_eq!(data, expected);

        match message {
            Message::Response(response) => {
                assert_eq!(response.id, request.id);
                assert_eq!(response.node_id, node.id());
                assert_eq!(response.data(), Some(PING_SUCCESS_RESPONSE));
            }
            other => panic!("unexpected message {:?}", other),
        }

        node.shutdown().await;
    }

    #[tokio::test]
    async fn positive_store_then_find_value() {
        let _ = pretty_env_logger::try_init();
        let (node, mut remote) = start_node();
        let requester = test::dummy_contact();
        let hash = Bitmap::rand();
        let publisher = Bitmap::rand();

        let token = node.tokens().get(&requester.id, &requester.addr());
        let store = request_from(
            Request::store(StoreArgs {
                blob_hash: hash,
                value: StoreArgsValue {
                    token,
                    lbry_id: requester.id,
                    port: 9999,
                },
                node_id: publisher,
                self_store: false,
            }),
            requester.id,
        );
        inject(&remote, store, requester.addr());

        match next_sent(&mut remote).await.1 {
            Message::Response(response) => {
                assert_eq!(response.data(), Some(STORE_SUCCESS_RESPONSE))
            }
            other => panic!("unexpected message {:?}", other),
        }

        let stored = node.store().get(&hash);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, publisher);
        assert_eq!(stored[0].peer_port, 9999);

        inject(
            &remote,
            request_from(Request::find_value(hash), requester.id),
            requester.addr(),
        );

        match next_sent(&mut remote).await.1 {
            Message::Response(response) => {
                assert!(response.is_value());
                assert_eq!(response.contacts().len(), 1);
                assert_eq!(response.contacts()[0].id, publisher);
                assert_eq!(response.contacts()[0].peer_port, 9999);
                assert!(!response.token().unwrap().is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }

        node.shutdown().await;
    }

    #[tokio::test]
    async fn negative_store_invalid_token() {
        let (node, mut remote) = start_node();
        let requester = test::dummy_contact();
        let hash = Bitmap::rand();

        let store = request_from(
            Request::store(StoreArgs {
                blob_hash: hash,
                value: StoreArgsValue {
                    token: b"bogus".to_vec(),
                    lbry_id: requester.id,
                    port: 9999,
                },
                node_id: requester.id,
                self_store: false,
            }),
            requester.id,
        );
        inject(&remote, store, requester.addr());

        match next_sent(&mut remote).await.1 {
            Message::Error(error) => assert_eq!(error.exception_type, INVALID_TOKEN_ERROR),
            other => panic!("unexpected message {:?}", other),
        }

        assert!(node.store().get(&hash).is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn positive_find_node_sorted() {
        let (node, mut remote) = start_node();
        for _ in 0..20 {
            node.routing_table().update(test::dummy_contact());
        }

        let requester = test::dummy_contact();
        let target = Bitmap::rand();
        inject(
            &remote,
            request_from(Request::find_node(target), requester.id),
            requester.addr(),
        );

        let mut expected: Vec<_> = node
            .routing_table()
            .buckets()
            .into_iter()
            .flat_map(|(_, contacts)| contacts)
            .collect();
        sort_by_distance(&mut expected, &target);
        expected.truncate(BUCKET_SIZE);

        match next_sent(&mut remote).await.1 {
            Message::Response(response) => {
                assert_eq!(response.payload, Payload::Contacts(expected))
            }
            other => panic!("unexpected message {:?}", other),
        }

        node.shutdown().await;
    }

    #[tokio::test]
    async fn negative_missing_argument() {
        let (node, mut remote) = start_node();
        let requester = test::dummy_contact();

        let mut request = request_from(Request::ping(), requester.id);
        request.method = Method::FindNode;
        inject(&remote, request, requester.addr());

        match next_sent(&mut remote).await.1 {
            Message::Error(error) => assert_eq!(error.exception_type, MISSING_ARGUMENT_ERROR),
            other => panic!("unexpected message {:?}", other),
        }

        node.shutdown().await;
    }

    #[tokio::test]
    async fn positive_send_and_receive() {
        let (node, mut remote) = start_node();
        let peer = test::dummy_contact();

        let sending = tokio::spawn({
            let node = node.clone();
            async move { node.send(peer, Request::ping(), SendOptions::default()).await }
        });

        let (_, message, addr) = next_sent(&mut remote).await;
        assert_eq!(addr, peer.addr());
        let request = match message {
            Message::Request(request) => request,
            other => panic!("unexpected message {:?}", other),
        };
        assert_eq!(request.node_id, node.id());

        // wrong sender id is ignored
        let mut forged = Response::new(&request, Bitmap::rand(), Payload::Data("pong".to_owned()));
        inject(&remote, forged.clone(), peer.addr());

        forged.node_id = peer.id;
        inject(&remote, forged.clone(), peer.addr());
        // duplicate is dropped
        inject(&remote, forged, peer.addr());

        let response = sending.await.unwrap().unwrap();
        assert_eq!(response.node_id, peer.id);
        assert_eq!(node.routing_table().get_closest(&peer.id, 1), vec![peer]);
        assert_eq!(node.transaction_count(), 0);

        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn negative_send_times_out() {
        let (node, mut remote) = start_node();
        let peer = test::dummy_contact();
        node.routing_table().update(peer);

        let sending = tokio::spawn({
            let node = node.clone();
            async move { node.send(peer, Request::ping(), SendOptions::default()).await }
        });

        next_sent(&mut remote).await;
        assert!(sending.await.unwrap().is_none());
        assert_eq!(node.transaction_count(), 0);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn positive_skip_id_check() {
        let (node, mut remote) = start_node();
        let seed = Contact::new(Bitmap::rand(), test::dummy_socket_addr());
        let actual_id = Bitmap::rand();

        let receiver = node.send_async(
            seed,
            Request::find_node(node.id()),
            SendOptions {
                skip_id_check: true,
            },
        );

        let request = match next_sent(&mut remote).await.1 {
            Message::Request(request) => request,
            other => panic!("unexpected message {:?}", other),
        };
        inject(
            &remote,
            Response::new(&request, actual_id, Payload::Contacts(vec![])),
            seed.addr(),
        );

        let response = receiver.await.unwrap();
        assert_eq!(response.node_id, actual_id);
        assert_eq!(node.routing_table().count(), 1);

        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn negative_broken_socket_backs_off() {
        let reads = Arc::new(AtomicUsize::new(0));
        let node = Node::new(Bitmap::rand());
        node.connect(
            Socket::new(BrokenSocket {
                reads: reads.clone(),
            })
            .unwrap(),
        );

        let period = Duration::from_secs(1);
        time::sleep(period).await;

        let count = reads.load(Ordering::SeqCst);
        assert!(count >= 2);
        assert!(count <= 1 + (period.as_millis() / SOCKET_ERROR_BACKOFF.as_millis()) as usize);

        node.shutdown().await;

        // The reader is gone, and the socket with it.
        assert_eq!(Arc::strong_count(&reads), 1);
        let count = reads.load(Ordering::SeqCst);
        time::sleep(period).await;
        assert_eq!(reads.load(Ordering::SeqCst), count);
    }

    #[tokio::test(start_paused = true)]
    async fn positive_groomer_refreshes_stale_buckets() {
        let (node, mut remote) = start_node();
        let start = Instant::now();
        let peer = test::dummy_contact();
        node.routing_table().update(peer);

        // Fresh buckets are left alone.
        assert!(time::timeout(T_REFRESH, remote.outgoing.recv())
            .await
            .is_err());

        // Each pass looks up a random id in the stale bucket, and the silent peer fails.
        for _ in 0..MAX_PEER_FAILS {
            let (data, addr) = time::timeout(T_REFRESH, remote.outgoing.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(addr, peer.addr());
            match Message::decode(&data).unwrap() {
                Message::Request(request) => assert_eq!(request.method, Method::FindNode),
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert!(start.elapsed() > T_REFRESH);

        time::sleep(UDP_TIMEOUT * 2).await;
        assert_eq!(node.transaction_count(), 0);

        // The peer is bad now, so a newcomer takes its slot in the full bucket.
        for _ in 0..BUCKET_SIZE - 1 {
            node.routing_table().update(test::dummy_contact());
        }
        let newcomer = test::dummy_contact();
        node.routing_table().update(newcomer);

        let contacts = node.routing_table().get_closest(&Bitmap::ZERO, usize::MAX);
        assert_eq!(contacts.len(), BUCKET_SIZE);
        assert!(contacts.contains(&newcomer));
        assert!(!contacts.contains(&peer));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn negative_send_to_self() {
        let (node, _remote) = start_node();
        let own = node.contact().unwrap();

        assert!(node
            .send(own, Request::ping(), SendOptions::default())
            .await
            .is_none());

        node.shutdown().await;
    }
}
