use crate::{
    announce::{AnnounceConfig, Announcer},
    bits::Bitmap,
    builder::DhtBuilder,
    contact::Contact,
    error::Error,
    finder,
    message::{Request, PING_SUCCESS_RESPONSE},
    node::{Node, SendOptions},
    routing::RoutingTable,
    rpc,
    socket::{Socket, SocketTrait},
    stop::StopGroup,
};
use futures_util::future;
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::{
    net::{self, TcpListener},
    sync::watch,
    time::{self, Instant},
};

/// A node of the distributed hash table.
///
/// This type is cheaply cloneable where each clone refers to the same underlying DHT
/// instance. Background tasks keep it alive until `shutdown` is called.
#[derive(Clone)]
pub struct Dht {
    inner: Arc<Inner>,
}

struct Inner {
    node: Node,
    contact: Contact,
    announcer: Announcer,
    joined: watch::Receiver<bool>,
    rpc_addr: Option<SocketAddr>,
    stop: StopGroup,
}

impl Dht {
    /// Create a new DhtBuilder.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    pub(crate) async fn with_builder<S>(builder: DhtBuilder, socket: S) -> Result<Self, Error>
    where
        S: SocketTrait + Send + Sync + 'static,
    {
        let node = match &builder.routing_table_json {
            Some(json) => {
                let table = RoutingTable::from_json(json)?;
                if let Some(id) = builder.node_id.filter(|id| *id != table.id()) {
                    log::warn!(
                        "[{}] ignoring node id {}, using the saved one",
                        table.id().hex_short(),
                        id.hex_short()
                    );
                }
                Node::with_routing_table(table)
            }
            None => Node::new(builder.node_id.unwrap_or_else(Bitmap::rand)),
        };

        let socket = Socket::new(socket)?;
        let contact = Contact::new(node.id(), socket.local_addr())
            .with_peer_port(builder.peer_protocol_port);

        let rpc_listener = match builder.rpc_port {
            Some(port) => Some(TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?),
            None => None,
        };
        let rpc_addr = match &rpc_listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        node.connect(socket);

        let stop = StopGroup::new();
        let announcer = Announcer::start(
            node.clone(),
            AnnounceConfig {
                rate: builder.announce_rate,
                burst: builder.announce_burst,
                reannounce_time: builder.reannounce_time,
                peer_port: builder.peer_protocol_port,
                notifications: builder.announce_notifications,
            },
            &stop,
        );

        let (joined_tx, joined_rx) = watch::channel(false);

        let dht = Self {
            inner: Arc::new(Inner {
                node,
                contact,
                announcer,
                joined: joined_rx,
                rpc_addr,
                stop,
            }),
        };

        let joining = dht.clone();
        let seeds = builder.seed_nodes;
        dht.inner.stop.spawn(async move {
            joining.join(&seeds).await;
            joined_tx.send_replace(true);
        });

        if let Some(interval) = builder.print_state_interval {
            let printer = dht.clone();
            dht.inner.stop.spawn(async move {
                let mut ticker = time::interval_at(Instant::now() + interval, interval);
                loop {
                    ticker.tick().await;
                    printer.print_state();
                }
            });
        }

        if let Some(listener) = rpc_listener {
            log::info!(
                "[{}] RPC server listening on {}",
                dht.id().hex_short(),
                rpc_addr.map(|addr| addr.to_string()).unwrap_or_default()
            );
            dht.inner.stop.spawn(rpc::serve(dht.clone(), listener));
        }

        Ok(dht)
    }

    async fn join(&self, seeds: &[String]) {
        let id = self.id();
        log::debug!("[{}] joining network", id.hex_short());

        // Seed ids are unknown until they answer.
        let requests = seeds.iter().map(|seed| async move {
            let addrs = match resolve(seed).await {
                Ok(addrs) => addrs,
                Err(error) => {
                    log::error!("[{}] join: {}", id.hex_short(), error);
                    return false;
                }
            };

            let responses = future::join_all(addrs.into_iter().map(|addr| {
                self.inner.node.send(
                    Contact::new(Bitmap::rand(), addr),
                    Request::find_node(id),
                    SendOptions {
                        skip_id_check: true,
                    },
                )
            }))
            .await;

            responses.iter().any(Option::is_some)
        });

        let responded = future::join_all(requests).await;

        if !responded.into_iter().any(|responded| responded) {
            if !seeds.is_empty() {
                log::error!("[{}] join: no seed nodes responded", id.hex_short());
            }
            return;
        }

        if let Err(error) = self.find_contacts(id, false).await {
            log::error!("[{}] join: {}", id.hex_short(), error);
        }

        log::debug!(
            "[{}] DHT ready on {} ({} nodes found during join)",
            id.hex_short(),
            self.inner.contact.addr(),
            self.inner.node.routing_table().count()
        );
    }

    /// Waits until joining the network completed, successfully or not.
    pub async fn wait_until_joined(&self) {
        let mut joined = self.inner.joined.clone();
        // Errs only if the join task was cancelled by a shutdown.
        let _ = joined.wait_for(|joined| *joined).await;
    }

    pub fn id(&self) -> Bitmap {
        self.inner.node.id()
    }

    /// Our own contact, carrying the peer protocol port.
    pub fn contact(&self) -> Contact {
        self.inner.contact
    }

    /// Address of the RPC server, if one was configured.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.inner.rpc_addr
    }

    pub(crate) fn node(&self) -> &Node {
        &self.inner.node
    }

    pub(crate) fn stop_group(&self) -> &StopGroup {
        &self.inner.stop
    }

    /// Pings the node at `addr` (`host:port`), whoever it is.
    pub async fn ping(&self, addr: &str) -> Result<(), Error> {
        let addr = resolve(addr)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidAddress(addr.to_owned()))?;

        let response = self
            .inner
            .node
            .send(
                Contact::new(Bitmap::rand(), addr),
                Request::ping(),
                SendOptions {
                    skip_id_check: true,
                },
            )
            .await;

        match response {
            Some(response) if response.data() == Some(PING_SUCCESS_RESPONSE) => Ok(()),
            _ => Err(Error::NoResponse(addr.to_string())),
        }
    }

    /// Returns the peers that announced having the blob with the given hash.
    pub async fn get(&self, hash: Bitmap) -> Result<Vec<Contact>, Error> {
        let (contacts, found) = self.find_contacts(hash, true).await?;
        Ok(if found { contacts } else { Vec::new() })
    }

    /// Iterative lookup of `target`. See `get` for the value lookup.
    pub async fn find_contacts(
        &self,
        target: Bitmap,
        find_value: bool,
    ) -> Result<(Vec<Contact>, bool), Error> {
        if self.inner.stop.is_stopped() {
            return Err(Error::Shutdown);
        }

        finder::find_contacts(&self.inner.node, target, find_value, Some(&self.inner.stop)).await
    }

    /// Starts announcing that this node has the blob with the given hash, and keeps
    /// announcing it periodically.
    pub fn add(&self, hash: Bitmap) {
        self.inner.announcer.add(hash);
    }

    /// Stops announcing the given hash.
    pub fn remove(&self, hash: Bitmap) {
        self.inner.announcer.remove(hash);
    }

    /// Routing table in the form accepted by `DhtBuilder::set_routing_table_json`.
    pub fn routing_table_json(&self) -> Result<String, Error> {
        self.inner.node.routing_table().to_json()
    }

    pub fn print_state(&self) {
        let node = &self.inner.node;

        log::info!("DHT node {}", self.inner.contact);
        log::info!("Outstanding transactions: {}", node.transaction_count());
        log::info!("Stored hashes: {}", node.store().count_stored_hashes());
        log::info!("Buckets: {}", node.routing_table().len());
        for line in node.routing_table().bucket_info().lines() {
            log::info!("{}", line);
        }
    }

    pub async fn shutdown(&self) {
        log::debug!("[{}] DHT shutting down", self.id().hex_short());
        self.inner.stop.stop_and_wait().await;
        self.inner.node.shutdown().await;
        log::debug!("[{}] DHT stopped", self.id().hex_short());
    }
}

async fn resolve(addr: &str) -> Result<Vec<SocketAddr>, Error> {
    let addrs: Vec<_> = net::lookup_host(addr)
        .await
        .map_err(|_| Error::InvalidAddress(addr.to_owned()))?
        // The protocol is IPv4 only.
        .filter(SocketAddr::is_ipv4)
        .collect();

    if addrs.is_empty() {
        Err(Error::InvalidAddress(addr.to_owned()))
    } else {
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn start(seeds: Vec<String>) -> Dht {
        Dht::builder()
            .set_address((Ipv4Addr::LOCALHOST, 0).into())
            .set_seed_nodes(seeds)
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn positive_join_without_seeds() {
        let dht = start(vec![]).await;

        time::timeout(Duration::from_secs(5), dht.wait_until_joined())
            .await
            .unwrap();
        assert_eq!(dht.node().routing_table().count(), 0);
        assert!(matches!(
            dht.find_contacts(Bitmap::rand(), false).await,
            Err(Error::NoContacts)
        ));

        dht.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn positive_ping() {
        let a = start(vec![]).await;
        let b = start(vec![]).await;

        a.ping(&b.contact().addr().to_string()).await.unwrap();
        assert_eq!(a.node().routing_table().get_closest(&b.id(), 1)[0].id, b.id());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn negative_ping_invalid_address() {
        let dht = start(vec![]).await;

        assert!(matches!(
            dht.ping("not an address").await,
            Err(Error::InvalidAddress(_))
        ));

        dht.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn positive_join_through_seed() {
        let seed = start(vec![]).await;
        let dht = start(vec![seed.contact().addr().to_string()]).await;

        time::timeout(Duration::from_secs(10), dht.wait_until_joined())
            .await
            .unwrap();
        assert_eq!(
            dht.node().routing_table().get_closest(&seed.id(), 1),
            vec![Contact::new(seed.id(), seed.contact().addr())]
        );

        dht.shutdown().await;
        seed.shutdown().await;
    }

    #[tokio::test]
    async fn positive_restore_routing_table() {
        let dht = start(vec![]).await;
        for _ in 0..5 {
            dht.node()
                .routing_table()
                .update(crate::test::dummy_contact());
        }
        let json = dht.routing_table_json().unwrap();
        dht.shutdown().await;

        let restored = Dht::builder()
            .set_address((Ipv4Addr::LOCALHOST, 0).into())
            .set_seed_nodes(Vec::<String>::new())
            .set_node_id(Bitmap::rand())
            .set_routing_table_json(json)
            .start()
            .await
            .unwrap();

        assert_eq!(restored.id(), dht.id());
        assert_eq!(restored.node().routing_table().count(), 5);

        restored.shutdown().await;
    }
}
