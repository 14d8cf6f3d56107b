use crate::{
    announce::AnnounceNotification, bits::Bitmap, dht::Dht, error::Error,
    DEFAULT_ANNOUNCE_BURST, DEFAULT_ANNOUNCE_RATE, DEFAULT_PEER_PORT, DEFAULT_PORT,
    DEFAULT_REANNOUNCE_TIME, SEED_NODES,
};
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc};

/// Stores information for initializing a DHT.
#[derive(Debug)]
pub struct DhtBuilder {
    pub(crate) address: SocketAddr,
    pub(crate) seed_nodes: Vec<String>,
    pub(crate) node_id: Option<Bitmap>,
    pub(crate) peer_protocol_port: u16,
    pub(crate) rpc_port: Option<u16>,
    pub(crate) reannounce_time: Duration,
    pub(crate) announce_rate: u32,
    pub(crate) announce_burst: u32,
    pub(crate) announce_notifications: Option<mpsc::UnboundedSender<AnnounceNotification>>,
    pub(crate) print_state_interval: Option<Duration>,
    pub(crate) routing_table_json: Option<String>,
}

impl Default for DhtBuilder {
    fn default() -> Self {
        Self {
            address: (Ipv4Addr::UNSPECIFIED, DEFAULT_PORT).into(),
            seed_nodes: SEED_NODES.iter().map(|seed| (*seed).to_owned()).collect(),
            node_id: None,
            peer_protocol_port: DEFAULT_PEER_PORT,
            rpc_port: None,
            reannounce_time: DEFAULT_REANNOUNCE_TIME,
            announce_rate: DEFAULT_ANNOUNCE_RATE,
            announce_burst: DEFAULT_ANNOUNCE_BURST,
            announce_notifications: None,
            print_state_interval: None,
            routing_table_json: None,
        }
    }
}

impl DhtBuilder {
    /// Address to bind the UDP socket to. Defaults to `0.0.0.0:4444`.
    pub fn set_address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    /// Nodes (as `host:port`) to join the network through. Defaults to the public LBRY seed
    /// nodes. An empty list starts a new network.
    pub fn set_seed_nodes<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seed_nodes = seeds.into_iter().map(Into::into).collect();
        self
    }

    /// Set the id of this node. If not provided, a random node id is generated.
    pub fn set_node_id(mut self, id: Bitmap) -> Self {
        self.node_id = Some(id);
        self
    }

    /// Port of the blob exchange protocol, announced along with our hashes. Defaults to 3333.
    pub fn set_peer_protocol_port(mut self, port: u16) -> Self {
        self.peer_protocol_port = port;
        self
    }

    /// Serve the JSON RPC interface on this TCP port. Port 0 picks a free one.
    pub fn set_rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = Some(port);
        self
    }

    /// How often every hash gets announced again. Defaults to 50 minutes.
    pub fn set_reannounce_time(mut self, reannounce_time: Duration) -> Self {
        self.reannounce_time = reannounce_time;
        self
    }

    /// Maximum number of announces per second. Defaults to 10.
    pub fn set_announce_rate(mut self, rate: u32) -> Self {
        self.announce_rate = rate;
        self
    }

    /// Seconds worth of announces that may go out back to back, so up to
    /// `announce_rate * announce_burst` at once. Defaults to 1.
    pub fn set_announce_burst(mut self, burst: u32) -> Self {
        self.announce_burst = burst;
        self
    }

    /// Receive a notification whenever an announce starts and finishes.
    pub fn set_announce_notifications(
        mut self,
        tx: mpsc::UnboundedSender<AnnounceNotification>,
    ) -> Self {
        self.announce_notifications = Some(tx);
        self
    }

    /// Log the state of the DHT periodically.
    pub fn set_print_state_interval(mut self, interval: Duration) -> Self {
        self.print_state_interval = Some(interval);
        self
    }

    /// Restore the routing table saved with `Dht::routing_table_json`. The saved node id
    /// takes precedence over the one given to `set_node_id`.
    pub fn set_routing_table_json(mut self, json: impl Into<String>) -> Self {
        self.routing_table_json = Some(json.into());
        self
    }

    /// Binds the socket and starts the DHT. Joining the network continues in the
    /// background, see `Dht::wait_until_joined`.
    pub async fn start(self) -> Result<Dht, Error> {
        let socket = UdpSocket::bind(self.address).await?;
        Dht::with_builder(self, socket).await
    }
}
