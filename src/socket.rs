//! Datagram socket abstraction, so nodes can run over something other than a real UDP socket.

use crate::{message::Message, UDP_MAX_MESSAGE_LEN, WRITE_TIMEOUT};
use async_trait::async_trait;
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{net::UdpSocket, time};

#[async_trait]
pub trait SocketTrait {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[derive(Clone)]
pub(crate) struct Socket(Arc<dyn SocketTrait + Send + Sync + 'static>, SocketAddr);

impl Socket {
    /// Fails for sockets not bound to an IPv4 address: the protocol carries IPv4 only.
    pub fn new<S: SocketTrait + Send + Sync + 'static>(inner: S) -> io::Result<Self> {
        let local_addr = inner.local_addr()?;

        if !local_addr.is_ipv4() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not an IPv4 address", local_addr),
            ));
        }

        Ok(Self(Arc::new(inner), local_addr))
    }

    /// Encodes and sends the message, giving up after the write timeout.
    pub async fn send(&self, message: &Message, addr: SocketAddr) -> io::Result<()> {
        let data = message
            .encode()
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;

        if data.len() > UDP_MAX_MESSAGE_LEN {
            log::error!(
                "sending {} byte message to {}, larger than the {} byte limit",
                data.len(),
                addr,
                UDP_MAX_MESSAGE_LEN
            );
        }

        // A partially sent datagram is useless, so there is no point retrying the rest.
        time::timeout(WRITE_TIMEOUT, self.0.send_to(&data, &addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.1
    }
}

#[async_trait]
impl SocketTrait for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, buf, target).await.map(|_| ())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
