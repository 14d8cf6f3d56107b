use crate::bits::Bitmap;
use serde::{
    de::{Deserializer, Error as _, IgnoredAny, SeqAccess, Visitor},
    ser::{SerializeSeq, Serializer},
    Deserialize, Serialize,
};
use serde_bytes::Bytes;
use std::{
    fmt,
    hash::{Hash, Hasher},
    net::{IpAddr, SocketAddr},
};

/// Reachable peer: its DHT id, the UDP address the DHT talks to and the TCP port it serves
/// blobs on.
///
/// Two contacts are equal when id, ip and udp port match. The peer port is not part of the
/// identity.
#[derive(Copy, Clone)]
pub struct Contact {
    pub id: Bitmap,
    pub ip: IpAddr,
    pub port: u16,
    pub peer_port: u16,
}

impl Contact {
    pub fn new(id: Bitmap, addr: SocketAddr) -> Self {
        Self {
            id,
            ip: addr.ip(),
            port: addr.port(),
            peer_port: 0,
        }
    }

    pub fn with_peer_port(mut self, peer_port: u16) -> Self {
        self.peer_port = peer_port;
        self
    }

    /// UDP address of the contact.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.ip == other.ip && self.port == other.port
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.id.hex_short(), self.addr())?;
        if self.peer_port != 0 {
            write!(f, "({})", self.peer_port)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Structured form: `[id, ip string, udp port]`.
impl Serialize for Contact {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(3))?;
        seq.serialize_element(Bytes::new(self.id.as_ref()))?;
        seq.serialize_element(&self.ip.to_string())?;
        seq.serialize_element(&self.port)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Contact {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct ContactVisitor;

        impl<'de> Visitor<'de> for ContactVisitor {
            type Value = Contact;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "list of node id, ip and port")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let id: Bitmap = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(0, &self))?;
                let ip: String = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(1, &self))?;
                let port: u16 = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(2, &self))?;

                if seq.next_element::<IgnoredAny>()?.is_some() {
                    return Err(A::Error::invalid_length(4, &self));
                }

                let ip = ip
                    .parse()
                    .map_err(|_| A::Error::custom(format!("invalid ip address {:?}", ip)))?;

                Ok(Contact {
                    id,
                    ip,
                    port,
                    peer_port: 0,
                })
            }
        }

        d.deserialize_seq(ContactVisitor)
    }
}
