//! Compact contact representation
//!
//! 4 bytes of IPv4 address, 2 bytes of big-endian peer port and the 48 byte node id. The
//! peer (TCP) port is encoded here, not the UDP port.

use crate::{
    bits::{Bitmap, NUM_BYTES},
    contact::Contact,
};
use std::{
    convert::{TryFrom, TryInto},
    net::{IpAddr, Ipv4Addr},
};

/// Length of a compact contact.
pub const COMPACT_CONTACT_LEN: usize = 4 + 2 + NUM_BYTES;

/// Encode a contact in compact form. Returns `None` if the contact is not IPv4.
pub fn encode_contact(contact: &Contact) -> Option<[u8; COMPACT_CONTACT_LEN]> {
    let ip = match contact.ip {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped()?,
    };

    let mut buffer = [0u8; COMPACT_CONTACT_LEN];
    buffer[..4].copy_from_slice(&ip.octets());
    buffer[4..6].copy_from_slice(&contact.peer_port.to_be_bytes());
    buffer[6..].copy_from_slice(contact.id.as_ref());

    Some(buffer)
}

/// Decode a compact contact. The UDP port of the result is zero since the compact form does
/// not carry it.
pub fn decode_contact(src: &[u8]) -> Option<Contact> {
    if src.len() != COMPACT_CONTACT_LEN {
        return None;
    }

    let ip: [u8; 4] = src.get(..4)?.try_into().ok()?;
    let peer_port = u16::from_be_bytes(src.get(4..6)?.try_into().ok()?);
    let id = Bitmap::try_from(src.get(6..)?).ok()?;

    Some(Contact {
        id,
        ip: Ipv4Addr::from(ip).into(),
        port: 0,
        peer_port,
    })
}

/// Serialize/deserialize `Vec` of `Contact` as a list of compact byte strings.
pub(crate) mod contacts {
    use crate::contact::Contact;
    use serde::{
        de::{Deserializer, Error as _, SeqAccess, Visitor},
        ser::{Error as _, SerializeSeq, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::fmt;

    pub(crate) fn serialize<S>(contacts: &[Contact], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = s.serialize_seq(Some(contacts.len()))?;
        for contact in contacts {
            let encoded = super::encode_contact(contact)
                .ok_or_else(|| S::Error::custom("contact addr is not ipv4"))?;
            seq.serialize_element(Bytes::new(&encoded))?
        }
        seq.end()
    }

    pub(crate) fn deserialize<'de, D>(d: D) -> Result<Vec<Contact>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ContactsVisitor;

        impl<'de> Visitor<'de> for ContactsVisitor {
            type Value = Vec<Contact>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(
                    f,
                    "list of {} byte strings",
                    super::COMPACT_CONTACT_LEN
                )
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut output = Vec::with_capacity(seq.size_hint().unwrap_or(0));

                while let Some(bytes) = seq.next_element::<ByteBuf>()? {
                    let item = super::decode_contact(&bytes)
                        .ok_or_else(|| A::Error::invalid_length(bytes.len(), &self))?;
                    output.push(item);
                }

                Ok(output)
            }
        }

        d.deserialize_seq(ContactsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::net::Ipv6Addr;

    const ID_HEX: &str = "1c8aff71b99462464d9eeac639595ab99664be3482cb91a29d87467515c7d9158fe72aa1f1582dab07d8f8b5db277f41";

    #[test]
    fn positive_encode_contact() {
        let id = Bitmap::from_hex(ID_HEX).unwrap();
        let contact = Contact {
            id,
            ip: Ipv4Addr::new(1, 2, 3, 4).into(),
            port: 4444,
            peer_port: 55 * 256 + 66,
        };

        let encoded = encode_contact(&contact).unwrap();

        assert_eq!(encoded.len(), 54);
        assert_eq!(encoded[..6], [1, 2, 3, 4, 0x37, 0x42]);
        assert_eq!(encoded[6..], *id.as_ref());
    }

    #[test]
    fn positive_decode_contact() {
        let id = Bitmap::rand();
        let contact = Contact {
            id,
            ip: Ipv4Addr::new(10, 9, 8, 7).into(),
            port: 4444,
            peer_port: 3333,
        };

        let decoded = decode_contact(&encode_contact(&contact).unwrap()).unwrap();

        assert_eq!(decoded.id, contact.id);
        assert_eq!(decoded.ip, contact.ip);
        assert_eq!(decoded.peer_port, contact.peer_port);
        assert_eq!(decoded.port, 0);
    }

    #[test]
    fn negative_decode_contact() {
        assert!(decode_contact(&[0u8; COMPACT_CONTACT_LEN - 1]).is_none());
        assert!(decode_contact(&[0u8; COMPACT_CONTACT_LEN + 1]).is_none());
    }

    #[test]
    fn negative_encode_ipv6() {
        let contact = Contact::new(Bitmap::rand(), (Ipv6Addr::LOCALHOST, 4444).into());
        assert!(encode_contact(&contact).is_none());
    }

    #[test]
    fn encode_decode_contacts() {
        #[derive(Debug, Serialize, Deserialize)]
        #[serde(transparent)]
        struct Wrapper {
            #[serde(with = "super::contacts")]
            contacts: Vec<Contact>,
        }

        let empty = serde_bencode::to_bytes(&Wrapper { contacts: vec![] }).unwrap();
        assert_eq!(empty, b"le");

        let contact = Contact::new(Bitmap::from([b'z'; 48]), (Ipv4Addr::LOCALHOST, 4444).into())
            .with_peer_port(6789);
        let encoded = serde_bencode::to_bytes(&Wrapper {
            contacts: vec![contact],
        })
        .unwrap();

        let mut expected = b"l54:".to_vec();
        expected.extend([127, 0, 0, 1, 26, 133]);
        expected.extend([b'z'; 48]);
        expected.push(b'e');
        assert_eq!(encoded, expected);

        let decoded: Wrapper = serde_bencode::from_bytes(&encoded).unwrap();
        assert_eq!(decoded.contacts.len(), 1);
        assert_eq!(decoded.contacts[0].id, contact.id);
        assert_eq!(decoded.contacts[0].peer_port, 6789);

        assert!(serde_bencode::from_bytes::<Wrapper>(b"l3:abce").is_err());
    }
}
