use crate::{
    bits::{byte_array, Bitmap},
    compact,
    contact::Contact,
};
use rand::Rng;
use serde::{
    de::{Deserializer, Error as _, IgnoredAny, MapAccess, SeqAccess, Visitor},
    ser::{SerializeMap, SerializeSeq, Serializer},
    Deserialize, Serialize,
};
use serde_bencode::value::Value;
use serde_bytes::{ByteBuf, Bytes};
use std::fmt;
use thiserror::Error;

pub(crate) const REQUEST_TYPE: u8 = 0;
pub(crate) const RESPONSE_TYPE: u8 = 1;
pub(crate) const ERROR_TYPE: u8 = 2;

pub(crate) const PING_SUCCESS_RESPONSE: &str = "pong";
pub(crate) const STORE_SUCCESS_RESPONSE: &str = "OK";

const TYPE_FIELD: &str = "0";
const MESSAGE_ID_FIELD: &str = "1";
const NODE_ID_FIELD: &str = "2";
const PAYLOAD_FIELD: &str = "3";
const ARGS_FIELD: &str = "4";
const CONTACTS_FIELD: &str = "contacts";
const TOKEN_FIELD: &str = "token";

pub(crate) const MESSAGE_ID_LEN: usize = 20;

/// Error decoding an incoming datagram.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not a dht message")]
    InvalidPrefix,
    #[error("unknown message type {0:?}")]
    UnknownType(char),
    #[error("malformed message")]
    Bencode(#[from] serde_bencode::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    Request(Request),
    Response(Response),
    Error(ErrorMessage),
}

impl Message {
    /// Decodes a datagram. The message type is picked from the type digit before the rest of
    /// the message is looked at.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if !data.starts_with(b"d1:0i") && !data.starts_with(b"di0ei") {
            return Err(DecodeError::InvalidPrefix);
        }

        match data.get(5).copied().unwrap_or_default() {
            b'0' => Ok(Self::Request(serde_bencode::from_bytes(data)?)),
            b'1' => Ok(Self::Response(serde_bencode::from_bytes(data)?)),
            b'2' => Ok(Self::Error(serde_bencode::from_bytes(data)?)),
            other => Err(DecodeError::UnknownType(other as char)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        match self {
            Self::Request(request) => serde_bencode::to_bytes(request),
            Self::Response(response) => serde_bencode::to_bytes(response),
            Self::Error(error) => serde_bencode::to_bytes(error),
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<ErrorMessage> for Message {
    fn from(error: ErrorMessage) -> Self {
        Self::Error(error)
    }
}

/// Random id correlating a request with its response.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) struct MessageId(#[serde(with = "byte_array")] [u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn rand() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl From<[u8; MESSAGE_ID_LEN]> for MessageId {
    fn from(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Method {
    Ping,
    Store,
    FindNode,
    FindValue,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Store => "store",
            Self::FindNode => "findNode",
            Self::FindValue => "findValue",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Method {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        match name.as_str() {
            "ping" => Ok(Self::Ping),
            "store" => Ok(Self::Store),
            "findNode" => Ok(Self::FindNode),
            "findValue" => Ok(Self::FindValue),
            _ => Err(D::Error::custom(format!("unknown method {:?}", name))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub(crate) struct Request {
    #[serde(rename = "1")]
    pub id: MessageId,
    #[serde(rename = "2")]
    pub node_id: Bitmap,
    #[serde(rename = "3")]
    pub method: Method,
    #[serde(rename = "4", default)]
    pub args: RequestArgs,
}

impl Request {
    fn new(method: Method, args: RequestArgs) -> Self {
        // Both ids get overwritten by the sending node.
        Self {
            id: MessageId::rand(),
            node_id: Bitmap::ZERO,
            method,
            args,
        }
    }

    pub fn ping() -> Self {
        Self::new(Method::Ping, RequestArgs::Empty)
    }

    pub fn find_node(target: Bitmap) -> Self {
        Self::new(Method::FindNode, RequestArgs::Target(target))
    }

    pub fn find_value(target: Bitmap) -> Self {
        Self::new(Method::FindValue, RequestArgs::Target(target))
    }

    pub fn store(args: StoreArgs) -> Self {
        Self::new(Method::Store, RequestArgs::Store(args))
    }
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(5))?;
        map.serialize_entry(TYPE_FIELD, &REQUEST_TYPE)?;
        map.serialize_entry(MESSAGE_ID_FIELD, &self.id)?;
        map.serialize_entry(NODE_ID_FIELD, &self.node_id)?;
        map.serialize_entry(PAYLOAD_FIELD, &self.method)?;
        map.serialize_entry(ARGS_FIELD, &self.args)?;
        map.end()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.method)?;
        match &self.args {
            RequestArgs::Empty => Ok(()),
            RequestArgs::Target(target) => write!(f, "({})", target.hex_short()),
            RequestArgs::Store(args) => write!(
                f,
                "({}, {}:{})",
                args.blob_hash.hex_short(),
                args.value.lbry_id.hex_short(),
                args.value.port
            ),
        }
    }
}

/// Request arguments. On the wire always a list: empty for `ping`, the target for `findNode`
/// and `findValue`, four elements for `store`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RequestArgs {
    Empty,
    Target(Bitmap),
    Store(StoreArgs),
}

impl Default for RequestArgs {
    fn default() -> Self {
        Self::Empty
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StoreArgs {
    pub blob_hash: Bitmap,
    pub value: StoreArgsValue,
    pub node_id: Bitmap,
    pub self_store: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoreArgsValue {
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
    #[serde(rename = "lbryid")]
    pub lbry_id: Bitmap,
    pub port: u16,
}

impl Serialize for RequestArgs {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Empty => s.serialize_seq(Some(0))?.end(),
            Self::Target(target) => {
                let mut seq = s.serialize_seq(Some(1))?;
                seq.serialize_element(target)?;
                seq.end()
            }
            Self::Store(args) => {
                let mut seq = s.serialize_seq(Some(4))?;
                seq.serialize_element(&args.blob_hash)?;
                seq.serialize_element(&args.value)?;
                seq.serialize_element(&args.node_id)?;
                seq.serialize_element(&u8::from(args.self_store))?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for RequestArgs {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct ArgsVisitor;

        impl<'de> Visitor<'de> for ArgsVisitor {
            type Value = RequestArgs;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a list of request arguments")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let first: Bitmap = match seq.next_element()? {
                    Some(first) => first,
                    None => return Ok(RequestArgs::Empty),
                };

                let value: StoreArgsValue = match seq.next_element()? {
                    Some(value) => value,
                    None => return Ok(RequestArgs::Target(first)),
                };

                let node_id: Bitmap = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(2, &self))?;
                let self_store: i64 = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(3, &self))?;

                let self_store = match self_store {
                    0 => false,
                    1 => true,
                    _ => return Err(A::Error::custom("self store must be 0 or 1")),
                };

                if seq.next_element::<IgnoredAny>()?.is_some() {
                    return Err(A::Error::invalid_length(5, &self));
                }

                Ok(RequestArgs::Store(StoreArgs {
                    blob_hash: first,
                    value,
                    node_id,
                    self_store,
                }))
            }
        }

        d.deserialize_seq(ArgsVisitor)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub(crate) struct Response {
    #[serde(rename = "1")]
    pub id: MessageId,
    #[serde(rename = "2")]
    pub node_id: Bitmap,
    #[serde(rename = "3")]
    pub payload: Payload,
}

impl Response {
    pub fn new(request: &Request, node_id: Bitmap, payload: Payload) -> Self {
        Self {
            id: request.id,
            node_id,
            payload,
        }
    }

    /// Contacts carried by the response: values for a `findValue` hit, closest contacts
    /// otherwise.
    pub fn contacts(&self) -> &[Contact] {
        match &self.payload {
            Payload::Data(_) => &[],
            Payload::Contacts(contacts)
            | Payload::Value { contacts, .. }
            | Payload::Closest { contacts, .. } => contacts,
        }
    }

    pub fn token(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Value { token, .. } | Payload::Closest { token, .. } => Some(token),
            _ => None,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self.payload, Payload::Value { .. })
    }

    pub fn data(&self) -> Option<&str> {
        match &self.payload {
            Payload::Data(data) => Some(data),
            _ => None,
        }
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(4))?;
        map.serialize_entry(TYPE_FIELD, &RESPONSE_TYPE)?;
        map.serialize_entry(MESSAGE_ID_FIELD, &self.id)?;
        map.serialize_entry(NODE_ID_FIELD, &self.node_id)?;
        map.serialize_entry(PAYLOAD_FIELD, &self.payload)?;
        map.end()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Payload {
    /// `ping` and `store` replies.
    Data(String),
    /// `findNode` reply.
    Contacts(Vec<Contact>),
    /// `findValue` reply with the contacts that announced `key`.
    Value {
        key: Bitmap,
        contacts: Vec<Contact>,
        token: Vec<u8>,
    },
    /// `findValue` reply without a value.
    Closest { contacts: Vec<Contact>, token: Vec<u8> },
}

struct CompactContacts<'a>(&'a [Contact]);

impl Serialize for CompactContacts<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        compact::contacts::serialize(self.0, s)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Data(data) => s.serialize_str(data),
            Self::Contacts(contacts) => contacts.serialize(s),
            Self::Value {
                key,
                contacts,
                token,
            } => {
                let mut map = s.serialize_map(Some(2))?;
                map.serialize_entry(Bytes::new(key.as_ref()), &CompactContacts(contacts))?;
                map.serialize_entry(TOKEN_FIELD, Bytes::new(token))?;
                map.end()
            }
            Self::Closest { contacts, token } => {
                let mut map = s.serialize_map(Some(2))?;
                map.serialize_entry(CONTACTS_FIELD, contacts)?;
                map.serialize_entry(TOKEN_FIELD, Bytes::new(token))?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct PayloadVisitor;

        impl<'de> Visitor<'de> for PayloadVisitor {
            type Value = Payload;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a string, a list of contacts or a dict")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(Payload::Data(String::from_utf8_lossy(v).into_owned()))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(Payload::Data(v.to_owned()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut contacts = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(contact) = seq.next_element()? {
                    contacts.push(contact);
                }

                Ok(Payload::Contacts(contacts))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut token = Vec::new();
                let mut closest = None;
                let mut value = None;

                while let Some(key) = map.next_key::<ByteBuf>()? {
                    if &key[..] == TOKEN_FIELD.as_bytes() {
                        token = map.next_value::<ByteBuf>()?.into_vec();
                    } else if &key[..] == CONTACTS_FIELD.as_bytes() {
                        closest = Some(map.next_value::<Vec<Contact>>()?);
                    } else if value.is_none() && key.len() == crate::bits::NUM_BYTES {
                        let key = Bitmap::try_from(&key[..]).map_err(A::Error::custom)?;
                        let contacts = map.next_value::<CompactContactList>()?.0;
                        value = Some((key, contacts));
                    } else {
                        map.next_value::<IgnoredAny>()?;
                    }
                }

                Ok(match (value, closest) {
                    (Some((key, contacts)), _) => Payload::Value {
                        key,
                        contacts,
                        token,
                    },
                    (None, contacts) => Payload::Closest {
                        contacts: contacts.unwrap_or_default(),
                        token,
                    },
                })
            }
        }

        d.deserialize_any(PayloadVisitor)
    }
}

struct CompactContactList(Vec<Contact>);

impl<'de> Deserialize<'de> for CompactContactList {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        compact::contacts::deserialize(d).map(Self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub(crate) struct ErrorMessage {
    #[serde(rename = "1")]
    pub id: MessageId,
    #[serde(rename = "2")]
    pub node_id: Bitmap,
    #[serde(rename = "3")]
    pub exception_type: String,
    #[serde(rename = "4", default, deserialize_with = "deserialize_error_args")]
    pub response: Vec<String>,
}

impl ErrorMessage {
    pub fn new(request: &Request, node_id: Bitmap, exception_type: &str) -> Self {
        Self {
            id: request.id,
            node_id,
            exception_type: exception_type.to_owned(),
            response: Vec::new(),
        }
    }
}

impl Serialize for ErrorMessage {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(5))?;
        map.serialize_entry(TYPE_FIELD, &ERROR_TYPE)?;
        map.serialize_entry(MESSAGE_ID_FIELD, &self.id)?;
        map.serialize_entry(NODE_ID_FIELD, &self.node_id)?;
        map.serialize_entry(PAYLOAD_FIELD, &self.exception_type)?;
        map.serialize_entry(ARGS_FIELD, &self.response)?;
        map.end()
    }
}

// Anything but a list yields no entries. List entries that are not strings get rendered.
fn deserialize_error_args<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    fn render(value: &Value) -> String {
        match value {
            Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Value::Int(int) => int.to_string(),
            Value::List(list) => {
                let items: Vec<_> = list.iter().map(render).collect();
                format!("[{}]", items.join(" "))
            }
            Value::Dict(_) => "map[]".to_owned(),
        }
    }

    match Value::deserialize(d)? {
        Value::List(list) => Ok(list.iter().map(render).collect()),
        _ => Ok(Vec::new()),
    }
}
