//! Operational JSON RPC interface.
//!
//! Every request is a single line holding a JSON object such as
//! `{"id": 1, "method": "IterativeFindValue", "params": {"key": "<hex>"}}`. Every response is
//! a single line holding `{"id": 1, "result": ...}` or `{"id": 1, "error": "..."}`.

use crate::{
    bits::Bitmap,
    contact::Contact,
    dht::Dht,
    error::Error,
    message::{Request, PING_SUCCESS_RESPONSE},
    node::SendOptions,
    SOCKET_ERROR_BACKOFF,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RpcRequest {
    Ping(RpcPingArgs),
    FindNode(RpcFindArgs),
    FindValue(RpcFindArgs),
    IterativeFindValue { key: String },
    GetRoutingTable,
    #[serde(rename = "GetNodeID")]
    GetNodeId,
    PrintBucketInfo,
    AddKnownNode(RpcContact),
}

/// Who to ping: a known contact, whose id is checked, or any node at `host:port`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcPingArgs {
    Contact {
        node_id: String,
        ip: IpAddr,
        port: u16,
    },
    Address {
        address: String,
    },
}

/// Query `key` at a single node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFindArgs {
    pub key: String,
    pub node_id: String,
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcContact {
    pub id: String,
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub peer_port: u16,
}

impl From<&Contact> for RpcContact {
    fn from(contact: &Contact) -> Self {
        Self {
            id: contact.id.hex(),
            ip: contact.ip,
            port: contact.port,
            peer_port: contact.peer_port,
        }
    }
}

impl TryFrom<&RpcContact> for Contact {
    type Error = Error;

    fn try_from(contact: &RpcContact) -> Result<Self, Error> {
        Ok(Contact::new(
            Bitmap::from_hex(&contact.id)?,
            SocketAddr::new(contact.ip, contact.port),
        )
        .with_peer_port(contact.peer_port))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFindValueResult {
    pub contacts: Vec<RpcContact>,
    /// The key, if the node had values for it.
    pub value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcIterativeFindValueResult {
    pub contacts: Vec<RpcContact>,
    pub found_value: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcBucket {
    pub start: String,
    pub end: String,
    pub num_contacts: usize,
    pub contacts: Vec<RpcContact>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRoutingTable {
    pub node_id: String,
    pub num_buckets: usize,
    pub buckets: Vec<RpcBucket>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) async fn serve(dht: Dht, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                log::debug!("[{}] RPC connection from {}", dht.id().hex_short(), addr);
                let connection = dht.clone();
                dht.stop_group().spawn(async move {
                    if let Err(error) = handle_connection(&connection, stream).await {
                        log::debug!(
                            "[{}] RPC connection from {} failed: {}",
                            connection.id().hex_short(),
                            addr,
                            error
                        );
                    }
                });
            }
            Err(error) => {
                log::warn!("[{}] RPC accept failed: {}", dht.id().hex_short(), error);
                time::sleep(SOCKET_ERROR_BACKOFF).await;
            }
        }
    }
}

async fn handle_connection(dht: &Dht, stream: TcpStream) -> Result<(), Error> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(dht, &line).await;
        let mut data = serde_json::to_vec(&response)?;
        data.push(b'\n');
        writer.write_all(&data).await?;
    }

    Ok(())
}

async fn handle_line(dht: &Dht, line: &str) -> RpcResponse {
    let mut value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(error) => {
            return RpcResponse {
                id: Value::Null,
                result: None,
                error: Some(error.to_string()),
            }
        }
    };

    let id = value
        .as_object_mut()
        .and_then(|object| object.remove("id"))
        .unwrap_or(Value::Null);
    let result = match serde_json::from_value::<RpcRequest>(value) {
        Ok(request) => handle(dht, request).await,
        Err(error) => Err(Error::from(error)),
    };

    match result {
        Ok(result) => RpcResponse {
            id,
            result: Some(result),
            error: None,
        },
        Err(error) => RpcResponse {
            id,
            result: None,
            error: Some(error.to_string()),
        },
    }
}

async fn handle(dht: &Dht, request: RpcRequest) -> Result<Value, Error> {
    let node = dht.node();

    let result = match request {
        RpcRequest::Ping(RpcPingArgs::Address { address }) => {
            dht.ping(&address).await?;
            serde_json::to_value(PING_SUCCESS_RESPONSE)?
        }
        RpcRequest::Ping(RpcPingArgs::Contact { node_id, ip, port }) => {
            let contact = Contact::new(Bitmap::from_hex(&node_id)?, SocketAddr::new(ip, port));

            match node
                .send(contact, Request::ping(), SendOptions::default())
                .await
            {
                Some(response) if response.data() == Some(PING_SUCCESS_RESPONSE) => {
                    serde_json::to_value(PING_SUCCESS_RESPONSE)?
                }
                _ => return Err(Error::NoResponse(contact.to_string())),
            }
        }
        RpcRequest::FindNode(args) => {
            let key = Bitmap::from_hex(&args.key)?;
            let contact = Contact::new(
                Bitmap::from_hex(&args.node_id)?,
                SocketAddr::new(args.ip, args.port),
            );

            let contacts: Vec<RpcContact> = node
                .send(contact, Request::find_node(key), SendOptions::default())
                .await
                .map(|response| response.contacts().iter().map(RpcContact::from).collect())
                .unwrap_or_default();
            serde_json::to_value(contacts)?
        }
        RpcRequest::FindValue(args) => {
            let key = Bitmap::from_hex(&args.key)?;
            let contact = Contact::new(
                Bitmap::from_hex(&args.node_id)?,
                SocketAddr::new(args.ip, args.port),
            );

            let response = node
                .send(contact, Request::find_value(key), SendOptions::default())
                .await
                .ok_or_else(|| Error::NoResponse(contact.to_string()))?;

            serde_json::to_value(RpcFindValueResult {
                contacts: response.contacts().iter().map(RpcContact::from).collect(),
                value: response.is_value().then(|| key.hex()),
            })?
        }
        RpcRequest::IterativeFindValue { key } => {
            let key = Bitmap::from_hex(&key)?;
            let (contacts, found_value) = dht.find_contacts(key, true).await?;

            serde_json::to_value(RpcIterativeFindValueResult {
                contacts: contacts.iter().map(RpcContact::from).collect(),
                found_value,
            })?
        }
        RpcRequest::GetRoutingTable => {
            let buckets: Vec<_> = node
                .routing_table()
                .buckets()
                .into_iter()
                .map(|(range, contacts)| RpcBucket {
                    start: range.start.hex(),
                    end: range.end.hex(),
                    num_contacts: contacts.len(),
                    contacts: contacts.iter().map(RpcContact::from).collect(),
                })
                .collect();

            serde_json::to_value(RpcRoutingTable {
                node_id: dht.id().hex(),
                num_buckets: buckets.len(),
                buckets,
            })?
        }
        RpcRequest::GetNodeId => serde_json::to_value(dht.id().hex())?,
        RpcRequest::PrintBucketInfo => {
            let info = node.routing_table().bucket_info();
            for line in info.lines() {
                log::info!("{}", line);
            }
            serde_json::to_value(info)?
        }
        RpcRequest::AddKnownNode(contact) => {
            node.routing_table().update(Contact::try_from(&contact)?);
            Value::Null
        }
    };

    Ok(result)
}
