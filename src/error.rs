use crate::bits::BitmapError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no contacts in routing table")]
    NoContacts,
    #[error("no response from {0}")]
    NoResponse(String),
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("invalid saved contact {0:?}")]
    InvalidSavedContact(String),
    #[error("invalid node id")]
    InvalidNodeId(#[from] BitmapError),
    #[error("io error")]
    Io(#[from] io::Error),
    #[error("json error")]
    Json(#[from] serde_json::Error),
    #[error("dht is shut down")]
    Shutdown,
}
