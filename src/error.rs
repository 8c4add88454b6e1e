//! Error taxonomies callers branch on

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::environment::ReadyStatus;

/// Failure of an outbound HTTP call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid peer url: {0}")]
    InvalidUrl(String),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
    #[error("bad request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("peer answered with status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The call was aborted through its cancel handle. Never a failure.
    #[error("call cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

/// Failure to encode or decode a control dictionary.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("plist: {0}")]
    Plist(#[from] plist::Error),
    #[error("body is not a dictionary")]
    NotDictionary,
    #[error("capabilities: {0}")]
    Capabilities(#[from] serde_json::Error),
}

/// Reasons an inbound `/Ask` is refused before any listener sees it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AskError {
    #[error("missing SenderID")]
    MissingSenderId,
    #[error("missing SenderComputerName")]
    MissingSenderName,
    #[error("missing Files")]
    MissingFiles,
    #[error("Files is not an array")]
    FilesNotArray,
    #[error("Files is empty or has no usable entries")]
    NoFiles,
}

/// Reasons `AirDropManager::send` refuses to start.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("environment not ready: {0:?}")]
    NotReady(ReadyStatus),
    #[error("unknown peer")]
    UnknownPeer,
    #[error("peer does not speak AirDrop")]
    Unsupported,
    #[error("a transfer to this peer is already in progress")]
    Busy,
    #[error("nothing to send")]
    NoEntities,
    #[error("manager is shut down")]
    Shutdown,
}

/// Reasons discovery or the transfer server cannot start.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("environment not ready: {0:?}")]
    NotReady(ReadyStatus),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
