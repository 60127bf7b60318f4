//! Peer-to-peer networking: the framed wire protocol, the peer registry with
//! ban scoring, and the tokio connection loops.

pub mod peer;
pub mod protocol;

use thiserror::Error;

use crate::ser::SerError;

/// Errors from the P2P layer.
#[derive(Clone, Debug, Error)]
pub enum P2pError {
    #[error("malformed frame: {0}")]
    Frame(&'static str),
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
    #[error("protocol version mismatch")]
    VersionMismatch,
    #[error("peer genesis does not match ours")]
    GenesisMismatch,
    #[error("unexpected message during handshake")]
    UnexpectedMessage,
    #[error("peer is banned")]
    PeerBanned,
    #[error("request timed out")]
    PeerTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("socket error: {0}")]
    Io(String),
    #[error(transparent)]
    Ser(#[from] SerError),
}
