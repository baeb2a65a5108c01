use std::net::SocketAddr;

use thiserror::Error;

use crate::peer::message::MessageId;
use crate::peer::session::SessionState;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("failed to connect to peer {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("peer i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("malformed handshake response")]
    InvalidHandshake,

    #[error("handshake info hash does not match")]
    InfoHashMismatch,

    #[error("expected {expected:?} message, got id {actual}")]
    UnexpectedMessage { expected: MessageId, actual: u8 },

    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("message of {0} bytes exceeds frame limit")]
    MessageTooLarge(usize),

    #[error("piece message too short: {0} bytes")]
    MalformedPiece(usize),

    #[error(
        "block mismatch: requested piece {piece} offset {offset} length {length}, \
         got piece {got_piece} offset {got_offset} length {got_length}"
    )]
    BlockMismatch {
        piece: u32,
        offset: u32,
        length: u32,
        got_piece: u32,
        got_offset: u32,
        got_length: u32,
    },
}

impl PeerError {
    /// True for violations of the wire protocol, as opposed to transport
    /// failures.
    pub fn is_protocol_error(&self) -> bool {
        !matches!(
            self,
            PeerError::Connect { .. } | PeerError::Io(_) | PeerError::Timeout(_)
        )
    }
}
