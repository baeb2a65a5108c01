use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::peer::Peer;
use crate::peer::error::PeerError;
use crate::peer::handshake::{HANDSHAKE_LEN, Handshake};
use crate::peer::message::{Bitfield, Message, MessageId, PIECE_HEADER_LEN, PieceBlock};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest frame body accepted from a peer. A full block plus its header
/// fits with room to spare; bitfields for very large torrents do too.
pub const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Bytes in a Piece body ahead of the block data: the id plus the
/// index/offset header.
const PIECE_SKIP: usize = 1 + PIECE_HEADER_LEN;

/// Where a session is in the handshake sequence. Transitions only move
/// forward; any error moves the session to `Failed` for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    HandshakeDone,
    BitfieldReceived,
    InterestedSent,
    Unchoked,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Check that each Piece reply echoes the requested index, offset and
    /// length instead of trusting its position in the stream.
    pub verify_block_echo: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECTION_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            verify_block_echo: true,
        }
    }
}

/// One connection to one peer, driven strictly in sequence:
/// handshake, Bitfield, Interested, Unchoke, then block requests.
#[derive(Debug)]
pub struct PeerSession<S = TcpStream> {
    stream: S,
    peer: Option<Peer>,
    infohash: [u8; 20],
    peer_id: [u8; 20],
    config: SessionConfig,
    state: SessionState,
    remote_peer_id: Option<[u8; 20]>,
    bitfield: Option<Bitfield>,
}

impl PeerSession<TcpStream> {
    /// Opens a TCP connection to `peer`.
    pub async fn connect(
        peer: Peer,
        infohash: [u8; 20],
        peer_id: [u8; 20],
        config: SessionConfig,
    ) -> Result<Self, PeerError> {
        let addr = peer.socket_addr();
        debug!(%peer, "connecting");

        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Connect {
                addr,
                source: std::io::ErrorKind::TimedOut.into(),
            })?
            .map_err(|source| PeerError::Connect { addr, source })?;

        info!(%peer, "connected to peer");
        let mut session = Self::new(stream, infohash, peer_id, config);
        session.peer = Some(peer);
        Ok(session)
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already established transport.
    pub fn new(stream: S, infohash: [u8; 20], peer_id: [u8; 20], config: SessionConfig) -> Self {
        Self {
            stream,
            peer: None,
            infohash,
            peer_id,
            config,
            state: SessionState::Connected,
            remote_peer_id: None,
            bitfield: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> Option<Peer> {
        self.peer
    }

    pub fn remote_peer_id(&self) -> Option<&[u8; 20]> {
        self.remote_peer_id.as_ref()
    }

    pub fn bitfield(&self) -> Option<&Bitfield> {
        self.bitfield.as_ref()
    }

    /// Sends our 68-byte handshake and reads the peer's. Returns the remote
    /// peer id.
    pub async fn handshake(&mut self) -> Result<[u8; 20], PeerError> {
        self.expect_state(SessionState::Connected, "handshake")?;
        let result = self.exchange_handshake().await;
        self.settle(result, SessionState::HandshakeDone)
    }

    /// Reads the next message and fails unless its id is `expected`.
    ///
    /// Only the two waits of the startup sequence are valid: Bitfield right
    /// after the handshake and Unchoke after Interested.
    pub async fn await_message(&mut self, expected: MessageId) -> Result<Message, PeerError> {
        let next = match (self.state, expected) {
            (SessionState::HandshakeDone, MessageId::Bitfield) => SessionState::BitfieldReceived,
            (SessionState::InterestedSent, MessageId::Unchoke) => SessionState::Unchoked,
            (state, _) => {
                return Err(PeerError::InvalidState {
                    operation: "await message",
                    state,
                });
            }
        };

        let result = self.read_expected(expected).await;
        let message = self.settle(result, next)?;

        if message.kind == MessageId::Bitfield {
            let bitfield = Bitfield::from(message.payload.clone());
            debug!(pieces = bitfield.piece_count(), "peer bitfield");
            self.bitfield = Some(bitfield);
        }
        Ok(message)
    }

    pub async fn await_bitfield(&mut self) -> Result<Bitfield, PeerError> {
        let message = self.await_message(MessageId::Bitfield).await?;
        Ok(Bitfield::from(message.payload))
    }

    pub async fn await_unchoke(&mut self) -> Result<(), PeerError> {
        self.await_message(MessageId::Unchoke).await.map(|_| ())
    }

    /// Sends the fixed 5-byte Interested message.
    pub async fn send_interested(&mut self) -> Result<(), PeerError> {
        self.expect_state(SessionState::BitfieldReceived, "send interested")?;
        let bytes = Message::interested().serialize();
        let result = self.write_all(&bytes).await;
        debug!("sent interested");
        self.settle(result, SessionState::InterestedSent)
    }

    /// Requests one block and waits for its data. One request is outstanding
    /// at a time.
    pub async fn request_block(
        &mut self,
        piece_index: u32,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, PeerError> {
        self.expect_state(SessionState::Unchoked, "request block")?;
        let result = self.exchange_block(piece_index, offset, length).await;
        self.settle(result, SessionState::Unchoked)
    }

    /// Flushes and closes the write half of the transport.
    pub async fn shutdown(mut self) -> Result<(), PeerError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn expect_state(&self, expected: SessionState, operation: &'static str) -> Result<(), PeerError> {
        if self.state != expected {
            return Err(PeerError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn settle<T>(&mut self, result: Result<T, PeerError>, next: SessionState) -> Result<T, PeerError> {
        match result {
            Ok(value) => {
                trace!(from = ?self.state, to = ?next, "session transition");
                self.state = next;
                Ok(value)
            }
            Err(e) => {
                if e.is_protocol_error() {
                    warn!(peer = ?self.peer, state = ?self.state, error = %e, "peer violated protocol");
                } else {
                    warn!(peer = ?self.peer, state = ?self.state, error = %e, "peer connection failed");
                }
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn exchange_handshake(&mut self) -> Result<[u8; 20], PeerError> {
        let handshake = Handshake::new(self.infohash, self.peer_id);
        self.write_all(&handshake.serialize()).await?;

        let mut response = [0u8; HANDSHAKE_LEN];
        self.read_exact(&mut response, "handshake").await?;

        let remote = Handshake::deserialize(&response).ok_or(PeerError::InvalidHandshake)?;
        if remote.infohash != self.infohash {
            return Err(PeerError::InfoHashMismatch);
        }

        info!(peer_id = %hex::encode(remote.peer_id), "handshake complete");
        self.remote_peer_id = Some(remote.peer_id);
        Ok(remote.peer_id)
    }

    async fn read_expected(&mut self, expected: MessageId) -> Result<Message, PeerError> {
        let body = self.read_frame().await?;
        let actual = body[0];
        if actual != expected as u8 {
            debug!(expected = ?expected, actual = ?MessageId::try_from(actual).ok(), "unexpected message");
            return Err(PeerError::UnexpectedMessage { expected, actual });
        }
        debug!(message = ?expected, len = body.len(), "received message");
        Ok(Message {
            kind: expected,
            payload: body[1..].to_vec(),
        })
    }

    async fn exchange_block(
        &mut self,
        piece_index: u32,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, PeerError> {
        trace!(piece_index, offset, length, "requesting block");
        let request = Message::request(piece_index, offset, length).serialize();
        self.write_all(&request).await?;

        let body = self.read_frame().await?;
        if body.len() < PIECE_SKIP {
            return Err(PeerError::MalformedPiece(body.len()));
        }
        let block = PieceBlock::parse(&body[1..]).ok_or(PeerError::MalformedPiece(body.len()))?;

        if self.config.verify_block_echo {
            if body[0] != MessageId::Piece as u8 {
                return Err(PeerError::UnexpectedMessage {
                    expected: MessageId::Piece,
                    actual: body[0],
                });
            }
            let got_length = block.data.len() as u32;
            if (block.index, block.begin, got_length) != (piece_index, offset, length) {
                return Err(PeerError::BlockMismatch {
                    piece: piece_index,
                    offset,
                    length,
                    got_piece: block.index,
                    got_offset: block.begin,
                    got_length,
                });
            }
        }

        Ok(block.data)
    }

    /// Reads one length-prefixed frame and returns its body, id byte first.
    /// Keep-alive frames are skipped.
    async fn read_frame(&mut self) -> Result<Vec<u8>, PeerError> {
        loop {
            let mut len_buf = [0u8; 4];
            self.read_exact(&mut len_buf, "message length").await?;
            let len = u32::from_be_bytes(len_buf) as usize;

            if len == 0 {
                trace!("keep-alive");
                continue;
            }
            if len > MAX_MESSAGE_LEN {
                return Err(PeerError::MessageTooLarge(len));
            }

            let mut body = vec![0u8; len];
            self.read_exact(&mut body, "message body").await?;
            return Ok(body);
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8], what: &'static str) -> Result<(), PeerError> {
        timeout(self.config.read_timeout, self.stream.read_exact(buf))
            .await
            .map_err(|_| PeerError::Timeout(what))??;
        Ok(())
    }

    /// Bounded by the read timeout, like reads.
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), PeerError> {
        let stream = &mut self.stream;
        timeout(self.config.read_timeout, async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| PeerError::Timeout("write"))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::{DuplexStream, duplex};

    const INFOHASH: [u8; 20] = [0xAB; 20];
    const LOCAL_ID: [u8; 20] = *b"00112233445566778899";
    const REMOTE_ID: [u8; 20] = *b"-RM0001-abcdefghijkl";

    fn session(stream: DuplexStream) -> PeerSession<DuplexStream> {
        PeerSession::new(stream, INFOHASH, LOCAL_ID, SessionConfig::default())
    }

    fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = ((payload.len() + 1) as u32).to_be_bytes().to_vec();
        buf.push(id);
        buf.extend_from_slice(payload);
        buf
    }

    fn piece_frame(index: u32, begin: u32, data: &[u8]) -> Vec<u8> {
        let mut payload = index.to_be_bytes().to_vec();
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(data);
        frame(7, &payload)
    }

    /// Reads the client handshake and answers with `infohash`.
    async fn answer_handshake(peer: &mut DuplexStream, infohash: [u8; 20]) -> [u8; 68] {
        let mut request = [0u8; 68];
        peer.read_exact(&mut request).await.unwrap();
        peer.write_all(&Handshake::new(infohash, REMOTE_ID).serialize())
            .await
            .unwrap();
        request
    }

    /// Drives a session to `Unchoked` against a scripted peer.
    async fn unchoked_session() -> (PeerSession<DuplexStream>, DuplexStream) {
        let (client, mut peer) = duplex(1 << 16);
        let mut session = session(client);

        let script = tokio::spawn(async move {
            answer_handshake(&mut peer, INFOHASH).await;
            peer.write_all(&frame(5, &[0xFF])).await.unwrap();
            let mut interested = [0u8; 5];
            peer.read_exact(&mut interested).await.unwrap();
            assert_eq!(interested, [0, 0, 0, 1, 2]);
            peer.write_all(&frame(1, &[])).await.unwrap();
            peer
        });

        session.handshake().await.unwrap();
        session.await_bitfield().await.unwrap();
        session.send_interested().await.unwrap();
        session.await_unchoke().await.unwrap();
        (session, script.await.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_exchange() {
        let (client, mut peer) = duplex(1 << 16);
        let mut session = session(client);

        let script = tokio::spawn(async move { answer_handshake(&mut peer, INFOHASH).await });

        let remote = session.handshake().await.unwrap();
        let sent = script.await.unwrap();

        assert_eq!(remote, REMOTE_ID);
        assert_eq!(session.remote_peer_id(), Some(&REMOTE_ID));
        assert_eq!(session.state(), SessionState::HandshakeDone);
        assert_eq!(sent, Handshake::new(INFOHASH, LOCAL_ID).serialize());
    }

    #[tokio::test]
    async fn test_handshake_malformed_reply() {
        let (client, mut peer) = duplex(1 << 16);
        let mut session = session(client);

        tokio::spawn(async move {
            let mut request = [0u8; 68];
            peer.read_exact(&mut request).await.unwrap();
            peer.write_all(&[0u8; 68]).await.unwrap();
            peer
        });

        assert_matches!(session.handshake().await, Err(PeerError::InvalidHandshake));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_handshake_info_hash_mismatch() {
        let (client, mut peer) = duplex(1 << 16);
        let mut session = session(client);

        tokio::spawn(async move {
            answer_handshake(&mut peer, [0u8; 20]).await;
            peer
        });

        assert_matches!(session.handshake().await, Err(PeerError::InfoHashMismatch));
    }

    #[tokio::test]
    async fn test_handshake_short_reply() {
        let (client, mut peer) = duplex(1 << 16);
        let mut session = session(client);

        tokio::spawn(async move {
            let mut request = [0u8; 68];
            peer.read_exact(&mut request).await.unwrap();
            peer.write_all(&[19u8; 10]).await.unwrap();
            // dropping the peer closes the stream mid-handshake
        });

        assert_matches!(session.handshake().await, Err(PeerError::Io(_)));
    }

    #[tokio::test]
    async fn test_startup_sequence_and_block_request() {
        let (mut session, mut peer) = unchoked_session().await;
        assert_eq!(session.state(), SessionState::Unchoked);
        assert!(session.bitfield().unwrap().has_piece(7));

        let script = tokio::spawn(async move {
            let mut request = [0u8; 17];
            peer.read_exact(&mut request).await.unwrap();
            peer.write_all(&piece_frame(2, 16384, b"hello")).await.unwrap();
            (request, peer)
        });

        let block = session.request_block(2, 16384, 5).await.unwrap();
        let (request, _peer) = script.await.unwrap();

        assert_eq!(block, b"hello");
        assert_eq!(request.to_vec(), Message::request(2, 16384, 5).serialize());
        assert_eq!(session.state(), SessionState::Unchoked);
    }

    #[tokio::test]
    async fn test_unexpected_message_is_terminal() {
        let (client, mut peer) = duplex(1 << 16);
        let mut session = session(client);

        tokio::spawn(async move {
            answer_handshake(&mut peer, INFOHASH).await;
            // Have instead of Bitfield
            peer.write_all(&frame(4, &[0, 0, 0, 1])).await.unwrap();
            peer
        });

        session.handshake().await.unwrap();
        assert_matches!(
            session.await_message(MessageId::Bitfield).await,
            Err(PeerError::UnexpectedMessage {
                expected: MessageId::Bitfield,
                actual: 4
            })
        );
        assert_eq!(session.state(), SessionState::Failed);
        assert_matches!(
            session.send_interested().await,
            Err(PeerError::InvalidState {
                state: SessionState::Failed,
                ..
            })
        );
    }

    #[tokio::test]
    async fn test_operations_out_of_order() {
        let (client, _peer) = duplex(1 << 16);
        let mut session = session(client);

        assert_matches!(
            session.request_block(0, 0, 16384).await,
            Err(PeerError::InvalidState {
                state: SessionState::Connected,
                ..
            })
        );
        assert_matches!(
            session.await_message(MessageId::Unchoke).await,
            Err(PeerError::InvalidState { .. })
        );
        assert_matches!(
            session.send_interested().await,
            Err(PeerError::InvalidState { .. })
        );
        // rejected calls do not poison the session
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_keep_alive_is_skipped() {
        let (client, mut peer) = duplex(1 << 16);
        let mut session = session(client);

        tokio::spawn(async move {
            answer_handshake(&mut peer, INFOHASH).await;
            peer.write_all(&[0, 0, 0, 0]).await.unwrap();
            peer.write_all(&frame(5, &[0x80])).await.unwrap();
            peer
        });

        session.handshake().await.unwrap();
        let message = session.await_message(MessageId::Bitfield).await.unwrap();
        assert_eq!(message.payload, vec![0x80]);
    }

    #[tokio::test]
    async fn test_frames_delivered_in_fragments() {
        let (client, mut peer) = duplex(1 << 16);
        let mut session = session(client);

        tokio::spawn(async move {
            answer_handshake(&mut peer, INFOHASH).await;
            for byte in frame(5, &[0xF0, 0x0F, 0xAA]) {
                peer.write_all(&[byte]).await.unwrap();
                peer.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            peer
        });

        session.handshake().await.unwrap();
        let bitfield = session.await_bitfield().await.unwrap();
        assert_eq!(bitfield.bits, vec![0xF0, 0x0F, 0xAA]);
    }

    #[tokio::test]
    async fn test_block_echo_mismatch() {
        let (mut session, mut peer) = unchoked_session().await;

        tokio::spawn(async move {
            let mut request = [0u8; 17];
            peer.read_exact(&mut request).await.unwrap();
            peer.write_all(&piece_frame(3, 0, b"abcd")).await.unwrap();
            peer
        });

        assert_matches!(
            session.request_block(2, 0, 4).await,
            Err(PeerError::BlockMismatch {
                piece: 2,
                got_piece: 3,
                ..
            })
        );
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_block_echo_unchecked_skips_header() {
        let (mut session, mut peer) = unchoked_session().await;
        session.config.verify_block_echo = false;

        tokio::spawn(async move {
            let mut request = [0u8; 17];
            peer.read_exact(&mut request).await.unwrap();
            peer.write_all(&piece_frame(9, 99, b"abcd")).await.unwrap();
            peer
        });

        assert_eq!(session.request_block(2, 0, 4).await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_truncated_piece_message() {
        let (mut session, mut peer) = unchoked_session().await;

        tokio::spawn(async move {
            let mut request = [0u8; 17];
            peer.read_exact(&mut request).await.unwrap();
            peer.write_all(&frame(7, &[0, 0, 0])).await.unwrap();
            peer
        });

        assert_matches!(
            session.request_block(0, 0, 4).await,
            Err(PeerError::MalformedPiece(4))
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (client, mut peer) = duplex(1 << 16);
        let mut session = session(client);

        tokio::spawn(async move {
            answer_handshake(&mut peer, INFOHASH).await;
            peer.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
            peer
        });

        session.handshake().await.unwrap();
        assert_matches!(
            session.await_bitfield().await,
            Err(PeerError::MessageTooLarge(_))
        );
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (client, mut peer) = duplex(1 << 16);
        let config = SessionConfig {
            read_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let mut session = PeerSession::new(client, INFOHASH, LOCAL_ID, config);

        let script = tokio::spawn(async move {
            let mut request = [0u8; 68];
            peer.read_exact(&mut request).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            peer
        });

        assert_matches!(
            session.handshake().await,
            Err(PeerError::Timeout("handshake"))
        );
        drop(script);
    }

    #[tokio::test]
    async fn test_write_timeout_when_peer_stops_reading() {
        // The pipe holds fewer bytes than a handshake and nobody drains it.
        let (client, _peer) = duplex(16);
        let config = SessionConfig {
            read_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let mut session = PeerSession::new(client, INFOHASH, LOCAL_ID, config);

        assert_matches!(session.handshake().await, Err(PeerError::Timeout("write")));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let peer = match addr {
            std::net::SocketAddr::V4(v4) => Peer::from(v4),
            std::net::SocketAddr::V6(_) => unreachable!(),
        };
        let result =
            PeerSession::connect(peer, INFOHASH, LOCAL_ID, SessionConfig::default()).await;
        assert_matches!(result, Err(PeerError::Connect { .. }));
    }
}
