use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::peer::state::PieceRequestState;
use crate::peer::{Peer, PeerError, PeerSession, SessionConfig};
use crate::torrent::{HASH_LEN, Torrent, TorrentError};
use crate::tracker::TrackerError;

pub const DEFAULT_PEER_ID: [u8; 20] = *b"00112233445566778899";
pub const DEFAULT_PORT: u16 = 6881;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error("tracker returned no peers")]
    NoPeers,

    #[error("piece {piece} failed hash verification")]
    Integrity { piece: u32 },

    #[error("piece {piece} incomplete: received {received} of {expected} bytes")]
    PieceIncomplete {
        piece: u32,
        received: usize,
        expected: u32,
    },

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub peer_id: [u8; 20],
    /// Port reported to the tracker. Nothing listens on it.
    pub port: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub verify_block_echo: bool,
    /// Check every piece against its SHA-1 from the metadata.
    pub verify_pieces: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            peer_id: DEFAULT_PEER_ID,
            port: DEFAULT_PORT,
            connect_timeout: session.connect_timeout,
            read_timeout: session.read_timeout,
            verify_block_echo: session.verify_block_echo,
            verify_pieces: false,
        }
    }
}

impl DownloadConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            verify_block_echo: self.verify_block_echo,
        }
    }
}

/// Where peer addresses come from. The HTTP tracker is the real one.
pub trait PeerSource {
    fn peers(
        &self,
        torrent: &Torrent,
        peer_id: &[u8; 20],
        port: u16,
    ) -> impl Future<Output = Result<Vec<Peer>, TrackerError>> + Send;
}

/// Downloads the whole file from the first peer `source` reports and
/// returns its bytes in piece order.
pub async fn download<P: PeerSource>(
    torrent: &Torrent,
    source: &P,
    config: &DownloadConfig,
) -> Result<Vec<u8>, DownloadError> {
    if torrent.length == 0 {
        info!(name = %torrent.name, "empty file, nothing to download");
        return Ok(Vec::new());
    }

    let peers = source.peers(torrent, &config.peer_id, config.port).await?;
    let peer = peers.first().copied().ok_or(DownloadError::NoPeers)?;
    info!(%peer, available = peers.len(), "using first peer");

    let mut session = PeerSession::connect(
        peer,
        torrent.infohash,
        config.peer_id,
        config.session_config(),
    )
    .await?;

    let result = fetch_pieces(&mut session, torrent, config).await;

    if let Err(e) = session.shutdown().await {
        debug!(error = %e, "error closing peer connection");
    }
    result
}

/// Same as [`download`], then writes the bytes to `path`. Nothing is
/// written unless every piece arrived.
pub async fn download_to_file<P: PeerSource>(
    torrent: &Torrent,
    source: &P,
    config: &DownloadConfig,
    path: impl AsRef<Path>,
) -> Result<usize, DownloadError> {
    let path = path.as_ref();
    let data = download(torrent, source, config).await?;

    tokio::fs::write(path, &data)
        .await
        .map_err(|source| DownloadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    info!(path = %path.display(), bytes = data.len(), "file written");
    Ok(data.len())
}

/// Runs the startup sequence on `session`, then requests every block of
/// every piece in order, one at a time.
pub async fn fetch_pieces<S>(
    session: &mut PeerSession<S>,
    torrent: &Torrent,
    config: &DownloadConfig,
) -> Result<Vec<u8>, DownloadError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session.handshake().await?;
    let bitfield = session.await_bitfield().await?;
    session.send_interested().await?;
    session.await_unchoke().await?;

    let layout = torrent.layout();
    let piece_count = u32::try_from(layout.piece_count()).map_err(|_| {
        TorrentError::InvalidPieces {
            len: torrent.pieces.len() * HASH_LEN,
            expected: layout.piece_count(),
        }
    })?;

    // not preallocated: `length` is untrusted
    let mut file = Vec::new();

    for index in 0..piece_count {
        if !bitfield.has_piece(index as usize) {
            warn!(piece = index, "peer does not advertise piece, requesting anyway");
        }

        let mut piece = PieceRequestState::new(index, layout.piece_size(u64::from(index)));
        for block in piece.blocks() {
            let data = session
                .request_block(block.piece_index, block.offset, block.length)
                .await?;
            piece.append(&data);
        }

        if !piece.is_complete() {
            return Err(DownloadError::PieceIncomplete {
                piece: index,
                received: piece.received(),
                expected: piece.length,
            });
        }

        if config.verify_pieces {
            let expected = torrent
                .piece_hash(index)
                .ok_or(TorrentError::InvalidPieces {
                    len: torrent.pieces.len() * HASH_LEN,
                    expected: layout.piece_count(),
                })?;
            if !piece.verify(expected) {
                return Err(DownloadError::Integrity { piece: index });
            }
        }

        debug!(
            piece = index,
            bytes = piece.received(),
            total = piece_count,
            "piece complete"
        );
        file.extend_from_slice(&piece.into_bytes());
    }

    info!(bytes = file.len(), pieces = piece_count, "download complete");
    Ok(file)
}
