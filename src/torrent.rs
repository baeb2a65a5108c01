use std::{fs, path::Path};

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bencode_parser::{DecodeError, Value, decode};
use crate::peer::state::PieceLayout;

pub const HASH_LEN: usize = 20;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("failed to read torrent file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode torrent file: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid torrent file: expected top-level dictionary")]
    NotADictionary,

    #[error("missing '{0}' field")]
    MissingField(&'static str),

    #[error("invalid '{0}' field")]
    InvalidField(&'static str),

    #[error("invalid 'pieces' field: {len} bytes for {expected} pieces")]
    InvalidPieces { len: usize, expected: u64 },
}

/// Typed view over a single-file torrent's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Torrent {
    pub announce: String,
    pub name: String,
    pub length: u64,
    pub piece_length: u32,
    pub pieces: Vec<[u8; HASH_LEN]>,
    pub infohash: [u8; HASH_LEN],
}

fn get_string(dict: &Value, key: &'static str) -> Result<String, TorrentError> {
    let value = dict
        .get(key.as_bytes())
        .ok_or(TorrentError::MissingField(key))?;
    value
        .as_str()
        .map(str::to_owned)
        .ok_or(TorrentError::InvalidField(key))
}

fn get_u64(dict: &Value, key: &'static str) -> Result<u64, TorrentError> {
    let value = dict
        .get(key.as_bytes())
        .ok_or(TorrentError::MissingField(key))?;
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or(TorrentError::InvalidField(key))
}

/// SHA-1 over the canonical encoding of the `info` dictionary.
pub fn compute_info_hash(info: &Value) -> [u8; HASH_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(info.encode());
    hasher.finalize().into()
}

impl Torrent {
    pub fn layout(&self) -> PieceLayout {
        PieceLayout::new(self.length, self.piece_length)
    }

    pub fn piece_count(&self) -> u64 {
        self.layout().piece_count()
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; HASH_LEN]> {
        self.pieces.get(index as usize)
    }

    /// The raw `pieces` string: every piece digest back to back.
    pub fn piece_hashes_concatenated(&self) -> Vec<u8> {
        self.pieces.concat()
    }

    pub fn infohash_hex(&self) -> String {
        hex::encode(self.infohash)
    }
}

/// Parse torrent from file path
pub fn parse_torrent_file(path: impl AsRef<Path>) -> Result<Torrent, TorrentError> {
    let data = fs::read(path)?;
    parse_torrent_bytes(&data)
}

/// Parse torrent from byte slice
pub fn parse_torrent_bytes(data: &[u8]) -> Result<Torrent, TorrentError> {
    let root = decode(data)?;
    if root.as_dict().is_none() {
        return Err(TorrentError::NotADictionary);
    }

    let announce = get_string(&root, "announce")?;

    let info = root
        .get(b"info")
        .ok_or(TorrentError::MissingField("info"))?;
    if info.as_dict().is_none() {
        return Err(TorrentError::InvalidField("info"));
    }

    let name = get_string(info, "name")?;
    let length = get_u64(info, "length")?;
    let piece_length = u32::try_from(get_u64(info, "piece length")?)
        .ok()
        .filter(|&len| len > 0)
        .ok_or(TorrentError::InvalidField("piece length"))?;

    let pieces_bytes = info
        .get(b"pieces")
        .ok_or(TorrentError::MissingField("pieces"))?
        .as_bytes()
        .ok_or(TorrentError::InvalidField("pieces"))?;

    let expected = PieceLayout::new(length, piece_length).piece_count();
    if pieces_bytes.len() % HASH_LEN != 0
        || (pieces_bytes.len() / HASH_LEN) as u64 != expected
        || expected > u64::from(u32::MAX)
    {
        return Err(TorrentError::InvalidPieces {
            len: pieces_bytes.len(),
            expected,
        });
    }

    let pieces = pieces_bytes
        .chunks_exact(HASH_LEN)
        .map(|chunk| {
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    Ok(Torrent {
        announce,
        name,
        length,
        piece_length,
        pieces,
        infohash: compute_info_hash(info),
    })
}
