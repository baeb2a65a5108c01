pub mod bencode_parser;
pub mod download;
pub mod peer;
pub mod torrent;
pub mod tracker;

// Re-export commonly used types and functions for easier access
pub use bencode_parser::{DecodeError, Value, decode, encode};
pub use download::{DownloadConfig, DownloadError, PeerSource, download, download_to_file};
pub use torrent::{Torrent, TorrentError, parse_torrent_bytes, parse_torrent_file};
pub use tracker::{HttpTracker, TrackerError};
