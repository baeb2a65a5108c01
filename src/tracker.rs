use std::net::Ipv4Addr;
use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::bencode_parser::{DecodeError, Value, decode};
use crate::download::PeerSource;
use crate::peer::{COMPACT_PEER_LEN, Peer};
use crate::torrent::Torrent;

const USER_AGENT: &str = concat!("torrent_fetch/", env!("CARGO_PKG_VERSION"));
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid announce url: {0}")]
    Url(#[from] url::ParseError),

    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker error: {0}")]
    Status(reqwest::StatusCode),

    #[error("failed to decode tracker response: {0}")]
    Decode(#[from] DecodeError),

    #[error("tracker refused announce: {0}")]
    Failure(String),

    #[error("invalid tracker response: {0}")]
    InvalidResponse(&'static str),

    #[error("compact peer list of {0} bytes is not a multiple of 6")]
    InvalidPeers(usize),
}

/// Parameters of one announce, the parts that vary per download.
#[derive(Debug, Clone)]
pub struct Announce<'a> {
    pub announce_url: &'a str,
    pub infohash: &'a [u8; 20],
    pub peer_id: &'a [u8; 20],
    pub port: u16,
    pub left: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Option<i64>,
    pub peers: Vec<Peer>,
}

fn encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

/// Builds the GET url. Raw hash and id bytes are percent-encoded by hand
/// because `Url`'s query serializer only accepts UTF-8.
pub fn build_tracker_url(announce: &Announce<'_>) -> Result<String, TrackerError> {
    let mut base = Url::parse(announce.announce_url)?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        encode_bytes(announce.infohash),
        encode_bytes(announce.peer_id),
        announce.port,
        announce.left
    );

    let query = match base.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
        _ => query,
    };

    base.set_query(Some(&query));
    Ok(base.to_string())
}

fn extract_peers(bytes: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    if bytes.len() % COMPACT_PEER_LEN != 0 {
        return Err(TrackerError::InvalidPeers(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(COMPACT_PEER_LEN)
        .filter_map(Peer::from_compact)
        .collect())
}

/// Non-compact form: a list of dictionaries with `ip` and `port`.
fn extract_peer_dicts(list: &[Value]) -> Result<Vec<Peer>, TrackerError> {
    list.iter()
        .map(|entry| -> Result<Peer, TrackerError> {
            let ip_addr = entry
                .get(b"ip")
                .and_then(Value::as_str)
                .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
                .ok_or(TrackerError::InvalidResponse("peer entry without IPv4 'ip'"))?;
            let port = entry
                .get(b"port")
                .and_then(Value::as_integer)
                .and_then(|port| u16::try_from(port).ok())
                .ok_or(TrackerError::InvalidResponse("peer entry without valid 'port'"))?;
            Ok(Peer { ip_addr, port })
        })
        .collect()
}

/// Parses a bencoded announce response body.
pub fn parse_tracker_response(bytes: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let response = decode(bytes)?;
    if response.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("not a dictionary"));
    }

    if let Some(reason) = response.get(b"failure reason") {
        let reason = reason.as_str().unwrap_or("unreadable failure reason");
        return Err(TrackerError::Failure(reason.to_owned()));
    }

    let interval = response.get(b"interval").and_then(Value::as_integer);

    let peers = match response.get(b"peers") {
        Some(Value::Bytes(compact)) => extract_peers(compact)?,
        Some(Value::List(list)) => extract_peer_dicts(list)?,
        Some(_) => return Err(TrackerError::InvalidResponse("'peers' has wrong type")),
        None => return Err(TrackerError::InvalidResponse("missing 'peers'")),
    };

    Ok(AnnounceResponse { interval, peers })
}

/// Tracker client speaking the HTTP announce protocol.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: Client,
}

impl HttpTracker {
    pub fn new() -> Result<Self, TrackerError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(TRACKER_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    pub async fn announce(&self, announce: &Announce<'_>) -> Result<AnnounceResponse, TrackerError> {
        let url = build_tracker_url(announce)?;
        debug!(%url, "announcing to tracker");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(TrackerError::Status(response.status()));
        }

        let body = response.bytes().await?;
        let parsed = parse_tracker_response(&body)?;
        info!(
            peers = parsed.peers.len(),
            interval = ?parsed.interval,
            "tracker announce complete"
        );
        Ok(parsed)
    }
}

impl PeerSource for HttpTracker {
    async fn peers(
        &self,
        torrent: &Torrent,
        peer_id: &[u8; 20],
        port: u16,
    ) -> Result<Vec<Peer>, TrackerError> {
        let announce = Announce {
            announce_url: &torrent.announce,
            infohash: &torrent.infohash,
            peer_id,
            port,
            left: torrent.length,
        };
        Ok(self.announce(&announce).await?.peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const INFOHASH: [u8; 20] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
    ];
    const PEER_ID: [u8; 20] = *b"00112233445566778899";

    fn announce(url: &str) -> Announce<'_> {
        Announce {
            announce_url: url,
            infohash: &INFOHASH,
            peer_id: &PEER_ID,
            port: 6881,
            left: 1048576,
        }
    }

    #[test]
    fn test_build_tracker_url() {
        let url = build_tracker_url(&announce("http://tracker.example.com:8080/announce")).unwrap();

        assert!(url.starts_with("http://tracker.example.com:8080/announce?"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("uploaded=0"));
        assert!(url.contains("downloaded=0"));
        assert!(url.contains("compact=1"));
        assert!(url.contains("left=1048576"));
        assert!(url.contains("peer_id=00112233445566778899"));
        assert!(url.contains("info_hash=%01%02%03%04%05%06%07%08%09%0A%0B%0C%0D%0E%0F%10%11%12%13%14"));
    }

    #[test]
    fn test_build_tracker_url_invalid_announce() {
        assert_matches!(
            build_tracker_url(&announce("invalid_url")),
            Err(TrackerError::Url(_))
        );
    }

    #[test]
    fn test_build_tracker_url_keeps_existing_query() {
        let url =
            build_tracker_url(&announce("http://tracker.example.com/announce?passkey=abc")).unwrap();

        assert!(url.contains("?passkey=abc&info_hash="));
        assert!(url.contains("port=6881"));
    }

    #[test]
    fn test_extract_peers_valid() {
        let peer_data = [
            192, 168, 1, 1, 0x1A, 0xE1, // 192.168.1.1:6881
            10, 0, 0, 1, 0x1F, 0x90, // 10.0.0.1:8080
        ];

        let peers = extract_peers(&peer_data).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "192.168.1.1:6881");
        assert_eq!(peers[1].to_string(), "10.0.0.1:8080");
    }

    #[test]
    fn test_extract_peers_invalid_length() {
        assert_matches!(
            extract_peers(&[192, 168, 1, 1, 0x1A]),
            Err(TrackerError::InvalidPeers(5))
        );
    }

    #[test]
    fn test_extract_peers_empty() {
        assert!(extract_peers(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_tracker_response_compact() {
        let body = b"d8:intervali1800e5:peers12:\xc0\xa8\x01\x01\x1a\xe1\x7f\x00\x00\x01\x27\x0fe";
        let response = parse_tracker_response(body).unwrap();

        assert_eq!(response.interval, Some(1800));
        assert_eq!(
            response.peers,
            vec![
                Peer {
                    ip_addr: Ipv4Addr::new(192, 168, 1, 1),
                    port: 6881
                },
                Peer {
                    ip_addr: Ipv4Addr::new(127, 0, 0, 1),
                    port: 9999
                },
            ]
        );
    }

    #[test]
    fn test_parse_tracker_response_dict_peers() {
        let body = b"d5:peersld2:ip8:10.0.0.74:porti51413eeee";
        let response = parse_tracker_response(body).unwrap();

        assert_eq!(response.interval, None);
        assert_eq!(response.peers[0].to_string(), "10.0.0.7:51413");
    }

    #[test]
    fn test_parse_tracker_response_failure_reason() {
        let body = b"d14:failure reason17:torrent not founde";
        assert_matches!(
            parse_tracker_response(body),
            Err(TrackerError::Failure(reason)) if reason == "torrent not found"
        );
    }

    #[test]
    fn test_parse_tracker_response_missing_peers() {
        assert_matches!(
            parse_tracker_response(b"d8:intervali60ee"),
            Err(TrackerError::InvalidResponse(_))
        );
    }

    #[test]
    fn test_parse_tracker_response_not_bencode() {
        assert_matches!(
            parse_tracker_response(b"<html>"),
            Err(TrackerError::Decode(_))
        );
    }
}
