use crate::peer::{PSTR, PSTR_LEN};

const RESERVED_LEN: usize = 8;
const ID_LEN: usize = 20;

// Offsets into the handshake: length byte, protocol name, reserved
// bytes, info hash, peer id.
const PSTR_END: usize = 1 + PSTR.len();
const INFOHASH_AT: usize = PSTR_END + RESERVED_LEN;
const PEER_ID_AT: usize = INFOHASH_AT + ID_LEN;

pub const HANDSHAKE_LEN: usize = PEER_ID_AT + ID_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub infohash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(infohash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { infohash, peer_id }
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let (header, ids) = buf.split_at_mut(INFOHASH_AT);
        header[0] = PSTR_LEN;
        header[1..PSTR_END].copy_from_slice(PSTR.as_bytes());

        let (infohash, peer_id) = ids.split_at_mut(ID_LEN);
        infohash.copy_from_slice(&self.infohash);
        peer_id.copy_from_slice(&self.peer_id);
        buf
    }

    /// Reserved bytes are ignored; peers advertise extensions there.
    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        let buf: &[u8; HANDSHAKE_LEN] = buf.try_into().ok()?;
        let (&pstr_len, rest) = buf.split_first()?;
        if pstr_len != PSTR_LEN || !rest.starts_with(PSTR.as_bytes()) {
            return None;
        }

        Some(Self {
            infohash: buf[INFOHASH_AT..PEER_ID_AT].try_into().ok()?,
            peer_id: buf[PEER_ID_AT..].try_into().ok()?,
        })
    }
}
