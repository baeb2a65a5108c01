#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            _ => Err(()),
        }
    }
}

/// Piece index and begin offset precede the block data in a Piece body.
pub const PIECE_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageId) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    pub fn interested() -> Self {
        Self::new(MessageId::Interested)
    }

    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(&length.to_be_bytes());
        Self {
            kind: MessageId::Request,
            payload,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let total_len = 1 + self.payload.len(); // 1 byte for ID
        let mut buf = Vec::with_capacity(4 + total_len);

        buf.extend_from_slice(&(total_len as u32).to_be_bytes()); // 4-byte length
        buf.push(self.kind as u8); // 1-byte message ID
        buf.extend_from_slice(&self.payload); // payload

        buf
    }
}

/// A Piece message body split into its header fields and the block bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceBlock {
    pub index: u32,
    pub begin: u32,
    pub data: Vec<u8>,
}

impl PieceBlock {
    /// Parses the payload that follows the id byte. `None` when the header
    /// is truncated.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < PIECE_HEADER_LEN {
            return None;
        }
        let index = u32::from_be_bytes(payload[0..4].try_into().ok()?);
        let begin = u32::from_be_bytes(payload[4..8].try_into().ok()?);
        Some(Self {
            index,
            begin,
            data: payload[PIECE_HEADER_LEN..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    pub bits: Vec<u8>, // raw bytes
}

impl Bitfield {
    pub fn has_piece(&self, index: usize) -> bool {
        let byte = index / 8;
        let bit = 7 - (index % 8); // MSB first
        if byte >= self.bits.len() {
            return false;
        }
        self.bits[byte] & (1 << bit) != 0
    }

    pub fn piece_count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }
}

impl From<Vec<u8>> for Bitfield {
    fn from(bits: Vec<u8>) -> Self {
        Self { bits }
    }
}
