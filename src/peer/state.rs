use sha1::{Digest, Sha1};

pub const BLOCK_SIZE: u32 = 16384; // 16KB blocks

/// Piece geometry of a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    pub total_length: u64,
    pub piece_length: u32,
}

impl PieceLayout {
    pub fn new(total_length: u64, piece_length: u32) -> Self {
        Self {
            total_length,
            piece_length,
        }
    }

    pub fn piece_count(&self) -> u64 {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_length.div_ceil(u64::from(self.piece_length))
    }

    /// Byte length of piece `index`. Every piece is `piece_length` except the
    /// last, which holds the remainder. Indices past the end have length 0.
    pub fn piece_size(&self, index: u64) -> u32 {
        let count = self.piece_count();
        if index >= count {
            return 0;
        }
        if index + 1 < count {
            return self.piece_length;
        }

        match self.total_length % u64::from(self.piece_length) {
            0 => self.piece_length,
            // less than piece_length, so it fits
            rem => rem as u32,
        }
    }
}

pub fn block_count(piece_len: u32) -> u32 {
    piece_len.div_ceil(BLOCK_SIZE)
}

/// Length of block `block_index` of a piece: `BLOCK_SIZE`, except the last
/// block which takes what is left.
pub fn block_length(piece_len: u32, block_index: u32) -> u32 {
    let count = block_count(piece_len);
    if block_index + 1 < count {
        BLOCK_SIZE
    } else {
        piece_len - count.saturating_sub(1) * BLOCK_SIZE
    }
}

/// Represents a block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

/// One piece being assembled from its blocks, in order.
#[derive(Debug, Clone)]
pub struct PieceRequestState {
    pub index: u32,
    pub length: u32,
    buffer: Vec<u8>,
}

impl PieceRequestState {
    pub fn new(index: u32, length: u32) -> Self {
        Self {
            index,
            length,
            buffer: Vec::new(),
        }
    }

    pub fn block_count(&self) -> u32 {
        block_count(self.length)
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + use<> {
        let (piece_index, length) = (self.index, self.length);
        (0..block_count(length)).map(move |i| BlockInfo {
            piece_index,
            offset: i * BLOCK_SIZE,
            length: block_length(length, i),
        })
    }

    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.len() == self.length as usize
    }

    /// Compares the SHA-1 of the assembled bytes with `expected`.
    pub fn verify(&self, expected: &[u8; 20]) -> bool {
        let digest: [u8; 20] = Sha1::digest(&self.buffer).into();
        &digest == expected
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}
