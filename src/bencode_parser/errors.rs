use std::num::ParseIntError;

use nom::error::{ErrorKind, ParseError};
use thiserror::Error;

/// Error produced by the nom combinators while walking the input.
///
/// Carries the remaining input at the point of failure so the public
/// [`DecodeError`] can report a byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeError<I> {
    InvalidInteger(I),
    InvalidBytesLength(I),
    ParseIntError(I, ParseIntError),
    NonStringKey(I),
    UnrecognizedFormat(I),
    NestingTooDeep(I),
    Nom(I, ErrorKind),
}

impl<I> ParseError<I> for BencodeError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        Self::Nom(input, kind)
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<I> BencodeError<I> {
    fn remaining(&self) -> &I {
        match self {
            Self::InvalidInteger(i)
            | Self::InvalidBytesLength(i)
            | Self::ParseIntError(i, _)
            | Self::NonStringKey(i)
            | Self::UnrecognizedFormat(i)
            | Self::NestingTooDeep(i)
            | Self::Nom(i, _) => i,
        }
    }
}

/// Failure to decode a bencoded byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at byte {offset}")]
    UnexpectedEof { offset: usize },

    #[error("invalid integer at byte {offset}")]
    InvalidInteger { offset: usize },

    #[error("invalid byte string length at byte {offset}")]
    InvalidLength { offset: usize },

    #[error("dictionary key at byte {offset} is not a byte string")]
    NonStringKey { offset: usize },

    #[error("unrecognized format: byte {byte:#04x} at offset {offset}")]
    UnrecognizedFormat { offset: usize, byte: u8 },

    #[error("nesting too deep at byte {offset}")]
    NestingTooDeep { offset: usize },

    #[error("trailing data after value at byte {offset}")]
    TrailingData { offset: usize },

    #[error("syntax error ({kind:?}) at byte {offset}")]
    Syntax { offset: usize, kind: ErrorKind },
}

impl DecodeError {
    pub fn offset(&self) -> usize {
        match self {
            Self::UnexpectedEof { offset }
            | Self::InvalidInteger { offset }
            | Self::InvalidLength { offset }
            | Self::NonStringKey { offset }
            | Self::UnrecognizedFormat { offset, .. }
            | Self::NestingTooDeep { offset }
            | Self::TrailingData { offset }
            | Self::Syntax { offset, .. } => *offset,
        }
    }

    /// Converts a parser failure into a positioned error relative to `source`.
    pub(crate) fn from_nom(source: &[u8], err: nom::Err<BencodeError<&[u8]>>) -> Self {
        let err = match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => e,
            nom::Err::Incomplete(_) => {
                return Self::UnexpectedEof {
                    offset: source.len(),
                };
            }
        };

        let rest = *err.remaining();
        let offset = source.len() - rest.len();

        match err {
            BencodeError::InvalidInteger(_) => Self::InvalidInteger { offset },
            BencodeError::InvalidBytesLength(_) | BencodeError::ParseIntError(_, _) => {
                Self::InvalidLength { offset }
            }
            BencodeError::NonStringKey(_) => Self::NonStringKey { offset },
            BencodeError::UnrecognizedFormat(_) => match rest.first() {
                Some(&byte) => Self::UnrecognizedFormat { offset, byte },
                None => Self::UnexpectedEof { offset },
            },
            BencodeError::NestingTooDeep(_) => Self::NestingTooDeep { offset },
            BencodeError::Nom(_, _) if rest.is_empty() => Self::UnexpectedEof { offset },
            BencodeError::Nom(_, ErrorKind::Eof) => Self::UnexpectedEof { offset },
            BencodeError::Nom(_, kind) => Self::Syntax { offset, kind },
        }
    }
}
