use nom::{
    IResult, Parser,
    bytes::complete::{take, take_till},
    character::complete::{char, digit1},
    error::ErrorKind,
    multi::many_till,
    sequence::{delimited, preceded},
};
use std::collections::HashMap;

use crate::bencode_parser::errors::{BencodeError, DecodeError};

type BenResult<'a, O = Value> = IResult<&'a [u8], O, BencodeError<&'a [u8]>>;

/// Lists and dictionaries nested deeper than this are rejected.
const MAX_DEPTH: usize = 64;

/// A decoded bencode value.
///
/// Dictionary keys are raw byte strings. The map carries no ordering; the
/// encoder sorts keys when serializing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<Self>),
    Dictionary(HashMap<Vec<u8>, Self>),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the byte string as UTF-8, or `None` if it is not a valid string.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&HashMap<Vec<u8>, Value>> {
        match self {
            Value::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }

    /// Canonical bencode serialization of this value.
    pub fn encode(&self) -> Vec<u8> {
        crate::bencode_parser::encoder::encode(self)
    }

    fn parse_value(inp: &[u8], depth: usize) -> BenResult<'_> {
        if depth > MAX_DEPTH {
            return Err(nom::Err::Failure(BencodeError::NestingTooDeep(inp)));
        }

        match inp.first() {
            Some(b'0'..=b'9') => Self::parse_bytes(inp),
            Some(b'i') => Self::parse_integer(inp),
            Some(b'l') => Self::parse_list(inp, depth),
            Some(b'd') => Self::parse_dict(inp, depth),
            Some(_) => Err(nom::Err::Failure(BencodeError::UnrecognizedFormat(inp))),
            None => Err(nom::Err::Failure(BencodeError::Nom(inp, ErrorKind::Eof))),
        }
    }

    fn parse_integer(start_inp: &[u8]) -> BenResult<'_> {
        let parsed: BenResult<'_, &[u8]> =
            delimited(char('i'), take_till(|b: u8| b == b'e'), char('e')).parse(start_inp);
        let (inp, value) = parsed?;

        let invalid = || nom::Err::Failure(BencodeError::InvalidInteger(start_inp));

        let value_str = std::str::from_utf8(value).map_err(|_| invalid())?;
        let magnitude = value_str.strip_prefix('-').unwrap_or(value_str);

        if magnitude.is_empty() || !magnitude.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        // i-0e and leading zeros are not canonical
        if value_str.starts_with("-0") || (magnitude.starts_with('0') && magnitude.len() > 1) {
            return Err(invalid());
        }

        let value_integer: i64 = value_str.parse().map_err(|_| invalid())?;
        Ok((inp, Value::Integer(value_integer)))
    }

    fn parse_bytes(start_inp: &[u8]) -> BenResult<'_> {
        let parsed: BenResult<'_, &[u8]> = digit1(start_inp);
        let (after_len, length) = parsed?;

        let (inp, _) = char(':').parse(after_len).map_err(|_: nom::Err<BencodeError<&[u8]>>| {
            if after_len.is_empty() {
                nom::Err::Failure(BencodeError::Nom(after_len, ErrorKind::Eof))
            } else {
                nom::Err::Failure(BencodeError::InvalidBytesLength(start_inp))
            }
        })?;

        let length = std::str::from_utf8(length)
            .map_err(|_| nom::Err::Failure(BencodeError::InvalidBytesLength(start_inp)))?;

        let length: usize = length
            .parse()
            .map_err(|e| nom::Err::Failure(BencodeError::ParseIntError(start_inp, e)))?;

        let taken: BenResult<'_, &[u8]> = take(length).parse(inp);
        let (inp, characters) = taken?;

        Ok((inp, Value::Bytes(characters.to_vec())))
    }

    fn parse_list(start_inp: &[u8], depth: usize) -> BenResult<'_> {
        let parsed: BenResult<'_, (Vec<Value>, char)> = preceded(
            char('l'),
            many_till(|i| Self::parse_value(i, depth + 1), char('e')),
        )
        .parse(start_inp);
        let (inp, (items, _)) = parsed?;

        Ok((inp, Value::List(items)))
    }

    fn parse_dict(start_inp: &[u8], depth: usize) -> BenResult<'_> {
        let parsed: BenResult<'_, (Vec<(Vec<u8>, Value)>, char)> = preceded(
            char('d'),
            many_till(|i| Self::parse_entry(i, depth + 1), char('e')),
        )
        .parse(start_inp);
        let (inp, (entries, _)) = parsed?;

        Ok((inp, Value::Dictionary(entries.into_iter().collect())))
    }

    fn parse_entry(start_inp: &[u8], depth: usize) -> BenResult<'_, (Vec<u8>, Value)> {
        let (inp, key) = Self::parse_value(start_inp, depth)?;

        let Value::Bytes(key) = key else {
            return Err(nom::Err::Failure(BencodeError::NonStringKey(start_inp)));
        };

        let (inp, value) = Self::parse_value(inp, depth)?;
        Ok((inp, (key, value)))
    }
}

/// Decodes exactly one bencoded value from `source`.
///
/// # Errors
/// Returns `Err` if `source` is not a single well-formed value, including
/// when bytes remain after it.
pub fn decode(source: &[u8]) -> Result<Value, DecodeError> {
    let (rest, value) =
        Value::parse_value(source, 0).map_err(|e| DecodeError::from_nom(source, e))?;

    if !rest.is_empty() {
        return Err(DecodeError::TrailingData {
            offset: source.len() - rest.len(),
        });
    }

    Ok(value)
}
