//! Canonical consensus serialization.
//!
//! Integers are little-endian; lengths use the compact-size form and must be minimally
//! encoded. Any other encoding of the same value is rejected on decode.

use std::fmt;

use beand_consensus::Hash256;

/// Largest length prefix accepted on decode.
pub const MAX_COMPACT_SIZE: u64 = 0x0200_0000;

macro_rules! le_ints {
    ($($write:ident / $read:ident: $ty:ty),* $(,)?) => {
        impl Encoder {
            $(
                pub fn $write(&mut self, value: $ty) {
                    self.buf.extend_from_slice(&value.to_le_bytes());
                }
            )*
        }

        impl<'a> Decoder<'a> {
            $(
                pub fn $read(&mut self) -> Result<$ty, DecodeError> {
                    Ok(<$ty>::from_le_bytes(self.read_fixed()?))
                }
            )*
        }
    };
}

le_ints!(
    write_u16_le / read_u16_le: u16,
    write_u32_le / read_u32_le: u32,
    write_i32_le / read_i32_le: i32,
    write_u64_le / read_u64_le: u64,
    write_i64_le / read_i64_le: i64,
);

pub trait Encodable {
    fn consensus_encode(&self, encoder: &mut Encoder);
}

pub trait Decodable: Sized {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError>;
}

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Compact size: one byte below 0xfd, otherwise a marker and 2, 4 or 8 bytes.
    pub fn write_varint(&mut self, value: u64) {
        if value < 0xfd {
            self.write_u8(value as u8);
        } else if let Ok(short) = u16::try_from(value) {
            self.write_u8(0xfd);
            self.write_u16_le(short);
        } else if let Ok(word) = u32::try_from(value) {
            self.write_u8(0xfe);
            self.write_u32_le(word);
        } else {
            self.write_u8(0xff);
            self.write_u64_le(value);
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_hash_le(&mut self, hash: &Hash256) {
        self.write_bytes(hash);
    }

    pub fn write_vec<T: Encodable>(&mut self, items: &[T]) {
        self.write_varint(items.len() as u64);
        items.iter().for_each(|item| item.consensus_encode(self));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    NonCanonicalVarInt,
    SizeTooLarge,
    InvalidData(&'static str),
    TrailingBytes,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            DecodeError::UnexpectedEof => "truncated input",
            DecodeError::NonCanonicalVarInt => "compact size not minimally encoded",
            DecodeError::SizeTooLarge => "length prefix too large",
            DecodeError::InvalidData(message) => *message,
            DecodeError::TrailingBytes => "unconsumed bytes after value",
        };
        f.write_str(message)
    }
}

impl std::error::Error for DecodeError {}

pub struct Decoder<'a> {
    rest: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { rest: input }
    }

    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.rest.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Ok(head)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let [byte] = self.read_fixed::<1>()?;
        Ok(byte)
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let (value, floor) = match self.read_u8()? {
            0xfd => (u64::from(self.read_u16_le()?), 0xfd),
            0xfe => (u64::from(self.read_u32_le()?), 0x1_0000),
            0xff => (self.read_u64_le()?, 0x1_0000_0000),
            small => (u64::from(small), 0),
        };
        match value {
            value if value < floor => Err(DecodeError::NonCanonicalVarInt),
            value if value > MAX_COMPACT_SIZE => Err(DecodeError::SizeTooLarge),
            value => Ok(value),
        }
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_hash_le(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed()
    }

    pub fn read_vec<T: Decodable>(&mut self) -> Result<Vec<T>, DecodeError> {
        let len = self.read_len()?;
        // every item is at least one byte
        let mut items = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            items.push(T::consensus_decode(self)?);
        }
        Ok(items)
    }

    fn read_len(&mut self) -> Result<usize, DecodeError> {
        usize::try_from(self.read_varint()?).map_err(|_| DecodeError::SizeTooLarge)
    }
}

pub fn encode<T: Encodable>(value: &T) -> Vec<u8> {
    let mut encoder = Encoder::new();
    value.consensus_encode(&mut encoder);
    encoder.into_inner()
}

/// Decodes exactly one `T`, rejecting leftover input.
pub fn decode<T: Decodable>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let value = T::consensus_decode(&mut decoder)?;
    if decoder.is_empty() {
        Ok(value)
    } else {
        Err(DecodeError::TrailingBytes)
    }
}
