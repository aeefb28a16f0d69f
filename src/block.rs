//! On-disk block formats shared by the WAL and SSTable layers.
//!
//! Every block begins with a two-byte magic and a block-type byte, so a
//! reader can always confirm it landed on the kind of block it expected
//! before trusting the rest of the bytes. All multi-byte integers are
//! big-endian (see [`crate::encoding`]).
//!
//! Checksums here are intentionally weak: a rolling product over the byte
//! stream, not a cryptographic or even CRC-grade function. They exist to
//! catch bitrot and torn writes, not tampering.

use crate::encoding::{self, Decode, Encode, EncodingError};
use thiserror::Error;

/// Maximum accepted key length, in bytes.
pub const MAX_KEY_LEN: usize = 2048;

/// Maximum accepted value length, in bytes (20 MiB).
pub const MAX_VALUE_LEN: usize = 20 * 1024 * 1024;

/// Current WAL action format version.
pub const WAL_VERSION: u8 = 1;

const DATA_BLOCK_MAGIC: [u8; 2] = *b"DT";
const INDEX_ENTRY_MAGIC: [u8; 2] = *b"IX";
const BLOOM_BLOCK_MAGIC: [u8; 2] = *b"BF";
const FOOTER_MAGIC: [u8; 2] = *b"FT";

/// Fixed byte size of a data-index entry on disk.
pub const INDEX_ENTRY_SIZE: usize = 8;

/// Fixed byte size of the footer on disk.
pub const FOOTER_SIZE: usize = 12;

/// Fixed byte size of a data block's header, before key/value bytes.
pub const DATA_BLOCK_HEADER_SIZE: usize = 24;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("corrupt block: {0}")]
    CorruptBlock(String),

    #[error("key or value exceeds size limit: {0}")]
    SizeExceeded(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

/// Block-type tag occupying byte 3 of most blocks (byte 2 carries reserved
/// or the `deleted` flag depending on block kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Data = 1,
    Index = 2,
    Bloom = 3,
    Footer = 8,
}

impl BlockType {
    fn from_u8(tag: u8) -> Result<Self, BlockError> {
        match tag {
            1 => Ok(Self::Data),
            2 => Ok(Self::Index),
            3 => Ok(Self::Bloom),
            8 => Ok(Self::Footer),
            other => Err(BlockError::CorruptBlock(format!(
                "unrecognized block type {other}"
            ))),
        }
    }
}

// --------------------------------------------------------------------------
// Checksums — rolling-product, not cryptographic
// --------------------------------------------------------------------------

/// 32-bit rolling-product checksum: `s = s*17 + 13*byte`.
///
/// Used for SSTable data-block values.
pub fn checksum32(data: &[u8]) -> u32 {
    let mut s: u32 = 0;
    for &b in data {
        s = s.wrapping_mul(17).wrapping_add(13u32.wrapping_mul(b as u32));
    }
    s
}

/// 16-bit rolling-product checksum: `s = s*13 + 7*byte`.
///
/// Used for WAL actions, over `key || value`.
pub fn checksum16(data: &[u8]) -> u16 {
    let mut s: u16 = 0;
    for &b in data {
        s = s.wrapping_mul(13).wrapping_add(7u16.wrapping_mul(b as u16));
    }
    s
}

// --------------------------------------------------------------------------
// WAL action
// --------------------------------------------------------------------------

/// The logical operation recorded by a WAL [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Put = 0,
    Delete = 1,
}

impl Op {
    fn from_u8(tag: u8) -> Result<Self, BlockError> {
        match tag {
            0 => Ok(Self::Put),
            1 => Ok(Self::Delete),
            other => Err(BlockError::CorruptBlock(format!("invalid op byte {other}"))),
        }
    }
}

/// One WAL entry: a durable record of a single put or delete.
///
/// Wire layout (big-endian, variable length):
/// ```text
/// byte 0        version (1)
/// byte 1        op (0=Put, 1=Delete)
/// bytes 2..4    16-bit checksum over key||value
/// bytes 4..12   64-bit ts
/// bytes 12..16  32-bit key length
/// bytes 16..20  32-bit value length
/// bytes 20..    key bytes
///                value bytes
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub version: u8,
    pub op: Op,
    pub ts: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Action {
    pub fn new_put(key: Vec<u8>, value: Vec<u8>, ts: u64) -> Self {
        Self {
            version: WAL_VERSION,
            op: Op::Put,
            ts,
            key,
            value,
        }
    }

    pub fn new_delete(key: Vec<u8>, ts: u64) -> Self {
        Self {
            version: WAL_VERSION,
            op: Op::Delete,
            ts,
            key,
            value: Vec::new(),
        }
    }

    fn checksum(&self) -> u16 {
        let mut joined = Vec::with_capacity(self.key.len() + self.value.len());
        joined.extend_from_slice(&self.key);
        joined.extend_from_slice(&self.value);
        checksum16(&joined)
    }

    /// Encode this action into `buf`, appending to whatever is already there.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.version);
        buf.push(self.op as u8);
        self.checksum().encode_to(buf);
        self.ts.encode_to(buf);
        (self.key.len() as u32).encode_to(buf);
        (self.value.len() as u32).encode_to(buf);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
    }

    /// Decode one action from the start of `buf`. Returns the action and the
    /// number of bytes consumed.
    pub fn decode_from(buf: &[u8]) -> Result<(Self, usize), BlockError> {
        encoding::require(buf, 20)?;
        let version = buf[0];
        let op = Op::from_u8(buf[1])?;
        let (checksum, _) = u16::decode_from(&buf[2..4])?;
        let (ts, _) = u64::decode_from(&buf[4..12])?;
        let (key_len, _) = u32::decode_from(&buf[12..16])?;
        let (value_len, _) = u32::decode_from(&buf[16..20])?;

        let key_len = key_len as usize;
        let value_len = value_len as usize;
        if key_len > MAX_KEY_LEN {
            return Err(BlockError::SizeExceeded(format!(
                "WAL key length {key_len} exceeds {MAX_KEY_LEN}"
            )));
        }
        if value_len > MAX_VALUE_LEN {
            return Err(BlockError::SizeExceeded(format!(
                "WAL value length {value_len} exceeds {MAX_VALUE_LEN}"
            )));
        }

        encoding::require(&buf[20..], key_len + value_len)?;
        let key = buf[20..20 + key_len].to_vec();
        let value = buf[20 + key_len..20 + key_len + value_len].to_vec();

        let mut joined = Vec::with_capacity(key_len + value_len);
        joined.extend_from_slice(&key);
        joined.extend_from_slice(&value);
        if checksum16(&joined) != checksum {
            return Err(BlockError::CorruptBlock(
                "WAL action checksum mismatch".into(),
            ));
        }

        Ok((
            Action {
                version,
                op,
                ts,
                key,
                value,
            },
            20 + key_len + value_len,
        ))
    }
}

// --------------------------------------------------------------------------
// SSTable data block
// --------------------------------------------------------------------------

/// A single `{key, Record}` pair as written to an SSTable.
///
/// Wire layout (big-endian):
/// ```text
/// bytes 0..2    magic 'D','T'
/// byte 2        deleted flag
/// byte 3        block type = 1
/// bytes 4..8    32-bit checksum over value
/// bytes 8..16   64-bit ts
/// bytes 16..20  32-bit key length
/// bytes 20..24  32-bit value length
/// bytes 24..    key bytes
///                value bytes
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub deleted: bool,
    pub ts: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl DataBlock {
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&DATA_BLOCK_MAGIC);
        buf.push(u8::from(self.deleted));
        buf.push(BlockType::Data as u8);
        checksum32(&self.value).encode_to(buf);
        self.ts.encode_to(buf);
        (self.key.len() as u32).encode_to(buf);
        (self.value.len() as u32).encode_to(buf);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
    }

    /// Decode the 24-byte header only, without reading key/value bytes.
    ///
    /// Returns `(deleted, ts, key_len, value_len, checksum)`.
    pub fn decode_header(buf: &[u8]) -> Result<(bool, u64, usize, usize, u32), BlockError> {
        encoding::require(buf, DATA_BLOCK_HEADER_SIZE)?;
        if buf[0..2] != DATA_BLOCK_MAGIC {
            return Err(BlockError::CorruptBlock("data block magic mismatch".into()));
        }
        let deleted = match buf[2] {
            0 => false,
            1 => true,
            other => {
                return Err(BlockError::CorruptBlock(format!(
                    "invalid deleted flag byte {other}"
                )));
            }
        };
        if BlockType::from_u8(buf[3])? != BlockType::Data {
            return Err(BlockError::CorruptBlock("expected data block type".into()));
        }
        let (checksum, _) = u32::decode_from(&buf[4..8])?;
        let (ts, _) = u64::decode_from(&buf[8..16])?;
        let (key_len, _) = u32::decode_from(&buf[16..20])?;
        let (value_len, _) = u32::decode_from(&buf[20..24])?;

        let key_len = key_len as usize;
        let value_len = value_len as usize;
        if key_len > MAX_KEY_LEN {
            return Err(BlockError::SizeExceeded(format!(
                "data block key length {key_len} exceeds {MAX_KEY_LEN}"
            )));
        }
        if value_len > MAX_VALUE_LEN {
            return Err(BlockError::SizeExceeded(format!(
                "data block value length {value_len} exceeds {MAX_VALUE_LEN}"
            )));
        }

        Ok((deleted, ts, key_len, value_len, checksum))
    }

    /// Decode a full data block (header + key + value) from the start of `buf`.
    pub fn decode_from(buf: &[u8]) -> Result<(Self, usize), BlockError> {
        let (deleted, ts, key_len, value_len, checksum) = Self::decode_header(buf)?;
        encoding::require(&buf[DATA_BLOCK_HEADER_SIZE..], key_len + value_len)?;
        let key = buf[DATA_BLOCK_HEADER_SIZE..DATA_BLOCK_HEADER_SIZE + key_len].to_vec();
        let value_start = DATA_BLOCK_HEADER_SIZE + key_len;
        let value = buf[value_start..value_start + value_len].to_vec();

        if checksum32(&value) != checksum {
            return Err(BlockError::CorruptBlock("data block checksum mismatch".into()));
        }

        Ok((
            DataBlock {
                deleted,
                ts,
                key,
                value,
            },
            value_start + value_len,
        ))
    }

    pub fn encoded_len(&self) -> usize {
        DATA_BLOCK_HEADER_SIZE + self.key.len() + self.value.len()
    }
}

// --------------------------------------------------------------------------
// SSTable data-index entry
// --------------------------------------------------------------------------

/// A fixed 8-byte pointer to one data block, in key order.
///
/// Wire layout: magic `'I','X'`, reserved byte, block type = 2, 32-bit file
/// offset of the corresponding data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u32,
}

impl IndexEntry {
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&INDEX_ENTRY_MAGIC);
        buf.push(0); // reserved
        buf.push(BlockType::Index as u8);
        self.offset.encode_to(buf);
    }

    pub fn decode_from(buf: &[u8]) -> Result<(Self, usize), BlockError> {
        encoding::require(buf, INDEX_ENTRY_SIZE)?;
        if buf[0..2] != INDEX_ENTRY_MAGIC {
            return Err(BlockError::CorruptBlock(
                "index entry magic mismatch".into(),
            ));
        }
        if BlockType::from_u8(buf[3])? != BlockType::Index {
            return Err(BlockError::CorruptBlock("expected index block type".into()));
        }
        let (offset, _) = u32::decode_from(&buf[4..8])?;
        Ok((IndexEntry { offset }, INDEX_ENTRY_SIZE))
    }
}

// --------------------------------------------------------------------------
// SSTable bloom-filter block
// --------------------------------------------------------------------------

/// Wire layout: magic `'B','F'`, reserved, block type = 3, 32-bit bit
/// length, 32-bit byte length, raw bit-array bytes.
#[derive(Debug, Clone)]
pub struct BloomBlock {
    pub bit_len: u32,
    pub bytes: Vec<u8>,
}

impl BloomBlock {
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&BLOOM_BLOCK_MAGIC);
        buf.push(0); // reserved
        buf.push(BlockType::Bloom as u8);
        self.bit_len.encode_to(buf);
        (self.bytes.len() as u32).encode_to(buf);
        buf.extend_from_slice(&self.bytes);
    }

    pub fn decode_from(buf: &[u8]) -> Result<(Self, usize), BlockError> {
        encoding::require(buf, 12)?;
        if buf[0..2] != BLOOM_BLOCK_MAGIC {
            return Err(BlockError::CorruptBlock(
                "bloom block magic mismatch".into(),
            ));
        }
        if BlockType::from_u8(buf[3])? != BlockType::Bloom {
            return Err(BlockError::CorruptBlock("expected bloom block type".into()));
        }
        let (bit_len, _) = u32::decode_from(&buf[4..8])?;
        let (byte_len, _) = u32::decode_from(&buf[8..12])?;
        let byte_len = byte_len as usize;
        encoding::require(&buf[12..], byte_len)?;
        let bytes = buf[12..12 + byte_len].to_vec();
        Ok((BloomBlock { bit_len, bytes }, 12 + byte_len))
    }
}

// --------------------------------------------------------------------------
// SSTable footer
// --------------------------------------------------------------------------

/// Fixed 12-byte footer at the end of every non-empty SSTable file.
///
/// Wire layout: magic `'F','T'`, reserved, block type = 8, 32-bit offset of
/// the first data-index entry, 32-bit offset of the bloom-filter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub data_index_start: u32,
    pub bloom_filter_position: u32,
}

impl Footer {
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&FOOTER_MAGIC);
        buf.push(0); // reserved
        buf.push(BlockType::Footer as u8);
        self.data_index_start.encode_to(buf);
        self.bloom_filter_position.encode_to(buf);
    }

    pub fn decode_from(buf: &[u8]) -> Result<Self, BlockError> {
        encoding::require(buf, FOOTER_SIZE)?;
        if buf[0..2] != FOOTER_MAGIC {
            return Err(BlockError::CorruptBlock("footer magic mismatch".into()));
        }
        if BlockType::from_u8(buf[3])? != BlockType::Footer {
            return Err(BlockError::CorruptBlock("expected footer block type".into()));
        }
        let (data_index_start, _) = u32::decode_from(&buf[4..8])?;
        let (bloom_filter_position, _) = u32::decode_from(&buf[8..12])?;
        Ok(Footer {
            data_index_start,
            bloom_filter_position,
        })
    }
}
