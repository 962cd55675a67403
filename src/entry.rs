//! Log entry model and on-disk codec.
//!
//! Each entry is a self-delimiting record appended to a segment file:
//!
//! ```text
//! +---------+-----------+-------+-----+------------+----------+----------+
//! |crc32:u32|timestamp  |tx_id  |ttl  |bucket_len  |key_len   |value_len |
//! |         |u64        |u64    |u32  |u32         |u32       |u32       |
//! +---------+-----------+-------+-----+------------+----------+----------+
//! |flag:u16 |ds:u16     |status:u16   | bucket     | key      | value    |
//! +---------+-----------+-------------+------------+----------+----------+
//! ```
//!
//! All multi-byte integers use big-endian encoding. The CRC32 checksum
//! covers everything after the checksum itself. The status byte pair on
//! the last entry of a transaction is the transaction's committed marker.

use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errdata;
use crate::error::{Error, Result};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Fixed byte length of the encoded entry header.
pub const ENTRY_HEADER_SIZE: u64 = 42;

/// TTL value marking an entry as persistent.
pub const PERSISTENT: u32 = 0;

/// Operation kind carried by an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Flag {
    Set = 0,
    Delete = 1,
    BPTreeBucketDelete = 2,
    SetBucketDelete = 3,
    SortedSetBucketDelete = 4,
    ListBucketDelete = 5,
    ZAdd = 6,
    ZRem = 7,
    ZRemRangeByRank = 8,
    ZPopMax = 9,
    ZPopMin = 10,
    LPush = 11,
    RPush = 12,
    LRem = 13,
    LPop = 14,
    RPop = 15,
    LSet = 16,
    LTrim = 17,
    LRemByIndex = 18,
    ExpireList = 19,
}

impl Flag {
    pub fn from_u16(raw: u16) -> Result<Self> {
        use Flag::*;
        Ok(match raw {
            0 => Set,
            1 => Delete,
            2 => BPTreeBucketDelete,
            3 => SetBucketDelete,
            4 => SortedSetBucketDelete,
            5 => ListBucketDelete,
            6 => ZAdd,
            7 => ZRem,
            8 => ZRemRangeByRank,
            9 => ZPopMax,
            10 => ZPopMin,
            11 => LPush,
            12 => RPush,
            13 => LRem,
            14 => LPop,
            15 => RPop,
            16 => LSet,
            17 => LTrim,
            18 => LRemByIndex,
            19 => ExpireList,
            other => return Err(errdata!("unknown entry flag {other}")),
        })
    }
}

/// Which secondary data structure an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DataStructure {
    None = 0,
    Tree = 1,
    List = 2,
    Set = 3,
    SortedSet = 4,
}

impl DataStructure {
    pub fn from_u16(raw: u16) -> Result<Self> {
        Ok(match raw {
            0 => DataStructure::None,
            1 => DataStructure::Tree,
            2 => DataStructure::List,
            3 => DataStructure::Set,
            4 => DataStructure::SortedSet,
            other => return Err(errdata!("unknown data structure tag {other}")),
        })
    }
}

/// Commit status of an entry. Within a transaction only the last entry
/// is stamped Committed; recovery treats a transaction as committed iff
/// a Committed-marked entry with its TxID is found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    UnCommitted = 0,
    Committed = 1,
}

impl Status {
    pub fn from_u16(raw: u16) -> Result<Self> {
        Ok(match raw {
            0 => Status::UnCommitted,
            1 => Status::Committed,
            other => return Err(errdata!("unknown entry status {other}")),
        })
    }
}

/// Entry metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetaData {
    /// Wall-clock timestamp of the write, in milliseconds.
    pub timestamp: u64,
    /// Time to live in seconds; [`PERSISTENT`] (zero) means no expiry.
    pub ttl: u32,
    pub flag: Flag,
    pub ds: DataStructure,
    pub status: Status,
    pub tx_id: u64,
    pub bucket_size: u32,
    pub key_size: u32,
    pub value_size: u32,
}

/// A single log record: a mutation against one key of one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub meta: MetaData,
}

impl Entry {
    pub fn new(bucket: Vec<u8>, key: Vec<u8>, value: Vec<u8>, meta: MetaData) -> Self {
        Self {
            bucket,
            key,
            value,
            meta,
        }
    }

    /// Total encoded size of the entry in bytes.
    pub fn size(&self) -> u64 {
        ENTRY_HEADER_SIZE + self.bucket.len() as u64 + self.key.len() as u64 + self.value.len() as u64
    }

    /// Validates user-supplied fields before the entry joins a pending batch.
    pub fn valid(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::KeyEmpty);
        }
        if self.bucket.is_empty() {
            return Err(Error::BucketEmpty);
        }
        Ok(())
    }

    /// Appends the encoded entry to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let start = buf.len();
        buf.write_u32::<BigEndian>(0)?; // crc placeholder
        buf.write_u64::<BigEndian>(self.meta.timestamp)?;
        buf.write_u64::<BigEndian>(self.meta.tx_id)?;
        buf.write_u32::<BigEndian>(self.meta.ttl)?;
        buf.write_u32::<BigEndian>(self.bucket.len() as u32)?;
        buf.write_u32::<BigEndian>(self.key.len() as u32)?;
        buf.write_u32::<BigEndian>(self.value.len() as u32)?;
        buf.write_u16::<BigEndian>(self.meta.flag as u16)?;
        buf.write_u16::<BigEndian>(self.meta.ds as u16)?;
        buf.write_u16::<BigEndian>(self.meta.status as u16)?;
        buf.extend_from_slice(&self.bucket);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);

        let crc = CRC32.checksum(&buf[start + 4..]);
        buf[start..start + 4].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Encodes the entry into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size() as usize);
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decodes one entry from the front of `buf`, verifying its checksum.
    /// Returns the entry and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Entry, u64)> {
        if (buf.len() as u64) < ENTRY_HEADER_SIZE {
            return Err(errdata!("entry header truncated"));
        }

        let mut cursor = Cursor::new(buf);
        let stored_crc = cursor.read_u32::<BigEndian>()?;
        let timestamp = cursor.read_u64::<BigEndian>()?;
        let tx_id = cursor.read_u64::<BigEndian>()?;
        let ttl = cursor.read_u32::<BigEndian>()?;
        let bucket_size = cursor.read_u32::<BigEndian>()?;
        let key_size = cursor.read_u32::<BigEndian>()?;
        let value_size = cursor.read_u32::<BigEndian>()?;
        let flag = Flag::from_u16(cursor.read_u16::<BigEndian>()?)?;
        let ds = DataStructure::from_u16(cursor.read_u16::<BigEndian>()?)?;
        let status = Status::from_u16(cursor.read_u16::<BigEndian>()?)?;

        let payload = u64::from(bucket_size) + u64::from(key_size) + u64::from(value_size);
        let total = ENTRY_HEADER_SIZE + payload;
        if (buf.len() as u64) < total {
            return Err(errdata!("entry payload truncated"));
        }

        let computed_crc = CRC32.checksum(&buf[4..total as usize]);
        if computed_crc != stored_crc {
            return Err(errdata!(
                "entry checksum mismatch: stored={stored_crc}, computed={computed_crc}"
            ));
        }

        let mut off = ENTRY_HEADER_SIZE as usize;
        let bucket = buf[off..off + bucket_size as usize].to_vec();
        off += bucket_size as usize;
        let key = buf[off..off + key_size as usize].to_vec();
        off += key_size as usize;
        let value = buf[off..off + value_size as usize].to_vec();

        let entry = Entry {
            bucket,
            key,
            value,
            meta: MetaData {
                timestamp,
                ttl,
                flag,
                ds,
                status,
                tx_id,
                bucket_size,
                key_size,
                value_size,
            },
        };

        Ok((entry, total))
    }
}

/// Current wall-clock time in unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Whether an entry written at `timestamp` (ms) with the given `ttl`
/// (seconds) has already expired.
pub fn is_expired(ttl: u32, timestamp: u64) -> bool {
    ttl != PERSISTENT && now_millis() > timestamp + u64::from(ttl) * 1000
}
