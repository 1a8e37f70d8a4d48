//! Block and string table records
//!
//! Both tables are flat arrays of fixed-size records addressed by index.
//! Block records describe extents of the data region; string records hold
//! the XOR-obfuscated file names that block records point at.

use crate::core::error::{PackError, Result};
use crate::core::header::{cluster_count, round_up_to_cluster, OBFUSCATION_KEY_SIZE};
use rand::RngCore;

pub const BLOCK_RECORD_SIZE: usize = 16;
pub const STRING_RECORD_SIZE: usize = 256;

/// Longest file name in bytes (UTF-8)
pub const MAX_NAME_LENGTH: usize = 255;

const FREE_STRING_INDEX: i32 = -1;

/// One entry of the block table
///
/// ```text
/// 0..4    string_index (i32 LE, -1 = free extent)
/// 4..8    cluster_index (u32 LE, relative to the data region)
/// 8..16   length (u64 LE)
/// ```
///
/// A free record with `length == 0` is an unused table slot rather than an
/// extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockRecord {
    pub string_index: Option<u32>,
    pub cluster_index: u32,
    pub length: u64,
}

impl BlockRecord {
    pub const EMPTY: BlockRecord = BlockRecord {
        string_index: None,
        cluster_index: 0,
        length: 0,
    };

    /// A free extent; `length` is kept as given and should be cluster-aligned
    pub fn free(cluster_index: u32, length: u64) -> Self {
        BlockRecord {
            string_index: None,
            cluster_index,
            length,
        }
    }

    pub fn used(string_index: u32, cluster_index: u32, length: u64) -> Self {
        BlockRecord {
            string_index: Some(string_index),
            cluster_index,
            length,
        }
    }

    pub fn is_free(&self) -> bool {
        self.string_index.is_none()
    }

    /// Unused table slot (free and zero-length)
    pub fn is_empty_slot(&self) -> bool {
        self.is_free() && self.length == 0
    }

    /// Detach from its name, widening the length to whole clusters
    pub fn into_free(self) -> Self {
        BlockRecord::free(self.cluster_index, round_up_to_cluster(self.length))
    }

    pub fn cluster_count(&self) -> u64 {
        cluster_count(self.length)
    }

    /// One past the last cluster of this extent
    pub fn end_cluster(&self) -> u64 {
        self.cluster_index as u64 + self.cluster_count()
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_RECORD_SIZE] {
        let string_index = match self.string_index {
            Some(index) => index as i32,
            None => FREE_STRING_INDEX,
        };

        let mut bytes = [0u8; BLOCK_RECORD_SIZE];
        bytes[0..4].copy_from_slice(&string_index.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.cluster_index.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOCK_RECORD_SIZE {
            return Err(PackError::CorruptFormat(format!(
                "block record needs {} bytes, got {}",
                BLOCK_RECORD_SIZE,
                bytes.len()
            )));
        }

        let string_index = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let cluster_index = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut length = [0u8; 8];
        length.copy_from_slice(&bytes[8..16]);

        let string_index = match string_index {
            FREE_STRING_INDEX => None,
            index if index >= 0 => Some(index as u32),
            index => {
                return Err(PackError::CorruptFormat(format!(
                    "invalid string index {}",
                    index
                )))
            }
        };

        Ok(BlockRecord {
            string_index,
            cluster_index,
            length: u64::from_le_bytes(length),
        })
    }
}

/// One entry of the string table
///
/// The first `length` bytes are the UTF-8 name XORed with the archive key.
/// The remainder is random, so occupied and vacant slots look alike on disk.
#[derive(Clone, PartialEq, Eq)]
pub struct StringRecord {
    length: u8,
    bytes: [u8; MAX_NAME_LENGTH],
}

impl StringRecord {
    /// A vacant slot filled with random bytes
    pub fn vacant() -> Self {
        let mut bytes = [0u8; MAX_NAME_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        StringRecord { length: 0, bytes }
    }

    /// Obfuscate `name` with `key`
    pub fn new(name: &str, key: &[u8; OBFUSCATION_KEY_SIZE]) -> Result<Self> {
        let raw = name.as_bytes();
        if raw.len() > MAX_NAME_LENGTH {
            return Err(PackError::NameTooLong { len: raw.len() });
        }

        let mut record = StringRecord::vacant();
        record.bytes[..raw.len()].copy_from_slice(raw);
        xor_in_place(&mut record.bytes[..raw.len()], key);
        record.length = raw.len() as u8;

        Ok(record)
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Recover the plain name
    pub fn decode(&self, key: &[u8; OBFUSCATION_KEY_SIZE]) -> Result<String> {
        let mut raw = self.bytes[..self.len()].to_vec();
        xor_in_place(&mut raw, key);
        String::from_utf8(raw)
            .map_err(|_| PackError::CorruptFormat("file name is not valid UTF-8".into()))
    }

    pub fn to_bytes(&self) -> [u8; STRING_RECORD_SIZE] {
        let mut bytes = [0u8; STRING_RECORD_SIZE];
        bytes[0] = self.length;
        bytes[1..].copy_from_slice(&self.bytes);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STRING_RECORD_SIZE {
            return Err(PackError::CorruptFormat(format!(
                "string record needs {} bytes, got {}",
                STRING_RECORD_SIZE,
                bytes.len()
            )));
        }

        let mut record = StringRecord {
            length: bytes[0],
            bytes: [0u8; MAX_NAME_LENGTH],
        };
        record.bytes.copy_from_slice(&bytes[1..STRING_RECORD_SIZE]);
        Ok(record)
    }
}

impl std::fmt::Debug for StringRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StringRecord")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

fn xor_in_place(bytes: &mut [u8], key: &[u8; OBFUSCATION_KEY_SIZE]) {
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte ^= key[i % OBFUSCATION_KEY_SIZE];
    }
}
