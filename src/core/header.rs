use crate::core::error::{PackError, Result};
use crate::core::record::{BLOCK_RECORD_SIZE, STRING_RECORD_SIZE};

pub const SIGNATURE: [u8; 3] = *b"PFS";
pub const VERSION: u8 = 0;
pub const OBFUSCATION_KEY_SIZE: usize = 4;
pub const HEADER_SIZE: usize = 20;

/// Allocation granularity of the data region
pub const CLUSTER_SIZE: u64 = 4096;

/// String indices are stored as `i32` with -1 meaning free
pub const MAX_FILE_COUNT: u32 = i32::MAX as u32;

/// Number of clusters needed to hold `length` bytes
pub fn cluster_count(length: u64) -> u64 {
    length.div_ceil(CLUSTER_SIZE)
}

/// Round `length` up to a whole number of clusters, saturating at the
/// largest cluster multiple
pub fn round_up_to_cluster(length: u64) -> u64 {
    cluster_count(length)
        .checked_mul(CLUSTER_SIZE)
        .unwrap_or(u64::MAX - u64::MAX % CLUSTER_SIZE)
}

/// Archive header (offset 0)
///
/// Fixed 20-byte record. Everything except `block_count` is written once at
/// creation; `block_count` is rewritten whenever the block table grows.
///
/// ```text
/// 0..3    signature "PFS"
/// 3       version (0)
/// 4..8    obfuscation key
/// 8..12   max_file_count (u32 LE)
/// 12..16  max_block_count (u32 LE)
/// 16..20  block_count (u32 LE)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub signature: [u8; 3],
    pub version: u8,
    pub obfuscation_key: [u8; OBFUSCATION_KEY_SIZE],
    pub max_file_count: u32,
    pub max_block_count: u32,
    pub block_count: u32,
}

impl Header {
    /// Create a header for a new archive with a fresh random key
    pub fn new(max_file_count: u32, max_block_count: u32) -> Self {
        Header {
            signature: SIGNATURE,
            version: VERSION,
            obfuscation_key: rand::random(),
            max_file_count,
            max_block_count,
            block_count: 0,
        }
    }

    /// Validate signature, version and capacity bounds
    pub fn validate(&self) -> Result<()> {
        if self.signature != SIGNATURE {
            return Err(PackError::CorruptFormat("invalid signature".into()));
        }

        if self.version != VERSION {
            return Err(PackError::CorruptFormat(format!(
                "unsupported version {}",
                self.version
            )));
        }

        if self.max_file_count == 0 || self.max_block_count == 0 {
            return Err(PackError::CorruptFormat(format!(
                "zero capacity (max files {}, max blocks {})",
                self.max_file_count, self.max_block_count
            )));
        }

        if self.max_file_count > MAX_FILE_COUNT {
            return Err(PackError::CorruptFormat(format!(
                "max file count ({}) exceeds {}",
                self.max_file_count, MAX_FILE_COUNT
            )));
        }

        if self.max_file_count > self.max_block_count {
            return Err(PackError::CorruptFormat(format!(
                "max file count ({}) exceeds max block count ({})",
                self.max_file_count, self.max_block_count
            )));
        }

        if self.block_count > self.max_block_count {
            return Err(PackError::CorruptFormat(format!(
                "block count ({}) exceeds max block count ({})",
                self.block_count, self.max_block_count
            )));
        }

        Ok(())
    }

    /// Byte layout of the archive described by this header
    pub fn layout(&self) -> Layout {
        Layout::new(self.max_file_count, self.max_block_count)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..3].copy_from_slice(&self.signature);
        bytes[3] = self.version;
        bytes[4..8].copy_from_slice(&self.obfuscation_key);
        bytes[8..12].copy_from_slice(&self.max_file_count.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.max_block_count.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.block_count.to_le_bytes());
        bytes
    }

    /// Deserialize and validate a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(PackError::CorruptFormat(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let u32_at = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };

        let header = Header {
            signature: [bytes[0], bytes[1], bytes[2]],
            version: bytes[3],
            obfuscation_key: [bytes[4], bytes[5], bytes[6], bytes[7]],
            max_file_count: u32_at(8),
            max_block_count: u32_at(12),
            block_count: u32_at(16),
        };

        header.validate()?;

        Ok(header)
    }
}

/// Fixed offsets of the archive's tables and data region
///
/// Computed from the capacity ceilings only, so growing the block table
/// never moves the string table or any data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub block_table: u64,
    pub string_table: u64,
    pub data_region: u64,
}

impl Layout {
    pub fn new(max_file_count: u32, max_block_count: u32) -> Self {
        let block_table = HEADER_SIZE as u64;
        let string_table = block_table + BLOCK_RECORD_SIZE as u64 * max_block_count as u64;
        let tables_end = string_table + STRING_RECORD_SIZE as u64 * max_file_count as u64;

        Layout {
            block_table,
            string_table,
            data_region: round_up_to_cluster(tables_end),
        }
    }

    pub fn block_record(&self, index: usize) -> u64 {
        self.block_table + (index * BLOCK_RECORD_SIZE) as u64
    }

    pub fn string_record(&self, index: u32) -> u64 {
        self.string_table + index as u64 * STRING_RECORD_SIZE as u64
    }

    /// Absolute offset of a data-region cluster
    pub fn cluster(&self, cluster_index: u32) -> u64 {
        self.data_region + cluster_index as u64 * CLUSTER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_creation() {
        let header = Header::new(4, 8);
        assert_eq!(header.signature, SIGNATURE);
        assert_eq!(header.version, VERSION);
        assert_eq!(header.block_count, 0);
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_keys_differ_between_archives() {
        // 2^-32 collision chance per pair; ten tries make a false failure negligible
        let first = Header::new(1, 1).obfuscation_key;
        assert!((0..10).any(|_| Header::new(1, 1).obfuscation_key != first));
    }

    #[test]
    fn test_header_serialization() {
        let mut header = Header::new(16, 32);
        header.block_count = 7;

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..3], b"PFS");

        let deserialized = Header::from_bytes(&bytes).unwrap();
        assert_eq!(deserialized, header);
    }

    #[test]
    fn test_invalid_signature() {
        let mut bytes = Header::new(4, 8).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            Header::from_bytes(&bytes),
            Err(PackError::CorruptFormat(_))
        ));
    }

    #[test]
    fn test_invalid_version() {
        let mut header = Header::new(4, 8);
        header.version = 1;
        assert!(matches!(header.validate(), Err(PackError::CorruptFormat(_))));
    }

    #[test]
    fn test_capacity_bounds() {
        assert!(Header::new(0, 8).validate().is_err());
        assert!(Header::new(4, 0).validate().is_err());
        assert!(Header::new(8, 4).validate().is_err());

        let oversized = Header::new(MAX_FILE_COUNT + 1, u32::MAX);
        assert!(matches!(
            oversized.validate(),
            Err(PackError::CorruptFormat(_))
        ));
        assert!(Header::new(MAX_FILE_COUNT, u32::MAX).validate().is_ok());

        let mut header = Header::new(4, 8);
        header.block_count = 9;
        assert!(header.validate().is_err());
        header.block_count = 8;
        assert!(header.validate().is_ok());
    }

    #[test]
    fn test_truncated_header() {
        let bytes = Header::new(4, 8).to_bytes();
        assert!(matches!(
            Header::from_bytes(&bytes[..10]),
            Err(PackError::CorruptFormat(_))
        ));
    }

    #[test]
    fn test_cluster_math() {
        assert_eq!(cluster_count(0), 0);
        assert_eq!(cluster_count(1), 1);
        assert_eq!(cluster_count(4096), 1);
        assert_eq!(cluster_count(4097), 2);
        assert_eq!(round_up_to_cluster(5000), 8192);
        assert_eq!(cluster_count(u64::MAX), u64::MAX / CLUSTER_SIZE + 1);
        assert_eq!(round_up_to_cluster(u64::MAX - 10), u64::MAX - 4095);
    }

    #[test]
    fn test_layout() {
        let layout = Layout::new(4, 8);
        assert_eq!(layout.block_table, 20);
        assert_eq!(layout.string_table, 20 + 16 * 8);
        // 20 + 128 + 1024 = 1172 -> one cluster
        assert_eq!(layout.data_region, 4096);
        assert_eq!(layout.block_record(2), 20 + 32);
        assert_eq!(layout.string_record(1), 148 + 256);
        assert_eq!(layout.cluster(3), 4096 * 4);

        let big = Layout::new(100, 100);
        // 20 + 1600 + 25600 = 27220 -> 7 clusters
        assert_eq!(big.data_region, 7 * 4096);
    }
}
