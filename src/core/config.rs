//! Archive creation settings
//!
//! Capacity ceilings are fixed when an archive is created, so they are the
//! only settings an archive has. They can be given directly or read from a
//! TOML file:
//!
//! ```toml
//! max_file_count = 256
//! max_block_count = 512
//! access = "read-write"
//! ```

use crate::core::access::AccessMode;
use crate::core::error::{PackError, Result};
use crate::core::header::MAX_FILE_COUNT;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_MAX_FILE_COUNT: u32 = 1024;
pub const DEFAULT_MAX_BLOCK_COUNT: u32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveConfig {
    pub max_file_count: u32,
    pub max_block_count: u32,
    pub access: AccessMode,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            max_file_count: DEFAULT_MAX_FILE_COUNT,
            max_block_count: DEFAULT_MAX_BLOCK_COUNT,
            access: AccessMode::ReadWrite,
        }
    }
}

impl ArchiveConfig {
    pub fn new(max_file_count: u32, max_block_count: u32) -> Self {
        ArchiveConfig {
            max_file_count,
            max_block_count,
            ..Default::default()
        }
    }

    pub fn with_access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: ArchiveConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| PackError::Config(e.to_string()))
    }

    /// Check the settings can create an archive
    pub fn validate(&self) -> Result<()> {
        validate_capacity(self.max_file_count, self.max_block_count)?;

        if !self.access.can_write() {
            return Err(PackError::InvalidParameter(format!(
                "cannot create an archive with {} access",
                self.access
            )));
        }

        Ok(())
    }
}

/// `0 < max_file_count <= max_block_count`
pub fn validate_capacity(max_file_count: u32, max_block_count: u32) -> Result<()> {
    if max_file_count == 0 {
        return Err(PackError::InvalidParameter(
            "max file count must be positive".to_string(),
        ));
    }

    if max_block_count == 0 {
        return Err(PackError::InvalidParameter(
            "max block count must be positive".to_string(),
        ));
    }

    if max_file_count > MAX_FILE_COUNT {
        return Err(PackError::InvalidParameter(format!(
            "max file count ({}) exceeds {}",
            max_file_count, MAX_FILE_COUNT
        )));
    }

    if max_file_count > max_block_count {
        return Err(PackError::InvalidParameter(format!(
            "max file count ({}) exceeds max block count ({})",
            max_file_count, max_block_count
        )));
    }

    Ok(())
}
