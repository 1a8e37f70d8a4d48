//! Archive open modes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How an archive was opened
///
/// Reads require `Read` or `ReadWrite`; writes, renames and deletes require
/// `Write` or `ReadWrite`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        self as u8 & AccessMode::Read as u8 != 0
    }

    pub fn can_write(self) -> bool {
        self as u8 & AccessMode::Write as u8 != 0
    }
}

impl Default for AccessMode {
    fn default() -> Self {
        AccessMode::ReadWrite
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::ReadWrite => "read-write",
        };
        f.write_str(s)
    }
}

impl FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" | "r" => Ok(AccessMode::Read),
            "write" | "w" => Ok(AccessMode::Write),
            "read-write" | "read_write" | "readwrite" | "rw" => Ok(AccessMode::ReadWrite),
            _ => Err(format!(
                "Invalid access mode '{}'. Valid options: read, write, read-write",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        assert!(AccessMode::Read.can_read());
        assert!(!AccessMode::Read.can_write());
        assert!(!AccessMode::Write.can_read());
        assert!(AccessMode::Write.can_write());
        assert!(AccessMode::ReadWrite.can_read());
        assert!(AccessMode::ReadWrite.can_write());
    }

    #[test]
    fn test_parse_and_display() {
        for mode in [AccessMode::Read, AccessMode::Write, AccessMode::ReadWrite] {
            assert_eq!(mode.to_string().parse::<AccessMode>().unwrap(), mode);
        }
        assert_eq!("RW".parse::<AccessMode>().unwrap(), AccessMode::ReadWrite);
        assert!("append".parse::<AccessMode>().is_err());
    }
}
