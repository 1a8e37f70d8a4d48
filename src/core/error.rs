use crate::core::access::AccessMode;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PackError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("File name is too long: {len} bytes (max 255)")]
    NameTooLong { len: usize },

    #[error("Access denied: cannot {operation} an archive opened as {access}")]
    AccessDenied {
        operation: &'static str,
        access: AccessMode,
    },

    #[error("Corrupt archive format: {0}")]
    CorruptFormat(String),

    #[error("File system is already open: {}", .0.display())]
    AlreadyOpen(PathBuf),

    #[error("File system is not registered: {}", .0.display())]
    NotOpen(PathBuf),

    #[error("File system is closed: {}", .0.display())]
    Closed(PathBuf),

    #[error("Stream factory is not set")]
    HelperNotSet,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackError {
    /// True for argument errors detected before any I/O, including over-long names.
    pub fn is_invalid_parameter(&self) -> bool {
        matches!(
            self,
            PackError::InvalidParameter(_) | PackError::NameTooLong { .. }
        )
    }
}

impl From<toml::de::Error> for PackError {
    fn from(err: toml::de::Error) -> Self {
        PackError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PackError>;
