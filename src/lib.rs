//! # PackFS - Packed Single-File Virtual Filesystem
//!
//! `packfs-rs` stores many named byte blobs inside one container file. The
//! container carries its own allocator and name table:
//!
//! - **Cluster allocation** in 4 KiB units with smallest-sufficient-fit reuse
//! - **Free-extent merging** so deleted neighbours coalesce into one extent
//! - **Obfuscated name table** with slot recycling
//! - **Pluggable streams**: host files, in-memory buffers, or any
//!   [`ArchiveStream`] implementation
//!
//! ## Quick Start
//!
//! ```rust
//! use packfs_rs::{AccessMode, FileSystem, MemoryStream, Result};
//!
//! # fn main() -> Result<()> {
//! let mut fs = FileSystem::create(
//!     "/virtual/assets.pfs",
//!     AccessMode::ReadWrite,
//!     Box::new(MemoryStream::new()),
//!     64,  // max files
//!     128, // max block records
//! )?;
//!
//! assert!(fs.write_file("textures/hero.png", b"not really a png")?);
//! assert_eq!(fs.read_file("textures/hero.png")?.unwrap(), b"not really a png");
//!
//! fs.rename_file("textures/hero.png", "textures/villain.png")?;
//! assert!(fs.delete_file("textures/villain.png")?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Registry
//!
//! ```rust,no_run
//! use packfs_rs::{AccessMode, FileStreamFactory, FileSystemController, Result};
//!
//! # fn main() -> Result<()> {
//! let controller = FileSystemController::with_stream_factory(FileStreamFactory);
//!
//! let handle = controller.create_file_system("data.pfs", AccessMode::ReadWrite, 256, 512)?;
//! handle.lock().write_file("readme.txt", b"hello")?;
//!
//! controller.destroy_file_system(&handle, false)?;
//! let handle = controller.load_file_system("data.pfs", AccessMode::Read)?;
//! assert!(handle.lock().has_file("readme.txt"));
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    access::AccessMode,
    config::ArchiveConfig,
    controller::{FileSystemController, FileSystemHandle},
    error::{PackError, Result},
    filesystem::{FileInfo, FileSystem, FileSystemStats},
    header::{Header, CLUSTER_SIZE},
    record::{BlockRecord, MAX_NAME_LENGTH},
    stream::{
        ArchiveStream, FileStream, FileStreamFactory, MemoryStream, MemoryStreamFactory,
        StreamFactory,
    },
};
