//! Archive engine
//!
//! - [`header`] / [`record`]: on-disk encodings
//! - [`allocator`]: free-extent and string-slot indexes
//! - [`filesystem`]: one open archive
//! - [`controller`]: process-wide registry of open archives
//! - [`stream`]: byte-stream backends

pub mod access;
pub mod allocator;
pub mod config;
pub mod controller;
pub mod error;
pub mod filesystem;
pub mod header;
pub mod record;
pub mod stream;
pub mod validation;
