//! Packed archive file system
//!
//! One [`FileSystem`] owns one archive stream and keeps an in-memory index
//! rebuilt from the on-disk tables:
//!
//! - name -> block index
//! - block index -> [`BlockRecord`] (mirror of the block table)
//! - free length -> block indices ([`FreeBlockIndex`])
//! - string slots in use and a queue of recycled ones ([`StringSlots`])
//!
//! Every mutating call writes the records it touched back to the stream and
//! flushes before returning, so the archive is consistent between calls.
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Header (20 bytes)                      │
//! ├────────────────────────────────────────┤
//! │ Block table (max_block_count × 16)     │
//! ├────────────────────────────────────────┤
//! │ String table (max_file_count × 256)    │
//! ├──────────── pad to 4 KiB ──────────────┤
//! │ Data region (4 KiB clusters)           │
//! └────────────────────────────────────────┘
//! ```

use crate::core::access::AccessMode;
use crate::core::allocator::extent::Extent;
use crate::core::allocator::{FreeBlockIndex, StringSlots};
use crate::core::config::validate_capacity;
use crate::core::error::{PackError, Result};
use crate::core::header::{
    cluster_count, round_up_to_cluster, Header, Layout, CLUSTER_SIZE, HEADER_SIZE,
};
use crate::core::record::{BlockRecord, StringRecord, BLOCK_RECORD_SIZE, STRING_RECORD_SIZE};
use crate::core::stream::ArchiveStream;
use crate::core::validation::validate_file_name;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Location of one file inside the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    /// Absolute byte offset within the archive stream
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FileSystemStats {
    pub file_count: usize,
    pub max_file_count: u32,
    pub block_count: u32,
    pub max_block_count: u32,
    pub free_extent_count: usize,
    pub free_bytes: u64,
    /// Bytes of the data region covered by block records
    pub data_bytes: u64,
    /// 0.0 when free space is one extent, higher as it splinters
    pub fragmentation: f64,
}

/// A packed archive opened for reading and/or writing
pub struct FileSystem {
    full_path: PathBuf,
    access: AccessMode,
    /// `None` once closed
    stream: Option<Box<dyn ArchiveStream>>,
    header: Header,
    layout: Layout,
    files: HashMap<String, usize>,
    blocks: Vec<BlockRecord>,
    free_blocks: FreeBlockIndex,
    strings: StringSlots,
}

impl FileSystem {
    /// Create an empty archive on `stream`
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if the capacities violate
    /// `0 < max_file_count <= max_block_count` or `access` cannot write.
    pub fn create<P: Into<PathBuf>>(
        full_path: P,
        access: AccessMode,
        mut stream: Box<dyn ArchiveStream>,
        max_file_count: u32,
        max_block_count: u32,
    ) -> Result<Self> {
        validate_capacity(max_file_count, max_block_count)?;
        if !access.can_write() {
            return Err(PackError::InvalidParameter(format!(
                "cannot create an archive with {} access",
                access
            )));
        }

        let header = Header::new(max_file_count, max_block_count);
        let layout = header.layout();

        stream.set_len(0)?;
        stream.set_position(0)?;
        stream.write_all(&header.to_bytes())?;

        // Vacant string slots are random so they look like occupied ones
        let mut string_table = Vec::with_capacity(STRING_RECORD_SIZE * max_file_count as usize);
        for _ in 0..max_file_count {
            string_table.extend_from_slice(&StringRecord::vacant().to_bytes());
        }
        stream.set_position(layout.string_table)?;
        stream.write_all(&string_table)?;

        stream.set_len(layout.data_region)?;
        stream.flush()?;

        let full_path = full_path.into();
        info!(
            "Created file system {:?} (max files {}, max blocks {})",
            full_path, max_file_count, max_block_count
        );

        Ok(FileSystem {
            full_path,
            access,
            stream: Some(stream),
            header,
            layout,
            files: HashMap::new(),
            blocks: Vec::new(),
            free_blocks: FreeBlockIndex::new(),
            strings: StringSlots::new(max_file_count),
        })
    }

    /// Open an existing archive and rebuild the index from its tables
    ///
    /// # Errors
    ///
    /// `CorruptFormat` when the header fails validation, the tables are
    /// truncated, a record points outside the archive, or two records claim
    /// the same clusters.
    ///
    /// Leftovers of an interrupted write are repaired: a second block naming
    /// an existing file and a free record nested inside a larger free record
    /// become free space, and clusters past the last record are cut off.
    /// Repairs are written back when `access` allows it.
    pub fn load<P: Into<PathBuf>>(
        full_path: P,
        access: AccessMode,
        mut stream: Box<dyn ArchiveStream>,
    ) -> Result<Self> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        stream.set_position(0)?;
        let n = stream.read_range(&mut header_bytes, 0, HEADER_SIZE)?;
        let header = Header::from_bytes(&header_bytes[..n])?;
        let layout = header.layout();

        let stream_len = stream.len()?;
        if stream_len < layout.data_region {
            return Err(PackError::CorruptFormat(format!(
                "archive is {} bytes, tables need {}",
                stream_len, layout.data_region
            )));
        }
        let mut data_clusters = cluster_count(stream_len - layout.data_region);

        let mut table = vec![0u8; header.block_count as usize * BLOCK_RECORD_SIZE];
        stream.set_position(layout.block_table)?;
        stream.read_exact(&mut table)?;

        let mut blocks = Vec::with_capacity(header.block_count as usize);
        for chunk in table.chunks_exact(BLOCK_RECORD_SIZE) {
            blocks.push(BlockRecord::from_bytes(chunk)?);
        }

        for (index, block) in blocks.iter().enumerate() {
            let available = data_clusters.saturating_sub(block.cluster_index as u64);
            if block.length > available.saturating_mul(CLUSTER_SIZE) {
                return Err(PackError::CorruptFormat(format!(
                    "block {} ({} bytes at cluster {}) runs past the {} data clusters",
                    index, block.length, block.cluster_index, data_clusters
                )));
            }
        }

        let tiling = tile_blocks(&blocks)?;
        let mut repaired = Vec::new();
        for &index in &tiling.nested {
            warn!(
                "Free block {} lies inside another free block, dropping it",
                index
            );
            blocks[index] = BlockRecord::EMPTY;
            repaired.push(index);
        }
        if tiling.covered < data_clusters {
            warn!(
                "Clusters {}..{} are not covered by any block, discarding them",
                tiling.covered, data_clusters
            );
            if access.can_write() {
                stream.set_len(layout.data_region + tiling.covered * CLUSTER_SIZE)?;
            }
            data_clusters = tiling.covered;
        }
        debug!("Data region holds {} clusters", data_clusters);

        let mut files = HashMap::new();
        let mut free_blocks = FreeBlockIndex::new();
        let mut occupied = BTreeMap::new();

        for index in 0..blocks.len() {
            let block = blocks[index];
            let Some(string_index) = block.string_index else {
                free_blocks.insert(block.length, index);
                continue;
            };

            if string_index >= header.max_file_count {
                return Err(PackError::CorruptFormat(format!(
                    "block {} references string {} (max {})",
                    index, string_index, header.max_file_count
                )));
            }

            let record = read_string(stream.as_mut(), &layout, string_index)?;
            let name = record.decode(&header.obfuscation_key)?;
            validate_file_name(&name)
                .map_err(|e| PackError::CorruptFormat(format!("block {}: {}", index, e)))?;

            // A crash during an overwrite can leave two blocks naming one
            // file; either one is a committed version, keep the first.
            if occupied.contains_key(&string_index) || files.contains_key(&name) {
                warn!(
                    "Block {} duplicates file {:?}, treating it as free space",
                    index, name
                );
                let freed = block.into_free();
                blocks[index] = freed;
                free_blocks.insert(freed.length, index);
                repaired.push(index);
                continue;
            }

            occupied.insert(string_index, record);
            files.insert(name, index);
        }

        let full_path = full_path.into();
        info!(
            "Loaded file system {:?} ({} files, {} blocks)",
            full_path,
            files.len(),
            blocks.len()
        );

        let mut fs = FileSystem {
            full_path,
            access,
            stream: Some(stream),
            strings: StringSlots::rebuild(header.max_file_count, occupied),
            header,
            layout,
            files,
            blocks,
            free_blocks,
        };

        if access.can_write() && !repaired.is_empty() {
            for index in repaired {
                fs.write_block(index)?;
            }
            fs.stream()?.flush()?;
        }

        Ok(fs)
    }

    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn max_file_count(&self) -> u32 {
        self.header.max_file_count
    }

    pub fn block_count(&self) -> u32 {
        self.header.block_count
    }

    pub fn max_block_count(&self) -> u32 {
        self.header.max_block_count
    }

    /// Absolute offset of cluster 0
    pub fn data_region_offset(&self) -> u64 {
        self.layout.data_region
    }

    /// The block table as held in memory
    pub fn blocks(&self) -> &[BlockRecord] {
        &self.blocks
    }

    /// Free extents as `(block index, record)`, in cluster order
    pub fn free_extents(&self) -> Vec<(usize, BlockRecord)> {
        let mut extents: Vec<_> = self
            .free_blocks
            .extents()
            .map(|(_, index)| (index, self.blocks[index]))
            .collect();
        extents.sort_by_key(|(_, block)| block.cluster_index);
        extents
    }

    /// Number of unused block-table slots available for reuse
    pub fn empty_slot_count(&self) -> usize {
        self.free_blocks.empty_slot_count()
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn get_file_info(&self, name: &str) -> Option<FileInfo> {
        let &index = self.files.get(name)?;
        Some(self.file_info(name, index))
    }

    /// Every file, sorted by name
    pub fn get_all_file_infos(&self) -> Vec<FileInfo> {
        let mut infos: Vec<_> = self
            .files
            .iter()
            .map(|(name, &index)| self.file_info(name, index))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn file_info(&self, name: &str, block_index: usize) -> FileInfo {
        let block = &self.blocks[block_index];
        FileInfo {
            name: name.to_string(),
            offset: self.layout.cluster(block.cluster_index),
            length: block.length,
        }
    }

    pub fn stats(&self) -> FileSystemStats {
        let free_bytes = self.free_blocks.free_bytes();
        let free_extent_count = self.free_blocks.extent_count();
        let fragmentation = if free_extent_count <= 1 {
            0.0
        } else {
            (free_extent_count as f64 - 1.0) / (free_bytes / CLUSTER_SIZE) as f64
        };

        FileSystemStats {
            file_count: self.files.len(),
            max_file_count: self.header.max_file_count,
            block_count: self.header.block_count,
            max_block_count: self.header.max_block_count,
            free_extent_count,
            free_bytes,
            data_bytes: self.data_clusters() * CLUSTER_SIZE,
            fragmentation,
        }
    }

    fn data_clusters(&self) -> u64 {
        self.blocks
            .iter()
            .filter(|block| block.length > 0)
            .map(BlockRecord::end_cluster)
            .max()
            .unwrap_or(0)
    }

    /// Check that the block records tile the data region and the indexes agree
    ///
    /// Unlike [`FileSystem::load`] nothing is repaired: nested free records
    /// and uncovered clusters are reported as corruption.
    pub fn verify(&mut self) -> Result<()> {
        let stream_len = self.stream()?.len()?;
        let data_clusters = cluster_count(stream_len.saturating_sub(self.layout.data_region));

        let tiling = tile_blocks(&self.blocks)?;
        if let Some(index) = tiling.nested.first() {
            return Err(PackError::CorruptFormat(format!(
                "free block {} lies inside another free block",
                index
            )));
        }
        if tiling.covered != data_clusters {
            return Err(PackError::CorruptFormat(format!(
                "blocks cover {} clusters, data region has {}",
                tiling.covered, data_clusters
            )));
        }

        for (name, &index) in &self.files {
            let block = &self.blocks[index];
            let Some(string_index) = block.string_index else {
                return Err(PackError::CorruptFormat(format!(
                    "file {:?} points at free block {}",
                    name, index
                )));
            };
            let record = self.strings.get(string_index).ok_or_else(|| {
                PackError::CorruptFormat(format!("file {:?} has no string record", name))
            })?;
            if record.decode(&self.header.obfuscation_key)? != *name {
                return Err(PackError::CorruptFormat(format!(
                    "string {} does not decode to {:?}",
                    string_index, name
                )));
            }
        }

        for (index, block) in self.blocks.iter().enumerate() {
            if block.is_free() && !self.free_blocks.contains(block.length, index) {
                return Err(PackError::CorruptFormat(format!(
                    "free block {} is missing from the free index",
                    index
                )));
            }
        }

        if self.header.block_count as usize != self.blocks.len()
            || self.files.len() > self.header.max_file_count as usize
        {
            return Err(PackError::CorruptFormat("capacity counters disagree".into()));
        }

        Ok(())
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Whole file contents, `None` if there is no such file
    pub fn read_file(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        self.read_file_segment(name, 0, u64::MAX)
    }

    /// Read into `buffer`, returning the bytes copied (0 for a missing file)
    pub fn read_file_into(&mut self, name: &str, buffer: &mut [u8]) -> Result<usize> {
        self.read_file_segment_into(name, 0, buffer)
    }

    /// Copy the whole file into `dst`, returning the bytes copied
    pub fn read_file_to(&mut self, name: &str, dst: &mut dyn Write) -> Result<u64> {
        self.read_file_segment_to(name, 0, u64::MAX, dst)
    }

    /// Up to `length` bytes starting at `offset` within the file
    ///
    /// Requests past the end of the file are truncated, not rejected.
    pub fn read_file_segment(
        &mut self,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<Option<Vec<u8>>> {
        self.check_read("read")?;
        let Some((position, length)) = self.segment(name, offset, length)? else {
            return Ok(None);
        };

        let mut buffer = vec![0u8; length as usize];
        let stream = self.stream()?;
        stream.set_position(position)?;
        stream.read_exact(&mut buffer)?;

        debug!("Read {} bytes of {} at offset {}", length, name, offset);
        Ok(Some(buffer))
    }

    pub fn read_file_segment_into(
        &mut self,
        name: &str,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<usize> {
        self.check_read("read")?;
        let Some((position, length)) = self.segment(name, offset, buffer.len() as u64)? else {
            return Ok(0);
        };

        let length = length as usize;
        let stream = self.stream()?;
        stream.set_position(position)?;
        stream.read_exact(&mut buffer[..length])?;
        Ok(length)
    }

    pub fn read_file_segment_to(
        &mut self,
        name: &str,
        offset: u64,
        length: u64,
        dst: &mut dyn Write,
    ) -> Result<u64> {
        self.check_read("read")?;
        let Some((position, length)) = self.segment(name, offset, length)? else {
            return Ok(0);
        };

        let stream = self.stream()?;
        stream.set_position(position)?;
        let copied = stream.copy_to(dst, length)?;
        if copied < length {
            return Err(short_stream(position, length, copied));
        }
        Ok(copied)
    }

    /// Extract a file to the host filesystem, `false` if there is no such file
    pub fn save_as_file<P: AsRef<Path>>(&mut self, name: &str, path: P) -> Result<bool> {
        self.check_read("read")?;
        validate_file_name(name)?;
        if !self.has_file(name) {
            return Ok(false);
        }

        let mut file = File::create(path.as_ref())?;
        let copied = self.read_file_to(name, &mut file)?;
        file.flush()?;

        debug!("Saved {} ({} bytes) to {:?}", name, copied, path.as_ref());
        Ok(true)
    }

    /// Absolute position and clamped length of a file segment
    fn segment(&self, name: &str, offset: u64, length: u64) -> Result<Option<(u64, u64)>> {
        validate_file_name(name)?;
        let Some(info) = self.get_file_info(name) else {
            return Ok(None);
        };

        let offset = offset.min(info.length);
        let length = length.min(info.length - offset);
        Ok(Some((info.offset + offset, length)))
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Store `data` under `name`, replacing any existing file
    ///
    /// Returns `Ok(false)` when the archive is full: no name slot for a new
    /// file, or no block-table slot for the allocation.
    pub fn write_file(&mut self, name: &str, data: &[u8]) -> Result<bool> {
        self.write_with(name, data.len() as u64, |stream| stream.write_all(data))
    }

    /// Store the remaining bytes of `reader` (from its current position)
    pub fn write_file_from_reader<R: Read + Seek>(
        &mut self,
        name: &str,
        reader: &mut R,
    ) -> Result<bool> {
        let start = reader.stream_position()?;
        let end = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(start))?;
        let length = end.saturating_sub(start);

        self.write_with(name, length, |stream| {
            let copied = stream.copy_from(reader, length)?;
            if copied < length {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("source ended after {} of {} bytes", copied, length),
                ));
            }
            Ok(())
        })
    }

    /// Store the contents of a host file
    pub fn write_file_from_path<P: AsRef<Path>>(&mut self, name: &str, path: P) -> Result<bool> {
        let mut file = File::open(path)?;
        self.write_file_from_reader(name, &mut file)
    }

    fn write_with<F>(&mut self, name: &str, length: u64, write_payload: F) -> Result<bool>
    where
        F: FnOnce(&mut dyn ArchiveStream) -> io::Result<()>,
    {
        self.check_write("write")?;
        validate_file_name(name)?;
        let string_record = StringRecord::new(name, &self.header.obfuscation_key)?;

        let old_block = self.files.get(name).copied();
        if old_block.is_none() && self.files.len() >= self.header.max_file_count as usize {
            warn!(
                "Cannot write {}: file count reached its maximum of {}",
                name, self.header.max_file_count
            );
            return Ok(false);
        }

        let Some(block_index) = self.allocate_block(length)? else {
            warn!("Cannot write {}: no space for {} bytes", name, length);
            return Ok(false);
        };

        if length > 0 {
            let position = self.layout.cluster(self.blocks[block_index].cluster_index);
            let stream = self.stream()?;
            let written = stream
                .set_position(position)
                .and_then(|_| write_payload(stream));
            if let Err(e) = written {
                self.free_block(block_index)?;
                return Err(e.into());
            }
        }

        let string_index = match old_block.and_then(|old| self.blocks[old].string_index) {
            Some(string_index) => string_index,
            None => match self.allocate_string(string_record)? {
                Some(string_index) => string_index,
                None => {
                    self.free_block(block_index)?;
                    warn!("Cannot write {}: string table is full", name);
                    return Ok(false);
                }
            },
        };

        let cluster_index = self.blocks[block_index].cluster_index;
        self.blocks[block_index] = BlockRecord::used(string_index, cluster_index, length);
        self.write_block(block_index)?;
        self.files.insert(name.to_string(), block_index);

        if let Some(old) = old_block {
            self.free_block(old)?;
        }

        self.stream()?.flush()?;
        debug!(
            "Wrote {} bytes to {} (block {}, cluster {})",
            length, name, block_index, cluster_index
        );
        Ok(true)
    }

    /// Rename a file; only its string record changes
    ///
    /// Returns `Ok(false)` if `old_name` does not exist or `new_name` does.
    pub fn rename_file(&mut self, old_name: &str, new_name: &str) -> Result<bool> {
        self.check_write("rename")?;
        validate_file_name(old_name)?;
        validate_file_name(new_name)?;

        let Some(&block_index) = self.files.get(old_name) else {
            return Ok(false);
        };
        if old_name == new_name {
            return Ok(true);
        }
        if self.files.contains_key(new_name) {
            return Ok(false);
        }

        let string_index = self.blocks[block_index].string_index.ok_or_else(|| {
            PackError::CorruptFormat(format!("file {:?} points at a free block", old_name))
        })?;
        let record = StringRecord::new(new_name, &self.header.obfuscation_key)?;
        self.write_string(string_index, &record)?;
        self.strings.replace(string_index, record);

        self.files.remove(old_name);
        self.files.insert(new_name.to_string(), block_index);

        self.stream()?.flush()?;
        debug!("Renamed {} to {}", old_name, new_name);
        Ok(true)
    }

    /// Delete a file, `false` if there is no such file
    pub fn delete_file(&mut self, name: &str) -> Result<bool> {
        self.check_write("delete")?;
        validate_file_name(name)?;

        let Some(block_index) = self.files.remove(name) else {
            return Ok(false);
        };

        let string_index = self.blocks[block_index].string_index;
        self.free_block(block_index)?;
        if let Some(string_index) = string_index {
            self.release_string(string_index)?;
        }

        self.stream()?.flush()?;
        debug!("Deleted {} (block {})", name, block_index);
        Ok(true)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.stream()?.flush()?;
        Ok(())
    }

    /// Flush and close the stream
    pub fn shutdown(mut self) -> Result<()> {
        self.close()
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Close the stream while other handles may still reference `self`
    ///
    /// Every later call fails with `Closed`. Closing twice is a no-op.
    pub(crate) fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.close()?;
            info!("Shut down file system {:?}", self.full_path);
        }
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut dyn ArchiveStream> {
        match self.stream.as_deref_mut() {
            Some(stream) => Ok(stream),
            None => Err(PackError::Closed(self.full_path.clone())),
        }
    }

    // ---------------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------------

    /// Reserve a block for `length` bytes
    ///
    /// - `length == 0`: an unused block-table slot
    /// - otherwise the smallest sufficient free extent, split when larger
    ///   than needed, or else fresh clusters appended to the stream
    ///
    /// Until the caller commits it, the block is recorded on disk as free
    /// space, so an interrupted write never leaves a dangling file.
    fn allocate_block(&mut self, length: u64) -> Result<Option<usize>> {
        if length == 0 {
            return self.allocate_empty_slot();
        }

        let length = round_up_to_cluster(length);

        if let Some((found, index)) = self.free_blocks.find_sufficient(length, &self.blocks) {
            if found == length {
                self.free_blocks.remove(found, index);
                debug!("Reusing free block {} ({} bytes)", index, found);
                return Ok(Some(index));
            }

            // The remainder needs a block-table slot of its own
            let Some(remainder_index) = self.allocate_empty_slot()? else {
                warn!(
                    "Cannot split free block {}: block table is full ({})",
                    index, self.header.max_block_count
                );
                return Ok(None);
            };

            // The remainder is persisted before the extent shrinks, so a
            // crash in between leaves it nested in the old extent rather
            // than leaving a hole.
            self.free_blocks.remove(found, index);
            let cluster_index = self.blocks[index].cluster_index;
            let remainder = BlockRecord::free(
                cluster_index + cluster_count(length) as u32,
                found - length,
            );
            self.blocks[remainder_index] = remainder;
            self.write_block(remainder_index)?;
            self.free_blocks.insert(remainder.length, remainder_index);

            self.blocks[index] = BlockRecord::free(cluster_index, length);
            self.write_block(index)?;

            debug!(
                "Split free block {} ({} bytes), remainder {} bytes in block {}",
                index, found, remainder.length, remainder_index
            );
            return Ok(Some(index));
        }

        let Some(index) = self.allocate_empty_slot()? else {
            warn!(
                "Cannot grow archive: block table is full ({})",
                self.header.max_block_count
            );
            return Ok(None);
        };

        let data_len = self.stream()?.len()?.saturating_sub(self.layout.data_region);
        let start_cluster = cluster_count(data_len);
        if start_cluster + cluster_count(length) > u32::MAX as u64 {
            self.free_blocks.insert(0, index);
            warn!("Cannot grow archive: cluster index space exhausted");
            return Ok(None);
        }

        let new_len = self.layout.data_region + start_cluster * CLUSTER_SIZE + length;
        let resized = self.stream()?.set_len(new_len);
        if let Err(e) = resized {
            self.free_blocks.insert(0, index);
            return Err(e.into());
        }

        self.blocks[index] = BlockRecord::free(start_cluster as u32, length);
        self.write_block(index)?;

        debug!(
            "Appended {} bytes at cluster {} (block {})",
            length, start_cluster, index
        );
        Ok(Some(index))
    }

    /// An unused block-table slot: a recycled one, else a new table entry
    fn allocate_empty_slot(&mut self) -> Result<Option<usize>> {
        if let Some(index) = self.free_blocks.take_empty_slot() {
            return Ok(Some(index));
        }

        if self.blocks.len() >= self.header.max_block_count as usize {
            return Ok(None);
        }

        let index = self.blocks.len();
        self.blocks.push(BlockRecord::EMPTY);
        self.write_block(index)?;
        self.header.block_count = self.blocks.len() as u32;
        self.write_header()?;
        Ok(Some(index))
    }

    /// Turn a block into free space, merging it with free neighbours
    fn free_block(&mut self, index: usize) -> Result<()> {
        let freed = self.blocks[index].into_free();

        if freed.length == 0 {
            // Zero-length files own a slot but no clusters
            self.blocks[index] = BlockRecord::EMPTY;
            self.write_block(index)?;
            self.free_blocks.insert(0, index);
            return Ok(());
        }

        self.blocks[index] = freed;
        self.combine_free_blocks(index)?;
        self.free_blocks.insert(self.blocks[index].length, index);
        Ok(())
    }

    /// Merge the free block at `index` with the free extents directly before
    /// and after it, then persist it
    ///
    /// The merged record is written before the absorbed records become
    /// unused slots, so an interrupted merge leaves them nested inside it.
    fn combine_free_blocks(&mut self, index: usize) -> Result<()> {
        let mut extent = Extent::of(&self.blocks[index]);

        let mut previous = None;
        let mut next = None;
        for (length, other) in self.free_blocks.extents() {
            if other == index {
                continue;
            }
            let other_extent = Extent::of(&self.blocks[other]);
            if previous.is_none() && other_extent.precedes(&extent) {
                previous = Some((length, other));
            } else if next.is_none() && extent.precedes(&other_extent) {
                next = Some((length, other));
            }
        }

        let mut absorbed = Vec::new();
        for (length, other) in [previous, next].into_iter().flatten() {
            if let Some(merged) = extent.coalesce(&Extent::of(&self.blocks[other])) {
                extent = merged;
                self.free_blocks.remove(length, other);
                absorbed.push(other);
            }
        }

        self.blocks[index] = BlockRecord::free(extent.start as u32, extent.byte_length());
        self.write_block(index)?;

        for &other in &absorbed {
            self.blocks[other] = BlockRecord::EMPTY;
            self.write_block(other)?;
            self.free_blocks.insert(0, other);
            debug!("Merged free block {} into block {}", other, index);
        }

        Ok(())
    }

    fn allocate_string(&mut self, record: StringRecord) -> Result<Option<u32>> {
        let Some(string_index) = self.strings.allocate(record.clone()) else {
            return Ok(None);
        };
        self.write_string(string_index, &record)?;
        Ok(Some(string_index))
    }

    fn release_string(&mut self, string_index: u32) -> Result<()> {
        if self.strings.release(string_index).is_some() {
            self.write_string(string_index, &StringRecord::vacant())?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Record persistence
    // ---------------------------------------------------------------------

    fn write_header(&mut self) -> Result<()> {
        let bytes = self.header.to_bytes();
        let stream = self.stream()?;
        stream.set_position(0)?;
        stream.write_all(&bytes)?;
        Ok(())
    }

    fn write_block(&mut self, index: usize) -> Result<()> {
        let position = self.layout.block_record(index);
        let bytes = self.blocks[index].to_bytes();
        let stream = self.stream()?;
        stream.set_position(position)?;
        stream.write_all(&bytes)?;
        Ok(())
    }

    fn write_string(&mut self, string_index: u32, record: &StringRecord) -> Result<()> {
        let position = self.layout.string_record(string_index);
        let stream = self.stream()?;
        stream.set_position(position)?;
        stream.write_all(&record.to_bytes())?;
        Ok(())
    }

    fn check_read(&self, operation: &'static str) -> Result<()> {
        if self.stream.is_none() {
            return Err(PackError::Closed(self.full_path.clone()));
        }
        if self.access.can_read() {
            Ok(())
        } else {
            Err(PackError::AccessDenied {
                operation,
                access: self.access,
            })
        }
    }

    fn check_write(&self, operation: &'static str) -> Result<()> {
        if self.stream.is_none() {
            return Err(PackError::Closed(self.full_path.clone()));
        }
        if self.access.can_write() {
            Ok(())
        } else {
            Err(PackError::AccessDenied {
                operation,
                access: self.access,
            })
        }
    }
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("full_path", &self.full_path)
            .field("access", &self.access)
            .field("file_count", &self.files.len())
            .field("block_count", &self.blocks.len())
            .finish_non_exhaustive()
    }
}

/// How the block records cover the data region
struct Tiling {
    /// Free records lying wholly inside another free record
    nested: Vec<usize>,
    /// Clusters covered without a gap from cluster 0
    covered: u64,
}

/// Walk the non-empty block records in cluster order
///
/// A free record nested in another free record is what an interrupted merge
/// or split leaves behind and is reported in `nested`. Any other overlap, or
/// a gap between records, is corruption.
fn tile_blocks(blocks: &[BlockRecord]) -> Result<Tiling> {
    let mut extents: Vec<(Extent, usize)> = blocks
        .iter()
        .enumerate()
        .filter(|(_, block)| block.length > 0)
        .map(|(index, block)| (Extent::of(block), index))
        .collect();
    extents.sort_by_key(|(extent, _)| (extent.start, Reverse(extent.length)));

    let mut nested = Vec::new();
    let mut last: Option<(Extent, usize)> = None;
    for (extent, index) in extents {
        let expected = last.map_or(0, |(previous, _)| previous.end());
        if let Some((previous, previous_index)) = last {
            if previous.overlaps(&extent) {
                if previous.covers(&extent)
                    && blocks[index].is_free()
                    && blocks[previous_index].is_free()
                {
                    nested.push(index);
                    continue;
                }
                return Err(PackError::CorruptFormat(format!(
                    "blocks {} and {} both claim cluster {}",
                    previous_index, index, extent.start
                )));
            }
        }
        if extent.start != expected {
            return Err(PackError::CorruptFormat(format!(
                "block {} starts at cluster {}, expected {}",
                index, extent.start, expected
            )));
        }
        last = Some((extent, index));
    }

    Ok(Tiling {
        nested,
        covered: last.map_or(0, |(extent, _)| extent.end()),
    })
}

fn read_string(
    stream: &mut dyn ArchiveStream,
    layout: &Layout,
    string_index: u32,
) -> Result<StringRecord> {
    let mut bytes = [0u8; STRING_RECORD_SIZE];
    stream.set_position(layout.string_record(string_index))?;
    stream.read_exact(&mut bytes)?;
    StringRecord::from_bytes(&bytes)
}

fn short_stream(position: u64, expected: u64, actual: u64) -> PackError {
    PackError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "archive ended after {} of {} bytes at offset {}",
            actual, expected, position
        ),
    ))
}
