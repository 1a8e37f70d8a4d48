//! Byte-stream backends for archives
//!
//! The engine does all of its I/O through [`ArchiveStream`]. [`FileStream`]
//! binds it to a host file, [`MemoryStream`] to a shared in-memory buffer.
//! A [`StreamFactory`] opens streams by path for the registry.

use crate::core::access::AccessMode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Scratch buffer size for bulk copies
pub const COPY_BUFFER_SIZE: usize = 4096;

/// Seekable byte stream backing one archive
pub trait ArchiveStream: Read + Write + Seek + Send {
    /// Total length in bytes
    fn len(&mut self) -> io::Result<u64>;

    /// Truncate or extend (with zeros) to `len` bytes
    fn set_len(&mut self, len: u64) -> io::Result<()>;

    fn is_empty(&mut self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    fn position(&mut self) -> io::Result<u64> {
        self.stream_position()
    }

    fn set_position(&mut self, position: u64) -> io::Result<()> {
        self.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    /// Read one byte, `None` at end of stream
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.write_all(&[byte])
    }

    /// Read up to `count` bytes into `buffer[start..]`, stopping early only at end of stream
    fn read_range(&mut self, buffer: &mut [u8], start: usize, count: usize) -> io::Result<usize> {
        let range = checked_range(buffer.len(), start, count)?;
        let target = &mut buffer[range];

        let mut filled = 0;
        while filled < target.len() {
            match self.read(&mut target[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Write exactly `buffer[start..start + count]`
    fn write_range(&mut self, buffer: &[u8], start: usize, count: usize) -> io::Result<()> {
        let range = checked_range(buffer.len(), start, count)?;
        self.write_all(&buffer[range])
    }

    /// Copy `length` bytes from the current position into `dst`
    ///
    /// Returns the number of bytes copied, which is short only at end of stream.
    fn copy_to(&mut self, dst: &mut dyn Write, length: u64) -> io::Result<u64> {
        let mut scratch = [0u8; COPY_BUFFER_SIZE];
        let mut remaining = length;
        let mut copied = 0;

        while remaining > 0 {
            let chunk = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
            let n = self.read_range(&mut scratch, 0, chunk)?;
            if n == 0 {
                break;
            }
            dst.write_all(&scratch[..n])?;
            copied += n as u64;
            remaining -= n as u64;
        }

        Ok(copied)
    }

    /// Copy `length` bytes from `src` into this stream at the current position
    fn copy_from(&mut self, src: &mut dyn Read, length: u64) -> io::Result<u64> {
        let mut scratch = [0u8; COPY_BUFFER_SIZE];
        let mut remaining = length;
        let mut copied = 0;

        while remaining > 0 {
            let chunk = remaining.min(COPY_BUFFER_SIZE as u64) as usize;
            let n = src.read(&mut scratch[..chunk])?;
            if n == 0 {
                break;
            }
            self.write_all(&scratch[..n])?;
            copied += n as u64;
            remaining -= n as u64;
        }

        Ok(copied)
    }

    /// Flush and release the backend
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

fn checked_range(len: usize, start: usize, count: usize) -> io::Result<std::ops::Range<usize>> {
    match start.checked_add(count) {
        Some(end) if end <= len => Ok(start..end),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "range {}+{} out of bounds for buffer of {} bytes",
                start, count, len
            ),
        )),
    }
}

/// Host-file stream
pub struct FileStream {
    file: File,
    path: PathBuf,
}

impl FileStream {
    /// Open `path`; `create` truncates or creates the file
    ///
    /// The file is always readable because the engine reads its own tables
    /// back even when the archive is write-only.
    pub fn open<P: AsRef<Path>>(path: P, access: AccessMode, create: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(access.can_write())
            .create(create)
            .truncate(create)
            .open(&path)?;

        Ok(FileStream {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ArchiveStream for FileStream {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

/// In-memory stream over a shared buffer
///
/// Clones of the buffer handle see each other's writes, which lets a
/// [`MemoryStreamFactory`] reopen an archive after it was shut down.
pub struct MemoryStream {
    data: Arc<Mutex<Vec<u8>>>,
    position: u64,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::with_data(Vec::new())
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self::shared(Arc::new(Mutex::new(data)))
    }

    pub fn shared(data: Arc<Mutex<Vec<u8>>>) -> Self {
        MemoryStream { data, position: 0 }
    }

    /// Copy of the current contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn buffer(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.data)
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock();
        let start = (self.position as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock();
        let start = self.position as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.lock().len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => len + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };

        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }

        self.position = target as u64;
        Ok(self.position)
    }
}

impl ArchiveStream for MemoryStream {
    fn len(&mut self) -> io::Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.data.lock().resize(len as usize, 0);
        Ok(())
    }
}

/// Opens archive streams by path
pub trait StreamFactory: Send + Sync {
    /// Open the stream for `path`; `create` starts a new, empty stream
    fn open(&self, path: &Path, access: AccessMode, create: bool)
        -> io::Result<Box<dyn ArchiveStream>>;

    /// Delete the backing storage for `path`
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Factory for [`FileStream`]s on the host filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStreamFactory;

impl StreamFactory for FileStreamFactory {
    fn open(
        &self,
        path: &Path,
        access: AccessMode,
        create: bool,
    ) -> io::Result<Box<dyn ArchiveStream>> {
        Ok(Box::new(FileStream::open(path, access, create)?))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// Factory for [`MemoryStream`]s keyed by path
///
/// Cloning the factory shares the same set of buffers.
#[derive(Clone, Default)]
pub struct MemoryStreamFactory {
    buffers: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>>,
}

impl MemoryStreamFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.buffers.lock().contains_key(path)
    }

    /// Copy of the bytes stored for `path`
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.buffers.lock().get(path).map(|buffer| buffer.lock().clone())
    }
}

impl StreamFactory for MemoryStreamFactory {
    fn open(
        &self,
        path: &Path,
        _access: AccessMode,
        create: bool,
    ) -> io::Result<Box<dyn ArchiveStream>> {
        let mut buffers = self.buffers.lock();

        let buffer = if create {
            let buffer = Arc::new(Mutex::new(Vec::new()));
            buffers.insert(path.to_path_buf(), Arc::clone(&buffer));
            buffer
        } else {
            buffers.get(path).cloned().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no in-memory archive at {}", path.display()),
                )
            })?
        };

        Ok(Box::new(MemoryStream::shared(buffer)))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match self.buffers.lock().remove(path) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no in-memory archive at {}", path.display()),
            )),
        }
    }
}
