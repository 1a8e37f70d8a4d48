//! Registry of open archives
//!
//! The controller maps canonical archive paths to shared [`FileSystemHandle`]s
//! and owns the [`StreamFactory`] used to open their backing streams.

use crate::core::access::AccessMode;
use crate::core::config::{validate_capacity, ArchiveConfig};
use crate::core::error::{PackError, Result};
use crate::core::filesystem::FileSystem;
use crate::core::stream::StreamFactory;
use crate::core::validation::canonicalize_archive_path;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared handle to an open archive; callers serialize through the mutex
pub type FileSystemHandle = Arc<Mutex<FileSystem>>;

pub struct FileSystemController {
    factory: RwLock<Option<Arc<dyn StreamFactory>>>,
    file_systems: Mutex<HashMap<PathBuf, FileSystemHandle>>,
}

impl FileSystemController {
    /// A registry with no stream factory installed
    pub fn new() -> Self {
        FileSystemController {
            factory: RwLock::new(None),
            file_systems: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_stream_factory<F: StreamFactory + 'static>(factory: F) -> Self {
        let controller = Self::new();
        controller.set_stream_factory(factory);
        controller
    }

    /// Install the factory used by every later create/load
    pub fn set_stream_factory<F: StreamFactory + 'static>(&self, factory: F) {
        *self.factory.write() = Some(Arc::new(factory));
    }

    fn stream_factory(&self) -> Result<Arc<dyn StreamFactory>> {
        self.factory.read().clone().ok_or(PackError::HelperNotSet)
    }

    pub fn count(&self) -> usize {
        self.file_systems.lock().len()
    }

    pub fn has_file_system<P: AsRef<Path>>(&self, path: P) -> bool {
        self.get_file_system(path).is_some()
    }

    pub fn get_file_system<P: AsRef<Path>>(&self, path: P) -> Option<FileSystemHandle> {
        let key = canonicalize_archive_path(path.as_ref()).ok()?;
        self.file_systems.lock().get(&key).cloned()
    }

    /// Create a new archive at `path`, replacing any file already there
    ///
    /// # Errors
    ///
    /// - `HelperNotSet` if no stream factory is installed
    /// - `AlreadyOpen` if `path` is registered
    /// - `InvalidParameter` for bad capacities or read-only access
    pub fn create_file_system<P: AsRef<Path>>(
        &self,
        path: P,
        access: AccessMode,
        max_file_count: u32,
        max_block_count: u32,
    ) -> Result<FileSystemHandle> {
        let factory = self.stream_factory()?;
        let key = canonicalize_archive_path(path.as_ref())?;

        // Checked before the factory truncates anything
        validate_capacity(max_file_count, max_block_count)?;
        if !access.can_write() {
            return Err(PackError::InvalidParameter(format!(
                "cannot create an archive with {} access",
                access
            )));
        }

        let mut file_systems = self.file_systems.lock();
        if file_systems.contains_key(&key) {
            return Err(PackError::AlreadyOpen(key));
        }

        let stream = factory.open(&key, access, true)?;
        let fs = FileSystem::create(key.clone(), access, stream, max_file_count, max_block_count)?;
        let handle = Arc::new(Mutex::new(fs));
        file_systems.insert(key.clone(), Arc::clone(&handle));

        info!("Registered new file system {:?} ({} open)", key, file_systems.len());
        Ok(handle)
    }

    pub fn create_file_system_with_config<P: AsRef<Path>>(
        &self,
        path: P,
        config: &ArchiveConfig,
    ) -> Result<FileSystemHandle> {
        config.validate()?;
        self.create_file_system(
            path,
            config.access,
            config.max_file_count,
            config.max_block_count,
        )
    }

    /// Open an existing archive at `path`
    pub fn load_file_system<P: AsRef<Path>>(
        &self,
        path: P,
        access: AccessMode,
    ) -> Result<FileSystemHandle> {
        let factory = self.stream_factory()?;
        let key = canonicalize_archive_path(path.as_ref())?;

        let mut file_systems = self.file_systems.lock();
        if file_systems.contains_key(&key) {
            return Err(PackError::AlreadyOpen(key));
        }

        let stream = factory.open(&key, access, false)?;
        let fs = FileSystem::load(key.clone(), access, stream)?;
        let handle = Arc::new(Mutex::new(fs));
        file_systems.insert(key.clone(), Arc::clone(&handle));

        info!("Registered file system {:?} ({} open)", key, file_systems.len());
        Ok(handle)
    }

    /// Close an archive and drop it from the registry
    ///
    /// With `delete_physical_file` the backing storage is removed as well.
    /// Other clones of `handle` stay valid as values, but every archive call
    /// through them fails with `Closed`.
    pub fn destroy_file_system(
        &self,
        handle: &FileSystemHandle,
        delete_physical_file: bool,
    ) -> Result<()> {
        let key = handle.lock().full_path().to_path_buf();

        {
            let mut file_systems = self.file_systems.lock();
            match file_systems.get(&key) {
                Some(registered) if Arc::ptr_eq(registered, handle) => {
                    file_systems.remove(&key);
                }
                _ => return Err(PackError::NotOpen(key)),
            }
        }

        handle.lock().close()?;

        if delete_physical_file {
            self.stream_factory()?.remove(&key)?;
            info!("Destroyed file system {:?} and deleted its file", key);
        } else {
            info!("Destroyed file system {:?}", key);
        }
        Ok(())
    }

    /// Every open archive, ordered by path
    pub fn get_all_file_systems(&self) -> Vec<FileSystemHandle> {
        let file_systems = self.file_systems.lock();
        let mut entries: Vec<_> = file_systems.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .map(|(_, handle)| Arc::clone(handle))
            .collect()
    }

    /// Close every archive without deleting files
    ///
    /// All archives are closed even if some fail; the first error is returned.
    pub fn shutdown(&self) -> Result<()> {
        let drained: Vec<_> = self.file_systems.lock().drain().collect();
        let mut first_error = None;

        for (key, handle) in drained {
            if let Err(e) = handle.lock().close() {
                warn!("Failed to close file system {:?}: {}", key, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for FileSystemController {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FileSystemController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemController")
            .field("factory_set", &self.factory.read().is_some())
            .field("open", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stream::{FileStreamFactory, MemoryStreamFactory};
    use tempfile::TempDir;

    fn memory_controller() -> (FileSystemController, MemoryStreamFactory) {
        let factory = MemoryStreamFactory::new();
        let controller = FileSystemController::with_stream_factory(factory.clone());
        (controller, factory)
    }

    #[test]
    fn test_helper_not_set() {
        let controller = FileSystemController::new();
        assert!(matches!(
            controller.create_file_system("/mem/a.pfs", AccessMode::ReadWrite, 4, 8),
            Err(PackError::HelperNotSet)
        ));
        assert!(matches!(
            controller.load_file_system("/mem/a.pfs", AccessMode::Read),
            Err(PackError::HelperNotSet)
        ));
    }

    #[test]
    fn test_create_registers_handle() {
        let (controller, factory) = memory_controller();
        let handle = controller
            .create_file_system("/mem/a.pfs", AccessMode::ReadWrite, 4, 8)
            .unwrap();

        assert_eq!(controller.count(), 1);
        assert!(controller.has_file_system("/mem/a.pfs"));
        assert!(controller.has_file_system("/mem/./x/../a.pfs"));
        assert!(factory.contains(Path::new("/mem/a.pfs")));

        let again = controller.get_file_system("/mem/a.pfs").unwrap();
        assert!(Arc::ptr_eq(&handle, &again));
    }

    #[test]
    fn test_already_open() {
        let (controller, _) = memory_controller();
        controller
            .create_file_system("/mem/a.pfs", AccessMode::ReadWrite, 4, 8)
            .unwrap();

        assert!(matches!(
            controller.create_file_system("/mem/a.pfs", AccessMode::ReadWrite, 4, 8),
            Err(PackError::AlreadyOpen(_))
        ));
        assert!(matches!(
            controller.load_file_system("/mem/b/../a.pfs", AccessMode::Read),
            Err(PackError::AlreadyOpen(_))
        ));
    }

    #[test]
    fn test_invalid_capacity_is_checked_first() {
        let (controller, factory) = memory_controller();
        let err = controller
            .create_file_system("/mem/a.pfs", AccessMode::ReadWrite, 8, 4)
            .unwrap_err();
        assert!(err.is_invalid_parameter());
        assert!(!factory.contains(Path::new("/mem/a.pfs")));
        assert_eq!(controller.count(), 0);
    }

    #[test]
    fn test_destroy_and_reload() {
        let (controller, factory) = memory_controller();
        let handle = controller
            .create_file_system("/mem/a.pfs", AccessMode::ReadWrite, 4, 8)
            .unwrap();
        handle.lock().write_file("hello.txt", b"hello").unwrap();

        controller.destroy_file_system(&handle, false).unwrap();
        assert_eq!(controller.count(), 0);
        assert!(factory.contains(Path::new("/mem/a.pfs")));
        assert!(matches!(
            controller.destroy_file_system(&handle, false),
            Err(PackError::NotOpen(_))
        ));

        let loaded = controller
            .load_file_system("/mem/a.pfs", AccessMode::Read)
            .unwrap();
        assert_eq!(
            loaded.lock().read_file("hello.txt").unwrap().unwrap(),
            b"hello"
        );

        controller.destroy_file_system(&loaded, true).unwrap();
        assert!(!factory.contains(Path::new("/mem/a.pfs")));
    }

    #[test]
    fn test_stale_handle_cannot_touch_reloaded_archive() {
        let (controller, _) = memory_controller();
        let handle = controller
            .create_file_system("/mem/a.pfs", AccessMode::ReadWrite, 4, 8)
            .unwrap();
        let stale = Arc::clone(&handle);
        controller.destroy_file_system(&handle, false).unwrap();
        assert!(stale.lock().is_closed());

        let fresh = controller
            .load_file_system("/mem/a.pfs", AccessMode::ReadWrite)
            .unwrap();
        assert!(fresh.lock().write_file("fresh", &[9u8; 5000]).unwrap());

        {
            let mut stale = stale.lock();
            assert!(matches!(
                stale.write_file("stale", b"x"),
                Err(PackError::Closed(_))
            ));
            assert!(matches!(stale.read_file("fresh"), Err(PackError::Closed(_))));
            assert!(matches!(stale.delete_file("fresh"), Err(PackError::Closed(_))));
            assert!(matches!(stale.flush(), Err(PackError::Closed(_))));
        }

        controller.destroy_file_system(&fresh, false).unwrap();
        let reloaded = controller
            .load_file_system("/mem/a.pfs", AccessMode::Read)
            .unwrap();
        let mut fs = reloaded.lock();
        assert_eq!(fs.file_count(), 1);
        assert_eq!(fs.read_file("fresh").unwrap().unwrap(), vec![9u8; 5000]);
        fs.verify().unwrap();
    }

    #[test]
    fn test_load_missing_is_io_error() {
        let (controller, _) = memory_controller();
        assert!(matches!(
            controller.load_file_system("/mem/none.pfs", AccessMode::Read),
            Err(PackError::Io(_))
        ));
        assert_eq!(controller.count(), 0);
    }

    #[test]
    fn test_create_with_config() {
        let (controller, _) = memory_controller();
        let config = ArchiveConfig::new(2, 3);
        let handle = controller
            .create_file_system_with_config("/mem/c.pfs", &config)
            .unwrap();
        assert_eq!(handle.lock().max_file_count(), 2);
        assert_eq!(handle.lock().max_block_count(), 3);

        let read_only = ArchiveConfig::new(2, 3).with_access(AccessMode::Read);
        assert!(controller
            .create_file_system_with_config("/mem/d.pfs", &read_only)
            .is_err());
    }

    #[test]
    fn test_get_all_and_shutdown() {
        let (controller, _) = memory_controller();
        for name in ["/mem/b.pfs", "/mem/a.pfs", "/mem/c.pfs"] {
            controller
                .create_file_system(name, AccessMode::ReadWrite, 1, 1)
                .unwrap();
        }

        let paths: Vec<_> = controller
            .get_all_file_systems()
            .iter()
            .map(|handle| handle.lock().full_path().to_path_buf())
            .collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/mem/a.pfs"),
                PathBuf::from("/mem/b.pfs"),
                PathBuf::from("/mem/c.pfs")
            ]
        );

        controller.shutdown().unwrap();
        assert_eq!(controller.count(), 0);
    }

    #[test]
    fn test_file_backed_registry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.pfs");
        let controller = FileSystemController::with_stream_factory(FileStreamFactory);

        let handle = controller
            .create_file_system(&path, AccessMode::ReadWrite, 4, 8)
            .unwrap();
        handle.lock().write_file("a", &[1u8; 5000]).unwrap();
        controller.destroy_file_system(&handle, false).unwrap();
        assert!(path.exists());

        let handle = controller
            .load_file_system(&path, AccessMode::ReadWrite)
            .unwrap();
        assert_eq!(handle.lock().read_file("a").unwrap().unwrap(), vec![1u8; 5000]);
        controller.destroy_file_system(&handle, true).unwrap();
        assert!(!path.exists());
    }
}
