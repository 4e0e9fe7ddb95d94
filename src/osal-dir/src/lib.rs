//! Directory iteration, grounded on `osapi-dir.c`'s lock-mode choices per
//! operation: `DirectoryOpen`/`DirectoryClose` take the registry's
//! EXCLUSIVE mode (they mutate the record's lifetime), `DirectoryRead`
//! takes GLOBAL (many readers, record itself unchanged), and
//! `DirectoryRewind` takes NONE, since the cursor it mutates has its own
//! interior lock.
//!
//! `std::fs::ReadDir` has no rewind primitive, so rewinding re-opens the
//! directory at the same physical path, which is what `rewinddir()` does
//! functionally on most libcs: POSIX never promised more than "start over".

use std::fs::ReadDir;
use std::sync::Arc;

use osal_error::{OsalError, OsalResult};
use osal_registry::{ObjectId, ObjectKind, ObjectTable};
use osal_vfs::VirtualFileSystem;
use parking_lot::Mutex;

/// One entry yielded by [`DirManager::read`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
}

struct DirState {
    physical_path: String,
    iter: ReadDir,
}

#[derive(Clone)]
struct DirRecord {
    virtual_path: String,
    state: Arc<Mutex<DirState>>,
}

pub struct DirManager {
    table: ObjectTable<DirRecord>,
}

impl DirManager {
    pub fn new(capacity: usize, max_name_len: usize) -> Self {
        DirManager {
            table: ObjectTable::new(ObjectKind::Dir, capacity, max_name_len),
        }
    }

    /// `OS_mkdir`: creates a directory at a virtual path, with no
    /// corresponding registry record (mkdir/rmdir operate directly on the
    /// translated path and never appear in the object table).
    pub fn mkdir(&self, vfs: &VirtualFileSystem, virtual_path: &str) -> OsalResult<()> {
        let physical = vfs.translate_path(virtual_path)?;
        std::fs::create_dir(&physical).map_err(OsalError::from)
    }

    /// `OS_rmdir`.
    pub fn rmdir(&self, vfs: &VirtualFileSystem, virtual_path: &str) -> OsalResult<()> {
        let physical = vfs.translate_path(virtual_path)?;
        std::fs::remove_dir(&physical).map_err(OsalError::from)
    }

    /// `OS_DirectoryOpen`.
    pub fn open(&self, vfs: &VirtualFileSystem, virtual_path: &str) -> OsalResult<ObjectId> {
        let physical = vfs.translate_path(virtual_path)?;
        let pending = self.table.allocate_new(Some(virtual_path), ObjectId::UNDEFINED)?;

        let iter = match std::fs::read_dir(&physical) {
            Ok(iter) => iter,
            Err(e) => return Err(pending.abort(e.into())),
        };

        Ok(pending.finalize(DirRecord {
            virtual_path: virtual_path.to_string(),
            state: Arc::new(Mutex::new(DirState {
                physical_path: physical,
                iter,
            })),
        }))
    }

    /// `OS_DirectoryClose`.
    pub fn close(&self, id: ObjectId) -> OsalResult<()> {
        self.table.get_exclusive(id)?.finalize_delete()
    }

    /// `OS_DirectoryRead`: returns `Ok(None)` once the directory is
    /// exhausted, matching a zero-filled `os_dirent_t` on the original
    /// rather than treating end-of-directory as an error.
    pub fn read(&self, id: ObjectId) -> OsalResult<Option<DirEntry>> {
        let token = self.table.get_global(id)?;
        let record = token.get();
        let mut state = record.state.lock();

        match state.iter.next() {
            Some(Ok(entry)) => Ok(Some(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
            })),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// `OS_DirectoryRewind`: reopens the directory at its original
    /// physical path and discards the previous iterator position.
    pub fn rewind(&self, id: ObjectId) -> OsalResult<()> {
        let record = self.table.get_none(id)?;
        let mut state = record.state.lock();
        state.iter = std::fs::read_dir(&state.physical_path)?;
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> OsalResult<ObjectId> {
        self.table.find_by_name(name)
    }
}

impl Default for DirManager {
    fn default() -> Self {
        DirManager::new(32, 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osal_vfs::PathLimits;

    fn vfs_rooted_at(tmp: &std::path::Path) -> VirtualFileSystem {
        let vfs = VirtualFileSystem::new(8, PathLimits::default());
        vfs.add_fixed_map(tmp.to_str().unwrap(), "/root").unwrap();
        vfs
    }

    #[test]
    fn read_after_close_is_invalid_id() {
        let tmp = std::env::temp_dir().join(format!("osal-dir-test-{}-a", std::process::id()));
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("one.txt"), b"x").unwrap();

        let vfs = vfs_rooted_at(&tmp);
        let mgr = DirManager::new(8, 64);
        let id = mgr.open(&vfs, "/root").unwrap();

        mgr.close(id).unwrap();
        assert_eq!(mgr.read(id).unwrap_err(), OsalError::InvalidId);

        std::fs::remove_dir_all(&tmp).unwrap();
    }

    #[test]
    fn read_lists_every_entry_then_exhausts() {
        let tmp = std::env::temp_dir().join(format!("osal-dir-test-{}-b", std::process::id()));
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("a.txt"), b"x").unwrap();
        std::fs::write(tmp.join("b.txt"), b"y").unwrap();

        let vfs = vfs_rooted_at(&tmp);
        let mgr = DirManager::new(8, 64);
        let id = mgr.open(&vfs, "/root").unwrap();

        let mut names = Vec::new();
        while let Some(entry) = mgr.read(id).unwrap() {
            names.push(entry.name);
        }
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
        assert!(mgr.read(id).unwrap().is_none());

        mgr.close(id).unwrap();
        std::fs::remove_dir_all(&tmp).unwrap();
    }

    #[test]
    fn rewind_restarts_iteration() {
        let tmp = std::env::temp_dir().join(format!("osal-dir-test-{}-c", std::process::id()));
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        std::fs::write(tmp.join("only.txt"), b"x").unwrap();

        let vfs = vfs_rooted_at(&tmp);
        let mgr = DirManager::new(8, 64);
        let id = mgr.open(&vfs, "/root").unwrap();

        assert!(mgr.read(id).unwrap().is_some());
        assert!(mgr.read(id).unwrap().is_none());

        mgr.rewind(id).unwrap();
        assert!(mgr.read(id).unwrap().is_some());

        mgr.close(id).unwrap();
        std::fs::remove_dir_all(&tmp).unwrap();
    }

    #[test]
    fn mkdir_then_rmdir_round_trips() {
        let tmp = std::env::temp_dir().join(format!("osal-dir-test-{}-d", std::process::id()));
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();

        let vfs = vfs_rooted_at(&tmp);
        let mgr = DirManager::new(8, 64);

        mgr.mkdir(&vfs, "/root/child").unwrap();
        assert!(tmp.join("child").is_dir());

        mgr.rmdir(&vfs, "/root/child").unwrap();
        assert!(!tmp.join("child").exists());

        std::fs::remove_dir_all(&tmp).unwrap();
    }
}
