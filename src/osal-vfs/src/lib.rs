//! Virtual filesystem, path translation, and volume management.
//!
//! Mirrors the original's split between "mount table bookkeeping" (shared,
//! portable) and "per-kernel volume backend" (`VolumeBackend`, the seam a
//! real multi-target build would plug VxWorks/RTEMS/etc. implementations
//! into -- here a single `LocalDiskBackend` ships).

use std::sync::Arc;

use bitflags::bitflags;
use newt::define_num_enum;

use osal_error::{OsalError, OsalResult};
use osal_registry::{ObjectId, ObjectKind, ObjectTable};

bitflags! {
    /// Invariant: `IS_MOUNTED_VIRTUAL` implies `IS_MOUNTED_SYSTEM` implies
    /// `IS_READY`. Checked with a debug assertion on every transition
    /// rather than enforced structurally, since the original's state
    /// machine allows transient intermediate states while a mount call is
    /// in flight.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct MountFlags: u8 {
        const IS_FIXED           = 0x01;
        const IS_READY           = 0x02;
        const IS_MOUNTED_SYSTEM  = 0x10;
        const IS_MOUNTED_VIRTUAL = 0x20;
    }
}

impl MountFlags {
    fn debug_check_implication(self) {
        if self.contains(MountFlags::IS_MOUNTED_VIRTUAL) {
            debug_assert!(self.contains(MountFlags::IS_MOUNTED_SYSTEM));
        }
        if self.contains(MountFlags::IS_MOUNTED_SYSTEM) {
            debug_assert!(self.contains(MountFlags::IS_READY));
        }
    }
}

define_num_enum! {
    pub enum FsType {
        Unknown,
        FsBased,
        NormalDisk,
        VolatileDisk,
        Mtd,
    }
}

/// Length limits configurable at construction time, standing in for the
/// original's `OS_MAX_PATH_LEN`/`OS_MAX_LOCAL_PATH_LEN`/`OS_MAX_FILE_NAME`
/// preprocessor constants.
#[derive(Debug, Clone, Copy)]
pub struct PathLimits {
    pub max_path_len: usize,
    pub max_local_path_len: usize,
    pub max_file_name: usize,
    pub dev_name_len: usize,
    pub vol_name_len: usize,
}

impl Default for PathLimits {
    fn default() -> Self {
        PathLimits {
            max_path_len: 64,
            max_local_path_len: 64,
            max_file_name: 20,
            dev_name_len: 32,
            vol_name_len: 32,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeStat {
    pub block_size: usize,
    pub total_blocks: u64,
    pub blocks_free: u64,
}

impl VolumeStat {
    pub fn free_bytes(&self) -> u64 {
        self.block_size as u64 * self.blocks_free
    }
}

/// Per-kernel seam for volume lifecycle operations. One implementation per
/// `fstype`; `mkfs`/`initfs` dispatch through whichever backend the caller
/// supplied when registering the volume.
pub trait VolumeBackend: Send + Sync {
    fn start(&self, entry: &MountEntry) -> OsalResult<()>;
    fn stop(&self, entry: &MountEntry) -> OsalResult<()>;
    fn format(&self, entry: &MountEntry) -> OsalResult<()>;
    fn check(&self, entry: &MountEntry, repair: bool) -> OsalResult<()>;
    fn stat(&self, entry: &MountEntry) -> OsalResult<VolumeStat>;
}

/// A backend over a real host directory tree: `start`/`stop`/`format` are
/// no-ops (the directory is assumed to already exist, matching how a
/// "fixed" mount is used in practice), and `stat` shells out to the host's
/// filesystem-statistics syscall.
pub struct LocalDiskBackend;

impl VolumeBackend for LocalDiskBackend {
    fn start(&self, _entry: &MountEntry) -> OsalResult<()> {
        Ok(())
    }

    fn stop(&self, _entry: &MountEntry) -> OsalResult<()> {
        Ok(())
    }

    fn format(&self, _entry: &MountEntry) -> OsalResult<()> {
        Ok(())
    }

    fn check(&self, _entry: &MountEntry, _repair: bool) -> OsalResult<()> {
        Ok(())
    }

    #[cfg(unix)]
    fn stat(&self, entry: &MountEntry) -> OsalResult<VolumeStat> {
        let stat = nix::sys::statvfs::statvfs(entry.physical_mountpoint.as_str())
            .map_err(|_| OsalError::ErrOperationNotSupported)?;

        Ok(VolumeStat {
            block_size: stat.fragment_size() as usize,
            total_blocks: stat.blocks(),
            blocks_free: stat.blocks_available(),
        })
    }

    #[cfg(not(unix))]
    fn stat(&self, _entry: &MountEntry) -> OsalResult<VolumeStat> {
        Err(OsalError::ErrOperationNotSupported)
    }
}

#[derive(Clone)]
pub struct MountEntry {
    pub device_name: String,
    pub volume_name: String,
    pub physical_mountpoint: String,
    pub virtual_mountpoint: String,
    pub block_size: usize,
    pub block_count: u64,
    pub flags: MountFlags,
    pub fstype: FsType,
    backend: Option<Arc<dyn VolumeBackend>>,
}

/// Mount table and path translator. Owns one [`ObjectTable`] of the
/// `FileSys` kind; each live entry's registry *name* is its
/// `virtual_mountpoint`, which lets the uniqueness invariant ("no two
/// active entries share the same virtual_mountpoint") ride for free on the
/// registry's existing name-uniqueness check instead of being re-verified
/// here.
pub struct VirtualFileSystem {
    table: ObjectTable<MountEntry>,
    limits: PathLimits,
}

fn validate_path(path: &str, limit: usize) -> OsalResult<()> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(OsalError::FsErrPathInvalid);
    }
    if path.len() > limit {
        return Err(OsalError::FsErrPathTooLong);
    }
    Ok(())
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl VirtualFileSystem {
    pub fn new(capacity: usize, limits: PathLimits) -> Self {
        VirtualFileSystem {
            table: ObjectTable::new(ObjectKind::FileSys, capacity, limits.max_path_len),
            limits,
        }
    }

    /// `AddFixedMap`: registers an `IS_FIXED`/`IS_READY`/`IS_MOUNTED_SYSTEM`/
    /// `IS_MOUNTED_VIRTUAL` entry without invoking format/mount on the host.
    pub fn add_fixed_map(&self, physical: &str, virt: &str) -> OsalResult<ObjectId> {
        validate_path(physical, self.limits.max_local_path_len)?;
        validate_path(virt, self.limits.max_path_len)?;

        let flags = MountFlags::IS_FIXED
            | MountFlags::IS_READY
            | MountFlags::IS_MOUNTED_SYSTEM
            | MountFlags::IS_MOUNTED_VIRTUAL;
        flags.debug_check_implication();

        let pending = self
            .table
            .allocate_new(Some(virt), ObjectId::UNDEFINED)
            .map_err(|e| match e {
                OsalError::NameTaken => OsalError::FsErrPathInvalid,
                other => other,
            })?;

        Ok(pending.finalize(MountEntry {
            device_name: String::new(),
            volume_name: String::new(),
            physical_mountpoint: physical.to_string(),
            virtual_mountpoint: virt.to_string(),
            block_size: 0,
            block_count: 0,
            flags,
            fstype: FsType::FsBased,
            backend: None,
        }))
    }

    /// `TranslatePath`: maps a virtual path to its physical equivalent by
    /// finding the unique mount whose `virtual_mountpoint` prefix-matches
    /// `virtual_path` on full path-segment boundaries (`/ut` never matches
    /// `/utXX`).
    pub fn translate_path(&self, virtual_path: &str) -> OsalResult<String> {
        validate_path(virtual_path, self.limits.max_path_len)?;

        let file_name_len = virtual_path
            .rfind('/')
            .map(|idx| virtual_path.len() - idx - 1)
            .unwrap_or(0);
        if file_name_len > self.limits.max_file_name {
            return Err(OsalError::FsErrNameTooLong);
        }

        let path_segments = segments(virtual_path);
        if path_segments.is_empty() {
            return Err(OsalError::FsErrPathInvalid);
        }

        let ids = self.table.snapshot();
        let mut found: Option<(ObjectId, usize)> = None;

        for id in ids {
            let token = match self.table.get_global(id) {
                Ok(t) => t,
                Err(_) => continue,
            };
            let mount_segments = segments(&token.get().virtual_mountpoint);

            if path_segments.len() >= mount_segments.len()
                && path_segments[..mount_segments.len()] == mount_segments[..]
            {
                found = Some((id, mount_segments.len()));
                break;
            }
        }

        let (id, mount_seg_count) = found.ok_or(OsalError::FsErrPathInvalid)?;
        let token = self.table.get_global(id)?;
        let entry = token.get();

        if !entry.flags.contains(MountFlags::IS_MOUNTED_VIRTUAL) {
            return Err(OsalError::IncorrectObjState);
        }

        let remainder: String = path_segments[mount_seg_count..]
            .iter()
            .map(|s| format!("/{s}"))
            .collect();

        let result = format!("{}{}", entry.physical_mountpoint, remainder);
        if result.len() > self.limits.max_local_path_len {
            return Err(OsalError::FsErrPathTooLong);
        }

        Ok(result)
    }

    fn register_volume(
        &self,
        device_name: &str,
        volume_name: &str,
        physical: &str,
        virt: &str,
        block_size: usize,
        block_count: u64,
        fstype: FsType,
        backend: Arc<dyn VolumeBackend>,
        format: bool,
    ) -> OsalResult<ObjectId> {
        if device_name.len() >= self.limits.dev_name_len
            || volume_name.len() >= self.limits.vol_name_len
        {
            return Err(OsalError::FsErrNameTooLong);
        }
        validate_path(physical, self.limits.max_local_path_len)?;
        validate_path(virt, self.limits.max_path_len)?;

        let pending = self
            .table
            .allocate_new(Some(virt), ObjectId::UNDEFINED)
            .map_err(|e| match e {
                OsalError::NameTaken => OsalError::FsErrDeviceNotFree,
                other => other,
            })?;

        let mut entry = MountEntry {
            device_name: device_name.to_string(),
            volume_name: volume_name.to_string(),
            physical_mountpoint: physical.to_string(),
            virtual_mountpoint: virt.to_string(),
            block_size,
            block_count,
            flags: MountFlags::empty(),
            fstype,
            backend: Some(backend.clone()),
        };

        backend.start(&entry)?;
        entry.flags |= MountFlags::IS_READY;

        if format {
            if let Err(err) = backend.format(&entry) {
                return Err(pending.abort(err));
            }
        }

        Ok(pending.finalize(entry))
    }

    /// `mkfs`: registers a fresh volume and formats it.
    #[allow(clippy::too_many_arguments)]
    pub fn mkfs(
        &self,
        device_name: &str,
        volume_name: &str,
        physical: &str,
        virt: &str,
        block_size: usize,
        block_count: u64,
        fstype: FsType,
        backend: Arc<dyn VolumeBackend>,
    ) -> OsalResult<ObjectId> {
        self.register_volume(
            device_name,
            volume_name,
            physical,
            virt,
            block_size,
            block_count,
            fstype,
            backend,
            true,
        )
    }

    /// `initfs`: attaches an existing volume without reformatting.
    #[allow(clippy::too_many_arguments)]
    pub fn initfs(
        &self,
        device_name: &str,
        volume_name: &str,
        physical: &str,
        virt: &str,
        block_size: usize,
        block_count: u64,
        fstype: FsType,
        backend: Arc<dyn VolumeBackend>,
    ) -> OsalResult<ObjectId> {
        self.register_volume(
            device_name,
            volume_name,
            physical,
            virt,
            block_size,
            block_count,
            fstype,
            backend,
            false,
        )
    }

    /// `rmfs`: deregisters a volume. Refused (via the registry's refcount
    /// rule) while any handle into the volume is outstanding.
    pub fn rmfs(&self, id: ObjectId) -> OsalResult<()> {
        let token = self.table.get_exclusive(id)?;
        if token.get().flags.contains(MountFlags::IS_FIXED) {
            return Err(OsalError::IncorrectObjState);
        }
        token.finalize_delete()
    }

    /// `mount`: flips `IS_MOUNTED_SYSTEM`/`IS_MOUNTED_VIRTUAL`, requires
    /// the volume to already be `IS_READY`.
    pub fn mount(&self, id: ObjectId) -> OsalResult<()> {
        let mut token = self.table.get_exclusive(id)?;
        let entry = token.get_mut();
        if !entry.flags.contains(MountFlags::IS_READY) {
            return Err(OsalError::IncorrectObjState);
        }
        entry.flags |= MountFlags::IS_MOUNTED_SYSTEM | MountFlags::IS_MOUNTED_VIRTUAL;
        entry.flags.debug_check_implication();
        tracing::info!(?id, "volume mounted");
        Ok(())
    }

    /// `unmount`: reverts `IS_MOUNTED_SYSTEM`/`IS_MOUNTED_VIRTUAL`.
    pub fn unmount(&self, id: ObjectId) -> OsalResult<()> {
        let mut token = self.table.get_exclusive(id)?;
        let entry = token.get_mut();
        entry.flags.remove(MountFlags::IS_MOUNTED_SYSTEM | MountFlags::IS_MOUNTED_VIRTUAL);
        tracing::info!(?id, "volume unmounted");
        Ok(())
    }

    pub fn chkfs(&self, id: ObjectId, repair: bool) -> OsalResult<()> {
        let token = self.table.get_exclusive(id)?;
        let entry = token.get();
        match &entry.backend {
            Some(backend) => backend.check(entry, repair),
            None => Err(OsalError::ErrOperationNotSupported),
        }
    }

    pub fn stat_volume(&self, id: ObjectId) -> OsalResult<VolumeStat> {
        let token = self.table.get_global(id)?;
        let entry = token.get();
        match &entry.backend {
            Some(backend) => backend.stat(entry),
            None => Err(OsalError::ErrOperationNotSupported),
        }
    }
}
