//! Host I/O primitives against a concrete filesystem path.
//!
//! [`TierIo`] is the seam between the adapter (and the mirror executor) and the real filesystem.
//! [`HostIo`] is the only production implementation; tests substitute their own to inject
//! failures.

use std::ffi::OsString;
use std::os::unix::fs::{DirBuilderExt as _, MetadataExt as _, PermissionsExt as _};
use std::path::Path;
use std::time::{Duration, SystemTime};

use nix::sys::stat::{Mode, SFlag};
use nix::unistd::AccessFlags;

/// The fixed attribute set reported by `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileStat {
    /// Last access.
    pub atime: SystemTime,
    /// Last status change.
    pub ctime: SystemTime,
    /// Last modification.
    pub mtime: SystemTime,
    /// Owning group.
    pub gid: u32,
    /// Full `st_mode`, file type bits included.
    pub mode: u32,
    /// Hard link count.
    pub nlink: u64,
    /// Size in bytes.
    pub size: u64,
    /// Owning user.
    pub uid: u32,
}

impl FileStat {
    /// Only the permission bits (including setuid, setgid and sticky).
    #[must_use]
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// `S_IFDIR`.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & u32::from(libc::S_IFMT) == u32::from(libc::S_IFDIR)
    }

    /// `S_IFLNK`.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & u32::from(libc::S_IFMT) == u32::from(libc::S_IFLNK)
    }
}

impl From<std::fs::Metadata> for FileStat {
    #[expect(
        clippy::cast_sign_loss,
        reason = "nsecs from MetadataExt is always in [0, 999_999_999]"
    )]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "nsecs from MetadataExt is always in [0, 999_999_999]"
    )]
    fn from(meta: std::fs::Metadata) -> Self {
        fn to_systime(secs: i64, nsecs: i64) -> SystemTime {
            if secs >= 0 {
                std::time::UNIX_EPOCH + Duration::new(secs.cast_unsigned(), nsecs as u32)
            } else {
                std::time::UNIX_EPOCH - Duration::from_secs((-secs).cast_unsigned())
                    + Duration::from_nanos(nsecs.cast_unsigned())
            }
        }

        Self {
            atime: to_systime(meta.atime(), meta.atime_nsec()),
            ctime: to_systime(meta.ctime(), meta.ctime_nsec()),
            mtime: to_systime(meta.mtime(), meta.mtime_nsec()),
            gid: meta.gid(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            size: meta.size(),
            uid: meta.uid(),
        }
    }
}

/// Filesystem statistics of the fast tier, field for field what `statvfs(3)` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// `f_bsize`.
    pub block_size: u64,
    /// `f_frsize`, the unit of the block counts.
    pub fragment_size: u64,
    /// `f_blocks`.
    pub total_blocks: u64,
    /// `f_bfree`.
    pub free_blocks: u64,
    /// `f_bavail`, free blocks usable by unprivileged users.
    pub available_blocks: u64,
    /// `f_files`.
    pub total_inodes: u64,
    /// `f_ffree`.
    pub free_inodes: u64,
    /// `f_favail`.
    pub available_inodes: u64,
    /// `f_fsid`.
    pub filesystem_id: u64,
    /// `f_flag`.
    pub mount_flags: u64,
    /// `f_namemax`.
    pub max_filename_length: u64,
}

/// Syscall-equivalent primitives against a concrete path.
///
/// Every method fails with the `std::io::Error` the underlying syscall produced; callers classify
/// it.
pub trait TierIo: Send + Sync {
    /// `lstat(2)`: does not follow a trailing symlink.
    fn lstat(&self, path: &Path) -> std::io::Result<FileStat>;

    /// `stat(2)`: follows symlinks.
    fn stat(&self, path: &Path) -> std::io::Result<FileStat>;

    /// `mkdir(2)`. Only the last component is created.
    fn mkdir(&self, path: &Path, mode: u32) -> std::io::Result<()>;

    /// `rmdir(2)`.
    fn rmdir(&self, path: &Path) -> std::io::Result<()>;

    /// `unlink(2)`.
    fn unlink(&self, path: &Path) -> std::io::Result<()>;

    /// `mknod(2)`. `mode` carries the file type bits.
    fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> std::io::Result<()>;

    /// `chmod(2)` with the permission bits of `mode`.
    fn chmod(&self, path: &Path, mode: u32) -> std::io::Result<()>;

    /// `access(2)` with an `R_OK | W_OK | X_OK | F_OK` mask.
    fn access(&self, path: &Path, mask: i32) -> std::io::Result<()>;

    /// `statvfs(3)` of the filesystem holding `path`.
    fn statvfs(&self, path: &Path) -> std::io::Result<FsStats>;

    /// Names of the entries of a directory, without `.` and `..`, in the order the host returns
    /// them.
    fn read_dir(&self, path: &Path) -> std::io::Result<Vec<OsString>>;
}

/// [`TierIo`] over the host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostIo;

impl TierIo for HostIo {
    fn lstat(&self, path: &Path) -> std::io::Result<FileStat> {
        std::fs::symlink_metadata(path).map(FileStat::from)
    }

    fn stat(&self, path: &Path) -> std::io::Result<FileStat> {
        std::fs::metadata(path).map(FileStat::from)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> std::io::Result<()> {
        std::fs::DirBuilder::new().mode(mode).create(path)
    }

    fn rmdir(&self, path: &Path) -> std::io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn unlink(&self, path: &Path) -> std::io::Result<()> {
        std::fs::remove_file(path)
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> std::io::Result<()> {
        let invalid = |_| std::io::Error::from_raw_os_error(libc::EINVAL);
        let mode = libc::mode_t::try_from(mode).map_err(invalid)?;
        let dev = libc::dev_t::try_from(rdev).map_err(invalid)?;
        nix::sys::stat::mknod(
            path,
            SFlag::from_bits_truncate(mode & libc::S_IFMT),
            Mode::from_bits_truncate(mode & 0o7777),
            dev,
        )?;
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> std::io::Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
    }

    fn access(&self, path: &Path, mask: i32) -> std::io::Result<()> {
        nix::unistd::access(path, AccessFlags::from_bits_truncate(mask))?;
        Ok(())
    }

    #[allow(clippy::allow_attributes)]
    #[allow(clippy::useless_conversion)]
    fn statvfs(&self, path: &Path) -> std::io::Result<FsStats> {
        let stat = nix::sys::statvfs::statvfs(path)?;

        Ok(FsStats {
            block_size: u64::from(stat.block_size()),
            fragment_size: u64::from(stat.fragment_size()),
            total_blocks: u64::from(stat.blocks()),
            free_blocks: u64::from(stat.blocks_free()),
            available_blocks: u64::from(stat.blocks_available()),
            total_inodes: u64::from(stat.files()),
            free_inodes: u64::from(stat.files_free()),
            available_inodes: u64::from(stat.files_available()),
            filesystem_id: u64::from(stat.filesystem_id()),
            mount_flags: u64::from(stat.flags().bits()),
            max_filename_length: u64::from(stat.name_max()),
        })
    }

    fn read_dir(&self, path: &Path) -> std::io::Result<Vec<OsString>> {
        std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect()
    }
}
