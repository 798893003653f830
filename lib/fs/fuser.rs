//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`HycacheFs`].

use std::ffi::OsStr;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::inode_table::{InodeTable, ROOT_INO};
use super::{AccessMask, HycacheFs, InodeAddr};
use crate::error::TierError;
use crate::io::FileStat;
use crate::tier::VirtualPath;

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyEmpty,
    fuser::ReplyStatfs,
);

/// Extension trait on `Result<T, TierError>` for FUSE reply handling.
///
/// Each callback only expresses its success path; errors are logged and replied as errno.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, TierError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.into());
            }
        }
    }
}

fn file_type(mode: u32) -> fuser::FileType {
    match mode & u32::from(libc::S_IFMT) {
        m if m == u32::from(libc::S_IFDIR) => fuser::FileType::Directory,
        m if m == u32::from(libc::S_IFLNK) => fuser::FileType::Symlink,
        m if m == u32::from(libc::S_IFIFO) => fuser::FileType::NamedPipe,
        m if m == u32::from(libc::S_IFSOCK) => fuser::FileType::Socket,
        m if m == u32::from(libc::S_IFCHR) => fuser::FileType::CharDevice,
        m if m == u32::from(libc::S_IFBLK) => fuser::FileType::BlockDevice,
        _ => fuser::FileType::RegularFile,
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "permission bits are masked to 12 bits"
)]
fn to_fuser_attr(ino: InodeAddr, stat: &FileStat) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size.div_ceil(512),
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.ctime,
        kind: file_type(stat.mode),
        perm: stat.permissions() as u16,
        nlink: u32::try_from(stat.nlink).unwrap_or(u32::MAX),
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

const BLOCK_SIZE: u32 = 4096;

/// Bridges [`HycacheFs`] to the [`fuser::Filesystem`] trait.
///
/// Runs on the single fuser session thread. The inode table is owned here; the filesystem
/// underneath only ever sees virtual paths.
pub struct FuserAdapter {
    fs: HycacheFs,
    inodes: InodeTable,
}

impl FuserAdapter {
    const ATTR_TTL: Duration = Duration::from_secs(1);

    /// Adapter with a fresh inode table.
    #[must_use]
    pub fn new(fs: HycacheFs) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
        }
    }

    /// The wrapped filesystem.
    #[must_use]
    pub fn fs(&self) -> &HycacheFs {
        &self.fs
    }

    fn path(&self, ino: InodeAddr) -> Result<VirtualPath, TierError> {
        self.inodes.path(ino).cloned().ok_or(TierError::NotFound)
    }

    fn child(&self, parent: InodeAddr, name: &OsStr) -> Result<(VirtualPath, String), TierError> {
        let parent = self.path(parent)?;
        let name = name
            .to_str()
            .ok_or_else(|| TierError::Io(std::io::Error::from_raw_os_error(libc::EINVAL)))?;
        Ok((parent, name.to_owned()))
    }

    /// Stat a freshly created child and register the kernel's lookup of it.
    fn entry(&mut self, path: VirtualPath) -> Result<fuser::FileAttr, TierError> {
        let stat = self.fs.getattr(&path)?;
        let ino = self.inodes.lookup(path);
        Ok(to_fuser_attr(ino, &stat))
    }
}

impl fuser::Filesystem for FuserAdapter {
    #[instrument(name = "FuserAdapter::destroy", skip(self))]
    fn destroy(&mut self) {
        self.fs.shutdown();
    }

    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        self.child(parent, name)
            .and_then(|(parent, name)| self.fs.lookup(&parent, &name))
            .map(|(path, stat)| to_fuser_attr(self.inodes.lookup(path), &stat))
            .fuse_reply(reply, |attr, reply| {
                debug!(?attr, "replying...");
                reply.entry(&Self::ATTR_TTL, &attr, 0);
            });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.path(ino)
            .and_then(|path| self.fs.getattr(&path))
            .fuse_reply(reply, |stat, reply| {
                let attr = to_fuser_attr(ino, &stat);
                debug!(?attr, "replying...");
                reply.attr(&Self::ATTR_TTL, &attr);
            });
    }

    #[instrument(name = "FuserAdapter::access", skip(self, _req, reply))]
    fn access(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mask: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.path(ino)
            .and_then(|path| self.fs.access(&path, AccessMask::from_bits_truncate(mask)))
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _fh, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let listing = self
            .path(ino)
            .and_then(|path| self.fs.readdir(&path).map(|names| (path, names)));
        let (dir, names) = match listing {
            Ok(listing) => listing,
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.into());
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (idx, name) in names.iter().enumerate().skip(skip) {
            let (entry_ino, kind) = match name.to_str() {
                Some(".") => (ino, fuser::FileType::Directory),
                Some("..") => {
                    let parent = dir.parent().map_or(ROOT_INO, |p| {
                        self.inodes.ino(&p).unwrap_or(ROOT_INO)
                    });
                    (parent, fuser::FileType::Directory)
                }
                Some(child) => {
                    let path = dir.join(child);
                    let kind = self
                        .fs
                        .getattr(&path)
                        .map_or(fuser::FileType::RegularFile, |stat| file_type(stat.mode));
                    (self.inodes.listed(&path), kind)
                }
                None => {
                    warn!(?name, "skipping entry with a non UTF-8 name");
                    continue;
                }
            };

            let Ok(next_offset) = i64::try_from(idx + 1) else {
                reply.error(libc::EIO);
                return;
            };
            if reply.add(entry_ino, next_offset, kind, name) {
                debug!("buffer full for now, stopping readdir");
                break;
            }
        }

        reply.ok();
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, _req, reply))]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.child(parent, name)
            .and_then(|(parent, name)| {
                let path = parent.join(&name);
                self.fs.mkdir(&path, mode & !umask)?;
                self.entry(path)
            })
            .fuse_reply(reply, |attr, reply| {
                reply.entry(&Self::ATTR_TTL, &attr, 0);
            });
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, _req, reply))]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.child(parent, name)
            .and_then(|(parent, name)| {
                let path = parent.join(&name);
                self.fs.rmdir(&path)?;
                self.inodes.unlink(&path);
                Ok(())
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::mknod", skip(self, _req, reply))]
    fn mknod(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.child(parent, name)
            .and_then(|(parent, name)| {
                let path = parent.join(&name);
                let mode = mode & !(umask & 0o7777);
                self.fs.mknod(&path, mode, u64::from(rdev))?;
                self.entry(path)
            })
            .fuse_reply(reply, |attr, reply| {
                reply.entry(&Self::ATTR_TTL, &attr, 0);
            });
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, ino: u64, reply: fuser::ReplyStatfs) {
        let path = self.inodes.path(ino).cloned().unwrap_or_else(VirtualPath::root);
        self.fs.statfs(&path).fuse_reply(reply, |stats, reply| {
            debug!(?stats, "replying...");
            reply.statfs(
                stats.total_blocks,
                stats.free_blocks,
                stats.available_blocks,
                stats.total_inodes,
                stats.free_inodes,
                saturate(stats.block_size),
                saturate(stats.max_filename_length),
                saturate(stats.fragment_size),
            );
        });
    }
}
