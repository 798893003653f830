//! The filesystem operation adapter.
//!
//! [`HycacheFs`] implements each supported call against the fast tier and decides which of them
//! have to be mirrored onto the slow tier. Every call follows the same steps: resolve the path,
//! gather the fast-tier facts it needs, perform the fast-tier action, enqueue a mirror operation
//! if the call requires one, then return. A fast-tier failure is returned as-is and leaves the
//! mirror queue untouched.

/// FUSE front-end: maps [`fuser::Filesystem`] callbacks onto [`HycacheFs`].
pub mod fuser;
/// Inode number allocation for the FUSE front-end.
pub mod inode_table;

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::TierError;
use crate::io::{FileStat, FsStats, TierIo};
use crate::mirror::{MirrorKind, MirrorOperation, MirrorQueue};
use crate::tier::{TierResolver, VirtualPath, is_control_entry};
use crate::tiering::{
    FlushPolicy, QueueOrder, SNAPSHOT_FILE_NAME, SharedTieringQueue, TieringQueue,
};

/// Type representing an inode identifier.
pub type InodeAddr = u64;

bitflags! {
    /// Accessibility checks requested by `access(2)`. The empty set only checks existence.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessMask: i32 {
        /// Read permission.
        const READ = libc::R_OK;
        /// Write permission.
        const WRITE = libc::W_OK;
        /// Execute or search permission.
        const EXECUTE = libc::X_OK;
    }
}

/// What `mkdir` does for a directory that already exists with the requested permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MkdirPolicy {
    /// Succeed without touching either tier.
    #[default]
    Skip,
    /// Attempt the create again, which fails with [`TierError::AlreadyExists`].
    Recreate,
}

/// Tunables of a [`HycacheFs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsOptions {
    /// Order the tiering queue is opened with.
    pub queue_order: QueueOrder,
    /// When tiering queue mutations are persisted.
    pub flush_policy: FlushPolicy,
    /// How `mkdir` treats the mirror.
    pub mkdir_policy: MkdirPolicy,
}

/// Directory entries that every listing starts with.
const DOT_ENTRIES: [&str; 2] = [".", ".."];

const PERMISSION_BITS: u32 = 0o7777;

/// The dual-tier filesystem, independent of any front-end.
pub struct HycacheFs {
    resolver: TierResolver,
    io: Arc<dyn TierIo>,
    mirror: Arc<MirrorQueue>,
    tiering: SharedTieringQueue,
    mkdir_policy: MkdirPolicy,
}

impl HycacheFs {
    /// Build the filesystem, recovering the tiering queue from the control directory on the fast
    /// tier. A snapshot that cannot be recovered aborts with [`TierError::Recovery`].
    #[instrument(name = "HycacheFs::open", skip(resolver, io, mirror))]
    pub fn open(
        resolver: TierResolver,
        io: Arc<dyn TierIo>,
        mirror: Arc<MirrorQueue>,
        options: FsOptions,
    ) -> Result<Self, TierError> {
        let snapshot = resolver.control_dir().join(SNAPSHOT_FILE_NAME);
        let tiering = TieringQueue::open(snapshot, options.queue_order, options.flush_policy)?;
        info!(
            fast = %resolver.fast_root().display(),
            slow = %resolver.slow_root().display(),
            "hycache filesystem ready"
        );

        Ok(Self {
            resolver,
            io,
            mirror,
            tiering: SharedTieringQueue::new(tiering),
            mkdir_policy: options.mkdir_policy,
        })
    }

    /// Tier roots this filesystem was opened with.
    #[must_use]
    pub fn resolver(&self) -> &TierResolver {
        &self.resolver
    }

    /// Handle to the tiering queue. Clones may be moved to a tiering-policy thread.
    #[must_use]
    pub fn tiering(&self) -> &SharedTieringQueue {
        &self.tiering
    }

    /// Queue feeding the mirror worker.
    #[must_use]
    pub fn mirror_queue(&self) -> &Arc<MirrorQueue> {
        &self.mirror
    }

    fn fast(&self, path: &VirtualPath) -> PathBuf {
        self.resolver.resolve(path).fast
    }

    fn mirror(&self, kind: MirrorKind, target: PathBuf) {
        self.mirror.enqueue(MirrorOperation::new(kind, target));
    }

    /// Check accessibility of the fast-tier entry. Every failure, including a missing entry,
    /// is reported as [`TierError::PermissionDenied`].
    #[instrument(name = "HycacheFs::access", skip(self))]
    pub fn access(&self, path: &VirtualPath, mask: AccessMask) -> Result<(), TierError> {
        self.io.access(&self.fast(path), mask.bits()).map_err(|e| {
            debug!(error = %e, "access check failed");
            TierError::PermissionDenied
        })
    }

    /// Attributes of the fast-tier entry, without following a final symlink.
    #[instrument(name = "HycacheFs::getattr", skip(self))]
    pub fn getattr(&self, path: &VirtualPath) -> Result<FileStat, TierError> {
        Ok(self.io.lstat(&self.fast(path))?)
    }

    /// Resolve `name` inside `parent` and return the child's path and attributes.
    #[instrument(name = "HycacheFs::lookup", skip(self))]
    pub fn lookup(
        &self,
        parent: &VirtualPath,
        name: &str,
    ) -> Result<(VirtualPath, FileStat), TierError> {
        let path = parent.join(name);
        let stat = self.getattr(&path)?;
        Ok((path, stat))
    }

    /// List a directory: `.` and `..` first, then the fast-tier entries. Control entries are
    /// omitted in every directory.
    #[instrument(name = "HycacheFs::readdir", skip(self))]
    pub fn readdir(&self, path: &VirtualPath) -> Result<Vec<OsString>, TierError> {
        let names = self.io.read_dir(&self.fast(path))?;

        let mut entries: Vec<OsString> = DOT_ENTRIES.iter().map(OsString::from).collect();
        entries.extend(names.into_iter().filter(|name| !is_control_entry(name)));
        Ok(entries)
    }

    /// Create a directory, or bring an existing one to the requested permission bits.
    ///
    /// - Nothing at `path`: create it and mirror the create.
    /// - A directory with different permission bits: chmod it and mirror the chmod.
    /// - A directory with the same bits: governed by [`MkdirPolicy`], never mirrored.
    #[instrument(name = "HycacheFs::mkdir", skip(self))]
    pub fn mkdir(&self, path: &VirtualPath, mode: u32) -> Result<(), TierError> {
        let paths = self.resolver.resolve(path);
        let facts = self.resolver.facts(self.io.as_ref(), path);

        let Some(existing) = facts.mode else {
            self.io.mkdir(&paths.fast, mode)?;
            self.mirror(MirrorKind::CreateDir { mode }, paths.slow);
            return Ok(());
        };

        if !facts.is_directory {
            return Err(TierError::AlreadyExists);
        }

        if existing != mode & PERMISSION_BITS {
            self.io.chmod(&paths.fast, mode)?;
            self.mirror(MirrorKind::ChangeMode { mode }, paths.slow);
            return Ok(());
        }

        match self.mkdir_policy {
            MkdirPolicy::Skip => {
                debug!("directory already exists with the requested mode");
                Ok(())
            }
            MkdirPolicy::Recreate => Ok(self.io.mkdir(&paths.fast, mode)?),
        }
    }

    /// Remove a directory.
    ///
    /// A plain fast-tier directory is removed locally only. A symlink to a directory marks an
    /// object living on the slow tier: the link is removed and the directory removal is mirrored.
    #[instrument(name = "HycacheFs::rmdir", skip(self))]
    pub fn rmdir(&self, path: &VirtualPath) -> Result<(), TierError> {
        let paths = self.resolver.resolve(path);
        let facts = self.resolver.facts(self.io.as_ref(), path);

        if !facts.is_symlink {
            return Ok(self.io.rmdir(&paths.fast)?);
        }

        if !facts.is_directory {
            return Err(TierError::NotADirectory);
        }

        self.io.unlink(&paths.fast)?;
        self.mirror(MirrorKind::RemoveDir, paths.slow);
        Ok(())
    }

    /// Create a filesystem node on the fast tier. Not mirrored.
    #[instrument(name = "HycacheFs::mknod", skip(self))]
    pub fn mknod(&self, path: &VirtualPath, mode: u32, rdev: u64) -> Result<(), TierError> {
        Ok(self.io.mknod(&self.fast(path), mode, rdev)?)
    }

    /// Statistics of the filesystem holding the fast-tier entry.
    #[instrument(name = "HycacheFs::statfs", skip(self))]
    pub fn statfs(&self, path: &VirtualPath) -> Result<FsStats, TierError> {
        Ok(self.io.statvfs(&self.fast(path))?)
    }

    /// Flush the tiering queue and close the mirror queue. Called once on unmount.
    #[instrument(name = "HycacheFs::shutdown", skip(self))]
    pub fn shutdown(&self) {
        if let Err(e) = self.tiering.flush() {
            warn!(error = %e, "failed to flush tiering queue on shutdown");
        }

        let pending = self.mirror.len();
        if pending > 0 {
            warn!(
                pending,
                "mirror operations still queued at shutdown; they are lost if the worker cannot drain them"
            );
        }
        self.mirror.close();
        info!("hycache filesystem shut down");
    }
}
