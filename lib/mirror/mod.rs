//! Deferred mirroring of structural changes from the fast tier to the slow tier.
//!
//! The adapter pushes a [`MirrorOperation`] onto the [`MirrorQueue`] after a fast-tier call has
//! succeeded. A [`MirrorWorker`] drains the queue on its own thread and replays each operation
//! against the slow tier, so filesystem callers never wait on slow-tier latency.

/// Background thread that applies queued operations to the slow tier.
pub mod executor;
/// Thread-safe blocking FIFO of pending operations.
pub mod queue;

pub use executor::{MirrorStats, MirrorWorker, MirrorWorkerConfig};
pub use queue::MirrorQueue;

use std::fmt;
use std::path::PathBuf;

/// What has to happen on the slow tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MirrorKind {
    /// Create a directory. An existing one is brought to `mode` instead.
    CreateDir {
        /// Requested permission bits.
        mode: u32,
    },
    /// Remove a directory.
    RemoveDir,
    /// Change permission bits.
    ChangeMode {
        /// New permission bits.
        mode: u32,
    },
    /// Create a filesystem node.
    CreateNode {
        /// File type and permission bits, as passed to `mknod(2)`.
        mode: u32,
        /// Device number for character and block devices.
        rdev: u64,
    },
    /// Remove a non-directory entry.
    RemoveFile,
}

impl MirrorKind {
    /// Short name used in log lines.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateDir { .. } => "create_dir",
            Self::RemoveDir => "remove_dir",
            Self::ChangeMode { .. } => "change_mode",
            Self::CreateNode { .. } => "create_node",
            Self::RemoveFile => "remove_file",
        }
    }
}

/// A structural change already applied to the fast tier, waiting to be replayed on the slow tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorOperation {
    /// What to do.
    pub kind: MirrorKind,
    /// Absolute path under the slow-tier root.
    pub target: PathBuf,
}

impl MirrorOperation {
    /// Operation of `kind` against the slow-tier path `target`.
    #[must_use]
    pub fn new(kind: MirrorKind, target: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }
}

impl fmt::Display for MirrorOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MirrorKind::CreateDir { mode } | MirrorKind::ChangeMode { mode } => {
                write!(f, "{} {} {mode:o}", self.kind.name(), self.target.display())
            }
            MirrorKind::CreateNode { mode, rdev } => write!(
                f,
                "{} {} {mode:o} {rdev}",
                self.kind.name(),
                self.target.display()
            ),
            MirrorKind::RemoveDir | MirrorKind::RemoveFile => {
                write!(f, "{} {}", self.kind.name(), self.target.display())
            }
        }
    }
}
