//! Dual-tier path resolution.
//!
//! A [`VirtualPath`] names an object in the unified namespace. [`TierResolver`] turns it into the
//! pair of physical paths under the fast and slow tier roots, and gathers the [`TierFacts`] a
//! handler needs from the fast tier. Facts are a snapshot: handlers compute them once per call and
//! never re-read the filesystem mid-call.
//!
//! Paths containing `..` are not sanitized here. The kernel never hands those to a FUSE
//! filesystem, and any other caller is responsible for rejecting them.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::io::TierIo;

/// Name of the reserved directory on the fast tier that holds persisted state.
pub const CONTROL_DIR_NAME: &str = ".____hycache";

/// Entries whose name starts with this marker are never listed.
pub const CONTROL_DIR_MARKER: &str = ".____";

/// A normalized, slash-separated path relative to the namespace root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualPath(String);

impl VirtualPath {
    /// Normalize a path as handed over by the front-end.
    ///
    /// Strips at most one leading separator. `"/a/b"` and `"a/b"` normalize to the same path,
    /// `"//a"` normalizes to `"/a"`.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        Self(raw.strip_prefix('/').unwrap_or(raw).to_owned())
    }

    /// The namespace root.
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Normalized form: no leading, trailing or repeated separators.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the mount root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The containing directory. `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rsplit_once('/') {
            Some((parent, _)) => Some(Self(parent.to_owned())),
            None => Some(Self::root()),
        }
    }

    /// Path of a child entry of this directory.
    #[must_use]
    pub fn join(&self, name: &str) -> Self {
        if self.is_root() {
            Self(name.to_owned())
        } else {
            Self(format!("{}/{name}", self.0))
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for VirtualPath {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

/// Physical locations of one virtual path on both tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TierPaths {
    /// Under the fast-tier root.
    pub fast: PathBuf,
    /// Under the slow-tier root.
    pub slow: PathBuf,
}

/// Fast-tier properties of a path, valid for the duration of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TierFacts {
    /// The fast-tier entry itself is a symbolic link, which marks a cross-tier object.
    pub is_symlink: bool,
    /// The fast-tier entry resolves (following links) to a directory.
    pub is_directory: bool,
    /// Permission bits of the resolved entry. `None` if nothing resolves at this path.
    pub mode: Option<u32>,
}

impl TierFacts {
    /// Something, possibly a dangling link, is present on the fast tier.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.is_symlink || self.mode.is_some()
    }
}

/// Maps virtual paths onto the two configured tier roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierResolver {
    fast_root: PathBuf,
    slow_root: PathBuf,
}

impl TierResolver {
    /// Roots are taken as given. Mount-time canonicalization happens in the binary.
    #[must_use]
    pub fn new(fast_root: impl Into<PathBuf>, slow_root: impl Into<PathBuf>) -> Self {
        Self {
            fast_root: fast_root.into(),
            slow_root: slow_root.into(),
        }
    }

    /// Root of the fast tier.
    #[must_use]
    pub fn fast_root(&self) -> &Path {
        &self.fast_root
    }

    /// Root of the slow tier.
    #[must_use]
    pub fn slow_root(&self) -> &Path {
        &self.slow_root
    }

    /// Location of the control directory on the fast tier.
    #[must_use]
    pub fn control_dir(&self) -> PathBuf {
        self.fast_root.join(CONTROL_DIR_NAME)
    }

    /// Pure path computation. Never fails and never touches the disk.
    #[must_use]
    pub fn resolve(&self, path: &VirtualPath) -> TierPaths {
        if path.is_root() {
            return TierPaths {
                fast: self.fast_root.clone(),
                slow: self.slow_root.clone(),
            };
        }

        TierPaths {
            fast: self.fast_root.join(path.as_str()),
            slow: self.slow_root.join(path.as_str()),
        }
    }

    /// Inspect the fast-tier entry for `path`. The slow tier is never consulted.
    ///
    /// Errors are folded into the facts the same way `islink`/`isdir` fold them: a path that
    /// cannot be inspected is neither a symlink nor a directory.
    pub fn facts(&self, io: &dyn TierIo, path: &VirtualPath) -> TierFacts {
        let fast = self.resolve(path).fast;

        let Ok(lstat) = io.lstat(&fast) else {
            return TierFacts::default();
        };

        if !lstat.is_symlink() {
            return TierFacts {
                is_symlink: false,
                is_directory: lstat.is_dir(),
                mode: Some(lstat.permissions()),
            };
        }

        match io.stat(&fast) {
            Ok(target) => TierFacts {
                is_symlink: true,
                is_directory: target.is_dir(),
                mode: Some(target.permissions()),
            },
            // Dangling link.
            Err(_) => TierFacts {
                is_symlink: true,
                is_directory: false,
                mode: None,
            },
        }
    }
}

/// Whether a directory entry name belongs to the reserved control namespace.
#[must_use]
pub fn is_control_entry(name: &std::ffi::OsStr) -> bool {
    name.as_encoded_bytes()
        .starts_with(CONTROL_DIR_MARKER.as_bytes())
}
