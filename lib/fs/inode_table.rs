//! Bidirectional mapping between FUSE inode numbers and virtual paths.
//!
//! The kernel refers to objects by inode number, the adapter by path. [`InodeTable`] hands out
//! numbers on `lookup` and keeps a per-inode lookup count, as FUSE requires, so a number stays
//! stable until the kernel forgets it. The root is always [`ROOT_INO`] and is never forgotten.

use std::collections::HashMap;

use tracing::trace;

use super::InodeAddr;
use crate::tier::VirtualPath;

/// Inode number of the namespace root, fixed by the FUSE protocol.
pub const ROOT_INO: InodeAddr = 1;

/// Reported in listings for entries the kernel has not looked up. Never allocated.
pub const UNBOUND_INO: InodeAddr = InodeAddr::MAX;

struct Slot {
    path: VirtualPath,
    lookups: u64,
}

/// Inode numbers handed to the kernel and the lookup counts keeping them alive.
pub struct InodeTable {
    by_ino: HashMap<InodeAddr, Slot>,
    by_path: HashMap<VirtualPath, InodeAddr>,
    next_ino: InodeAddr,
}

impl InodeTable {
    /// Table holding only the root.
    #[must_use]
    pub fn new() -> Self {
        let root = VirtualPath::root();
        let mut by_path = HashMap::new();
        by_path.insert(root.clone(), ROOT_INO);
        let mut by_ino = HashMap::new();
        by_ino.insert(
            ROOT_INO,
            Slot {
                path: root,
                lookups: 1,
            },
        );

        Self {
            by_ino,
            by_path,
            next_ino: ROOT_INO + 1,
        }
    }

    /// Path currently bound to `ino`.
    #[must_use]
    pub fn path(&self, ino: InodeAddr) -> Option<&VirtualPath> {
        self.by_ino.get(&ino).map(|slot| &slot.path)
    }

    /// Inode bound to `path`, if the kernel currently knows it.
    #[must_use]
    pub fn ino(&self, path: &VirtualPath) -> Option<InodeAddr> {
        self.by_path.get(path).copied()
    }

    /// Record one kernel lookup of `path`, allocating an inode on first sight.
    pub fn lookup(&mut self, path: VirtualPath) -> InodeAddr {
        if let Some(&ino) = self.by_path.get(&path) {
            if let Some(slot) = self.by_ino.get_mut(&ino) {
                slot.lookups += 1;
            }
            return ino;
        }

        let ino = self.next_ino;
        self.next_ino += 1;
        trace!(ino, %path, "allocated inode");
        self.by_path.insert(path.clone(), ino);
        self.by_ino.insert(ino, Slot { path, lookups: 1 });
        ino
    }

    /// Inode to report for `path` in a directory listing.
    ///
    /// The kernel never forgets entries it only saw through `readdir`, so listing allocates
    /// nothing: unknown paths get [`UNBOUND_INO`].
    #[must_use]
    pub fn listed(&self, path: &VirtualPath) -> InodeAddr {
        self.ino(path).unwrap_or(UNBOUND_INO)
    }

    /// Drop `count` lookups of `ino`. The binding is released once no lookup remains.
    pub fn forget(&mut self, ino: InodeAddr, count: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(slot) = self.by_ino.get_mut(&ino) else {
            return;
        };

        slot.lookups = slot.lookups.saturating_sub(count);
        if slot.lookups > 0 {
            return;
        }

        if let Some(slot) = self.by_ino.remove(&ino) {
            trace!(ino, path = %slot.path, "released inode");
            // The path may have been rebound to a newer inode meanwhile.
            if self.by_path.get(&slot.path) == Some(&ino) {
                self.by_path.remove(&slot.path);
            }
        }
    }

    /// Unbind `path` after it was removed, so a later create gets a fresh inode. The old inode
    /// stays resolvable until the kernel forgets it.
    pub fn unlink(&mut self, path: &VirtualPath) {
        if path.is_root() {
            return;
        }
        self.by_path.remove(path);
    }

    /// Number of live bindings, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    /// Never true: the root is always bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
