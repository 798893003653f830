//! Durable priority queue of promotion and demotion candidates.
//!
//! The queue records which paths a tiering policy wants to move between tiers, and in which
//! order. Its whole state is persisted as a snapshot file inside the control directory on the
//! fast tier, so a restart resumes exactly where the previous mount left off.
//!
//! Snapshots are written to a temporary file in the same directory, synced, then renamed over the
//! previous snapshot. A crash mid-write leaves the previous snapshot intact.
//!
//! With [`FlushPolicy::EveryMutation`] every `push`/`pop` writes a snapshot. A [`TieringScope`]
//! defers the writes until the scope ends, which then flushes once. Dropping the queue flushes
//! any unsaved mutation.

use std::collections::{BTreeMap, HashSet};
use std::io::Write as _;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::tier::VirtualPath;

const SNAPSHOT_VERSION: u32 = 1;

/// Name of the snapshot file inside the control directory.
pub const SNAPSHOT_FILE_NAME: &str = "queue.json";

/// Which end of the priority range is served first. Ties are always served in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueOrder {
    /// Smallest priority first.
    #[default]
    LowestFirst,
    /// Largest priority first.
    HighestFirst,
}

/// When mutations reach the snapshot file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlushPolicy {
    /// Every `push` and `pop` writes a snapshot before returning.
    #[default]
    EveryMutation,
    /// Mutations only mark the queue dirty. Snapshots happen when a scope ends, on an explicit
    /// [`TieringQueue::snapshot`], and on drop.
    Deferred,
}

/// Direction of a planned move between tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieringAction {
    /// Move the object from the slow tier onto the fast tier.
    Promote,
    /// Move the object off the fast tier onto the slow tier.
    Demote,
}

/// What a queue entry asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TieringPayload {
    /// Object to move.
    pub path: VirtualPath,
    /// Which way to move it.
    pub action: TieringAction,
}

/// One queued candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriorityQueueEntry {
    /// Position in the queue, see [`QueueOrder`].
    pub priority: u64,
    /// The planned move.
    pub payload: TieringPayload,
}

impl PriorityQueueEntry {
    /// Entry asking to apply `action` to `path`.
    #[must_use]
    pub fn new(priority: u64, path: impl Into<VirtualPath>, action: TieringAction) -> Self {
        Self {
            priority,
            payload: TieringPayload {
                path: path.into(),
                action,
            },
        }
    }
}

/// The snapshot could not be turned back into a queue. Mounting must not proceed.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The snapshot exists but cannot be read, or the initial snapshot cannot be written.
    #[error("cannot access snapshot {path}: {source}")]
    Io {
        /// Snapshot file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot is not valid JSON of the expected shape.
    #[error("snapshot {path} is corrupt: {source}")]
    Corrupt {
        /// Snapshot file.
        path: PathBuf,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// The snapshot was written by a newer or older format.
    #[error("snapshot {path} has unsupported version {version}")]
    UnsupportedVersion {
        /// Snapshot file.
        path: PathBuf,
        /// Version found in the file.
        version: u32,
    },

    /// The snapshot was written with the other [`QueueOrder`].
    #[error("snapshot {path} was written {stored:?}, but the queue is configured {configured:?}")]
    OrderMismatch {
        /// Snapshot file.
        path: PathBuf,
        /// Order recorded in the file.
        stored: QueueOrder,
        /// Order the queue was opened with.
        configured: QueueOrder,
    },

    /// Two entries share a sequence number.
    #[error("snapshot {path} contains sequence number {seq} twice")]
    DuplicateSequence {
        /// Snapshot file.
        path: PathBuf,
        /// The repeated sequence number.
        seq: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    seq: u64,
    priority: u64,
    payload: TieringPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Snapshot {
    version: u32,
    order: QueueOrder,
    next_seq: u64,
    /// Pop order, head first.
    entries: Vec<StoredEntry>,
}

/// `(rank, seq)`: `rank` is the priority mapped so that smaller always pops first, `seq` keeps
/// equal ranks in insertion order.
type Key = (u64, u64);

/// Durable priority queue, see the module docs.
#[derive(Debug)]
pub struct TieringQueue {
    path: PathBuf,
    order: QueueOrder,
    flush: FlushPolicy,
    entries: BTreeMap<Key, PriorityQueueEntry>,
    next_seq: u64,
    dirty: bool,
    /// Set while a [`TieringScope`] is alive.
    deferred: bool,
}

impl TieringQueue {
    /// Open the queue persisted at `path`.
    ///
    /// A missing or empty snapshot yields an empty queue, and an empty snapshot is written right
    /// away (creating the parent directory), so the file always exists after a successful open.
    /// Anything that cannot be read back verbatim is a [`RecoveryError`].
    #[instrument(name = "TieringQueue::open", skip(path), fields(path = %path.as_ref().display()))]
    pub fn open(
        path: impl AsRef<Path>,
        order: QueueOrder,
        flush: FlushPolicy,
    ) -> Result<Self, RecoveryError> {
        let path = path.as_ref().to_path_buf();
        let mut queue = Self {
            path,
            order,
            flush,
            entries: BTreeMap::new(),
            next_seq: 0,
            dirty: false,
            deferred: false,
        };

        let bytes = match std::fs::read(&queue.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(RecoveryError::Io {
                    path: queue.path.clone(),
                    source,
                });
            }
        };

        if bytes.is_empty() {
            queue.initialize()?;
            info!("initialized empty tiering queue");
            return Ok(queue);
        }

        queue.restore(&bytes)?;
        info!(entries = queue.len(), "recovered tiering queue");
        Ok(queue)
    }

    fn initialize(&mut self) -> Result<(), RecoveryError> {
        let path = self.path.clone();
        let io_err = |source| RecoveryError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        self.snapshot().map_err(io_err)
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), RecoveryError> {
        let snapshot: Snapshot =
            serde_json::from_slice(bytes).map_err(|source| RecoveryError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(RecoveryError::UnsupportedVersion {
                path: self.path.clone(),
                version: snapshot.version,
            });
        }

        if snapshot.order != self.order {
            return Err(RecoveryError::OrderMismatch {
                path: self.path.clone(),
                stored: snapshot.order,
                configured: self.order,
            });
        }

        let mut next_seq = snapshot.next_seq;
        let mut seen = HashSet::with_capacity(snapshot.entries.len());
        for stored in snapshot.entries {
            if !seen.insert(stored.seq) {
                return Err(RecoveryError::DuplicateSequence {
                    path: self.path.clone(),
                    seq: stored.seq,
                });
            }
            let key = (self.rank(stored.priority), stored.seq);
            let entry = PriorityQueueEntry {
                priority: stored.priority,
                payload: stored.payload,
            };
            self.entries.insert(key, entry);
            next_seq = next_seq.max(stored.seq.saturating_add(1));
        }
        self.next_seq = next_seq;
        Ok(())
    }

    fn rank(&self, priority: u64) -> u64 {
        match self.order {
            QueueOrder::LowestFirst => priority,
            QueueOrder::HighestFirst => u64::MAX - priority,
        }
    }

    /// Insert an entry behind every queued entry of equal priority.
    ///
    /// If the snapshot cannot be written the entry is not inserted, so the queue matches the
    /// returned error.
    pub fn push(&mut self, entry: PriorityQueueEntry) -> std::io::Result<()> {
        let seq = self.next_seq;
        let key = (self.rank(entry.priority), seq);
        debug!(
            priority = entry.priority,
            path = %entry.payload.path,
            action = ?entry.payload.action,
            seq,
            "push"
        );

        let was_dirty = self.dirty;
        self.next_seq += 1;
        self.entries.insert(key, entry);
        if let Err(e) = self.mutated() {
            self.entries.remove(&key);
            self.next_seq = seq;
            self.dirty = was_dirty;
            return Err(e);
        }
        Ok(())
    }

    /// Remove the entry that is served next.
    ///
    /// If the snapshot cannot be written the entry stays queued at its place and the error is
    /// returned instead.
    pub fn pop(&mut self) -> std::io::Result<Option<PriorityQueueEntry>> {
        let was_dirty = self.dirty;
        let Some((key, entry)) = self.entries.pop_first() else {
            return Ok(None);
        };
        debug!(priority = entry.priority, path = %entry.payload.path, "pop");

        if let Err(e) = self.mutated() {
            self.entries.insert(key, entry);
            self.dirty = was_dirty;
            return Err(e);
        }
        Ok(Some(entry))
    }

    /// The entry that [`pop`](Self::pop) would return.
    #[must_use]
    pub fn peek(&self) -> Option<&PriorityQueueEntry> {
        self.entries.values().next()
    }

    /// Entries in pop order.
    pub fn iter(&self) -> impl Iterator<Item = &PriorityQueueEntry> {
        self.entries.values()
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether there are mutations the snapshot file does not reflect yet.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Location of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Order the queue was opened with.
    #[must_use]
    pub fn order(&self) -> QueueOrder {
        self.order
    }

    fn mutated(&mut self) -> std::io::Result<()> {
        self.dirty = true;
        if self.deferred || self.flush == FlushPolicy::Deferred {
            return Ok(());
        }
        self.snapshot()
    }

    /// Write the full state to the snapshot file, replacing it atomically.
    pub fn snapshot(&mut self) -> std::io::Result<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            order: self.order,
            next_seq: self.next_seq,
            entries: self
                .entries
                .iter()
                .map(|(&(_, seq), entry)| StoredEntry {
                    seq,
                    priority: entry.priority,
                    payload: entry.payload.clone(),
                })
                .collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;

        let file_name = self
            .path
            .file_name()
            .map_or_else(|| SNAPSHOT_FILE_NAME.into(), |n| n.to_string_lossy());
        let tmp_path = self
            .path
            .with_file_name(format!("{file_name}.{}.tmp", std::process::id()));

        if let Err(e) = write_and_rename(&tmp_path, &self.path, &bytes) {
            if let Err(cleanup) = std::fs::remove_file(&tmp_path)
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(
                    tmp = %tmp_path.display(),
                    error = %cleanup,
                    "failed to remove temporary snapshot"
                );
            }
            return Err(e);
        }

        // Persist the rename itself.
        if let Some(parent) = self.path.parent() {
            let synced = std::fs::File::open(parent).and_then(|dir| dir.sync_all());
            if let Err(e) = synced {
                warn!(
                    dir = %parent.display(),
                    error = %e,
                    "failed to sync control directory, the latest snapshot may not survive a crash"
                );
            }
        }

        self.dirty = false;
        debug!(entries = snapshot.entries.len(), "snapshot written");
        Ok(())
    }

    /// Defer snapshots until the returned scope ends.
    pub fn scope(&mut self) -> TieringScope<&mut Self> {
        TieringScope::new(self)
    }
}

fn write_and_rename(tmp_path: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    std::fs::rename(tmp_path, path)
}

impl Drop for TieringQueue {
    fn drop(&mut self) {
        if self.dirty
            && let Err(e) = self.snapshot()
        {
            error!(path = %self.path.display(), error = %e, "failed to flush tiering queue");
        }
    }
}

/// Scoped acquisition of a [`TieringQueue`].
///
/// Mutations made through the scope only mark the queue dirty. When the scope ends the queue is
/// flushed once, whichever way the scope is left. Use [`commit`](Self::commit) to observe the
/// flush result; a failed flush on drop is logged.
pub struct TieringScope<G: DerefMut<Target = TieringQueue>> {
    guard: Option<G>,
}

impl<G: DerefMut<Target = TieringQueue>> TieringScope<G> {
    fn new(mut guard: G) -> Self {
        guard.deferred = true;
        Self { guard: Some(guard) }
    }

    /// End the scope and flush.
    pub fn commit(mut self) -> std::io::Result<()> {
        match self.guard.take() {
            Some(guard) => Self::finish(guard),
            None => Ok(()),
        }
    }

    fn finish(mut guard: G) -> std::io::Result<()> {
        guard.deferred = false;
        if guard.dirty {
            guard.snapshot()
        } else {
            Ok(())
        }
    }
}

impl<G: DerefMut<Target = TieringQueue>> Deref for TieringScope<G> {
    type Target = TieringQueue;

    fn deref(&self) -> &TieringQueue {
        match &self.guard {
            Some(guard) => &**guard,
            None => unreachable!("guard is only taken by commit, which consumes the scope"),
        }
    }
}

impl<G: DerefMut<Target = TieringQueue>> DerefMut for TieringScope<G> {
    fn deref_mut(&mut self) -> &mut TieringQueue {
        match &mut self.guard {
            Some(guard) => &mut **guard,
            None => unreachable!("guard is only taken by commit, which consumes the scope"),
        }
    }
}

impl<G: DerefMut<Target = TieringQueue>> Drop for TieringScope<G> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take()
            && let Err(e) = Self::finish(guard)
        {
            error!(error = %e, "failed to flush tiering queue at end of scope");
        }
    }
}

/// A [`TieringQueue`] that can be handed to another thread, such as a tiering policy.
///
/// The only way in is [`acquire`](Self::acquire), which holds the lock for the whole scope, so a
/// snapshot never observes a half-applied mutation.
#[derive(Debug, Clone)]
pub struct SharedTieringQueue(Arc<Mutex<TieringQueue>>);

impl SharedTieringQueue {
    /// Wrap an opened queue.
    #[must_use]
    pub fn new(queue: TieringQueue) -> Self {
        Self(Arc::new(Mutex::new(queue)))
    }

    /// Lock the queue for a scope. The queue is flushed when the scope ends.
    pub fn acquire(&self) -> TieringScope<MutexGuard<'_, TieringQueue>> {
        TieringScope::new(self.0.lock())
    }

    /// Write any unsaved mutation to disk.
    pub fn flush(&self) -> std::io::Result<()> {
        let mut queue = self.0.lock();
        if queue.is_dirty() {
            queue.snapshot()
        } else {
            Ok(())
        }
    }
}
