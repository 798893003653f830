use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{MirrorKind, MirrorOperation, MirrorQueue};
use crate::io::TierIo;

/// Retry policy of a [`MirrorWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorWorkerConfig {
    /// Attempts per operation before it is put back at the head of the queue.
    pub max_attempts: u32,
    /// Delay after the first failed attempt. Doubles after every further failure.
    pub initial_backoff: Duration,
    /// Upper bound for the delay between attempts.
    pub max_backoff: Duration,
}

impl Default for MirrorWorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Counters published by a running [`MirrorWorker`].
#[derive(Debug, Default)]
pub struct MirrorStats {
    applied: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

impl MirrorStats {
    /// Operations that reached the slow tier, including ones that were already converged.
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Failed attempts that were retried.
    #[must_use]
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// Operations abandoned: either they failed in a way retrying cannot fix, or the queue was
    /// closed while they kept failing.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

enum Outcome {
    Applied,
    Requeued,
    Dropped,
}

/// Drains a [`MirrorQueue`] on a dedicated thread and replays every operation on the slow tier.
///
/// Operations are applied one at a time in queue order. An operation failing with a transient
/// error (I/O, no space, busy) is retried in place, so nothing queued behind it can overtake it.
/// One failing because of the slow tier's contents (missing target, not empty, no permission) is
/// dropped right away and counted in [`MirrorStats::dropped`]. Failures are logged and never
/// reach the filesystem call that produced the operation.
pub struct MirrorWorker {
    handle: JoinHandle<()>,
    stats: Arc<MirrorStats>,
}

impl MirrorWorker {
    /// Spawn the worker thread.
    ///
    /// The thread runs until the queue is closed and drained.
    pub fn spawn(
        queue: Arc<MirrorQueue>,
        io: Arc<dyn TierIo>,
        config: MirrorWorkerConfig,
    ) -> std::io::Result<Self> {
        let stats = Arc::new(MirrorStats::default());
        let thread_stats = Arc::clone(&stats);
        let handle = std::thread::Builder::new()
            .name("hycache-mirror".to_owned())
            .spawn(move || run(&queue, io.as_ref(), config, &thread_stats))?;

        Ok(Self { handle, stats })
    }

    /// Live counters, readable while the worker runs and after it stopped.
    #[must_use]
    pub fn stats(&self) -> Arc<MirrorStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for the thread to finish. Close the queue first, or this never returns.
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("mirror worker thread panicked");
        }
    }
}

fn run(queue: &MirrorQueue, io: &dyn TierIo, config: MirrorWorkerConfig, stats: &MirrorStats) {
    info!("mirror worker started");

    while let Some(op) = queue.dequeue_blocking() {
        match process(queue, io, config, stats, op) {
            Outcome::Applied => {
                stats.applied.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Requeued => std::thread::sleep(config.max_backoff),
            Outcome::Dropped => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    info!("mirror worker stopped");
}

fn process(
    queue: &MirrorQueue,
    io: &dyn TierIo,
    config: MirrorWorkerConfig,
    stats: &MirrorStats,
    op: MirrorOperation,
) -> Outcome {
    let mut backoff = config.initial_backoff;

    for attempt in 1..=config.max_attempts.max(1) {
        match apply(io, &op) {
            Ok(()) => {
                debug!(%op, attempt, "mirrored");
                return Outcome::Applied;
            }
            Err(e) if is_permanent(&e) => {
                error!(%op, error = %e, "mirror operation cannot succeed, dropping it");
                return Outcome::Dropped;
            }
            Err(e) => {
                warn!(%op, attempt, error = %e, "mirror attempt failed");
                if attempt < config.max_attempts {
                    stats.retried.fetch_add(1, Ordering::Relaxed);
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(config.max_backoff);
                }
            }
        }
    }

    if queue.is_closed() {
        error!(%op, "giving up on mirror operation during shutdown");
        return Outcome::Dropped;
    }

    error!(%op, "mirror operation keeps failing, putting it back");
    queue.requeue_front(op);
    Outcome::Requeued
}

/// Errors that describe the slow tier's state rather than its availability. Retrying does not
/// change the outcome, and holding the queue head on them would stall every later operation.
fn is_permanent(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(
            libc::ENOENT
                | libc::ENOTDIR
                | libc::EISDIR
                | libc::EEXIST
                | libc::ENOTEMPTY
                | libc::EINVAL
                | libc::EPERM
                | libc::EACCES
                | libc::EROFS
                | libc::ENAMETOOLONG
                | libc::ELOOP
        )
    )
}

/// Apply one operation to the slow tier. States that already match the operation count as
/// success, since the queue delivers at least once.
///
/// `CreateDir` creates missing slow-tier ancestors first: a directory that predates the mount may
/// exist on the fast tier only.
pub fn apply(io: &dyn TierIo, op: &MirrorOperation) -> std::io::Result<()> {
    let target = op.target.as_path();
    match op.kind {
        MirrorKind::CreateDir { mode } => match create_dir_all(io, target, mode) {
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => io.chmod(target, mode),
            other => other,
        },
        MirrorKind::RemoveDir => ignore_errno(io.rmdir(target), libc::ENOENT),
        MirrorKind::ChangeMode { mode } => io.chmod(target, mode),
        MirrorKind::CreateNode { mode, rdev } => {
            ignore_errno(io.mknod(target, mode, rdev), libc::EEXIST)
        }
        MirrorKind::RemoveFile => ignore_errno(io.unlink(target), libc::ENOENT),
    }
}

/// Mode of ancestors created on behalf of a `CreateDir`.
const ANCESTOR_MODE: u32 = 0o755;

/// `mkdir -p`, except that `EEXIST` on `path` itself is still reported.
fn create_dir_all(io: &dyn TierIo, path: &Path, mode: u32) -> std::io::Result<()> {
    match io.mkdir(path, mode) {
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
        other => return other,
    }

    let Some(parent) = path.parent() else {
        return Err(std::io::Error::from_raw_os_error(libc::ENOENT));
    };
    debug!(path = %parent.display(), "creating missing slow-tier ancestor");
    ignore_errno(create_dir_all(io, parent, ANCESTOR_MODE), libc::EEXIST)?;
    io.mkdir(path, mode)
}

fn ignore_errno(result: std::io::Result<()>, errno: i32) -> std::io::Result<()> {
    match result {
        Err(e) if e.raw_os_error() == Some(errno) => Ok(()),
        other => other,
    }
}
