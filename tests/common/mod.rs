#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hycache::fs::{FsOptions, HycacheFs};
use hycache::io::{FileStat, FsStats, HostIo, TierIo};
use hycache::mirror::{MirrorOperation, MirrorQueue};
use hycache::tier::TierResolver;

/// A fast and a slow tier, each in its own temporary directory.
pub struct Tiers {
    fast: tempfile::TempDir,
    slow: tempfile::TempDir,
}

impl Tiers {
    pub fn new() -> Self {
        Self {
            fast: tempfile::tempdir().unwrap(),
            slow: tempfile::tempdir().unwrap(),
        }
    }

    pub fn fast(&self) -> &Path {
        self.fast.path()
    }

    pub fn slow(&self) -> &Path {
        self.slow.path()
    }

    pub fn resolver(&self) -> TierResolver {
        TierResolver::new(self.fast(), self.slow())
    }

    /// Permission bits of `rel` on the fast tier, following symlinks.
    pub fn fast_mode(&self, rel: &str) -> u32 {
        HostIo.stat(&self.fast().join(rel)).unwrap().permissions()
    }

    /// Permission bits of `rel` on the slow tier, following symlinks.
    pub fn slow_mode(&self, rel: &str) -> u32 {
        HostIo.stat(&self.slow().join(rel)).unwrap().permissions()
    }
}

/// An adapter over real tiers with its mirror queue exposed.
pub struct Harness {
    pub tiers: Tiers,
    pub mirror: Arc<MirrorQueue>,
    pub fs: HycacheFs,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(FsOptions::default())
    }

    pub fn with_options(options: FsOptions) -> Self {
        Self::with_io(Arc::new(HostIo), options)
    }

    pub fn with_io(io: Arc<dyn TierIo>, options: FsOptions) -> Self {
        let tiers = Tiers::new();
        let mirror = Arc::new(MirrorQueue::new());
        let fs = HycacheFs::open(tiers.resolver(), io, Arc::clone(&mirror), options).unwrap();
        Self { tiers, mirror, fs }
    }

    /// Everything enqueued so far, head first.
    pub fn mirrored(&self) -> Vec<MirrorOperation> {
        self.mirror.snapshot()
    }
}

/// Host calls that [`FaultyIo`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Mkdir,
    Rmdir,
    Unlink,
    Mknod,
    Chmod,
    Statvfs,
}

/// Delegates to [`HostIo`], except that selected calls fail with a fixed errno a set number of
/// times before succeeding.
pub struct FaultyIo {
    failures: parking_lot::Mutex<HashMap<Call, (i32, usize)>>,
    calls: parking_lot::Mutex<Vec<(Call, PathBuf)>>,
    attempts: AtomicUsize,
}

impl FaultyIo {
    pub fn new() -> Self {
        Self {
            failures: parking_lot::Mutex::new(HashMap::new()),
            calls: parking_lot::Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fail the next `times` invocations of `call` with `errno`.
    pub fn fail(self, call: Call, errno: i32, times: usize) -> Self {
        self.failures.lock().insert(call, (errno, times));
        self
    }

    /// Fail every invocation of `call` with `errno`.
    pub fn always_fail(self, call: Call, errno: i32) -> Self {
        self.fail(call, errno, usize::MAX)
    }

    /// Calls that reached this collaborator, in order, failed ones included.
    pub fn calls(&self) -> Vec<(Call, PathBuf)> {
        self.calls.lock().clone()
    }

    /// Number of mutating calls made so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn check(&self, call: Call, path: &Path) -> std::io::Result<()> {
        self.calls.lock().push((call, path.to_path_buf()));
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let mut failures = self.failures.lock();
        if let Some((errno, remaining)) = failures.get_mut(&call)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(std::io::Error::from_raw_os_error(*errno));
        }
        Ok(())
    }
}

impl TierIo for FaultyIo {
    fn lstat(&self, path: &Path) -> std::io::Result<FileStat> {
        HostIo.lstat(path)
    }

    fn stat(&self, path: &Path) -> std::io::Result<FileStat> {
        HostIo.stat(path)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> std::io::Result<()> {
        self.check(Call::Mkdir, path)?;
        HostIo.mkdir(path, mode)
    }

    fn rmdir(&self, path: &Path) -> std::io::Result<()> {
        self.check(Call::Rmdir, path)?;
        HostIo.rmdir(path)
    }

    fn unlink(&self, path: &Path) -> std::io::Result<()> {
        self.check(Call::Unlink, path)?;
        HostIo.unlink(path)
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> std::io::Result<()> {
        self.check(Call::Mknod, path)?;
        HostIo.mknod(path, mode, rdev)
    }

    fn chmod(&self, path: &Path, mode: u32) -> std::io::Result<()> {
        self.check(Call::Chmod, path)?;
        HostIo.chmod(path, mode)
    }

    fn access(&self, path: &Path, mask: i32) -> std::io::Result<()> {
        HostIo.access(path, mask)
    }

    fn statvfs(&self, path: &Path) -> std::io::Result<FsStats> {
        self.check(Call::Statvfs, path)?;
        HostIo.statvfs(path)
    }

    fn read_dir(&self, path: &Path) -> std::io::Result<Vec<OsString>> {
        HostIo.read_dir(path)
    }
}

/// Sorted names of a listing, without `.` and `..`.
pub fn names(listing: &[OsString]) -> Vec<String> {
    let mut names: Vec<String> = listing
        .iter()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| n != "." && n != "..")
        .collect();
    names.sort();
    names
}
