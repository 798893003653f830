use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::select;
use tracing::{debug, error, info, warn};

use hycache::error::TierError;
use hycache::fs::HycacheFs;
use hycache::io::{HostIo, TierIo};
use hycache::mirror::{MirrorQueue, MirrorWorker};
use hycache::tier::TierResolver;

use crate::app_config;

mod managed_fuse {
    //! fuser will not attempt to fuse unmount the filesystem when the `BackgroundSession` is
    //! dropped, and will only do a regular unmount, but we want to be aggressive and force an
    //! unmount if possible.
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use nix::errno::Errno;

    use super::{HycacheFs, app_config, debug, error};
    use hycache::fs::fuser::FuserAdapter;
    use fuser::BackgroundSession;

    pub struct ManagedFuse {
        mount_point: PathBuf,
    }

    impl ManagedFuse {
        pub fn new(mount_point: &Path) -> Self {
            Self {
                mount_point: mount_point.to_path_buf(),
            }
        }

        /// Mount `fs` and serve it on a background thread until the session is dropped.
        pub fn spawn(
            &self,
            fs: HycacheFs,
            config: &app_config::Config,
        ) -> Result<BackgroundSession, std::io::Error> {
            let mut mount_opts = vec![
                fuser::MountOption::FSName("hycache".to_owned()),
                fuser::MountOption::Subtype("hycache".to_owned()),
                fuser::MountOption::RW,
                fuser::MountOption::Exec,
                fuser::MountOption::DefaultPermissions,
            ];
            if config.allow_other {
                // fuser only accepts auto-unmount together with allow-other or allow-root.
                mount_opts.push(fuser::MountOption::AllowOther);
                mount_opts.push(fuser::MountOption::AutoUnmount);
            }

            fuser::spawn_mount2(FuserAdapter::new(fs), &self.mount_point, &mount_opts)
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for i in 0..UMOUNT_ATTEMPT_COUNT {
                match nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH) {
                    Ok(()) => {
                        debug!(attempt = i + 1, "Unmounted FUSE filesystem.");
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(attempt = i + 1, "FUSE filesystem still busy. Retrying...");
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!(attempt = i + 1, "FUSE filesystem already unmounted.");
                        break;
                    }
                    Err(e) => {
                        error!(attempt = i + 1, error = %e, "Failed to unmount FUSE filesystem.");
                        break;
                    }
                }
            }
        }
    }
}

/// Where to mount and which directories back the two tiers.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub mount_point: PathBuf,
    pub fast_tier: PathBuf,
    pub slow_tier: PathBuf,
}

#[derive(Debug, Error)]
pub enum MountError {
    #[error("{role} tier {path} is not usable: {source}")]
    TierRoot {
        role: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{role} tier {path} is not a directory")]
    TierNotADirectory { role: &'static str, path: PathBuf },

    #[error("Mount point is not usable: {0}")]
    MountPoint(#[source] std::io::Error),

    #[error("Failed to open the filesystem: {0}")]
    Filesystem(#[from] TierError),

    #[error("Failed to start the mirror worker: {0}")]
    Worker(#[source] std::io::Error),

    #[error("Failed to mount: {0}")]
    Fuse(#[source] std::io::Error),

    #[error("Failed to wait for a shutdown signal: {0}")]
    Signal(#[source] std::io::Error),

    #[error("Failed to create the async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Both tier roots must be existing directories. They are never created implicitly.
fn check_tier_root(role: &'static str, path: &Path) -> Result<(), MountError> {
    let meta = std::fs::metadata(path).map_err(|source| MountError::TierRoot {
        role,
        path: path.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(MountError::TierNotADirectory {
            role,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents) and logs an info message.
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Close the mirror queue and wait until the worker has drained it.
async fn drain_mirror(mirror: &MirrorQueue, worker: MirrorWorker) {
    mirror.close();
    let pending = mirror.len();
    if pending > 0 {
        info!(pending, "Waiting for the mirror worker to drain the queue...");
    }

    let stats = worker.stats();
    if let Err(e) = tokio::task::spawn_blocking(move || worker.join()).await {
        error!(error = %e, "Mirror worker could not be joined.");
        return;
    }
    info!(
        applied = stats.applied(),
        retried = stats.retried(),
        dropped = stats.dropped(),
        "Mirror worker stopped."
    );
}

/// Mount, serve until a shutdown signal, then unmount and drain the mirror.
pub async fn run(config: app_config::Config, spec: MountSpec) -> Result<(), MountError> {
    check_tier_root("fast", &spec.fast_tier)?;
    check_tier_root("slow", &spec.slow_tier)?;
    prepare_mount_point(&spec.mount_point)
        .await
        .map_err(MountError::MountPoint)?;

    let io: Arc<dyn TierIo> = Arc::new(HostIo);
    let mirror = Arc::new(MirrorQueue::with_warn_depth(config.mirror.warn_depth));
    let fs = HycacheFs::open(
        TierResolver::new(&spec.fast_tier, &spec.slow_tier),
        Arc::clone(&io),
        Arc::clone(&mirror),
        config.fs_options(),
    )?;
    let tiering = fs.tiering().clone();

    let worker = MirrorWorker::spawn(Arc::clone(&mirror), io, config.mirror.worker_config())
        .map_err(MountError::Worker)?;

    info!(
        mount_point = %spec.mount_point.display(),
        fast = %spec.fast_tier.display(),
        slow = %spec.slow_tier.display(),
        "Mounting filesystem."
    );

    let fuse = managed_fuse::ManagedFuse::new(&spec.mount_point);
    let served = match fuse.spawn(fs, &config) {
        Ok(session) => {
            info!("hycache is running. Press Ctrl+C to stop.");
            let waited = wait_for_exit().await.map_err(MountError::Signal);
            // Unmounts and runs the filesystem's shutdown on the session thread.
            drop(session);
            waited
        }
        Err(e) => Err(MountError::Fuse(e)),
    };
    drop(fuse);

    // Idempotent. Covers sessions that ended without a clean destroy.
    if let Err(e) = tiering.flush() {
        warn!(error = %e, "Failed to flush the tiering queue.");
    }
    drain_mirror(&mirror, worker).await;

    served
}

pub fn spawn(config: app_config::Config, spec: MountSpec) -> Result<(), MountError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(MountError::Runtime)?;
    runtime.block_on(run(config, spec))
}
