//! FUSE availability checks.

use std::path::{Path, PathBuf};

const FUSE_DEVICE: &str = "/dev/fuse";
const MOUNT_HELPERS: [&str; 2] = ["fusermount3", "fusermount"];

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// The kernel module is not loaded or the device node is missing.
    #[error(
        "{FUSE_DEVICE} does not exist. Load the fuse kernel module (`modprobe fuse`) or, in a \
         container, pass the device through."
    )]
    DeviceMissing,

    /// No setuid mount helper on `PATH`.
    #[error(
        "Neither fusermount3 nor fusermount was found on PATH. Install the fuse3 package of your \
         distribution."
    )]
    MountHelperMissing,
}

fn find_on_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// Checks for the FUSE device node and a mount helper. Running as root does not need the helper.
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if !Path::new(FUSE_DEVICE).exists() {
        return Err(FuseCheckError::DeviceMissing);
    }

    if nix::unistd::Uid::effective().is_root() {
        return Ok(());
    }

    MOUNT_HELPERS
        .iter()
        .find_map(|helper| find_on_path(helper))
        .map(|_| ())
        .ok_or(FuseCheckError::MountHelperMissing)
}
