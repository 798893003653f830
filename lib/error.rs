//! Error taxonomy shared by the resolver, the adapter and the FUSE front-end.

use thiserror::Error;

use crate::tiering::RecoveryError;

/// Failure of a filesystem call against the fast tier.
///
/// Every variant maps onto a POSIX error code through `From<TierError> for i32`, which is what
/// the FUSE front-end replies with.
#[derive(Debug, Error)]
pub enum TierError {
    /// `EACCES`. `EPERM` is kept apart and passed through as [`TierError::Io`].
    #[error("permission denied")]
    PermissionDenied,

    /// `ENOENT`.
    #[error("no such file or directory")]
    NotFound,

    /// `EEXIST`.
    #[error("file exists")]
    AlreadyExists,

    /// `ENOTDIR`.
    #[error("not a directory")]
    NotADirectory,

    /// The persisted tiering queue could not be restored. Replied as `EIO`.
    #[error("tiering queue recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    /// Any other failure. Replied with its raw errno, `EIO` if it has none.
    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for TierError {
    #[expect(
        clippy::wildcard_enum_match_arm,
        reason = "ErrorKind is non_exhaustive; everything else is passed through"
    )]
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::EACCES) => return Self::PermissionDenied,
            Some(libc::ENOENT) => return Self::NotFound,
            Some(libc::EEXIST) => return Self::AlreadyExists,
            Some(libc::ENOTDIR) => return Self::NotADirectory,
            Some(_) => return Self::Io(e),
            None => {}
        }

        match e.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            std::io::ErrorKind::NotADirectory => Self::NotADirectory,
            _ => Self::Io(e),
        }
    }
}

impl From<nix::errno::Errno> for TierError {
    fn from(errno: nix::errno::Errno) -> Self {
        std::io::Error::from(errno).into()
    }
}

impl From<TierError> for i32 {
    fn from(e: TierError) -> Self {
        match e {
            TierError::PermissionDenied => libc::EACCES,
            TierError::NotFound => libc::ENOENT,
            TierError::AlreadyExists => libc::EEXIST,
            TierError::NotADirectory => libc::ENOTDIR,
            TierError::Recovery(_) => libc::EIO,
            TierError::Io(ref io_err) => io_err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_os_errors_are_classified() {
        let cases = [
            (libc::EACCES, libc::EACCES),
            (libc::EPERM, libc::EPERM),
            (libc::ENOENT, libc::ENOENT),
            (libc::EEXIST, libc::EEXIST),
            (libc::ENOTDIR, libc::ENOTDIR),
            (libc::ENOSPC, libc::ENOSPC),
        ];
        for (raw, expected) in cases {
            let err = TierError::from(std::io::Error::from_raw_os_error(raw));
            assert_eq!(i32::from(err), expected, "errno {raw} mapped wrongly");
        }
    }

    #[test]
    fn kind_only_errors_fall_back_to_eio() {
        let err = TierError::from(std::io::Error::other("opaque"));
        assert!(matches!(err, TierError::Io(_)));
        assert_eq!(i32::from(err), libc::EIO);
    }

    #[test]
    fn errno_converts_through_io_error() {
        let err = TierError::from(nix::errno::Errno::ENOENT);
        assert!(matches!(err, TierError::NotFound));
    }
}
