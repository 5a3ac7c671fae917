//! Error classification and errno mapping.
//!
//! Every failure the client reports is first classified into an
//! [`ErrorCategory`]; the category owns the single mapping to POSIX errno
//! values handed to the kernel binding. Categories also carry the coarse
//! [`ErrorClass`] that decides propagation: deterministic outcomes go
//! straight back to the caller, remote unavailability is retried on
//! background paths, stale caches trigger invalidation.

use leasefs_core::RemoteError;
use std::io;

/// Coarse class deciding how an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Entry absent or confirmed deleted.
    NotFound,
    /// Capability denies the required access.
    Permission,
    /// Volume or inode quota exhausted.
    Quota,
    /// Write would exceed the maximum file size.
    SizeLimit,
    /// Name taken, type mismatch, or a racing create/delete.
    Conflict,
    /// Transient network or service failure.
    RemoteUnavailable,
    /// Cookie or generation mismatch.
    StaleCache,
    /// Malformed request or unusable handle.
    Usage,
}

impl ErrorClass {
    /// True for outcomes that are returned to the caller unchanged.
    pub fn is_deterministic(self) -> bool {
        !matches!(self, Self::RemoteUnavailable | Self::StaleCache)
    }
}

/// Semantic category of a client error.
///
/// # Example
///
/// ```
/// use leasefs_common::ErrorCategory;
/// use leasefs_core::RemoteError;
///
/// let category = ErrorCategory::from(&RemoteError::QuotaExceeded);
/// assert_eq!(category, ErrorCategory::QuotaExceeded);
/// assert_eq!(category.to_errno(), libc::EDQUOT);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// ENOENT
    NotFound,
    /// EEXIST
    AlreadyExists,
    /// EACCES
    PermissionDenied,
    /// EPERM
    NotPermitted,
    /// EDQUOT
    QuotaExceeded,
    /// EFBIG
    FileTooLarge,
    /// ENOTEMPTY
    NotEmpty,
    /// ENOTDIR
    NotDirectory,
    /// EISDIR
    IsDirectory,
    /// EXDEV
    CrossDevice,
    /// ENODATA
    NoData,
    /// EAGAIN
    WouldBlock,
    /// EINVAL
    InvalidArgument,
    /// ENAMETOOLONG
    NameTooLong,
    /// EBADF
    BadHandle,
    /// ENXIO
    NoDevice,
    /// EOPNOTSUPP
    NotSupported,
    /// EIO after a stale generation could not be refreshed.
    Stale,
    /// EIO
    Io,
}

impl ErrorCategory {
    /// Converts this category to a POSIX errno value.
    pub fn to_errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::PermissionDenied => libc::EACCES,
            Self::NotPermitted => libc::EPERM,
            Self::QuotaExceeded => libc::EDQUOT,
            Self::FileTooLarge => libc::EFBIG,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::CrossDevice => libc::EXDEV,
            Self::NoData => libc::ENODATA,
            Self::WouldBlock => libc::EAGAIN,
            Self::InvalidArgument => libc::EINVAL,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::BadHandle => libc::EBADF,
            Self::NoDevice => libc::ENXIO,
            Self::NotSupported => libc::EOPNOTSUPP,
            Self::Stale | Self::Io => libc::EIO,
        }
    }

    /// The propagation class of this category.
    pub fn class(self) -> ErrorClass {
        match self {
            Self::NotFound => ErrorClass::NotFound,
            Self::PermissionDenied | Self::NotPermitted => ErrorClass::Permission,
            Self::QuotaExceeded => ErrorClass::Quota,
            Self::FileTooLarge => ErrorClass::SizeLimit,
            Self::AlreadyExists
            | Self::NotEmpty
            | Self::NotDirectory
            | Self::IsDirectory
            | Self::CrossDevice
            | Self::WouldBlock => ErrorClass::Conflict,
            Self::Io => ErrorClass::RemoteUnavailable,
            Self::Stale => ErrorClass::StaleCache,
            Self::NoData
            | Self::InvalidArgument
            | Self::NameTooLong
            | Self::BadHandle
            | Self::NoDevice
            | Self::NotSupported => ErrorClass::Usage,
        }
    }

    /// Short name for logs and statistics.
    pub fn name(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::NotPermitted => "not_permitted",
            Self::QuotaExceeded => "quota_exceeded",
            Self::FileTooLarge => "file_too_large",
            Self::NotEmpty => "not_empty",
            Self::NotDirectory => "not_directory",
            Self::IsDirectory => "is_directory",
            Self::CrossDevice => "cross_device",
            Self::NoData => "no_data",
            Self::WouldBlock => "would_block",
            Self::InvalidArgument => "invalid_argument",
            Self::NameTooLong => "name_too_long",
            Self::BadHandle => "bad_handle",
            Self::NoDevice => "no_device",
            Self::NotSupported => "not_supported",
            Self::Stale => "stale",
            Self::Io => "io",
        }
    }
}

impl From<&RemoteError> for ErrorCategory {
    fn from(e: &RemoteError) -> Self {
        match e {
            RemoteError::NotFound => Self::NotFound,
            RemoteError::AlreadyExists => Self::AlreadyExists,
            RemoteError::PermissionDenied => Self::PermissionDenied,
            RemoteError::NotPermitted => Self::NotPermitted,
            RemoteError::QuotaExceeded => Self::QuotaExceeded,
            RemoteError::NotEmpty => Self::NotEmpty,
            RemoteError::NotADirectory => Self::NotDirectory,
            RemoteError::IsADirectory => Self::IsDirectory,
            RemoteError::LockConflict => Self::WouldBlock,
            RemoteError::Stale { .. } => Self::Stale,
            RemoteError::Unavailable(_) => Self::Io,
            RemoteError::Invalid(_) => Self::InvalidArgument,
        }
    }
}

/// Classifies a `std::io::Error`, preferring its raw OS code.
fn io_error_category(e: &io::Error) -> ErrorCategory {
    if let Some(code) = e.raw_os_error() {
        return match code {
            libc::ENOENT => ErrorCategory::NotFound,
            libc::EEXIST => ErrorCategory::AlreadyExists,
            libc::EACCES => ErrorCategory::PermissionDenied,
            libc::EPERM => ErrorCategory::NotPermitted,
            libc::EDQUOT => ErrorCategory::QuotaExceeded,
            libc::EFBIG => ErrorCategory::FileTooLarge,
            libc::ENOTEMPTY => ErrorCategory::NotEmpty,
            libc::ENOTDIR => ErrorCategory::NotDirectory,
            libc::EISDIR => ErrorCategory::IsDirectory,
            libc::EXDEV => ErrorCategory::CrossDevice,
            libc::EINVAL => ErrorCategory::InvalidArgument,
            libc::ENAMETOOLONG => ErrorCategory::NameTooLong,
            libc::EBADF => ErrorCategory::BadHandle,
            _ => ErrorCategory::Io,
        };
    }
    match e.kind() {
        io::ErrorKind::NotFound => ErrorCategory::NotFound,
        io::ErrorKind::AlreadyExists => ErrorCategory::AlreadyExists,
        io::ErrorKind::PermissionDenied => ErrorCategory::PermissionDenied,
        io::ErrorKind::InvalidInput => ErrorCategory::InvalidArgument,
        io::ErrorKind::WouldBlock => ErrorCategory::WouldBlock,
        io::ErrorKind::Unsupported => ErrorCategory::NotSupported,
        _ => ErrorCategory::Io,
    }
}

/// Converts a `std::io::Error` to an errno value.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error()
        .unwrap_or_else(|| io_error_category(e).to_errno())
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasefs_core::Cookie;

    #[test]
    fn test_remote_errors_map_to_errno() {
        let cases = [
            (RemoteError::NotFound, libc::ENOENT),
            (RemoteError::AlreadyExists, libc::EEXIST),
            (RemoteError::PermissionDenied, libc::EACCES),
            (RemoteError::NotPermitted, libc::EPERM),
            (RemoteError::QuotaExceeded, libc::EDQUOT),
            (RemoteError::NotEmpty, libc::ENOTEMPTY),
            (RemoteError::NotADirectory, libc::ENOTDIR),
            (RemoteError::IsADirectory, libc::EISDIR),
            (RemoteError::LockConflict, libc::EAGAIN),
            (RemoteError::Unavailable("down".into()), libc::EIO),
            (RemoteError::Invalid("bad".into()), libc::EINVAL),
        ];
        for (err, errno) in cases {
            assert_eq!(ErrorCategory::from(&err).to_errno(), errno, "{err}");
        }
    }

    #[test]
    fn test_stale_is_not_deterministic() {
        let stale = RemoteError::Stale {
            expected: Cookie::new(1),
            found: Cookie::new(2),
        };
        let category = ErrorCategory::from(&stale);
        assert_eq!(category.class(), ErrorClass::StaleCache);
        assert!(!category.class().is_deterministic());
        assert_eq!(category.to_errno(), libc::EIO);
    }

    #[test]
    fn test_taxonomy_classes() {
        assert_eq!(ErrorCategory::QuotaExceeded.class(), ErrorClass::Quota);
        assert_eq!(ErrorCategory::FileTooLarge.class(), ErrorClass::SizeLimit);
        assert_eq!(ErrorCategory::AlreadyExists.class(), ErrorClass::Conflict);
        assert_eq!(ErrorCategory::Io.class(), ErrorClass::RemoteUnavailable);
        assert!(ErrorCategory::NotFound.class().is_deterministic());
    }

    #[test]
    fn test_io_error_mapping() {
        let raw = io::Error::from_raw_os_error(libc::ENOTEMPTY);
        assert_eq!(io_error_category(&raw), ErrorCategory::NotEmpty);
        assert_eq!(io_error_to_errno(&raw), libc::ENOTEMPTY);

        let kind = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(io_error_to_errno(&kind), libc::EACCES);

        let other = io::Error::other("boom");
        assert_eq!(io_error_to_errno(&other), libc::EIO);
    }

    #[test]
    fn test_category_names_are_unique() {
        let all = [
            ErrorCategory::NotFound,
            ErrorCategory::AlreadyExists,
            ErrorCategory::PermissionDenied,
            ErrorCategory::NotPermitted,
            ErrorCategory::QuotaExceeded,
            ErrorCategory::FileTooLarge,
            ErrorCategory::NotEmpty,
            ErrorCategory::NotDirectory,
            ErrorCategory::IsDirectory,
            ErrorCategory::CrossDevice,
            ErrorCategory::NoData,
            ErrorCategory::WouldBlock,
            ErrorCategory::InvalidArgument,
            ErrorCategory::NameTooLong,
            ErrorCategory::BadHandle,
            ErrorCategory::NoDevice,
            ErrorCategory::NotSupported,
            ErrorCategory::Stale,
            ErrorCategory::Io,
        ];
        let names: std::collections::HashSet<_> = all.iter().map(|c| c.name()).collect();
        assert_eq!(names.len(), all.len());
    }
}
