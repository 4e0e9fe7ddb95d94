//! Shared error type for the OSAL core.
//!
//! The original layer returns negative `int32` codes from every API. Rust
//! code returns `Result<T, OsalError>` instead; [`OsalError::raw_code`]
//! reproduces the original numeric value for callers that need to bridge to
//! a C-style facade.

use thiserror::Error;

pub type OsalResult<T> = Result<T, OsalError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum OsalError {
    #[error("path exceeds the maximum path length")]
    PathTooLong,

    #[error("name exceeds the maximum name length")]
    NameTooLong,

    #[error("name is already in use within this object kind")]
    NameTaken,

    #[error("no object with that name is registered")]
    NameNotFound,

    #[error("a required pointer/reference argument was null or invalid")]
    InvalidPointer,

    #[error("the supplied object id is stale or does not refer to a live object")]
    InvalidId,

    #[error("no free ids remain in this object kind's table")]
    NoFreeIds,

    #[error("semaphore operation failed")]
    SemFailure,

    #[error("semaphore wait timed out")]
    SemTimeout,

    #[error("queue is full")]
    QueueFull,

    #[error("queue is empty")]
    QueueEmpty,

    #[error("queue operation timed out")]
    QueueTimeout,

    #[error("queue size or depth is out of the permitted range")]
    QueueInvalidSize,

    #[error("path exceeds the maximum filesystem path length")]
    FsErrPathTooLong,

    #[error("name exceeds the maximum filesystem name length")]
    FsErrNameTooLong,

    #[error("the filesystem/volume has not been created")]
    FsErrDriveNotCreated,

    #[error("the underlying device is already in use")]
    FsErrDeviceNotFree,

    #[error("the path does not resolve to any mounted volume")]
    FsErrPathInvalid,

    #[error("operation is not implemented")]
    ErrNotImplemented,

    #[error("operation is not supported by this backend")]
    ErrOperationNotSupported,

    #[error("object is not in the state required for this operation")]
    IncorrectObjState,

    #[error("output would exceed the caller-supplied buffer")]
    ErrOutputTooLarge,

    #[error("a supplied size argument is invalid")]
    ErrInvalidSize,

    #[error("a supplied address/range is invalid")]
    ErrBadAddress,

    #[error("generic I/O error: {0}")]
    Io(String),
}

impl OsalError {
    /// Mirrors the original layer's signed integer error codes, for the
    /// handful of errors whose numeric value the spec actually pins down.
    /// Everything else only ever needs to compare `!= SUCCESS` on the C
    /// side, so no stable number is promised for it.
    pub const fn raw_code(self) -> i32 {
        match self {
            OsalError::FsErrPathTooLong => -103,
            OsalError::FsErrNameTooLong => -104,
            OsalError::FsErrDriveNotCreated => -106,
            OsalError::FsErrDeviceNotFree => -107,
            OsalError::FsErrPathInvalid => -108,
            _ => -1,
        }
    }
}

impl From<std::io::Error> for OsalError {
    fn from(err: std::io::Error) -> Self {
        OsalError::Io(err.to_string())
    }
}

/// Bug-assertion policy, consulted by the [`bugcheck`] macro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BugCheckPolicy {
    /// Bug checks are compiled out entirely; the guarded condition is never
    /// evaluated for its assertion effect.
    Disabled,
    /// Violations are logged via `tracing` and the indicated error is
    /// returned to the caller; the process keeps running.
    #[default]
    Permissive,
    /// Violations abort the process after printing, matching a strict
    /// flight-software build.
    Strict,
}

/// Checks `cond`; on failure, behaves per `policy` and otherwise yields
/// `err`. Threaded through as a function (rather than a macro needing
/// `file!()`/`line!()` plumbing) since every call site already has a
/// `tracing` span identifying the module.
pub fn bugcheck(cond: bool, policy: BugCheckPolicy, err: OsalError) -> OsalResult<()> {
    if cond {
        return Ok(());
    }

    match policy {
        BugCheckPolicy::Disabled => Ok(()),
        BugCheckPolicy::Permissive => {
            tracing::error!(error = ?err, "OSAL bug-check failed");
            Err(err)
        }
        BugCheckPolicy::Strict => {
            panic!("OSAL bug-check failed: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_match_spec() {
        assert_eq!(OsalError::FsErrPathTooLong.raw_code(), -103);
        assert_eq!(OsalError::FsErrNameTooLong.raw_code(), -104);
        assert_eq!(OsalError::FsErrDriveNotCreated.raw_code(), -106);
        assert_eq!(OsalError::FsErrDeviceNotFree.raw_code(), -107);
        assert_eq!(OsalError::FsErrPathInvalid.raw_code(), -108);
    }

    #[test]
    fn bugcheck_disabled_never_fails() {
        assert!(bugcheck(false, BugCheckPolicy::Disabled, OsalError::InvalidId).is_ok());
    }

    #[test]
    fn bugcheck_permissive_returns_error() {
        assert_eq!(
            bugcheck(false, BugCheckPolicy::Permissive, OsalError::InvalidId),
            Err(OsalError::InvalidId)
        );
    }
}
