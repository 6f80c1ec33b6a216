//! The handler's error taxonomy and its translation to kernel errno values.

/// Every way a filesystem operation can fail.
///
/// Each variant maps to exactly one kernel errno (see [`Error::errno`]); the
/// dispatcher in [`crate::handler`] is the only place that performs that
/// translation before replying to the kernel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such file or directory")]
    NoEntry,
    #[error("directory not empty")]
    NotEmpty,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such extended attribute")]
    NoData,
    #[error("no such attribute")]
    NoAttr,
    #[error("not a directory")]
    NotDirectory,
    #[error("operation not supported")]
    Unsupported,
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    /// The kernel errno this error is reported as.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Self::NoEntry => libc::ENOENT,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::InvalidArgument => libc::EINVAL,
            Self::NoData | Self::NoAttr => libc::ENODATA,
            Self::NotDirectory => libc::ENOTDIR,
            Self::Unsupported => libc::ENOSYS,
            Self::Internal(_) => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
