use thiserror::Error;

/// Result type used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Win32 error codes the library gives special meaning to.
pub mod os_code {
    pub const FILE_NOT_FOUND: u32 = 2;
    pub const PATH_NOT_FOUND: u32 = 3;
    pub const ACCESS_DENIED: u32 = 5;
    pub const INVALID_DRIVE: u32 = 15;
    pub const BAD_LENGTH: u32 = 24;
    pub const INVALID_PARAMETER: u32 = 87;
    pub const FILENAME_EXCED_RANGE: u32 = 206;
    pub const MORE_DATA: u32 = 234;
    pub const ABANDONED_WAIT_0: u32 = 735;
    pub const OPERATION_ABORTED: u32 = 995;
    pub const NOT_ENOUGH_QUOTA: u32 = 1816;
}

/// Classification of an OS call failure. The original error code is kept
/// alongside the kind for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsErrorKind {
    FileNotFound,
    PathNotFound,
    AccessDenied,
    PathTooLong,
    DriveNotFound,
    OperationAborted,
    Other,
}

impl std::fmt::Display for OsErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            OsErrorKind::FileNotFound => "file not found",
            OsErrorKind::PathNotFound => "path not found",
            OsErrorKind::AccessDenied => "access denied",
            OsErrorKind::PathTooLong => "path too long",
            OsErrorKind::DriveNotFound => "drive not found",
            OsErrorKind::OperationAborted => "operation aborted",
            OsErrorKind::Other => "os call failed",
        };
        f.write_str(text)
    }
}

/// Error type shared by the workspace.
///
/// Validation and state errors are always raised before any OS call is made;
/// OS failures carry the original Win32 code.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} (os error {code})")]
    Os { code: u32, kind: OsErrorKind },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{field} is out of range")]
    OutOfRange { field: &'static str },

    #[error("completion key is zero or reserved")]
    InvalidCompletionKey,

    #[error("completion key is already registered")]
    DuplicateCompletionKey,

    #[error("standard {0} is already being read in {1} mode")]
    StreamModeConflict(&'static str, &'static str),

    #[error("standard {0} was not redirected")]
    StreamNotRedirected(&'static str),

    #[error("standard {0} has already been taken")]
    StreamTaken(&'static str),

    #[error("active process limit for the job has been reached")]
    ProcessLimitReached,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps a raw Win32 error code onto the taxonomy.
    pub fn from_os_code(code: u32) -> Error {
        let kind = match code {
            os_code::FILE_NOT_FOUND => OsErrorKind::FileNotFound,
            os_code::PATH_NOT_FOUND => OsErrorKind::PathNotFound,
            os_code::ACCESS_DENIED => OsErrorKind::AccessDenied,
            os_code::FILENAME_EXCED_RANGE => OsErrorKind::PathTooLong,
            os_code::INVALID_DRIVE => OsErrorKind::DriveNotFound,
            os_code::OPERATION_ABORTED => OsErrorKind::OperationAborted,
            _ => OsErrorKind::Other,
        };
        Error::Os { code, kind }
    }

    /// The original Win32 code, if this error came from an OS call.
    pub fn os_code(&self) -> Option<u32> {
        match self {
            Error::Os { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for errors the caller produced (contradictory or out-of-range
    /// configuration) rather than the OS.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_) | Error::OutOfRange { .. }
        )
    }
}
