use std::io::ErrorKind;

use thiserror::Error;

/// Failure classes reported by the file system.
///
/// Every fallible call returns an `anyhow::Error`; when the failure belongs to one
/// of these classes the code sits somewhere in the error chain and can be
/// recovered with [`ErrorCode::of`].
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    #[error("unknown error")]
    OtherError,
    #[error("out of memory")]
    OutOfMemory,
    #[error("not initialized")]
    NotInitialized,
    #[error("already initialized")]
    IsInitialized,
    #[error("argv[0] is NULL")]
    Argv0IsNull,
    #[error("unsupported")]
    Unsupported,
    #[error("past end of file")]
    PastEof,
    #[error("files still open")]
    FilesStillOpen,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not mounted")]
    NotMounted,
    #[error("not found")]
    NotFound,
    #[error("symlinks are forbidden")]
    SymlinkForbidden,
    #[error("write directory is not set")]
    NoWriteDir,
    #[error("file open for reading")]
    OpenForReading,
    #[error("file open for writing")]
    OpenForWriting,
    #[error("not a file")]
    NotAFile,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("corrupted")]
    Corrupt,
    #[error("infinite symbolic link loop")]
    SymlinkLoop,
    #[error("i/o error")]
    Io,
    #[error("permission denied")]
    Permission,
    #[error("no space available for writing")]
    NoSpace,
    #[error("filename is illegal or insecure")]
    BadFilename,
    #[error("tried to modify a file the OS needs")]
    Busy,
    #[error("directory isn't empty")]
    DirNotEmpty,
    #[error("OS reported an error")]
    OsError,
    #[error("duplicate resource")]
    Duplicate,
}

impl ErrorCode {
    /// Finds the failure class of `err`.
    ///
    /// The outermost `ErrorCode`, attached as error or as context, wins; otherwise
    /// the first `std::io::Error` in the chain is classified by its kind. Anything
    /// else is [`ErrorCode::OtherError`].
    pub fn of(err: &anyhow::Error) -> ErrorCode {
        if let Some(code) = err.downcast_ref::<ErrorCode>() {
            return *code;
        }
        for cause in err.chain() {
            if let Some(code) = cause.downcast_ref::<ErrorCode>() {
                return *code;
            }
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                return Self::from_io_kind(io.kind());
            }
        }
        ErrorCode::OtherError
    }

    /// Returns true if `err` is classified as `self`.
    pub fn matches(self, err: &anyhow::Error) -> bool {
        Self::of(err) == self
    }

    pub fn from_io_kind(kind: ErrorKind) -> ErrorCode {
        match kind {
            ErrorKind::NotFound | ErrorKind::NotADirectory => ErrorCode::NotFound,
            ErrorKind::PermissionDenied => ErrorCode::Permission,
            ErrorKind::AlreadyExists => ErrorCode::Duplicate,
            ErrorKind::DirectoryNotEmpty => ErrorCode::DirNotEmpty,
            ErrorKind::IsADirectory => ErrorCode::NotAFile,
            ErrorKind::ReadOnlyFilesystem => ErrorCode::ReadOnly,
            ErrorKind::StorageFull => ErrorCode::NoSpace,
            ErrorKind::ResourceBusy => ErrorCode::Busy,
            ErrorKind::UnexpectedEof => ErrorCode::PastEof,
            ErrorKind::InvalidInput => ErrorCode::InvalidArgument,
            ErrorKind::InvalidData => ErrorCode::Corrupt,
            ErrorKind::OutOfMemory => ErrorCode::OutOfMemory,
            ErrorKind::Unsupported => ErrorCode::Unsupported,
            _ => ErrorCode::Io,
        }
    }
}
