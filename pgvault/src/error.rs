//! Engine error taxonomy. Callers branch on [`ErrorKind`]; workflow stages
//! attach their stage name so the supervisor can report where a chain
//! failed before unwinding teardown.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigInvalid,
    AuthFailed,
    Timeout,
    NetworkIo,
    Tls,
    ProtocolViolation,
    CorruptWal,
    UnknownRmgr,
    IncompatibleVersion,
    DiskIo,
    ChecksumMismatch,
    NotFound,
    AlreadyExists,
    ActiveConflict,
    ChainBroken,
    NoSpace,
    RemoteRejected,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Numeric category used as the process exit code for failed requests.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::ConfigInvalid => 1,
            ErrorKind::AuthFailed => 2,
            ErrorKind::Timeout => 3,
            ErrorKind::NetworkIo => 4,
            ErrorKind::Tls => 5,
            ErrorKind::ProtocolViolation => 6,
            ErrorKind::CorruptWal => 7,
            ErrorKind::UnknownRmgr => 8,
            ErrorKind::IncompatibleVersion => 9,
            ErrorKind::DiskIo => 10,
            ErrorKind::ChecksumMismatch => 11,
            ErrorKind::NotFound => 12,
            ErrorKind::AlreadyExists => 13,
            ErrorKind::ActiveConflict => 14,
            ErrorKind::ChainBroken => 15,
            ErrorKind::NoSpace => 16,
            ErrorKind::RemoteRejected => 17,
            ErrorKind::Cancelled => 18,
            ErrorKind::Internal => 19,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NetworkIo => "network_io",
            ErrorKind::Tls => "tls",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::CorruptWal => "corrupt_wal",
            ErrorKind::UnknownRmgr => "unknown_rmgr",
            ErrorKind::IncompatibleVersion => "incompatible_version",
            ErrorKind::DiskIo => "disk_io",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::ActiveConflict => "active_conflict",
            ErrorKind::ChainBroken => "chain_broken",
            ErrorKind::NoSpace => "no_space",
            ErrorKind::RemoteRejected => "remote_rejected",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Error {
        Error {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ if e.raw_os_error() == Some(nix::libc::ENOSPC) => ErrorKind::NoSpace,
            _ => ErrorKind::DiskIo,
        };
        Error::with_source(kind, "I/O error", e)
    }
}

impl From<pq_proto::framed::ConnectionError> for Error {
    fn from(e: pq_proto::framed::ConnectionError) -> Error {
        use pq_proto::framed::ConnectionError;
        match &e {
            ConnectionError::Timeout => Error::with_source(ErrorKind::Timeout, "server reply timed out", e),
            ConnectionError::Eof => Error::with_source(ErrorKind::NetworkIo, "connection closed", e),
            ConnectionError::Io(_) => Error::with_source(ErrorKind::NetworkIo, "socket error", e),
            ConnectionError::Protocol(_) => {
                Error::with_source(ErrorKind::ProtocolViolation, "protocol error", e)
            }
        }
    }
}

impl From<postgres_wal::WalDecodeError> for Error {
    fn from(e: postgres_wal::WalDecodeError) -> Error {
        use postgres_wal::WalDecodeError;
        let kind = match &e {
            WalDecodeError::UnknownRmgr { .. } | WalDecodeError::UnknownRecordType { .. } => {
                ErrorKind::UnknownRmgr
            }
            _ => ErrorKind::CorruptWal,
        };
        Error::with_source(kind, "WAL decode failed", e)
    }
}

impl From<remote_storage::RemoteStorageError> for Error {
    fn from(e: remote_storage::RemoteStorageError) -> Error {
        use remote_storage::RemoteStorageError;
        let kind = match &e {
            RemoteStorageError::Rejected(_) => ErrorKind::RemoteRejected,
            RemoteStorageError::Network(_) => ErrorKind::NetworkIo,
            RemoteStorageError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            RemoteStorageError::Cancelled => ErrorKind::Cancelled,
            RemoteStorageError::Io(_) => ErrorKind::DiskIo,
        };
        Error::with_source(kind, "remote storage failed", e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A workflow stage failure: the kind plus which stage it came from.
#[derive(Debug, thiserror::Error)]
#[error("stage {stage}: {error}")]
pub struct StageError {
    pub stage: &'static str,
    #[source]
    pub error: Error,
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind
    }
}
