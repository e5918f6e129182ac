//! Error taxonomy and translation of raw SFTP/SSH failures.
//!
//! Every failure that crosses the transport seam arrives either as an
//! [`SftpFailure`] (a status reply from the SFTP server) or as a
//! [`TransportError`] (the SSH connection itself failed). [`translate`] turns
//! the former into a [`ProviderError`] carrying the operation, the paths
//! involved and the server's own description of the problem.

use std::fmt;

use thiserror::Error;

use crate::types::{AuthMethod, RemotePath};

/// SFTP status codes as sent on the wire.
///
/// SFTP v3 defines codes 0 to 8; later drafts add the rest. Servers speaking
/// v3 may still send the higher values, so they are all decoded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    NoConnection,
    ConnectionLost,
    OpUnsupported,
    InvalidHandle,
    NoSuchPath,
    FileAlreadyExists,
    WriteProtect,
    NoMedia,
    DirNotEmpty,
    NotADirectory,
    FileIsADirectory,
    Other(u32),
}

impl StatusCode {
    pub fn code(self) -> u32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Eof => 1,
            StatusCode::NoSuchFile => 2,
            StatusCode::PermissionDenied => 3,
            StatusCode::Failure => 4,
            StatusCode::BadMessage => 5,
            StatusCode::NoConnection => 6,
            StatusCode::ConnectionLost => 7,
            StatusCode::OpUnsupported => 8,
            StatusCode::InvalidHandle => 9,
            StatusCode::NoSuchPath => 10,
            StatusCode::FileAlreadyExists => 11,
            StatusCode::WriteProtect => 12,
            StatusCode::NoMedia => 13,
            StatusCode::DirNotEmpty => 18,
            StatusCode::NotADirectory => 19,
            StatusCode::FileIsADirectory => 24,
            StatusCode::Other(code) => code,
        }
    }
}

impl From<u32> for StatusCode {
    fn from(code: u32) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::Eof,
            2 => StatusCode::NoSuchFile,
            3 => StatusCode::PermissionDenied,
            4 => StatusCode::Failure,
            5 => StatusCode::BadMessage,
            6 => StatusCode::NoConnection,
            7 => StatusCode::ConnectionLost,
            8 => StatusCode::OpUnsupported,
            9 => StatusCode::InvalidHandle,
            10 => StatusCode::NoSuchPath,
            11 => StatusCode::FileAlreadyExists,
            12 => StatusCode::WriteProtect,
            13 => StatusCode::NoMedia,
            18 => StatusCode::DirNotEmpty,
            19 => StatusCode::NotADirectory,
            24 => StatusCode::FileIsADirectory,
            other => StatusCode::Other(other),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusCode::Ok => "ok",
            StatusCode::Eof => "end of file",
            StatusCode::NoSuchFile => "no such file",
            StatusCode::PermissionDenied => "permission denied",
            StatusCode::Failure => "failure",
            StatusCode::BadMessage => "bad message",
            StatusCode::NoConnection => "no connection",
            StatusCode::ConnectionLost => "connection lost",
            StatusCode::OpUnsupported => "operation unsupported",
            StatusCode::InvalidHandle => "invalid handle",
            StatusCode::NoSuchPath => "no such path",
            StatusCode::FileAlreadyExists => "file already exists",
            StatusCode::WriteProtect => "write protected",
            StatusCode::NoMedia => "no media",
            StatusCode::DirNotEmpty => "directory not empty",
            StatusCode::NotADirectory => "not a directory",
            StatusCode::FileIsADirectory => "file is a directory",
            StatusCode::Other(code) => return write!(f, "status {code}"),
        };
        f.write_str(text)
    }
}

/// A status reply from the SFTP server, or a channel failure reported as one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct SftpFailure {
    pub code: StatusCode,
    pub message: String,
}

impl SftpFailure {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The channel under the SFTP session went away.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ConnectionLost, message)
    }
}

/// Failure of the SSH transport itself (resolve, handshake, channel open).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The file-system intent that was being carried out when a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    List,
    Fetch,
    Read,
    Rename,
    Delete,
    DeleteDirectory,
    CreateFile,
    CreateDirectory,
    Stat,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Connect => "connect",
            Operation::List => "list",
            Operation::Fetch => "open",
            Operation::Read => "read",
            Operation::Rename => "rename",
            Operation::Delete => "delete",
            Operation::DeleteDirectory => "delete directory",
            Operation::CreateFile => "create file",
            Operation::CreateDirectory => "create directory",
            Operation::Stat => "stat",
        })
    }
}

/// Why a path could not be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    NoSuchPath,
    NotADirectory,
}

/// Fieldless mirror of [`ProviderError`] for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotInitialized,
    Connection,
    Trust,
    Authentication,
    NotFound,
    AlreadyExists,
    DirectoryNotEmpty,
    Permission,
    UserCancelled,
    DataLossRisk,
    PartialDelete,
    Protocol,
}

/// One path a recursive delete could not remove, and why.
#[derive(Debug, Clone)]
pub struct DeleteFailure {
    pub path: RemotePath,
    pub cause: ProviderError,
}

impl fmt::Display for DeleteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.cause)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("provider has not been initialized with a host and user")]
    NotInitialized,

    #[error("connection to {host}:{port} failed: {message}")]
    Connection {
        host: String,
        port: u16,
        message: String,
    },

    #[error("host key {fingerprint} for {host}:{port} was not trusted")]
    Trust {
        host: String,
        port: u16,
        fingerprint: String,
    },

    #[error("authentication of '{user}' on {host} failed (tried: {})", format_methods(.tried))]
    Authentication {
        user: String,
        host: String,
        tried: Vec<AuthMethod>,
    },

    #[error("cannot {operation} '{path}': {}", not_found_text(.reason, .message))]
    NotFound {
        operation: Operation,
        path: RemotePath,
        reason: NotFoundReason,
        message: String,
    },

    #[error("cannot {operation} '{path}': already exists{}", suffix(.message))]
    AlreadyExists {
        operation: Operation,
        path: RemotePath,
        message: String,
    },

    #[error("cannot delete directory '{path}': directory is not empty{}", suffix(.message))]
    DirectoryNotEmpty { path: RemotePath, message: String },

    #[error("cannot {operation} {}: permission denied{}", format_paths(.paths), suffix(.message))]
    Permission {
        operation: Operation,
        paths: Vec<RemotePath>,
        message: String,
    },

    #[error("{operation} of '{path}' was cancelled by the user")]
    UserCancelled { operation: Operation, path: RemotePath },

    #[error(
        "renaming '{from}' to '{to}' failed and the original target could not be restored; \
         it is preserved as '{temporary}' ({cause})"
    )]
    DataLossRisk {
        from: RemotePath,
        to: RemotePath,
        temporary: RemotePath,
        cause: Box<ProviderError>,
    },

    #[error("could not delete '{root}': {} path(s) failed, first: {}", .failures.len(), first_failure(.failures))]
    PartialDelete {
        root: RemotePath,
        failures: Vec<DeleteFailure>,
    },

    #[error("cannot {operation} {}: {code} (code {}){}", format_paths(.paths), .code.code(), suffix(.message))]
    Protocol {
        operation: Operation,
        paths: Vec<RemotePath>,
        code: StatusCode,
        message: String,
    },
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            ProviderError::NotInitialized => ErrorKind::NotInitialized,
            ProviderError::Connection { .. } => ErrorKind::Connection,
            ProviderError::Trust { .. } => ErrorKind::Trust,
            ProviderError::Authentication { .. } => ErrorKind::Authentication,
            ProviderError::NotFound { .. } => ErrorKind::NotFound,
            ProviderError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            ProviderError::DirectoryNotEmpty { .. } => ErrorKind::DirectoryNotEmpty,
            ProviderError::Permission { .. } => ErrorKind::Permission,
            ProviderError::UserCancelled { .. } => ErrorKind::UserCancelled,
            ProviderError::DataLossRisk { .. } => ErrorKind::DataLossRisk,
            ProviderError::PartialDelete { .. } => ErrorKind::PartialDelete,
            ProviderError::Protocol { .. } => ErrorKind::Protocol,
        }
    }

    /// Raw SFTP status code, for errors that came from a status reply.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            ProviderError::NotFound { reason, .. } => Some(match reason {
                NotFoundReason::NoSuchPath => StatusCode::NoSuchFile,
                NotFoundReason::NotADirectory => StatusCode::NotADirectory,
            }),
            ProviderError::AlreadyExists { .. } => Some(StatusCode::FileAlreadyExists),
            ProviderError::DirectoryNotEmpty { .. } => Some(StatusCode::DirNotEmpty),
            ProviderError::Permission { .. } => Some(StatusCode::PermissionDenied),
            ProviderError::Protocol { code, .. } => Some(*code),
            ProviderError::DataLossRisk { cause, .. } => cause.status_code(),
            _ => None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ProviderError::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn connection(host: &str, port: u16, message: impl fmt::Display) -> Self {
        ProviderError::Connection {
            host: host.to_string(),
            port,
            message: message.to_string(),
        }
    }

    /// Fills in the endpoint of a connection error raised below the session
    /// layer, where the host is not known.
    pub(crate) fn with_endpoint(self, host: &str, port: u16) -> Self {
        match self {
            ProviderError::Connection {
                host: h, message, ..
            } if h.is_empty() => ProviderError::Connection {
                host: host.to_string(),
                port,
                message,
            },
            ProviderError::DataLossRisk {
                from,
                to,
                temporary,
                cause,
            } => ProviderError::DataLossRisk {
                from,
                to,
                temporary,
                cause: Box::new(cause.with_endpoint(host, port)),
            },
            other => other,
        }
    }

    /// Whether this failure, or one nested inside it, means the session
    /// is gone.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            ProviderError::Connection { .. } => true,
            ProviderError::DataLossRisk { cause, .. } => cause.is_connection_loss(),
            ProviderError::PartialDelete { failures, .. } => {
                failures.iter().any(|f| f.cause.is_connection_loss())
            }
            _ => false,
        }
    }
}

/// Maps an SFTP status reply into the taxonomy.
///
/// The first path is the one the operation acted on; for a rename it is the
/// source and the second path is the target.
pub fn translate(operation: Operation, paths: &[&RemotePath], failure: SftpFailure) -> ProviderError {
    let SftpFailure { code, message } = failure;
    let primary = paths.first().map(|p| (*p).clone()).unwrap_or_else(RemotePath::root);
    // for a rename, "already exists" is about the target
    let subject = if operation == Operation::Rename {
        paths.get(1).map(|p| (*p).clone()).unwrap_or_else(|| primary.clone())
    } else {
        primary.clone()
    };
    let owned_paths = || paths.iter().map(|p| (*p).clone()).collect::<Vec<_>>();

    match code {
        StatusCode::NoSuchFile | StatusCode::NoSuchPath => ProviderError::NotFound {
            operation,
            path: primary,
            reason: NotFoundReason::NoSuchPath,
            message,
        },
        StatusCode::NotADirectory => ProviderError::NotFound {
            operation,
            path: primary,
            reason: NotFoundReason::NotADirectory,
            message,
        },
        StatusCode::PermissionDenied | StatusCode::WriteProtect => ProviderError::Permission {
            operation,
            paths: owned_paths(),
            message,
        },
        StatusCode::FileAlreadyExists => ProviderError::AlreadyExists {
            operation,
            path: subject,
            message,
        },
        StatusCode::DirNotEmpty => ProviderError::DirectoryNotEmpty {
            path: primary,
            message,
        },
        StatusCode::NoConnection | StatusCode::ConnectionLost => ProviderError::Connection {
            host: String::new(),
            port: 0,
            message: format!("{operation} {}: {code}{}", format_paths(&owned_paths()), suffix(&message)),
        },
        _ => ProviderError::Protocol {
            operation,
            paths: owned_paths(),
            code,
            message,
        },
    }
}

/// Maps an SSH transport failure to a connection error for `host:port`.
pub fn translate_transport(host: &str, port: u16, err: TransportError) -> ProviderError {
    ProviderError::connection(host, port, err)
}

fn suffix(message: &str) -> String {
    if message.trim().is_empty() {
        String::new()
    } else {
        format!(" ({})", message.trim())
    }
}

fn not_found_text(reason: &NotFoundReason, message: &str) -> String {
    let base = match reason {
        NotFoundReason::NoSuchPath => "no such file or directory",
        NotFoundReason::NotADirectory => "not a directory",
    };
    format!("{base}{}", suffix(message))
}

fn format_paths(paths: &[RemotePath]) -> String {
    match paths {
        [] => "'/'".to_string(),
        [one] => format!("'{one}'"),
        [from, to, ..] => format!("'{from}' to '{to}'"),
    }
}

fn format_methods(methods: &[AuthMethod]) -> String {
    if methods.is_empty() {
        return "none".to_string();
    }
    methods
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn first_failure(failures: &[DeleteFailure]) -> String {
    failures
        .first()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "none".to_string())
}
