// Module declarations
mod consumer;
mod error;
mod operations;
mod provider;
mod session;
mod types;
mod utils;

pub mod transport;

// Public API exports
pub use consumer::Consumer;
pub use error::{
    DeleteFailure, ErrorKind, NotFoundReason, Operation, ProviderError, SftpFailure, StatusCode,
    TransportError, translate, translate_transport,
};
pub use operations::fetch::RemoteFile;
pub use provider::SftpProvider;
pub use session::{Session, SessionManager};
pub use transport::{Connector, RusshConnector, SftpChannel, SshTransport};
pub use types::{
    AuthMethod, ConnectionTarget, Credential, CredentialRequest, Handle, HostKey, ListingEntry,
    MAX_IO_SIZE, OpenMode, ProviderConfig, RawAttributes, RawEntry, RemotePath, RenameOutcome,
};

// Re-export commonly used external types for convenience
pub use async_trait::async_trait;
pub use bytes::Bytes;
pub use tokio_util::sync::CancellationToken;
