//! Capabilities the provider needs from the SSH/SFTP implementation.
//!
//! The provider never speaks the wire protocol itself. A [`Connector`] opens
//! an [`SshTransport`] to a host, the transport authenticates and opens an
//! [`SftpChannel`], and every file-system request goes through that channel.
//! [`russh`] contains the production implementation.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{SftpFailure, TransportError};
use crate::types::{Credential, Handle, HostKey, OpenMode, RawAttributes, RawEntry};

pub mod russh;

pub use self::russh::RusshConnector;

/// Opens SSH transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects and completes key exchange. No credentials are sent yet.
    async fn open_session(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn SshTransport>, TransportError>;
}

/// A connected, possibly unauthenticated, SSH transport.
#[async_trait]
pub trait SshTransport: Send {
    /// Key the server presented during the handshake.
    fn host_key(&self) -> HostKey;

    /// Returns `Ok(false)` when the server rejects the credential.
    async fn authenticate(
        &mut self,
        user: &str,
        credential: &Credential,
    ) -> Result<bool, TransportError>;

    async fn open_sftp(&mut self) -> Result<Box<dyn SftpChannel>, TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// SFTP requests over one open channel.
///
/// Every method maps to one request/reply exchange, except that
/// [`SftpChannel::read_dir`] and [`SftpChannel::read`] turn the end-of-file
/// status into `Ok(None)`.
#[async_trait]
pub trait SftpChannel: Send {
    /// Whether the server advertised an atomic rename-with-replace extension.
    fn supports_atomic_overwrite(&self) -> bool;

    async fn open_dir(&mut self, path: &str) -> Result<Handle, SftpFailure>;

    async fn read_dir(&mut self, handle: &Handle) -> Result<Option<Vec<RawEntry>>, SftpFailure>;

    async fn open(&mut self, path: &str, mode: OpenMode) -> Result<Handle, SftpFailure>;

    async fn read(
        &mut self,
        handle: &Handle,
        offset: u64,
        len: u32,
    ) -> Result<Option<Bytes>, SftpFailure>;

    async fn close(&mut self, handle: Handle) -> Result<(), SftpFailure>;

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), SftpFailure>;

    /// Rename replacing an existing target in one request. Fails with
    /// `OpUnsupported` when the server has no such extension.
    async fn rename_overwrite(&mut self, from: &str, to: &str) -> Result<(), SftpFailure>;

    async fn remove_file(&mut self, path: &str) -> Result<(), SftpFailure>;

    async fn remove_dir(&mut self, path: &str) -> Result<(), SftpFailure>;

    async fn make_dir(&mut self, path: &str) -> Result<(), SftpFailure>;

    async fn stat(&mut self, path: &str) -> Result<RawAttributes, SftpFailure>;

    /// Ends the SFTP subsystem; the transport stays up.
    async fn shutdown(&mut self) -> Result<(), SftpFailure>;
}
