//! Production transport built on `russh` and `russh-sftp`.
//!
//! The handler accepts whatever key the server presents and only records it.
//! The trust decision belongs to the consumer and is made by the session
//! manager right after the handshake, before any credential is sent.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::keys::ssh_key::{self, HashAlg};
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh_sftp::client::RawSftpSession;
use russh_sftp::client::error::Error as RawSftpError;
use russh_sftp::protocol::{self, FileAttributes, OpenFlags, Packet};
use tracing::{debug, info, warn};

use crate::error::{SftpFailure, StatusCode, TransportError};
use crate::transport::{Connector, SftpChannel, SshTransport};
use crate::types::{
    Credential, Handle, HostKey, OpenMode, ProviderConfig, ProviderConfigArc, RawAttributes,
    RawEntry,
};

const POSIX_RENAME: &str = "posix-rename@openssh.com";

/// Keyboard-interactive rounds answered with the password before giving up.
const MAX_INTERACTIVE_ROUNDS: usize = 3;

/// Connector that opens real SSH connections.
#[derive(Debug, Clone)]
pub struct RusshConnector {
    config: ProviderConfigArc,
}

impl RusshConnector {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config: config.into(),
        }
    }

    pub(crate) fn with_shared_config(config: ProviderConfigArc) -> Self {
        Self { config }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new(ProviderConfig::default())
    }
}

/// Records the server key; never rejects during the handshake.
struct KeyRecorder {
    seen: Arc<OnceLock<ssh_key::PublicKey>>,
}

impl client::Handler for KeyRecorder {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let _ = self.seen.set(server_public_key.clone());
        Ok(true)
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn open_session(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn SshTransport>, TransportError> {
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.config.keepalive_interval(),
            keepalive_max: 3,
            ..Default::default()
        };
        let seen = Arc::new(OnceLock::new());
        let handler = KeyRecorder { seen: seen.clone() };

        info!("Connecting to {}:{}", host, port);
        let handle = tokio::time::timeout(
            self.config.connect_timeout(),
            client::connect(Arc::new(ssh_config), (host, port), handler),
        )
        .await
        .map_err(|_| {
            TransportError::new(format!(
                "connect timed out after {}s",
                self.config.connect_timeout().as_secs()
            ))
        })?
        .map_err(|e| TransportError::new(e.to_string()))?;

        let server_key = seen
            .get()
            .ok_or_else(|| TransportError::new("server did not present a host key"))?;
        let host_key = HostKey {
            algorithm: server_key.algorithm().as_str().to_string(),
            fingerprint: server_key.fingerprint(HashAlg::Sha256).to_string(),
        };
        debug!("SSH handshake completed, host key {}", host_key.fingerprint);

        Ok(Box::new(RusshTransport { handle, host_key }))
    }
}

struct RusshTransport {
    handle: client::Handle<KeyRecorder>,
    host_key: HostKey,
}

impl RusshTransport {
    async fn authenticate_interactive(
        &mut self,
        user: &str,
        password: &str,
    ) -> Result<bool, russh::Error> {
        let mut response = self
            .handle
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await?;
        for _ in 0..MAX_INTERACTIVE_ROUNDS {
            let prompts = match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => prompts,
            };
            let answers = prompts.iter().map(|_| password.to_string()).collect();
            response = self
                .handle
                .authenticate_keyboard_interactive_respond(answers)
                .await?;
        }
        Ok(matches!(response, KeyboardInteractiveAuthResponse::Success))
    }
}

#[async_trait]
impl SshTransport for RusshTransport {
    fn host_key(&self) -> HostKey {
        self.host_key.clone()
    }

    async fn authenticate(
        &mut self,
        user: &str,
        credential: &Credential,
    ) -> Result<bool, TransportError> {
        match credential {
            Credential::PrivateKey { path, passphrase } => {
                let key = match load_secret_key(path, passphrase.as_deref()) {
                    Ok(key) => key,
                    Err(e) => {
                        // an unreadable key is a rejected credential, not a dead transport
                        warn!("Could not load private key {}: {}", path.display(), e);
                        return Ok(false);
                    }
                };
                let hash_alg = self
                    .handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| TransportError::new(e.to_string()))?
                    .flatten();
                let result = self
                    .handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                    .await
                    .map_err(|e| TransportError::new(e.to_string()))?;
                Ok(result.success())
            }
            Credential::Password(password) => {
                let result = self
                    .handle
                    .authenticate_password(user, password)
                    .await
                    .map_err(|e| TransportError::new(e.to_string()))?;
                if result.success() {
                    return Ok(true);
                }
                debug!("Password rejected, retrying as keyboard-interactive");
                self.authenticate_interactive(user, password)
                    .await
                    .map_err(|e| TransportError::new(e.to_string()))
            }
        }
    }

    async fn open_sftp(&mut self) -> Result<Box<dyn SftpChannel>, TransportError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::new(format!("open channel: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| TransportError::new(format!("request sftp subsystem: {e}")))?;

        let raw = RawSftpSession::new(channel.into_stream());
        let version = raw
            .init()
            .await
            .map_err(|e| TransportError::new(format!("sftp init: {e}")))?;
        let posix_rename = version.extensions.contains_key(POSIX_RENAME);
        debug!(
            "SFTP version {} negotiated, {} {}",
            version.version,
            POSIX_RENAME,
            if posix_rename { "available" } else { "unavailable" }
        );

        Ok(Box::new(RusshSftp {
            raw: Some(raw),
            posix_rename,
        }))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| TransportError::new(e.to_string()))
    }
}

struct RusshSftp {
    /// `None` once shut down
    raw: Option<RawSftpSession>,
    posix_rename: bool,
}

impl RusshSftp {
    fn raw(&self) -> Result<&RawSftpSession, SftpFailure> {
        self.raw
            .as_ref()
            .ok_or_else(|| SftpFailure::connection_lost("sftp channel was shut down"))
    }
}

fn failure(err: RawSftpError) -> SftpFailure {
    match err {
        RawSftpError::Status(status) => {
            SftpFailure::new(status_code(&status.status_code), status.error_message)
        }
        other => SftpFailure::connection_lost(other.to_string()),
    }
}

fn status_code(code: &protocol::StatusCode) -> StatusCode {
    match code {
        protocol::StatusCode::Ok => StatusCode::Ok,
        protocol::StatusCode::Eof => StatusCode::Eof,
        protocol::StatusCode::NoSuchFile => StatusCode::NoSuchFile,
        protocol::StatusCode::PermissionDenied => StatusCode::PermissionDenied,
        protocol::StatusCode::Failure => StatusCode::Failure,
        protocol::StatusCode::BadMessage => StatusCode::BadMessage,
        protocol::StatusCode::NoConnection => StatusCode::NoConnection,
        protocol::StatusCode::ConnectionLost => StatusCode::ConnectionLost,
        protocol::StatusCode::OpUnsupported => StatusCode::OpUnsupported,
        #[allow(unreachable_patterns)]
        _ => StatusCode::Failure,
    }
}

fn is_eof(err: &RawSftpError) -> bool {
    matches!(err, RawSftpError::Status(status) if status.status_code == protocol::StatusCode::Eof)
}

fn raw_attributes(attrs: &FileAttributes) -> RawAttributes {
    RawAttributes {
        size: attrs.size,
        uid: attrs.uid,
        gid: attrs.gid,
        user: attrs.user.clone(),
        group: attrs.group.clone(),
        permissions: attrs.permissions,
        atime: attrs.atime,
        mtime: attrs.mtime,
    }
}

/// SSH `string` encoding: u32 length prefix then the bytes.
fn put_ssh_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

#[async_trait]
impl SftpChannel for RusshSftp {
    fn supports_atomic_overwrite(&self) -> bool {
        self.posix_rename
    }

    async fn open_dir(&mut self, path: &str) -> Result<Handle, SftpFailure> {
        let handle = self.raw()?.opendir(path).await.map_err(failure)?;
        Ok(Handle::new(handle.handle))
    }

    async fn read_dir(&mut self, handle: &Handle) -> Result<Option<Vec<RawEntry>>, SftpFailure> {
        match self.raw()?.readdir(handle.as_str()).await {
            Ok(name) => Ok(Some(
                name.files
                    .into_iter()
                    .map(|file| RawEntry {
                        attrs: raw_attributes(&file.attrs),
                        filename: file.filename,
                        longname: file.longname,
                    })
                    .collect(),
            )),
            Err(e) if is_eof(&e) => Ok(None),
            Err(e) => Err(failure(e)),
        }
    }

    async fn open(&mut self, path: &str, mode: OpenMode) -> Result<Handle, SftpFailure> {
        let flags = match mode {
            OpenMode::Read => OpenFlags::READ,
            OpenMode::CreateNew => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUDE,
        };
        let handle = self
            .raw()?
            .open(path, flags, FileAttributes::default())
            .await
            .map_err(failure)?;
        Ok(Handle::new(handle.handle))
    }

    async fn read(
        &mut self,
        handle: &Handle,
        offset: u64,
        len: u32,
    ) -> Result<Option<Bytes>, SftpFailure> {
        match self.raw()?.read(handle.as_str(), offset, len).await {
            Ok(data) if data.data.is_empty() => Ok(None),
            Ok(data) => Ok(Some(Bytes::from(data.data))),
            Err(e) if is_eof(&e) => Ok(None),
            Err(e) => Err(failure(e)),
        }
    }

    async fn close(&mut self, handle: Handle) -> Result<(), SftpFailure> {
        self.raw()?.close(handle.as_str()).await.map_err(failure)?;
        Ok(())
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), SftpFailure> {
        self.raw()?.rename(from, to).await.map_err(failure)?;
        Ok(())
    }

    async fn rename_overwrite(&mut self, from: &str, to: &str) -> Result<(), SftpFailure> {
        if !self.posix_rename {
            return Err(SftpFailure::new(
                StatusCode::OpUnsupported,
                format!("server does not offer {POSIX_RENAME}"),
            ));
        }
        let mut payload = BytesMut::with_capacity(8 + from.len() + to.len());
        put_ssh_string(&mut payload, from);
        put_ssh_string(&mut payload, to);

        match self.raw()?.extended(POSIX_RENAME, payload.to_vec()).await {
            Ok(Packet::Status(status)) if status.status_code != protocol::StatusCode::Ok => Err(
                SftpFailure::new(status_code(&status.status_code), status.error_message),
            ),
            Ok(_) => Ok(()),
            Err(e) => Err(failure(e)),
        }
    }

    async fn remove_file(&mut self, path: &str) -> Result<(), SftpFailure> {
        self.raw()?.remove(path).await.map_err(failure)?;
        Ok(())
    }

    async fn remove_dir(&mut self, path: &str) -> Result<(), SftpFailure> {
        self.raw()?.rmdir(path).await.map_err(failure)?;
        Ok(())
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), SftpFailure> {
        self.raw()?
            .mkdir(path, FileAttributes::default())
            .await
            .map_err(failure)?;
        Ok(())
    }

    async fn stat(&mut self, path: &str) -> Result<RawAttributes, SftpFailure> {
        let attrs = self.raw()?.stat(path).await.map_err(failure)?;
        Ok(raw_attributes(&attrs.attrs))
    }

    async fn shutdown(&mut self) -> Result<(), SftpFailure> {
        // dropping the raw session closes its channel stream, which ends
        // the subsystem before the transport goes away
        if self.raw.take().is_some() {
            debug!("SFTP channel closed");
        }
        Ok(())
    }
}
