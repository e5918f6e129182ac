use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProviderError;

/// Absolute, slash-separated path on the remote host.
///
/// Construction normalises the input: repeated slashes collapse, `.`
/// components disappear, `..` pops a component (never above the root) and
/// there is no trailing slash except for the root itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(path: &str) -> Result<Self, ProviderError> {
        if !path.starts_with('/') {
            return Err(ProviderError::invalid_argument(format!(
                "remote path '{path}' is not absolute"
            )));
        }
        if path.contains('\0') {
            return Err(ProviderError::invalid_argument(
                "remote path contains a NUL byte",
            ));
        }

        let mut parts: Vec<&str> = Vec::new();
        for component in path.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                other => parts.push(other),
            }
        }
        Ok(Self(format!("/{}", parts.join("/"))))
    }

    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Last component, `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Containing directory, `None` for the root.
    pub fn parent(&self) -> Option<RemotePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Appends a single file name.
    pub fn join(&self, name: &str) -> Result<RemotePath, ProviderError> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(ProviderError::invalid_argument(format!(
                "'{name}' is not a valid file name"
            )));
        }
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RemotePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RemotePath {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RemotePath::new(s)
    }
}

impl TryFrom<&str> for RemotePath {
    type Error = ProviderError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        RemotePath::new(value)
    }
}

impl Serialize for RemotePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RemotePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RemotePath::new(&raw).map_err(serde::de::Error::custom)
    }
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingEntry {
    /// File name only, never a full path
    pub filename: String,
    /// Mode bits including the file type bits
    pub permissions: u32,
    pub owner: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub hard_links: u32,
    pub modified_at: Option<SystemTime>,
    pub accessed_at: Option<SystemTime>,
}

impl ListingEntry {
    pub fn is_directory(&self) -> bool {
        self.permissions & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.permissions & S_IFMT == S_IFLNK
    }
}

/// Attribute record as returned by the SFTP server; every field is optional
/// on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAttributes {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl RawAttributes {
    pub fn is_directory(&self) -> bool {
        self.permissions.is_some_and(|p| p & S_IFMT == S_IFDIR)
    }
}

/// Directory entry as returned by a `READDIR` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub filename: String,
    /// `ls -l` style line, empty when the server does not send one
    pub longname: String,
    pub attrs: RawAttributes,
}

/// Opaque handle returned by the server for an open file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle(String);

impl Handle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// How a file is opened on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create a new empty file, failing if it already exists
    CreateNew,
}

/// Authentication methods, in the order they are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMethod {
    PublicKey,
    Password,
}

impl AuthMethod {
    pub const PREFERENCE: [AuthMethod; 2] = [AuthMethod::PublicKey, AuthMethod::Password];
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMethod::PublicKey => "publickey",
            AuthMethod::Password => "password",
        })
    }
}

/// Secret material handed over by the consumer for one authentication
/// attempt. It is dropped as soon as the attempt completes.
#[derive(Clone)]
pub enum Credential {
    PrivateKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Password(String),
}

impl Credential {
    pub fn method(&self) -> AuthMethod {
        match self {
            Credential::PrivateKey { .. } => AuthMethod::PublicKey,
            Credential::Password(_) => AuthMethod::Password,
        }
    }
}

// Secrets stay out of logs and panic messages.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::PrivateKey { path, .. } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .finish_non_exhaustive(),
            Credential::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// What the provider asks the consumer for before an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRequest {
    pub method: AuthMethod,
    pub user: String,
    pub host: String,
    pub port: u16,
}

/// Server host key as seen during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub algorithm: String,
    /// `SHA256:<base64>` fingerprint
    pub fingerprint: String,
}

/// The (host, port, user) tuple a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl ConnectionTarget {
    pub fn new(host: &str, port: u16, user: &str) -> Result<Self, ProviderError> {
        if host.trim().is_empty() {
            return Err(ProviderError::invalid_argument("host name is empty"));
        }
        if user.trim().is_empty() {
            return Err(ProviderError::invalid_argument("user name is empty"));
        }
        if port == 0 {
            return Err(ProviderError::invalid_argument("port 0 is not valid"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
        })
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Result of a successful rename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameOutcome {
    /// An existing target was replaced
    pub was_overwritten: bool,
    /// Temporary copy of the replaced target that could not be removed
    pub stray_temporary: Option<RemotePath>,
}

/// Largest read most SFTP servers will honour in one request.
pub const MAX_IO_SIZE: u32 = 261_120;

/// Configuration for the provider and its connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Chunk size for file reads in bytes
    pub io_size: u32,
    /// SSH connect and handshake timeout. Also bounds the restore of a
    /// parked rename target after the session was torn down.
    pub connect_timeout_secs: u64,
    /// SSH keepalive interval; `None` disables keepalives
    pub keepalive_interval_secs: Option<u64>,
    /// Random temporary names tried by the non-atomic overwrite
    pub temp_name_attempts: u8,
}

impl Default for ProviderConfig {
    /// - io_size: 32768 (32KB)
    /// - connect_timeout_secs: 30
    /// - keepalive_interval_secs: 30
    /// - temp_name_attempts: 8
    fn default() -> Self {
        Self {
            io_size: 32_768,
            connect_timeout_secs: 30,
            keepalive_interval_secs: Some(30),
            temp_name_attempts: 8,
        }
    }
}

impl ProviderConfig {
    /// Parses a JSON document; missing fields take their default.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn io_size(&self) -> u32 {
        self.io_size.clamp(1, MAX_IO_SIZE)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn temp_name_attempts(&self) -> u8 {
        self.temp_name_attempts.max(1)
    }
}

/// Internal configuration wrapper with Arc for shared ownership
#[derive(Debug, Clone)]
pub(crate) struct ProviderConfigArc {
    pub(crate) inner: Arc<ProviderConfig>,
}

impl From<ProviderConfig> for ProviderConfigArc {
    fn from(config: ProviderConfig) -> Self {
        Self {
            inner: Arc::new(config),
        }
    }
}

impl std::ops::Deref for ProviderConfigArc {
    type Target = ProviderConfig;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

pub(crate) fn epoch_seconds(secs: Option<u32>) -> Option<SystemTime> {
    secs.map(|s| UNIX_EPOCH + Duration::from_secs(u64::from(s)))
}
