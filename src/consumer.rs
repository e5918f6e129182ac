use async_trait::async_trait;

use crate::types::{Credential, CredentialRequest, HostKey, RemotePath};

/// Decisions the provider needs from its host application.
///
/// Every call suspends the operation that made it until the host answers.
/// The provider imposes no timeout: a prompt that never resolves keeps the
/// operation waiting.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Whether to trust `key` for `host:port`. Called once per new
    /// connection, before any credential is sent.
    async fn confirm_host_key(&self, host: &str, port: u16, key: &HostKey) -> bool;

    /// Secret for one authentication attempt, or `None` to skip the method.
    async fn provide_credentials(&self, request: &CredentialRequest) -> Option<Credential>;

    /// Whether `to` may be replaced by `from`.
    async fn confirm_overwrite(&self, from: &RemotePath, to: &RemotePath) -> bool;
}
