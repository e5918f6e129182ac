use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consumer::Consumer;
use crate::error::{ProviderError, translate_transport};
use crate::transport::{Connector, SftpChannel, SshTransport};
use crate::types::{AuthMethod, ConnectionTarget, CredentialRequest};

/// One authenticated SSH connection with its SFTP channel
pub struct Session {
    target: ConnectionTarget,
    transport: Box<dyn SshTransport>,
    channel: Box<dyn SftpChannel>,
    connected: bool,
    teardown: CancellationToken,
}

impl Session {
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// `false` once the session was disconnected or torn down by the host.
    pub fn is_connected(&self) -> bool {
        self.connected && !self.teardown.is_cancelled()
    }

    /// Token that tears this session down when cancelled. Whatever request
    /// is in flight fails as a connection error.
    pub fn teardown_token(&self) -> CancellationToken {
        self.teardown.clone()
    }

    pub(crate) fn channel(&mut self) -> &mut dyn SftpChannel {
        self.channel.as_mut()
    }

    /// Releases the channel, then the transport. Safe to call repeatedly.
    async fn close(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.teardown.cancel();
        if let Err(e) = self.channel.shutdown().await {
            debug!("Closing sftp channel to {} failed: {}", self.target, e);
        }
        if let Err(e) = self.transport.disconnect().await {
            debug!("Disconnecting from {} failed: {}", self.target, e);
        }
        info!("Disconnected from {}", self.target);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown.cancel();
    }
}

/// Owns the connect/disconnect lifecycle of the provider's single session
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    consumer: Option<Arc<dyn Consumer>>,
    session: Option<Session>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            consumer: None,
            session: None,
        }
    }

    /// Replaces the consumer used for future prompts. An open session is
    /// left as it is.
    pub fn switch_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        self.consumer = Some(consumer);
    }

    pub fn consumer(&self) -> Option<Arc<dyn Consumer>> {
        self.consumer.clone()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Checks if a live session exists
    pub fn connected(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_connected)
    }

    /// Returns the session for `target`, connecting first when there is no
    /// live session for exactly that (host, port, user) tuple.
    ///
    /// # Errors
    ///
    /// - `Connection` if the transport or the SFTP channel cannot be opened
    /// - `Trust` if the consumer rejects the server's host key
    /// - `Authentication` if every method was skipped or rejected
    /// - `NotInitialized` if no consumer has been set
    pub async fn ensure_connected(
        &mut self,
        target: &ConnectionTarget,
    ) -> Result<&mut Session, ProviderError> {
        let reusable = self
            .session
            .as_ref()
            .is_some_and(|s| s.is_connected() && s.target == *target);

        if !reusable {
            if let Some(mut stale) = self.session.take() {
                if stale.teardown.is_cancelled() && stale.connected {
                    warn!("Session to {} was torn down, reconnecting", stale.target);
                }
                stale.close().await;
            }
            let session = self.connect(target).await?;
            self.session = Some(session);
        }

        self.session.as_mut().ok_or(ProviderError::NotInitialized)
    }

    /// Releases the channel then the transport. Idempotent.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }

    async fn connect(&self, target: &ConnectionTarget) -> Result<Session, ProviderError> {
        let consumer = self.consumer.clone().ok_or(ProviderError::NotInitialized)?;
        let ConnectionTarget { host, port, user } = target;
        let port = *port;

        info!("Connecting to {}", target);
        let mut transport = self
            .connector
            .open_session(host, port)
            .await
            .map_err(|e| translate_transport(host, port, e))?;

        let host_key = transport.host_key();
        if !consumer.confirm_host_key(host, port, &host_key).await {
            warn!(
                "Host key {} for {}:{} rejected by consumer",
                host_key.fingerprint, host, port
            );
            shut(transport.as_mut(), target).await;
            return Err(ProviderError::Trust {
                host: host.clone(),
                port,
                fingerprint: host_key.fingerprint,
            });
        }

        let mut tried = Vec::new();
        let mut authenticated = false;
        for method in AuthMethod::PREFERENCE {
            let request = CredentialRequest {
                method,
                user: user.clone(),
                host: host.clone(),
                port,
            };
            let Some(credential) = consumer.provide_credentials(&request).await else {
                debug!("No {} credential supplied for {}", method, target);
                continue;
            };
            if credential.method() != method {
                warn!(
                    "Ignoring {} credential offered for {} authentication to {}",
                    credential.method(),
                    method,
                    target
                );
                continue;
            }
            tried.push(method);

            match transport.authenticate(user, &credential).await {
                Ok(true) => {
                    authenticated = true;
                    break;
                }
                Ok(false) => debug!("{} authentication rejected for {}", method, target),
                Err(e) => {
                    shut(transport.as_mut(), target).await;
                    return Err(translate_transport(host, port, e));
                }
            }
        }

        if !authenticated {
            shut(transport.as_mut(), target).await;
            return Err(ProviderError::Authentication {
                user: user.clone(),
                host: host.clone(),
                tried,
            });
        }
        info!("Authenticated as {}", target);

        let channel = match transport.open_sftp().await {
            Ok(channel) => channel,
            Err(e) => {
                shut(transport.as_mut(), target).await;
                return Err(translate_transport(host, port, e));
            }
        };
        debug!("SFTP channel open on {}", target);

        Ok(Session {
            target: target.clone(),
            transport,
            channel,
            connected: true,
            teardown: CancellationToken::new(),
        })
    }
}

async fn shut(transport: &mut dyn SshTransport, target: &ConnectionTarget) {
    if let Err(e) = transport.disconnect().await {
        debug!("Disconnecting from {} failed: {}", target, e);
    }
}
