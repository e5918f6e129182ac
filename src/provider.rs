use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::consumer::Consumer;
use crate::error::ProviderError;
use crate::operations::fetch::RemoteFile;
use crate::operations::rename::Rename;
use crate::operations::{create, delete, fetch, list};
use crate::session::{Session, SessionManager};
use crate::transport::{Connector, RusshConnector};
use crate::types::{
    ConnectionTarget, ListingEntry, ProviderConfig, ProviderConfigArc, RemotePath, RenameOutcome,
};
use crate::utils::guarded;

/// SFTP file-operations provider for one remote account
///
/// All operations share a single session that is opened on first use and
/// reopened after it is lost. Prompts for host-key trust, credentials and
/// overwrite confirmation go to the [`Consumer`] given at initialization.
pub struct SftpProvider {
    config: ProviderConfigArc,
    sessions: SessionManager,
    target: Option<ConnectionTarget>,
}

impl SftpProvider {
    /// Creates a provider that opens sessions through `connector`
    pub fn new(connector: Arc<dyn Connector>, config: ProviderConfig) -> Self {
        Self {
            config: config.into(),
            sessions: SessionManager::new(connector),
            target: None,
        }
    }

    /// Creates a provider backed by the russh transport
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut provider = SftpProvider::with_russh(ProviderConfig::default());
    /// provider.initialize(consumer, "alice", "files.example.com", 22).await?;
    /// let entries = provider.list(&RemotePath::new("/home/alice")?).await?;
    /// ```
    pub fn with_russh(config: ProviderConfig) -> Self {
        let config = ProviderConfigArc::from(config);
        let connector = RusshConnector::with_shared_config(config.clone());
        Self {
            config,
            sessions: SessionManager::new(Arc::new(connector)),
            target: None,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Binds the provider to an account. No connection is made yet.
    ///
    /// # Arguments
    ///
    /// * `consumer` - Receives trust, credential and overwrite prompts
    /// * `user` - Remote user name
    /// * `host` - Host name or address
    /// * `port` - SSH port
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the user or host is empty or the port is zero.
    /// Re-initializing for a different account closes the current session.
    pub async fn initialize(
        &mut self,
        consumer: Arc<dyn Consumer>,
        user: &str,
        host: &str,
        port: u16,
    ) -> Result<(), ProviderError> {
        let target = ConnectionTarget::new(host, port, user)?;
        if self.target.as_ref().is_some_and(|t| *t != target) {
            self.sessions.disconnect().await;
        }
        info!("Provider initialized for {}", target);
        self.sessions.switch_consumer(consumer);
        self.target = Some(target);
        Ok(())
    }

    /// Sends future prompts to `consumer`; the open session is kept.
    pub fn switch_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        self.sessions.switch_consumer(consumer);
    }

    /// Opens the session now instead of on the first operation
    ///
    /// # Errors
    ///
    /// - `NotInitialized` if [`SftpProvider::initialize`] was not called
    /// - `Connection`, `Trust` or `Authentication` if the session cannot be
    ///   established
    pub async fn connect(&mut self) -> Result<(), ProviderError> {
        self.session().await.map(|_| ())
    }

    /// Closes the session if there is one
    pub async fn disconnect(&mut self) {
        self.sessions.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.sessions.connected()
    }

    /// Token of the live session. Cancelling it tears the session down;
    /// the request in flight fails with a connection error and the next
    /// operation reconnects.
    pub fn teardown_token(&self) -> Option<CancellationToken> {
        self.sessions.session().map(Session::teardown_token)
    }

    /// Lists a remote directory
    ///
    /// # Arguments
    ///
    /// * `directory` - Directory to list
    ///
    /// # Returns
    ///
    /// One entry per child in server order, without `.` and `..`
    ///
    /// # Example
    ///
    /// ```ignore
    /// for entry in provider.list(&RemotePath::new("/srv")?).await? {
    ///     println!("{} {} bytes", entry.filename, entry.size);
    /// }
    /// ```
    pub async fn list(&mut self, directory: &RemotePath) -> Result<Vec<ListingEntry>, ProviderError> {
        let (session, guard) = self.checkout().await?;
        let result = guarded(&guard.teardown, list::list(session.channel(), directory)).await;
        guard.settle(result)
    }

    /// Opens a remote file for reading
    ///
    /// The returned reader borrows the provider until it is closed or
    /// dropped.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut file = provider.fetch(&RemotePath::new("/etc/motd")?).await?;
    /// let contents = file.read_to_end().await?;
    /// file.close().await?;
    /// ```
    pub async fn fetch(&mut self, path: &RemotePath) -> Result<RemoteFile<'_>, ProviderError> {
        let io_size = self.config.io_size();
        let (session, guard) = self.checkout().await?;
        let opened = guarded(
            &guard.teardown,
            fetch::open(
                session.channel(),
                path,
                io_size,
                guard.teardown.clone(),
                guard.target.clone(),
            ),
        )
        .await;
        guard.settle(opened)
    }

    /// Renames `from` to `to`, replacing an existing `to` only after the
    /// consumer confirms
    ///
    /// # Returns
    ///
    /// Whether an existing target was replaced, and the name of a leftover
    /// temporary copy if cleaning it up failed
    ///
    /// # Errors
    ///
    /// - `UserCancelled` if the consumer declined the overwrite
    /// - `DataLossRisk` if the replaced target could not be restored after
    ///   a failed rename, including one cut short by a teardown; the error
    ///   names where it now lives
    /// - `NotFound`, `Permission`, `Protocol` for failures of the rename
    ///   itself
    pub async fn rename(
        &mut self,
        from: &RemotePath,
        to: &RemotePath,
    ) -> Result<RenameOutcome, ProviderError> {
        if from.is_root() || to.is_root() {
            return Err(ProviderError::invalid_argument(
                "the root directory cannot be renamed",
            ));
        }
        if from == to {
            return Ok(RenameOutcome {
                was_overwritten: false,
                stray_temporary: None,
            });
        }
        let attempts = self.config.temp_name_attempts();
        let restore_timeout = self.config.connect_timeout();
        let consumer = self.sessions.consumer().ok_or(ProviderError::NotInitialized)?;
        let (session, guard) = self.checkout().await?;
        // teardown is checked per request inside the rename
        let rename = Rename::new(
            session.channel(),
            consumer.as_ref(),
            from,
            to,
            attempts,
            guard.teardown.clone(),
            restore_timeout,
        );
        let result = rename.run().await;
        guard.settle(result)
    }

    /// Deletes a file or symbolic link
    pub async fn delete(&mut self, path: &RemotePath) -> Result<(), ProviderError> {
        let (session, guard) = self.checkout().await?;
        let result = guarded(&guard.teardown, delete::delete_file(session.channel(), path)).await;
        guard.settle(result)
    }

    /// Deletes a directory
    ///
    /// # Arguments
    ///
    /// * `path` - Directory to delete
    /// * `recursive` - Delete its contents first
    ///
    /// # Errors
    ///
    /// - `DirectoryNotEmpty` if `recursive` is false and the directory has
    ///   entries
    /// - `PartialDelete` if a recursive delete removed some paths but not
    ///   all; the error lists every path that remains together with its
    ///   cause
    pub async fn delete_directory(
        &mut self,
        path: &RemotePath,
        recursive: bool,
    ) -> Result<(), ProviderError> {
        let (session, guard) = self.checkout().await?;
        let result = if recursive {
            guarded(&guard.teardown, delete::delete_recursive(session.channel(), path)).await
        } else {
            guarded(&guard.teardown, delete::remove_directory(session.channel(), path)).await
        };
        guard.settle(result)
    }

    /// Creates an empty file; fails with `AlreadyExists` if `path` exists
    pub async fn create_file(&mut self, path: &RemotePath) -> Result<(), ProviderError> {
        let (session, guard) = self.checkout().await?;
        let result = guarded(&guard.teardown, create::create_file(session.channel(), path)).await;
        guard.settle(result)
    }

    /// Creates a directory; fails with `AlreadyExists` if `path` exists
    pub async fn create_directory(&mut self, path: &RemotePath) -> Result<(), ProviderError> {
        let (session, guard) = self.checkout().await?;
        let result =
            guarded(&guard.teardown, create::create_directory(session.channel(), path)).await;
        guard.settle(result)
    }

    async fn session(&mut self) -> Result<&mut Session, ProviderError> {
        let target = self.target.as_ref().ok_or(ProviderError::NotInitialized)?;
        self.sessions.ensure_connected(target).await
    }

    async fn checkout(&mut self) -> Result<(&mut Session, OperationGuard), ProviderError> {
        let session = self.session().await?;
        let guard = OperationGuard {
            teardown: session.teardown_token(),
            target: session.target().clone(),
        };
        Ok((session, guard))
    }
}

/// What an operation needs to report a lost session after the fact.
struct OperationGuard {
    teardown: CancellationToken,
    target: ConnectionTarget,
}

impl OperationGuard {
    /// Names the endpoint in connection errors and marks the session dead
    /// so the next operation reconnects.
    fn settle<T>(&self, result: Result<T, ProviderError>) -> Result<T, ProviderError> {
        result.map_err(|err| {
            if err.is_connection_loss() && !self.teardown.is_cancelled() {
                warn!("Lost session to {}: {}", self.target, err);
                self.teardown.cancel();
            }
            err.with_endpoint(&self.target.host, self.target.port)
        })
    }
}
