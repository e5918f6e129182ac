use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, try_unfold};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Operation, ProviderError, translate};
use crate::transport::SftpChannel;
use crate::types::{ConnectionTarget, Handle, OpenMode, RemotePath};
use crate::utils::guarded;

/// Opens a remote file for sequential reading
///
/// # Errors
///
/// - `NotFound` if the file does not exist
/// - `Permission` if it cannot be opened for reading
pub(crate) async fn open<'a>(
    channel: &'a mut dyn SftpChannel,
    path: &RemotePath,
    io_size: u32,
    teardown: CancellationToken,
    target: ConnectionTarget,
) -> Result<RemoteFile<'a>, ProviderError> {
    let handle = channel
        .open(path.as_str(), OpenMode::Read)
        .await
        .map_err(|f| translate(Operation::Fetch, &[path], f))?;
    info!("Remote file opened: {}", path);

    Ok(RemoteFile {
        channel,
        handle: Some(handle),
        path: path.clone(),
        offset: 0,
        io_size,
        teardown,
        target,
    })
}

/// A remote file open for reading.
///
/// Chunks arrive in file order and are at most the configured I/O size.
/// The file borrows the provider's session, so no other operation can run
/// until it is closed or dropped. Dropping without [`RemoteFile::close`]
/// leaves the handle open on the server until the session ends.
pub struct RemoteFile<'a> {
    channel: &'a mut dyn SftpChannel,
    handle: Option<Handle>,
    path: RemotePath,
    offset: u64,
    io_size: u32,
    teardown: CancellationToken,
    target: ConnectionTarget,
}

impl<'a> RemoteFile<'a> {
    pub fn path(&self) -> &RemotePath {
        &self.path
    }

    /// Bytes handed out so far
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Reads the next chunk, or `None` at end of file.
    ///
    /// # Errors
    ///
    /// `Connection` if the session is lost or torn down mid-read; the next
    /// provider operation reconnects. Other read failures map through the
    /// usual translation.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, ProviderError> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(None);
        };
        let channel = &mut *self.channel;
        let path = &self.path;
        let (offset, len) = (self.offset, self.io_size);

        let read = guarded(&self.teardown, async move {
            channel
                .read(handle, offset, len)
                .await
                .map_err(|f| translate(Operation::Read, &[path], f))
        })
        .await;

        match read {
            Ok(Some(chunk)) if !chunk.is_empty() => {
                self.offset += chunk.len() as u64;
                Ok(Some(chunk))
            }
            Ok(_) => {
                debug!("End of {} after {} bytes", self.path, self.offset);
                Ok(None)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Reads everything from the current position to end of file.
    pub async fn read_to_end(&mut self) -> Result<Bytes, ProviderError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.read_chunk().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    /// Turns the file into a stream of chunks. The handle is closed once
    /// the stream reaches end of file.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, ProviderError>> + Send + 'a {
        try_unfold(self, |mut file| async move {
            match file.read_chunk().await? {
                Some(chunk) => Ok(Some((chunk, file))),
                None => {
                    file.release().await?;
                    Ok(None)
                }
            }
        })
    }

    /// Closes the server-side handle
    pub async fn close(mut self) -> Result<(), ProviderError> {
        self.release().await
    }

    async fn release(&mut self) -> Result<(), ProviderError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let channel = &mut *self.channel;
        let path = &self.path;
        let closed = guarded(&self.teardown, async move {
            channel
                .close(handle)
                .await
                .map_err(|f| translate(Operation::Fetch, &[path], f))
        })
        .await;
        closed.map_err(|e| self.fail(e))?;
        debug!("Closed {}", self.path);
        Ok(())
    }

    fn fail(&self, err: ProviderError) -> ProviderError {
        if err.is_connection_loss() {
            self.teardown.cancel();
        }
        err.with_endpoint(&self.target.host, self.target.port)
    }
}
