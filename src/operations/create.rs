use tracing::{debug, info};

use crate::error::{Operation, ProviderError, SftpFailure, StatusCode, translate};
use crate::transport::SftpChannel;
use crate::types::{OpenMode, RemotePath};

/// Creates an empty file, failing if anything already exists at `path`
///
/// # Errors
///
/// - `AlreadyExists` if `path` exists
/// - `NotFound` if the parent directory does not exist
/// - `Permission` if the parent is not writable
pub(crate) async fn create_file(
    channel: &mut dyn SftpChannel,
    path: &RemotePath,
) -> Result<(), ProviderError> {
    let handle = match channel.open(path.as_str(), OpenMode::CreateNew).await {
        Ok(handle) => handle,
        Err(failure) => return Err(refine_exists(channel, Operation::CreateFile, path, failure).await),
    };
    if let Err(e) = channel.close(handle).await {
        debug!("Closing new file {} failed: {}", path, e);
    }
    info!("Created file {}", path);
    Ok(())
}

/// Creates a directory with the server's default permissions
///
/// # Errors
///
/// Same as [`create_file`].
pub(crate) async fn create_directory(
    channel: &mut dyn SftpChannel,
    path: &RemotePath,
) -> Result<(), ProviderError> {
    if let Err(failure) = channel.make_dir(path.as_str()).await {
        return Err(refine_exists(channel, Operation::CreateDirectory, path, failure).await);
    }
    info!("Created directory {}", path);
    Ok(())
}

/// SFTP v3 has no "already exists" status; servers send `Failure`.
async fn refine_exists(
    channel: &mut dyn SftpChannel,
    operation: Operation,
    path: &RemotePath,
    failure: SftpFailure,
) -> ProviderError {
    if failure.code == StatusCode::Failure && channel.stat(path.as_str()).await.is_ok() {
        return ProviderError::AlreadyExists {
            operation,
            path: path.clone(),
            message: failure.message,
        };
    }
    translate(operation, &[path], failure)
}
