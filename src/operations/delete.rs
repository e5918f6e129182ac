use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::error::{DeleteFailure, Operation, ProviderError, StatusCode, translate};
use crate::operations::list::{has_entries, list};
use crate::transport::SftpChannel;
use crate::types::{ListingEntry, RemotePath};

/// Removes a single file. Symbolic links are removed, never followed.
pub(crate) async fn delete_file(
    channel: &mut dyn SftpChannel,
    path: &RemotePath,
) -> Result<(), ProviderError> {
    channel
        .remove_file(path.as_str())
        .await
        .map_err(|f| translate(Operation::Delete, &[path], f))?;
    debug!("Removed {}", path);
    Ok(())
}

/// Removes an empty directory.
///
/// OpenSSH answers `rmdir` of a non-empty directory with a bare `Failure`,
/// so that code is checked against the directory's contents before it is
/// reported.
pub(crate) async fn remove_directory(
    channel: &mut dyn SftpChannel,
    path: &RemotePath,
) -> Result<(), ProviderError> {
    let failure = match channel.remove_dir(path.as_str()).await {
        Ok(()) => {
            debug!("Removed directory {}", path);
            return Ok(());
        }
        Err(failure) => failure,
    };
    if failure.code == StatusCode::Failure && has_entries(channel, path).await {
        return Err(ProviderError::DirectoryNotEmpty {
            path: path.clone(),
            message: failure.message,
        });
    }
    Err(translate(Operation::DeleteDirectory, &[path], failure))
}

/// Deletes a directory and everything below it, children first.
///
/// The top-level listing must succeed; after that the walk keeps going past
/// individual failures, and a directory whose contents were not all removed
/// is left in place. Every path that could not be removed is reported in a
/// single `PartialDelete`.
///
/// # Errors
///
/// - `NotFound` / `Permission` / `Protocol` if `root` cannot be listed
/// - `PartialDelete` if anything below or at `root` survived
pub(crate) async fn delete_recursive(
    channel: &mut dyn SftpChannel,
    root: &RemotePath,
) -> Result<(), ProviderError> {
    if root.is_root() {
        return Err(ProviderError::invalid_argument(
            "refusing to delete the root directory",
        ));
    }
    info!("Deleting directory tree {}", root);

    let entries = list(channel, root).await?;
    let mut failures = Vec::new();
    delete_contents(channel, root, entries, &mut failures).await;

    if failures.is_empty() {
        if let Err(cause) = remove_directory(channel, root).await {
            failures.push(DeleteFailure {
                path: root.clone(),
                cause,
            });
        }
    }

    if failures.is_empty() {
        info!("Deleted directory tree {}", root);
        Ok(())
    } else {
        warn!("{} path(s) under {} could not be deleted", failures.len(), root);
        Err(ProviderError::PartialDelete {
            root: root.clone(),
            failures,
        })
    }
}

async fn delete_contents(
    channel: &mut dyn SftpChannel,
    directory: &RemotePath,
    entries: Vec<ListingEntry>,
    failures: &mut Vec<DeleteFailure>,
) {
    for entry in entries {
        let path = match directory.join(&entry.filename) {
            Ok(path) => path,
            Err(cause) => {
                failures.push(DeleteFailure {
                    path: directory.clone(),
                    cause,
                });
                continue;
            }
        };

        if entry.is_directory() && !entry.is_symlink() {
            delete_subdirectory(channel, path, failures).await;
        } else if let Err(cause) = delete_file(channel, &path).await {
            failures.push(DeleteFailure { path, cause });
        }
    }
}

fn delete_subdirectory<'a>(
    channel: &'a mut dyn SftpChannel,
    directory: RemotePath,
    failures: &'a mut Vec<DeleteFailure>,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        let entries = match list(channel, &directory).await {
            Ok(entries) => entries,
            Err(cause) => {
                failures.push(DeleteFailure {
                    path: directory,
                    cause,
                });
                return;
            }
        };

        let before = failures.len();
        delete_contents(channel, &directory, entries, failures).await;
        if failures.len() > before {
            debug!("Keeping {} because some of its contents remain", directory);
            return;
        }

        if let Err(cause) = remove_directory(channel, &directory).await {
            failures.push(DeleteFailure {
                path: directory,
                cause,
            });
        }
    })
}
