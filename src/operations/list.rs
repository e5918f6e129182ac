use tracing::debug;

use crate::error::{Operation, ProviderError, SftpFailure, StatusCode, translate};
use crate::transport::SftpChannel;
use crate::types::{Handle, ListingEntry, RawEntry, RemotePath, epoch_seconds};
use crate::utils::parse_longname;

/// Lists the contents of a remote directory
///
/// Entries come back in the order the server enumerated them, without `.`
/// and `..`. The directory handle is closed whether or not reading succeeded.
///
/// # Errors
///
/// - `NotFound` if the directory does not exist or is not a directory
/// - `Permission` if the directory cannot be opened for reading
/// - `Protocol` if reading fails after the directory was opened; entries
///   read before the failure are discarded
pub(crate) async fn list(
    channel: &mut dyn SftpChannel,
    directory: &RemotePath,
) -> Result<Vec<ListingEntry>, ProviderError> {
    let handle = channel
        .open_dir(directory.as_str())
        .await
        .map_err(|f| translate(Operation::List, &[directory], f))?;

    let result = read_entries(channel, &handle, directory).await;

    if let Err(e) = channel.close(handle).await {
        debug!("Closing directory handle for {} failed: {}", directory, e);
    }
    let entries = result?;
    debug!("Listed {} entries in {}", entries.len(), directory);
    Ok(entries)
}

/// Whether `directory` holds anything besides `.` and `..`. Only the first
/// batch is read; any failure counts as "no".
pub(crate) async fn has_entries(channel: &mut dyn SftpChannel, directory: &RemotePath) -> bool {
    let Ok(handle) = channel.open_dir(directory.as_str()).await else {
        return false;
    };
    let found = match channel.read_dir(&handle).await {
        Ok(Some(batch)) => batch.iter().any(|e| !is_dot_entry(&e.filename)),
        _ => false,
    };
    if let Err(e) = channel.close(handle).await {
        debug!("Closing directory handle for {} failed: {}", directory, e);
    }
    found
}

async fn read_entries(
    channel: &mut dyn SftpChannel,
    handle: &Handle,
    directory: &RemotePath,
) -> Result<Vec<ListingEntry>, ProviderError> {
    let mut entries = Vec::new();
    loop {
        let batch = match channel.read_dir(handle).await {
            Ok(Some(batch)) if !batch.is_empty() => batch,
            Ok(_) => break,
            Err(f) => return Err(read_failure(directory, f)),
        };
        entries.extend(
            batch
                .into_iter()
                .filter(|e| !is_dot_entry(&e.filename))
                .map(listing_entry),
        );
    }
    Ok(entries)
}

/// Once the handle is open, anything but a lost connection is a protocol
/// error carrying the raw code.
fn read_failure(directory: &RemotePath, failure: SftpFailure) -> ProviderError {
    match failure.code {
        StatusCode::NoConnection | StatusCode::ConnectionLost => {
            translate(Operation::List, &[directory], failure)
        }
        code => ProviderError::Protocol {
            operation: Operation::List,
            paths: vec![directory.clone()],
            code,
            message: failure.message,
        },
    }
}

fn is_dot_entry(name: &str) -> bool {
    name == "." || name == ".."
}

/// Builds a listing entry from a raw `READDIR` record.
///
/// Owner and group names come from the attributes when the server sends
/// them, otherwise from the long name, otherwise the numeric ids.
pub(crate) fn listing_entry(raw: RawEntry) -> ListingEntry {
    let RawEntry {
        filename,
        longname,
        attrs,
    } = raw;
    let long = parse_longname(&longname);
    let uid = attrs.uid.unwrap_or(0);
    let gid = attrs.gid.unwrap_or(0);

    ListingEntry {
        filename,
        permissions: attrs.permissions.unwrap_or(0),
        owner: attrs
            .user
            .or(long.owner)
            .unwrap_or_else(|| uid.to_string()),
        group: attrs
            .group
            .or(long.group)
            .unwrap_or_else(|| gid.to_string()),
        uid,
        gid,
        size: attrs.size.unwrap_or(0),
        hard_links: long.hard_links.unwrap_or(1),
        modified_at: epoch_seconds(attrs.mtime),
        accessed_at: epoch_seconds(attrs.atime),
    }
}
