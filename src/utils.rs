use std::future::Future;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ProviderError, SftpFailure};

/// Longest file name most servers accept, in bytes.
const MAX_NAME_LEN: usize = 255;

/// Runs `fut` unless the session's teardown token fires first, in which case
/// the request is abandoned and the operation fails as a connection error.
pub(crate) async fn guarded<T, F>(teardown: &CancellationToken, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        _ = teardown.cancelled() => Err(ProviderError::Connection {
            host: String::new(),
            port: 0,
            message: "session was torn down".to_string(),
        }),
        result = fut => result,
    }
}

/// Like [`guarded`] for a single SFTP request: a teardown reads as the
/// channel being lost, so callers can react to it as a failed step.
pub(crate) async fn interruptible<T, F>(
    teardown: &CancellationToken,
    request: F,
) -> Result<T, SftpFailure>
where
    F: Future<Output = Result<T, SftpFailure>>,
{
    tokio::select! {
        biased;
        _ = teardown.cancelled() => Err(SftpFailure::connection_lost("session was torn down")),
        result = request => result,
    }
}

/// Fields recovered from an `ls -l` style long name.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct LongName {
    pub(crate) hard_links: Option<u32>,
    pub(crate) owner: Option<String>,
    pub(crate) group: Option<String>,
}

/// Parses `drwxr-xr-x  2 owner group 4096 Jan  1 00:00 name`.
///
/// Anything that does not start with a ten character mode string yields an
/// empty result.
pub(crate) fn parse_longname(longname: &str) -> LongName {
    let mut fields = longname.split_whitespace();
    let Some(mode) = fields.next() else {
        return LongName::default();
    };
    if mode.chars().count() < 10 {
        return LongName::default();
    }
    let hard_links = fields.next().and_then(|n| n.parse().ok());
    let owner = fields.next().map(str::to_string);
    let group = fields.next().map(str::to_string);
    LongName {
        hard_links,
        owner,
        group,
    }
}

/// Sibling name used to park an existing target during a non-atomic
/// overwrite. Random so that concurrent clients do not pick the same name.
///
/// Long target names are cut (on a char boundary) so the result stays
/// within [`MAX_NAME_LEN`] bytes.
pub(crate) fn temporary_name_for(target_name: &str) -> String {
    let suffix = format!(".{}.tmp", Uuid::new_v4().simple());
    let mut stem_len = target_name.len().min(MAX_NAME_LEN - suffix.len());
    while !target_name.is_char_boundary(stem_len) {
        stem_len -= 1;
    }
    format!("{}{}", &target_name[..stem_len], suffix)
}
