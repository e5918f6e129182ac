//! Three-tier rename.
//!
//! 1. A plain rename, which succeeds whenever the target does not exist.
//! 2. If the target exists and the server has an atomic rename-with-replace
//!    extension, confirm with the consumer and replace in one request.
//! 3. Otherwise park the target under a temporary sibling name, rename the
//!    source into place and delete the parked copy. A failure in the middle
//!    restores the target; if even that fails the caller learns where the
//!    original now lives.
//!
//! Transitions between tiers are driven by [`TRANSITIONS`], keyed on the
//! class of status code the failed request returned.
//!
//! Each request is raced against the session's teardown token on its own.
//! A teardown fails the step in flight like a lost channel would, and the
//! restore of a parked target is still attempted, bounded by a timeout.

use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consumer::Consumer;
use crate::error::{Operation, ProviderError, SftpFailure, StatusCode, translate};
use crate::transport::SftpChannel;
use crate::types::{RemotePath, RenameOutcome};
use crate::utils::{interruptible, temporary_name_for};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Simple,
    AtomicRetry,
    NonAtomicRetry,
}

#[derive(Debug)]
enum RenameState {
    Simple,
    AtomicRetry,
    NonAtomicRetry,
    Done(RenameOutcome),
    Failed(ProviderError),
}

impl From<Tier> for RenameState {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Simple => RenameState::Simple,
            Tier::AtomicRetry => RenameState::AtomicRetry,
            Tier::NonAtomicRetry => RenameState::NonAtomicRetry,
        }
    }
}

/// What a failed rename request says about the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    TargetExists,
    Unsupported,
    /// Generic failure; SFTP v3 servers send this for an existing target
    Ambiguous,
    Terminal,
}

fn classify(code: StatusCode) -> FailureClass {
    match code {
        StatusCode::FileAlreadyExists => FailureClass::TargetExists,
        StatusCode::OpUnsupported => FailureClass::Unsupported,
        StatusCode::Failure => FailureClass::Ambiguous,
        _ => FailureClass::Terminal,
    }
}

/// (tier that failed, class of its failure, tier to try next)
const TRANSITIONS: &[(Tier, FailureClass, Tier)] = &[
    (Tier::Simple, FailureClass::TargetExists, Tier::AtomicRetry),
    (Tier::AtomicRetry, FailureClass::Unsupported, Tier::NonAtomicRetry),
];

fn is_lost(failure: &SftpFailure) -> bool {
    matches!(failure.code, StatusCode::NoConnection | StatusCode::ConnectionLost)
}

fn next_tier(failed: Tier, class: FailureClass) -> Option<Tier> {
    TRANSITIONS
        .iter()
        .find(|(tier, c, _)| *tier == failed && *c == class)
        .map(|(_, _, next)| *next)
}

pub(crate) struct Rename<'a> {
    channel: &'a mut dyn SftpChannel,
    consumer: &'a dyn Consumer,
    from: &'a RemotePath,
    to: &'a RemotePath,
    temp_name_attempts: u8,
    teardown: CancellationToken,
    restore_timeout: Duration,
    confirmed: bool,
}

impl<'a> Rename<'a> {
    pub(crate) fn new(
        channel: &'a mut dyn SftpChannel,
        consumer: &'a dyn Consumer,
        from: &'a RemotePath,
        to: &'a RemotePath,
        temp_name_attempts: u8,
        teardown: CancellationToken,
        restore_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            consumer,
            from,
            to,
            temp_name_attempts: temp_name_attempts.max(1),
            teardown,
            restore_timeout,
            confirmed: false,
        }
    }

    pub(crate) async fn run(mut self) -> Result<RenameOutcome, ProviderError> {
        info!("Renaming {} to {}", self.from, self.to);
        let mut state = RenameState::Simple;
        loop {
            state = match state {
                RenameState::Simple => self.simple().await,
                RenameState::AtomicRetry => self.atomic_retry().await,
                RenameState::NonAtomicRetry => self.non_atomic_retry().await,
                RenameState::Done(outcome) => return Ok(outcome),
                RenameState::Failed(err) => return Err(err),
            };
        }
    }

    async fn simple(&mut self) -> RenameState {
        let request = self.channel.rename(self.from.as_str(), self.to.as_str());
        let failure = match interruptible(&self.teardown, request).await {
            Ok(()) => {
                return RenameState::Done(RenameOutcome {
                    was_overwritten: false,
                    stray_temporary: None,
                });
            }
            Err(failure) => failure,
        };

        let mut class = classify(failure.code);
        if class == FailureClass::Ambiguous && self.target_exists().await {
            class = FailureClass::TargetExists;
        }
        match next_tier(Tier::Simple, class) {
            Some(Tier::AtomicRetry) if !self.channel.supports_atomic_overwrite() => {
                debug!("No atomic overwrite available, falling back to temporary rename");
                RenameState::NonAtomicRetry
            }
            Some(next) => next.into(),
            None => RenameState::Failed(self.rename_error(failure)),
        }
    }

    async fn atomic_retry(&mut self) -> RenameState {
        if !self.confirm_overwrite().await {
            return self.cancelled();
        }
        let request = self
            .channel
            .rename_overwrite(self.from.as_str(), self.to.as_str());
        let failure = match interruptible(&self.teardown, request).await {
            Ok(()) => {
                info!("Replaced {} with {} atomically", self.to, self.from);
                return RenameState::Done(RenameOutcome {
                    was_overwritten: true,
                    stray_temporary: None,
                });
            }
            Err(failure) => failure,
        };

        match next_tier(Tier::AtomicRetry, classify(failure.code)) {
            Some(next) => {
                debug!("Server refused atomic overwrite: {}", failure);
                next.into()
            }
            None => RenameState::Failed(self.rename_error(failure)),
        }
    }

    async fn non_atomic_retry(&mut self) -> RenameState {
        if !self.confirm_overwrite().await {
            return self.cancelled();
        }
        let temporary = match self.temporary_path().await {
            Ok(path) => path,
            Err(err) => return RenameState::Failed(err),
        };

        let request = self.channel.rename(self.to.as_str(), temporary.as_str());
        if let Err(failure) = interruptible(&self.teardown, request).await {
            let lost = is_lost(&failure);
            let cause = translate(Operation::Rename, &[self.to, &temporary], failure);
            if !lost {
                // refused outright, nothing has changed
                return RenameState::Failed(cause);
            }
            // the park may have been applied before the session went away
            return self.put_back(temporary, cause).await;
        }

        let request = self.channel.rename(self.from.as_str(), self.to.as_str());
        if let Err(failure) = interruptible(&self.teardown, request).await {
            let cause = self.rename_error(failure);
            return self.put_back(temporary, cause).await;
        }

        let request = self.channel.remove_file(temporary.as_str());
        let stray_temporary = match interruptible(&self.teardown, request).await {
            Ok(()) => None,
            Err(failure) => {
                warn!(
                    "Renamed {} to {} but could not remove the replaced copy {}: {}",
                    self.from, self.to, temporary, failure
                );
                Some(temporary)
            }
        };
        RenameState::Done(RenameOutcome {
            was_overwritten: true,
            stray_temporary,
        })
    }

    /// Moves the parked target back after the move into place failed.
    async fn put_back(&mut self, temporary: RemotePath, cause: ProviderError) -> RenameState {
        let restore = self.channel.rename(temporary.as_str(), self.to.as_str());
        let restored = match timeout(self.restore_timeout, restore).await {
            Ok(result) => result,
            Err(_) => Err(SftpFailure::connection_lost("restore timed out")),
        };
        match restored {
            Ok(()) => {
                info!("Restored {} after failed rename", self.to);
                RenameState::Failed(cause)
            }
            Err(f) if matches!(f.code, StatusCode::NoSuchFile | StatusCode::NoSuchPath) => {
                debug!("Nothing parked at {}, {} untouched", temporary, self.to);
                RenameState::Failed(cause)
            }
            Err(restore) => {
                error!(
                    "Could not restore {} from {}: {}; original target left at {}",
                    self.to, temporary, restore, temporary
                );
                RenameState::Failed(ProviderError::DataLossRisk {
                    from: self.from.clone(),
                    to: self.to.clone(),
                    temporary,
                    cause: Box::new(cause),
                })
            }
        }
    }

    /// Asks the consumer at most once per rename.
    async fn confirm_overwrite(&mut self) -> bool {
        if !self.confirmed {
            self.confirmed = self.consumer.confirm_overwrite(self.from, self.to).await;
        }
        self.confirmed
    }

    fn cancelled(&self) -> RenameState {
        info!("Overwrite of {} declined", self.to);
        RenameState::Failed(ProviderError::UserCancelled {
            operation: Operation::Rename,
            path: self.to.clone(),
        })
    }

    async fn target_exists(&mut self) -> bool {
        let request = self.channel.stat(self.to.as_str());
        interruptible(&self.teardown, request).await.is_ok()
    }

    /// Picks a sibling of the target that does not exist yet.
    async fn temporary_path(&mut self) -> Result<RemotePath, ProviderError> {
        let (Some(parent), Some(name)) = (self.to.parent(), self.to.file_name()) else {
            return Err(ProviderError::invalid_argument(
                "the root directory cannot be replaced",
            ));
        };
        let name = name.to_string();

        let mut candidate = None;
        for _ in 0..self.temp_name_attempts {
            let path = parent.join(&temporary_name_for(&name))?;
            let request = self.channel.stat(path.as_str());
            match interruptible(&self.teardown, request).await {
                Err(f) if matches!(f.code, StatusCode::NoSuchFile | StatusCode::NoSuchPath) => {
                    return Ok(path);
                }
                Ok(_) => {
                    debug!("Temporary name {} already taken", path);
                    candidate = Some(path);
                }
                Err(f) => return Err(translate(Operation::Stat, &[&path], f)),
            }
        }
        Err(ProviderError::AlreadyExists {
            operation: Operation::Rename,
            path: candidate.unwrap_or(parent),
            message: "no free temporary name".to_string(),
        })
    }

    fn rename_error(&self, failure: SftpFailure) -> ProviderError {
        translate(Operation::Rename, &[self.from, self.to], failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_target_moves_simple_to_atomic() {
        assert_eq!(
            next_tier(Tier::Simple, FailureClass::TargetExists),
            Some(Tier::AtomicRetry)
        );
    }

    #[test]
    fn unsupported_extension_moves_atomic_to_non_atomic() {
        assert_eq!(
            next_tier(Tier::AtomicRetry, FailureClass::Unsupported),
            Some(Tier::NonAtomicRetry)
        );
    }

    #[test]
    fn other_failures_are_terminal() {
        assert_eq!(next_tier(Tier::Simple, FailureClass::Terminal), None);
        assert_eq!(next_tier(Tier::Simple, FailureClass::Unsupported), None);
        assert_eq!(next_tier(Tier::AtomicRetry, FailureClass::Terminal), None);
        assert_eq!(next_tier(Tier::AtomicRetry, FailureClass::TargetExists), None);
        assert_eq!(next_tier(Tier::NonAtomicRetry, FailureClass::TargetExists), None);
    }

    #[test]
    fn status_codes_classify() {
        assert_eq!(classify(StatusCode::FileAlreadyExists), FailureClass::TargetExists);
        assert_eq!(classify(StatusCode::OpUnsupported), FailureClass::Unsupported);
        assert_eq!(classify(StatusCode::Failure), FailureClass::Ambiguous);
        assert_eq!(classify(StatusCode::PermissionDenied), FailureClass::Terminal);
        assert_eq!(classify(StatusCode::NoSuchFile), FailureClass::Terminal);
    }
}
