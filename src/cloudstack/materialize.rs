//! Post-create visibility polling.
//!
//! A new instance is looked up directly until it appears or the deadline
//! passes. After the deadline the provider job is awaited and one final
//! lookup decides the outcome. Sleeps go through a [`Clock`] so tests run
//! without wall-clock delay, and every wait honours a [`Cancellation`].

use std::fmt;
use std::future::{Future, pending};
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::model::VirtualMachineRecord;

use super::response::ResponseDocument;
use super::types::InstanceId;
use super::{CloudStackCompute, CloudStackError};

const LAUNCH_JOB_LABEL: &str = "Launch Server";
const VISIBILITY_WAIT: &str = "instance visibility";

/// Future returned by [`Clock::sleep`].
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Time source for polling loops.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Completes after `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> SleepFuture<'_>;
}

/// Wall clock backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Receiving side of a cancellation signal.
#[derive(Clone, Debug)]
pub struct Cancellation {
    receiver: watch::Receiver<bool>,
}

/// Sending side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl Cancellation {
    /// Creates a linked handle and token.
    #[must_use]
    pub fn pair() -> (CancelHandle, Self) {
        let (sender, receiver) = watch::channel(false);
        (CancelHandle { sender }, Self { receiver })
    }

    /// A token that is never cancelled.
    #[must_use]
    pub fn never() -> Self {
        let (_, token) = Self::pair();
        token
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes once cancellation is requested. Pends forever when the
    /// handle was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                pending::<()>().await;
            }
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}

impl CancelHandle {
    /// Requests cancellation of every linked wait.
    pub fn cancel(&self) {
        self.sender.send_modify(|cancelled| *cancelled = true);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Polling,
    AwaitingJob,
    FinalCheck,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Polling => "polling",
            Self::AwaitingJob => "awaiting-job",
            Self::FinalCheck => "final-check",
        })
    }
}

impl CloudStackCompute {
    async fn pause_for(&self, duration: Duration, action: &str) -> Result<(), CloudStackError> {
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(CloudStackError::Cancelled {
                action: action.to_owned(),
            }),
            () = self.clock.sleep(duration) => Ok(()),
        }
    }

    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub(super) async fn materialize(
        &self,
        response: &ResponseDocument,
        instance_id: &InstanceId,
    ) -> Result<VirtualMachineRecord, CloudStackError> {
        let deadline = self.clock.now() + self.settings.timeout;
        let mut phase = Phase::Polling;
        loop {
            phase = match phase {
                Phase::Polling if self.clock.now() >= deadline => Phase::AwaitingJob,
                Phase::Polling => {
                    match self.fetch_instance(instance_id.as_str()).await {
                        Ok(Some(record)) => {
                            info!(%phase, "instance is visible");
                            return Ok(record);
                        }
                        Ok(None) => {
                            self.pause_for(self.settings.poll_interval, VISIBILITY_WAIT)
                                .await?;
                        }
                        Err(err) => {
                            warn!(error = %err, "instance lookup failed; backing off");
                            self.pause_for(self.settings.error_backoff, VISIBILITY_WAIT)
                                .await?;
                        }
                    }
                    Phase::Polling
                }
                Phase::AwaitingJob => {
                    tokio::select! {
                        biased;
                        () = self.cancellation.cancelled() => {
                            return Err(CloudStackError::Cancelled {
                                action: String::from(LAUNCH_JOB_LABEL),
                            });
                        }
                        outcome = self
                            .collaborators
                            .jobs
                            .await_completion(response, LAUNCH_JOB_LABEL) => outcome?,
                    }
                    Phase::FinalCheck
                }
                Phase::FinalCheck => {
                    let record = self.fetch_instance(instance_id.as_str()).await?;
                    return record.ok_or_else(|| CloudStackError::InstanceNotFound {
                        instance_id: instance_id.to_string(),
                    });
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let (handle, token) = Cancellation::pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn never_token_does_not_resolve() {
        let token = Cancellation::never();
        let outcome = tokio::time::timeout(Duration::from_millis(10), token.cancelled()).await;
        assert!(outcome.is_err());
    }

    #[test]
    fn phases_render_as_kebab_case() {
        assert_eq!(Phase::AwaitingJob.to_string(), "awaiting-job");
    }
}
