use crate::config::WaitConfig;
use crate::runner::duration_to_millis;
use crate::stack::{StackBackend, StackError, StackStatus};

use backoff::backoff::Backoff;

use std::time::Instant;

/// The kind of operation we're waiting on, which determines which terminal states count as
/// success
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum WaitFor {
    Create,
    Update,
    Delete,
}

impl WaitFor {
    fn check(self, status: &StackStatus) -> Progress {
        use StackStatus::*;
        match (self, status) {
            (WaitFor::Create, CreateComplete) => Progress::Done,
            (WaitFor::Update, UpdateComplete) => Progress::Done,
            (WaitFor::Delete, DeleteComplete) => Progress::Done,
            (_, s) if s.is_in_progress() => Progress::Waiting,
            _ => Progress::Failed,
        }
    }
}

enum Progress {
    Done,
    Waiting,
    Failed,
}

pub(crate) fn new_backoff(config: &WaitConfig) -> backoff::ExponentialBackoff {
    let fixed = config.initial_interval >= config.max_interval;
    backoff::ExponentialBackoff {
        initial_interval: config.initial_interval,
        current_interval: config.initial_interval,
        max_interval: config.max_interval,
        multiplier: if fixed { 1.0 } else { 1.5 },
        randomization_factor: if fixed { 0.0 } else { 0.2 },
        max_elapsed_time: config.timeout,
        start_time: Instant::now(),
        ..Default::default()
    }
}

/// Polls the backend until the stack reaches a terminal state for the given operation. A stack
/// that has disappeared counts as deleted, and as a failure for anything else.
pub(crate) async fn wait_for_stack(
    backend: &dyn StackBackend,
    stack_name: &str,
    wait_for: WaitFor,
    config: &WaitConfig,
) -> Result<(), StackError> {
    let start_time = Instant::now();
    let mut backoff = new_backoff(config);

    loop {
        let stack = backend
            .describe_stack(stack_name)
            .await
            .map_err(|e| StackError::backend("describe stack", stack_name, e))?;

        let progress = match stack.as_ref() {
            None if wait_for == WaitFor::Delete => Progress::Done,
            None => return Err(StackError::NotFound(stack_name.to_owned())),
            Some(stack) => wait_for.check(&stack.status),
        };

        match progress {
            Progress::Done => {
                log::debug!(
                    "stack {:?} reached terminal state after {}ms",
                    stack_name,
                    duration_to_millis(start_time.elapsed())
                );
                return Ok(());
            }
            Progress::Failed => {
                // progress can only be Failed when the stack exists
                let (status, reason) = stack
                    .map(|s| (s.status, s.status_reason))
                    .unwrap_or((StackStatus::DeleteComplete, None));
                return Err(StackError::FailedState {
                    stack: stack_name.to_owned(),
                    status,
                    reason,
                });
            }
            Progress::Waiting => match backoff.next_backoff() {
                Some(delay) => {
                    log::trace!(
                        "waiting {}ms for stack {:?} to leave in progress state",
                        duration_to_millis(delay),
                        stack_name
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(StackError::Timeout {
                        stack: stack_name.to_owned(),
                        elapsed: start_time.elapsed(),
                    });
                }
            },
        }
    }
}
