//! Submit a query and wait for it to reach a terminal state.
//!
//! The remote query has no deadline: a query that stays `QUEUED` or
//! `RUNNING` keeps the caller waiting. What *is* bounded, optionally, is the
//! number of consecutive failures of the status check itself; see
//! [`PollPolicy`]. Both submission and polling stop promptly when the
//! cancellation token fires.

use std::time::Duration;

use log::{debug, info, warn};
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::{
    config::QuerySpec,
    query::service::{ExecutionHandle, QueryService, QueryState, ServiceError},
};

/// How the status of a submitted execution is polled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Fixed delay between two status checks.
    pub interval: Duration,
    /// Consecutive failed status checks tolerated before giving up.
    /// `None` retries forever.
    pub max_consecutive_errors: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_consecutive_errors: None,
        }
    }
}

/// Errors raised while submitting or waiting for a query.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueryError {
    /// The service rejected the submission.
    #[snafu(display("Query {query} was rejected by the service: {source}"))]
    Submit {
        /// Name of the query definition.
        query: String,
        /// Error reported by the service.
        source: ServiceError,
    },

    /// The execution finished in a state other than `SUCCEEDED`.
    #[snafu(display(
        "Execution {execution} ended in state {state}{}",
        reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default()
    ))]
    TerminalState {
        /// Execution id.
        execution: String,
        /// Terminal state name.
        state: String,
        /// Reason reported by the service, if any.
        reason: Option<String>,
    },

    /// The status check failed more often in a row than the policy allows.
    #[snafu(display(
        "Giving up on execution {execution} after {attempts} consecutive status check failures: {source}"
    ))]
    PollExhausted {
        /// Execution id.
        execution: String,
        /// Number of failed checks in a row.
        attempts: u32,
        /// The last error returned by the status check.
        source: ServiceError,
    },

    /// The cancellation token fired.
    #[snafu(display("Cancelled while waiting for {stage}"))]
    Cancelled {
        /// What was in flight: `submission` or `completion`.
        stage: &'static str,
    },
}

/// Drives one execution from submission to a terminal state.
pub struct QueryPoller<'a> {
    service: &'a dyn QueryService,
    policy: PollPolicy,
    cancel: &'a CancellationToken,
}

impl<'a> QueryPoller<'a> {
    /// Create a poller for `service`.
    pub fn new(
        service: &'a dyn QueryService,
        policy: PollPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            service,
            policy,
            cancel,
        }
    }

    /// Submit the query text of `spec` to its workgroup.
    pub async fn submit(&self, spec: &QuerySpec) -> Result<ExecutionHandle, QueryError> {
        let handle = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return CancelledSnafu { stage: "submission" }.fail();
            }
            res = self.service.submit(&spec.query, &spec.workgroup) => {
                res.context(SubmitSnafu { query: spec.name.clone() })?
            }
        };
        info!("Query {} submitted as execution {handle}", spec.name);
        Ok(handle)
    }

    /// Poll until `handle` reaches a terminal state.
    ///
    /// Returns `Ok(())` on `SUCCEEDED`, [`QueryError::TerminalState`] on
    /// `FAILED` / `CANCELLED`.
    pub async fn await_completion(&self, handle: &ExecutionHandle) -> Result<(), QueryError> {
        let mut consecutive_errors: u32 = 0;
        let mut last_state: Option<QueryState> = None;

        loop {
            let status = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return CancelledSnafu { stage: "completion" }.fail();
                }
                res = self.service.status(handle) => res,
            };

            match status {
                Ok(QueryState::Succeeded) => {
                    debug!("Execution {handle} succeeded");
                    return Ok(());
                }
                Ok(state @ (QueryState::Failed { .. } | QueryState::Cancelled { .. })) => {
                    let state_name = state.to_string();
                    let reason = match state {
                        QueryState::Failed { reason } | QueryState::Cancelled { reason } => reason,
                        _ => None,
                    };
                    return TerminalStateSnafu {
                        execution: handle.to_string(),
                        state: state_name,
                        reason,
                    }
                    .fail();
                }
                Ok(state) => {
                    consecutive_errors = 0;
                    if last_state.as_ref() != Some(&state) {
                        debug!("Execution {handle} is {state}");
                        last_state = Some(state);
                    }
                }
                Err(err) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    if let Some(max) = self.policy.max_consecutive_errors {
                        if consecutive_errors > max {
                            return Err(err).context(PollExhaustedSnafu {
                                execution: handle.to_string(),
                                attempts: consecutive_errors,
                            });
                        }
                    }
                    warn!(
                        "Status check for execution {handle} failed (attempt {consecutive_errors}), retrying: {err}"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return CancelledSnafu { stage: "completion" }.fail();
                }
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
        }
    }
}
