//! Remote query execution: the service seam and the submit/poll driver.
//!
//! - [`service`] defines [`QueryService`], the contract any remote
//!   asynchronous SQL engine has to satisfy, plus the wire-level value types
//!   ([`ExecutionHandle`], [`QueryState`], [`ResultPage`]).
//! - [`poller`] submits a query and waits for it to reach a terminal state
//!   according to a [`PollPolicy`].

pub mod poller;
pub mod service;

pub use poller::{PollPolicy, QueryError, QueryPoller};
pub use service::{
    ExecutionHandle, QueryService, QueryState, RESULT_PAGE_SIZE, ResultPage, ServiceError,
};
