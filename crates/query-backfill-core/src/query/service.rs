//! The remote query service contract.

use std::fmt;

use async_trait::async_trait;

/// Maximum number of rows requested per result page.
pub const RESULT_PAGE_SIZE: usize = 1000;

/// Error type returned by query service implementations.
///
/// Implementations wrap whatever their transport produces; the pipeline only
/// needs to display it and attach stage context.
pub type ServiceError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Opaque identifier of one in-flight remote query.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExecutionHandle(pub String);

impl ExecutionHandle {
    /// Wrap a service-assigned execution id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw execution id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Execution state reported by the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryState {
    /// Accepted, waiting for capacity.
    Queued,
    /// Executing.
    Running,
    /// Finished; results can be read.
    Succeeded,
    /// Finished with an error.
    Failed {
        /// Reason reported by the service, if any.
        reason: Option<String>,
    },
    /// Cancelled before completion.
    Cancelled {
        /// Reason reported by the service, if any.
        reason: Option<String>,
    },
}

impl QueryState {
    /// Whether no further transitions are expected.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryState::Queued | QueryState::Running)
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryState::Queued => "QUEUED",
            QueryState::Running => "RUNNING",
            QueryState::Succeeded => "SUCCEEDED",
            QueryState::Failed { .. } => "FAILED",
            QueryState::Cancelled { .. } => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// One page of raw tabular results.
///
/// `columns` is positional and identical across every page of one query.
/// Cells are `None` when the service reported a SQL `NULL`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultPage {
    /// Column names, by position.
    pub columns: Vec<String>,
    /// Raw rows; the first page starts with a header row.
    pub rows: Vec<Vec<Option<String>>>,
    /// Token for the next page, or `None` when this is the last one.
    pub next_token: Option<String>,
}

/// A remote, asynchronous SQL execution service.
#[async_trait]
pub trait QueryService: Send + Sync {
    /// Submit `query` to `workgroup`; returns the handle of the new execution.
    async fn submit(&self, query: &str, workgroup: &str) -> Result<ExecutionHandle, ServiceError>;

    /// Fetch the current state of an execution.
    async fn status(&self, handle: &ExecutionHandle) -> Result<QueryState, ServiceError>;

    /// Fetch one page of results of a succeeded execution.
    ///
    /// `token` is `None` for the first page and the previous page's
    /// `next_token` afterwards.
    async fn results_page(
        &self,
        handle: &ExecutionHandle,
        page_size: usize,
        token: Option<&str>,
    ) -> Result<ResultPage, ServiceError>;
}
