use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::TimeDelta;

use crate::config::QuerySpec;
use crate::query::{
    ExecutionHandle, PollPolicy, QueryService, QueryState, ResultPage, ServiceError,
};

pub(crate) type TestResult = Result<(), Box<dyn std::error::Error>>;

pub(crate) fn query_spec(name: &str) -> QuerySpec {
    QuerySpec {
        name: name.to_string(),
        region: "us-east-1".to_string(),
        assume_role_arn: None,
        query: "SELECT timestamp, value, host FROM metrics".to_string(),
        workgroup: "primary".to_string(),
        interval: TimeDelta::hours(1),
        offset: TimeDelta::zero(),
        max_series: None,
        poll: PollPolicy::default(),
    }
}

pub(crate) fn page(columns: &[&str], rows: &[&[&str]]) -> ResultPage {
    ResultPage {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows: rows
            .iter()
            .map(|r| r.iter().map(|c| Some(c.to_string())).collect())
            .collect(),
        next_token: None,
    }
}

/// In-memory query service replaying a fixed script.
///
/// States are consumed in order; the last one repeats once the script runs
/// out. Pages are served in order, with `next_token` set to the index of the
/// following page.
pub(crate) struct ScriptedService {
    submit_error: Option<String>,
    states: Mutex<VecDeque<Result<QueryState, String>>>,
    last_state: Mutex<Result<QueryState, String>>,
    pages: Vec<ResultPage>,
    failing_page: Option<usize>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
    page_calls: AtomicUsize,
}

impl ScriptedService {
    pub(crate) fn new() -> Self {
        Self {
            submit_error: None,
            states: Mutex::new(VecDeque::new()),
            last_state: Mutex::new(Ok(QueryState::Succeeded)),
            pages: Vec::new(),
            failing_page: None,
            submit_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            page_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_states(self, states: Vec<Result<QueryState, String>>) -> Self {
        *self.states.lock().unwrap() = states.into();
        self
    }

    pub(crate) fn with_pages(mut self, pages: Vec<ResultPage>) -> Self {
        self.pages = pages;
        self
    }

    pub(crate) fn reject_submit(mut self, msg: &str) -> Self {
        self.submit_error = Some(msg.to_string());
        self
    }

    pub(crate) fn fail_page(mut self, idx: usize) -> Self {
        self.failing_page = Some(idx);
        self
    }

    pub(crate) fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryService for ScriptedService {
    async fn submit(&self, _query: &str, _workgroup: &str) -> Result<ExecutionHandle, ServiceError> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst);
        match &self.submit_error {
            Some(msg) => Err(msg.clone().into()),
            None => Ok(ExecutionHandle::new(format!("exec-{n}"))),
        }
    }

    async fn status(&self, _handle: &ExecutionHandle) -> Result<QueryState, ServiceError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.states.lock().unwrap().pop_front();
        let mut last = self.last_state.lock().unwrap();
        if let Some(state) = next {
            *last = state;
        }
        last.clone().map_err(Into::into)
    }

    async fn results_page(
        &self,
        _handle: &ExecutionHandle,
        _page_size: usize,
        token: Option<&str>,
    ) -> Result<ResultPage, ServiceError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let idx = match token {
            None => 0,
            Some(t) => t.parse::<usize>()?,
        };
        if self.failing_page == Some(idx) {
            return Err(format!("page {idx} unavailable").into());
        }
        let mut page = self.pages.get(idx).cloned().unwrap_or_default();
        page.next_token = (idx + 1 < self.pages.len()).then(|| (idx + 1).to_string());
        Ok(page)
    }
}
