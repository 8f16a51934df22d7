#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::TimeDelta;
use query_backfill_core::{
    ExecutionHandle, QueryService, QuerySpec, QueryState, ResultPage, ServiceError,
    TimeSeriesRecord,
    block::{BlockBuilder, BlockSummary, BuildError, BuilderOptions, ParquetBlockBuilder},
    pipeline::PipelinePaths,
    query::PollPolicy,
    record::RecordReceiver,
};
use tempfile::TempDir;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub fn spec(name: &str, max_series: Option<u64>) -> QuerySpec {
    QuerySpec {
        name: name.to_string(),
        region: "eu-west-1".to_string(),
        assume_role_arn: None,
        query: "SELECT * FROM samples".to_string(),
        workgroup: "backfill".to_string(),
        interval: TimeDelta::hours(1),
        offset: TimeDelta::zero(),
        max_series,
        poll: PollPolicy {
            interval: std::time::Duration::from_millis(1),
            max_consecutive_errors: Some(3),
        },
    }
}

pub fn text_page(columns: &[&str], rows: &[&[&str]], next: Option<&str>) -> ResultPage {
    ResultPage {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows: rows
            .iter()
            .map(|r| r.iter().map(|c| Some(c.to_string())).collect())
            .collect(),
        next_token: next.map(str::to_string),
    }
}

/// Two pages: a header plus two rows, then three rows. Five hosts.
pub fn two_pages() -> Vec<ResultPage> {
    let cols = ["timestamp", "value", "host"];
    vec![
        text_page(
            &cols,
            &[
                &["timestamp", "value", "host"],
                &["1700000000000", "1", "h1"],
                &["1700000001000", "2", "h2"],
            ],
            Some("p1"),
        ),
        text_page(
            &cols,
            &[
                &["1700000002000", "3", "h3"],
                &["1700000003000", "4", "h4"],
                &["1700000004000", "5", "h5"],
            ],
            None,
        ),
    ]
}

/// Query service answering from a fixed state and page list.
pub struct FakeService {
    state: QueryState,
    pages: Vec<ResultPage>,
    page_calls: AtomicUsize,
    tokens: Mutex<Vec<Option<String>>>,
}

impl FakeService {
    pub fn new(state: QueryState, pages: Vec<ResultPage>) -> Arc<Self> {
        Arc::new(Self {
            state,
            pages,
            page_calls: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
        })
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryService for FakeService {
    async fn submit(&self, _query: &str, _workgroup: &str) -> Result<ExecutionHandle, ServiceError> {
        Ok(ExecutionHandle::new("exec-1"))
    }

    async fn status(&self, _handle: &ExecutionHandle) -> Result<QueryState, ServiceError> {
        Ok(self.state.clone())
    }

    async fn results_page(
        &self,
        _handle: &ExecutionHandle,
        _page_size: usize,
        token: Option<&str>,
    ) -> Result<ResultPage, ServiceError> {
        let idx = self.page_calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(token.map(str::to_string));
        self.pages
            .get(idx)
            .cloned()
            .ok_or_else(|| format!("no page {idx}").into())
    }
}

/// Builder that records every batch it receives, then delegates to the
/// Parquet builder with the same records.
pub struct RecordingBuilder {
    inner: ParquetBlockBuilder,
    seen: Mutex<Vec<Vec<TimeSeriesRecord>>>,
    capacity: usize,
}

impl RecordingBuilder {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: ParquetBlockBuilder::new(BuilderOptions::default()),
            seen: Mutex::new(Vec::new()),
            capacity,
        })
    }

    pub fn batches(&self) -> Vec<Vec<TimeSeriesRecord>> {
        self.seen.lock().unwrap().clone()
    }
}

impl BlockBuilder for RecordingBuilder {
    fn channel_capacity(&self) -> usize {
        self.capacity
    }

    fn build(&self, dir: &Path, mut records: RecordReceiver) -> Result<BlockSummary, BuildError> {
        let mut received = Vec::new();
        while let Some(batch) = records.blocking_recv() {
            received.push(batch);
        }
        let (tx, rx) = tokio::sync::mpsc::channel(received.len().max(1));
        for batch in &received {
            // Sized to hold every batch, so this never fails.
            let _ = tx.try_send(batch.clone());
        }
        drop(tx);
        *self.seen.lock().unwrap() = received;
        self.inner.build(dir, rx)
    }
}

pub fn store(tmp: &TempDir) -> std::io::Result<PipelinePaths> {
    let dest = tmp.path().join("tsdb");
    std::fs::create_dir_all(&dest)?;
    Ok(PipelinePaths {
        dest,
        tmp_root: tmp.path().join("tsdb-tmp"),
    })
}

pub fn entries(dir: &Path) -> std::io::Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<Result<_, _>>()?;
    names.sort();
    Ok(names)
}
