//! Page through a succeeded execution and feed parsed records to the builder.
//!
//! The streamer is the producer side of the bounded record channel. Each
//! page is parsed and pushed as one batch; a full channel suspends the
//! streamer until the consumer catches up, which caps memory use at
//! `capacity` pages regardless of the size of the result set.
//!
//! The sender is dropped exactly once: after the last page on success, or on
//! the first error. In the error case the consumer sees an ordinary close,
//! so callers must check the streamer's result before trusting what the
//! consumer built.

use std::sync::Arc;

use log::debug;
use snafu::prelude::*;
use tokio::task::JoinHandle;

use crate::{
    parse::{ParseError, parse_page},
    query::{ExecutionHandle, QueryService, RESULT_PAGE_SIZE, ServiceError},
    record::RecordSender,
};

/// Errors raised while streaming results.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StreamError {
    /// Fetching a page failed.
    #[snafu(display("Failed to fetch result page {page} of execution {execution}: {source}"))]
    FetchPage {
        /// Execution id.
        execution: String,
        /// Zero-based page index.
        page: usize,
        /// Error reported by the service.
        source: ServiceError,
    },

    /// A page contained an unparseable row.
    #[snafu(display("Failed to parse result page {page} of execution {execution}: {source}"))]
    ParsePage {
        /// Execution id.
        execution: String,
        /// Zero-based page index.
        page: usize,
        /// The row-level parse error.
        source: ParseError,
    },

    /// The consumer dropped its receiver before the stream ended.
    #[snafu(display("Record consumer went away while streaming page {page} of execution {execution}"))]
    ConsumerGone {
        /// Execution id.
        execution: String,
        /// Zero-based page index that could not be delivered.
        page: usize,
    },
}

/// What a completed stream delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Pages fetched.
    pub pages: usize,
    /// Records pushed to the channel.
    pub records: usize,
}

/// Fetch every page of `handle`, pushing parsed records onto `tx`.
///
/// Consumes `tx`; the channel is closed when this function returns.
pub async fn stream_results(
    service: &dyn QueryService,
    handle: &ExecutionHandle,
    tx: RecordSender,
) -> Result<StreamSummary, StreamError> {
    let execution = handle.to_string();
    let mut summary = StreamSummary::default();
    let mut token: Option<String> = None;

    loop {
        let page_idx = summary.pages;
        let page = service
            .results_page(handle, RESULT_PAGE_SIZE, token.as_deref())
            .await
            .context(FetchPageSnafu {
                execution: execution.clone(),
                page: page_idx,
            })?;

        let records = parse_page(&page, page_idx == 0).context(ParsePageSnafu {
            execution: execution.clone(),
            page: page_idx,
        })?;

        summary.pages += 1;
        summary.records += records.len();
        debug!(
            "Execution {execution}: page {page_idx} carried {} rows, {} records",
            page.rows.len(),
            records.len()
        );

        if !records.is_empty() && tx.send(records).await.is_err() {
            return ConsumerGoneSnafu {
                execution,
                page: page_idx,
            }
            .fail();
        }

        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    drop(tx);
    Ok(summary)
}

/// Run [`stream_results`] as its own task.
pub fn spawn_streamer(
    service: Arc<dyn QueryService>,
    handle: ExecutionHandle,
    tx: RecordSender,
) -> JoinHandle<Result<StreamSummary, StreamError>> {
    tokio::spawn(async move { stream_results(service.as_ref(), &handle, tx).await })
}
