//! The ingest cycle and the scheduling loop around it.
//!
//! One cycle is:
//!
//! 1. submit the query and wait for `SUCCEEDED` (on the coordinating task);
//! 2. create the bounded record channel;
//! 3. spawn the result streamer (producer) and run the block builder on a
//!    blocking thread (consumer) until the channel closes;
//! 4. inspect the block and merge it into the destination store, or discard
//!    it.
//!
//! Any failure after step 1 removes the temporary directory, so the
//! destination only ever receives blocks built from a complete result set.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use snafu::{IntoError, prelude::*};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::{
    block::{BlockBuilder, BuildError, layout::cycle_dir},
    config::QuerySpec,
    import::{self, ImportError, ImportOutcome},
    query::{QueryError, QueryPoller, QueryService},
    record::record_channel,
    schedule::{Scheduler, truncate},
    storage::{self, StorageError},
    stream::{StreamError, spawn_streamer},
};

/// Filesystem locations used by every cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelinePaths {
    /// The long-lived destination store. Must exist.
    pub dest: PathBuf,
    /// Root under which per-cycle temporary block directories are created.
    pub tmp_root: PathBuf,
}

/// One query definition bound to the service that executes it.
#[derive(Clone)]
pub struct IngestJob {
    /// Validated query definition.
    pub spec: QuerySpec,
    /// Remote service for this definition (region and credentials are
    /// per-definition).
    pub service: Arc<dyn QueryService>,
}

/// Successful result of one cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The block was merged into the destination store.
    Merged {
        /// Temporary block directory (removed by now).
        tmp_dir: PathBuf,
        /// Records streamed from the query.
        records: usize,
        /// Sub-blocks moved into the destination.
        sub_blocks: Vec<String>,
    },
    /// The block was discarded by the series guard.
    Skipped {
        /// Temporary block directory (removed by now).
        tmp_dir: PathBuf,
        /// Largest series count found.
        max_series_seen: u64,
        /// Configured limit.
        limit: u64,
    },
}

/// A failed cycle, tagged with the stage that failed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CycleError {
    /// Submission, polling or a terminal query state.
    #[snafu(display("[{query}] query stage failed: {source}"))]
    Query {
        /// Query definition name.
        query: String,
        /// Underlying error.
        source: QueryError,
    },

    /// A leftover temporary directory could not be removed.
    #[snafu(display("[{query}] could not prepare temporary directory: {source}"))]
    Prepare {
        /// Query definition name.
        query: String,
        /// Underlying error.
        source: StorageError,
    },

    /// Fetching or parsing results failed.
    #[snafu(display("[{query}] result stream failed: {source}"))]
    Stream {
        /// Query definition name.
        query: String,
        /// Underlying error.
        source: StreamError,
    },

    /// The block builder failed.
    #[snafu(display("[{query}] block build failed: {source}"))]
    Build {
        /// Query definition name.
        query: String,
        /// Underlying error.
        source: BuildError,
    },

    /// A cycle task panicked or was aborted.
    #[snafu(display("[{query}] {task} task did not complete: {source}"))]
    Join {
        /// Query definition name.
        query: String,
        /// `streamer` or `builder`.
        task: &'static str,
        /// Underlying error.
        source: JoinError,
    },

    /// Inspecting, merging or discarding the block failed.
    #[snafu(display("[{query}] import failed: {source}"))]
    Import {
        /// Query definition name.
        query: String,
        /// Underlying error.
        source: ImportError,
    },
}

impl CycleError {
    /// Whether the cycle stopped because the cancellation token fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            CycleError::Query {
                source: QueryError::Cancelled { .. },
                ..
            }
        )
    }
}

/// Drives ingest cycles for a set of query definitions.
pub struct IngestPipeline {
    jobs: Vec<IngestJob>,
    builder: Arc<dyn BlockBuilder>,
    paths: PipelinePaths,
    scheduler: Scheduler,
    fail_fast: bool,
}

impl IngestPipeline {
    /// Create a pipeline. Cycles abort on error but the loop keeps going
    /// unless [`IngestPipeline::with_fail_fast`] is set.
    pub fn new(jobs: Vec<IngestJob>, builder: Arc<dyn BlockBuilder>, paths: PipelinePaths) -> Self {
        let specs: Vec<QuerySpec> = jobs.iter().map(|j| j.spec.clone()).collect();
        Self {
            scheduler: Scheduler::new(&specs),
            jobs,
            builder,
            paths,
            fail_fast: false,
        }
    }

    /// Stop at the first failed cycle instead of logging and continuing.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// The configured jobs.
    pub fn jobs(&self) -> &[IngestJob] {
        &self.jobs
    }

    /// Run the scheduling loop until `cancel` fires (returns `Ok`) or, with
    /// fail-fast, until a cycle fails.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), CycleError> {
        loop {
            let Some(due) = self.scheduler.next_due(Utc::now()) else {
                return Ok(());
            };
            let job = &self.jobs[due.index];
            info!(
                "Next cycle: query {} in {}",
                job.spec.name,
                humantime::format_duration(due.delay)
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, leaving scheduling loop");
                    return Ok(());
                }
                _ = tokio::time::sleep(due.delay) => {}
            }

            if let Err(e) = self.run_reported(job, Utc::now(), cancel).await {
                if e.is_cancelled() {
                    return Ok(());
                }
                if self.fail_fast {
                    return Err(e);
                }
            }
        }
    }

    /// Run one cycle for every job, immediately and in configuration order.
    ///
    /// Returns the first failure, after the remaining jobs ran (or at once
    /// with fail-fast).
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<Vec<CycleOutcome>, CycleError> {
        let mut outcomes = Vec::with_capacity(self.jobs.len());
        let mut first_error = None;
        for job in &self.jobs {
            match self.run_reported(job, Utc::now(), cancel).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_cancelled() || self.fail_fast => return Err(e),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    async fn run_reported(
        &self,
        job: &IngestJob,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, CycleError> {
        let result = self.run_cycle(job, now, cancel).await;
        match &result {
            Ok(CycleOutcome::Merged {
                records, sub_blocks, ..
            }) => info!(
                "Cycle for query {} finished: {records} records, {} sub-block(s) merged",
                job.spec.name,
                sub_blocks.len()
            ),
            Ok(CycleOutcome::Skipped {
                tmp_dir,
                max_series_seen,
                limit,
            }) => info!(
                "Cycle for query {} skipped: {max_series_seen} series exceed the limit of {limit} (block {})",
                job.spec.name,
                tmp_dir.display()
            ),
            Err(e) if e.is_cancelled() => info!("Cycle for query {} cancelled", job.spec.name),
            Err(e) => error!("Cycle aborted: {e}"),
        }
        result
    }

    /// Run a single ingest cycle for `job`. `now` is the cycle's start time;
    /// its truncation to the query interval names the temporary directory.
    pub async fn run_cycle(
        &self,
        job: &IngestJob,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, CycleError> {
        let spec = &job.spec;
        let query = spec.name.clone();
        let tmp_dir = cycle_dir(&self.paths.tmp_root, &spec.name, truncate(now, spec.interval));
        info!("Starting cycle for query {query} (block dir {})", tmp_dir.display());

        let poller = QueryPoller::new(job.service.as_ref(), spec.poll, cancel);
        let handle = poller.submit(spec).await.context(QuerySnafu {
            query: query.clone(),
        })?;
        poller.await_completion(&handle).await.context(QuerySnafu {
            query: query.clone(),
        })?;

        if storage::exists(&tmp_dir).await.unwrap_or(false) {
            warn!("Removing leftover block dir {}", tmp_dir.display());
        }
        storage::remove_tree(&tmp_dir).await.context(PrepareSnafu {
            query: query.clone(),
        })?;

        let (tx, rx) = record_channel(self.builder.channel_capacity());
        let streamer = spawn_streamer(job.service.clone(), handle, tx);
        let builder = self.builder.clone();
        let build_dir = tmp_dir.clone();
        let build = tokio::task::spawn_blocking(move || builder.build(&build_dir, rx));

        let (streamed, built) = tokio::join!(streamer, build);

        // A failed builder drops its receiver, which the streamer reports as
        // a lost consumer; the builder's error is the cause.
        let summary = match (streamed, built) {
            (_, Err(source)) => Err(JoinSnafu {
                query: query.clone(),
                task: "builder",
            }
            .into_error(source)),
            (_, Ok(Err(source))) => Err(BuildSnafu {
                query: query.clone(),
            }
            .into_error(source)),
            (Err(source), Ok(Ok(_))) => Err(JoinSnafu {
                query: query.clone(),
                task: "streamer",
            }
            .into_error(source)),
            (Ok(Err(source)), Ok(Ok(_))) => Err(StreamSnafu {
                query: query.clone(),
            }
            .into_error(source)),
            (Ok(Ok(stream)), Ok(Ok(block))) => {
                debug!(
                    "Query {query}: {} pages streamed, {} records built",
                    stream.pages, block.records
                );
                Ok(block)
            }
        };
        let summary = match summary {
            Ok(summary) => summary,
            Err(e) => {
                discard_quietly(&tmp_dir).await;
                return Err(e);
            }
        };

        // Sub-blocks not merged by a failed import are dropped with the dir.
        let outcome = match import::import_block(&tmp_dir, &self.paths.dest, spec.max_series).await
        {
            Ok(outcome) => outcome,
            Err(source) => {
                discard_quietly(&tmp_dir).await;
                return Err(ImportSnafu { query }.into_error(source));
            }
        };

        Ok(match outcome {
            ImportOutcome::Merged { moved } => CycleOutcome::Merged {
                tmp_dir,
                records: summary.records,
                sub_blocks: moved,
            },
            ImportOutcome::Skipped {
                max_series_seen,
                limit,
            } => CycleOutcome::Skipped {
                tmp_dir,
                max_series_seen,
                limit,
            },
        })
    }
}

async fn discard_quietly(dir: &Path) {
    if let Err(e) = import::discard_block(dir).await {
        warn!("Failed to remove block dir {}: {e}", dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::{BuilderOptions, ParquetBlockBuilder},
        query::QueryState,
        test_util::{ScriptedService, TestResult, page, query_spec},
    };
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn paths(tmp: &TempDir) -> std::io::Result<PipelinePaths> {
        let dest = tmp.path().join("store");
        std::fs::create_dir_all(&dest)?;
        Ok(PipelinePaths {
            dest,
            tmp_root: tmp.path().join("work"),
        })
    }

    fn pipeline(service: Arc<ScriptedService>, spec: QuerySpec, paths: PipelinePaths) -> IngestPipeline {
        IngestPipeline::new(
            vec![IngestJob { spec, service }],
            Arc::new(ParquetBlockBuilder::new(BuilderOptions::default())),
            paths,
        )
    }

    fn cycle_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 5)
            .single()
            .expect("valid time")
    }

    fn store_entries(dir: &Path) -> std::io::Result<Vec<String>> {
        let mut names: Vec<String> = std::fs::read_dir(dir)?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<_, _>>()?;
        names.sort();
        Ok(names)
    }

    fn rows() -> Vec<crate::query::ResultPage> {
        vec![page(
            &["timestamp", "value", "host"],
            &[
                &["timestamp", "value", "host"],
                &["1709287200000", "1.5", "a"],
                &["1709287260000", "2.5", "b"],
            ],
        )]
    }

    #[tokio::test]
    async fn merges_block_and_names_tmp_dir_after_slot() -> TestResult {
        let tmp = TempDir::new()?;
        let paths = paths(&tmp)?;
        let service = Arc::new(ScriptedService::new().with_pages(rows()));
        let p = pipeline(service, query_spec("cpu"), paths.clone());

        let outcome = p
            .run_cycle(&p.jobs()[0], cycle_start(), &CancellationToken::new())
            .await?;

        let CycleOutcome::Merged {
            tmp_dir,
            records,
            sub_blocks,
        } = outcome
        else {
            panic!("expected a merge, got {outcome:?}");
        };
        assert_eq!(tmp_dir, paths.tmp_root.join("cpu_20240301_100000"));
        assert_eq!(records, 2);
        assert_eq!(sub_blocks.len(), 1);
        assert_eq!(store_entries(&paths.dest)?, sub_blocks);
        assert!(!tmp_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn leftover_tmp_dir_is_replaced() -> TestResult {
        let tmp = TempDir::new()?;
        let paths = paths(&tmp)?;
        let stale = paths.tmp_root.join("cpu_20240301_100000").join("stale-block");
        std::fs::create_dir_all(&stale)?;
        let service = Arc::new(ScriptedService::new().with_pages(rows()));
        let p = pipeline(service, query_spec("cpu"), paths.clone());

        p.run_cycle(&p.jobs()[0], cycle_start(), &CancellationToken::new())
            .await?;

        assert!(!store_entries(&paths.dest)?.contains(&"stale-block".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn parse_error_discards_the_block() -> TestResult {
        let tmp = TempDir::new()?;
        let paths = paths(&tmp)?;
        let mut pages = rows();
        pages[0].rows[2][1] = Some("NaN?".to_string());
        let service = Arc::new(ScriptedService::new().with_pages(pages));
        let p = pipeline(service, query_spec("cpu"), paths.clone());

        let err = p
            .run_cycle(&p.jobs()[0], cycle_start(), &CancellationToken::new())
            .await
            .expect_err("parse error");

        assert!(matches!(err, CycleError::Stream { .. }), "{err}");
        assert!(store_entries(&paths.dest)?.is_empty());
        assert!(!paths.tmp_root.join("cpu_20240301_100000").exists());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_before_submission() -> TestResult {
        let tmp = TempDir::new()?;
        let service = Arc::new(ScriptedService::new());
        let p = pipeline(service.clone(), query_spec("cpu"), paths(&tmp)?);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = p
            .run_cycle(&p.jobs()[0], cycle_start(), &cancel)
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(service.submit_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn run_once_keeps_going_unless_fail_fast() -> TestResult {
        let tmp = TempDir::new()?;
        let paths = paths(&tmp)?;
        let failing: Arc<dyn QueryService> = Arc::new(
            ScriptedService::new().with_states(vec![Ok(QueryState::Failed { reason: None })]),
        );
        let healthy = Arc::new(ScriptedService::new().with_pages(rows()));
        let jobs = vec![
            IngestJob {
                spec: query_spec("broken"),
                service: failing,
            },
            IngestJob {
                spec: query_spec("cpu"),
                service: healthy.clone(),
            },
        ];
        let builder: Arc<dyn BlockBuilder> = Arc::new(ParquetBlockBuilder::default());

        let p = IngestPipeline::new(jobs.clone(), builder.clone(), paths.clone());
        let err = p
            .run_once(&CancellationToken::new())
            .await
            .expect_err("first job fails");
        assert!(matches!(err, CycleError::Query { ref query, .. } if query == "broken"));
        assert_eq!(healthy.submit_calls(), 1);
        assert_eq!(store_entries(&paths.dest)?.len(), 1);

        let p = IngestPipeline::new(jobs, builder, paths).with_fail_fast(true);
        assert!(p.run_once(&CancellationToken::new()).await.is_err());
        assert_eq!(healthy.submit_calls(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_when_cancelled_while_sleeping() {
        let tmp = TempDir::new().expect("tempdir");
        let service = Arc::new(ScriptedService::new());
        let p = pipeline(service, query_spec("cpu"), paths(&tmp).expect("paths"));
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(2 * 3600)).await;
            stopper.cancel();
        });

        p.run(&cancel).await.expect("clean shutdown");
        assert!(cancel.is_cancelled());
    }
}
