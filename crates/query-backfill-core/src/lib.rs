//! Core engine for the scheduled query backfill pipeline.
//!
//! This crate pulls time-series rows out of a remote, asynchronous SQL query
//! service and lands them in a block-structured time-series store:
//!
//! - Clock-aligned scheduling of ingest cycles (`schedule` module).
//! - Query submission and status polling against a pluggable
//!   [`query::QueryService`] (`query` module).
//! - Paginated streaming of results through a bounded channel (`stream`
//!   module), parsed row by row into [`record::TimeSeriesRecord`]s (`parse`
//!   module).
//! - Construction of on-disk blocks from that channel (`block` module).
//! - The safety-gated merge of a freshly built block into the destination
//!   store (`import` module).
//! - The cycle driver that ties everything together (`pipeline` module).
//!
//! Binaries (for example, the Athena-backed CLI) depend on this crate and
//! supply a concrete query service.
#![deny(missing_docs)]

pub mod block;
pub mod config;
pub mod import;
pub mod parse;
pub mod pipeline;
pub mod query;
pub mod record;
pub mod schedule;
pub mod storage;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_util;

pub use block::{BlockBuilder, BuilderOptions, ParquetBlockBuilder};
pub use config::{BackfillConfig, ConfigError, QuerySpec};
pub use import::{ImportDecision, ImportError, ImportOutcome};
pub use pipeline::{CycleError, CycleOutcome, IngestJob, IngestPipeline, PipelinePaths};
pub use query::{ExecutionHandle, QueryService, QueryState, ResultPage, ServiceError};
pub use record::TimeSeriesRecord;
