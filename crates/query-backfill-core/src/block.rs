//! Storage blocks: on-disk layout, metadata, and the bundled builder.
//!
//! A *block directory* is what one ingest cycle produces at its temporary
//! path:
//!
//! ```text
//! <cycle dir>/
//!   wal/                 builder-private, never merged
//!   chunks_head/         builder-private, never merged
//!   <block id>/          one sub-block per time slot
//!     meta.json
//!     chunks/000001.parquet
//! ```
//!
//! The importer only relies on `meta.json` (see [`meta::BlockMeta`]); the chunk
//! files are opaque to the rest of the pipeline.

pub mod builder;
pub mod layout;
pub mod meta;

pub use builder::{BlockBuilder, BlockSummary, BuildError, BuilderOptions, ParquetBlockBuilder};
pub use meta::{BlockMeta, BlockStats, MetaError, read_block_metas};
