//! Build a block directory from the record channel.
//!
//! [`BlockBuilder`] is the seam between the pipeline and whatever produces
//! the on-disk block. The bundled [`ParquetBlockBuilder`] works in two phases:
//!
//! 1. **Ingest.** Records are drained from the channel on the calling
//!    (blocking) thread and routed to a *head* per time slot
//!    (`timestamp div block_duration`). A head buffers up to
//!    `flush_threshold` records and then appends them as one row group to its
//!    current chunk under `chunks_head/<slot>/`, rolling to a fresh chunk
//!    file once `max_samples_per_writer` samples went into the current one.
//! 2. **Finalise.** Once the channel closes, heads are turned into sub-blocks
//!    in parallel on a rayon pool of `concurrency` threads: chunk files move
//!    into `<block id>/chunks/` and `meta.json` is written atomically, last.
//!
//! Timestamps are taken as epoch milliseconds.

use std::{
    collections::{BTreeMap, HashSet},
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::{Float64Builder, StringBuilder, TimestampMillisecondBuilder},
    datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit},
    error::ArrowError,
    record_batch::RecordBatch,
};
use log::{debug, info};
use parquet::{arrow::ArrowWriter, errors::ParquetError, file::properties::WriterProperties};
use rayon::prelude::*;
use snafu::prelude::*;
use uuid::Uuid;

use crate::{
    block::{
        layout::{CHUNKS_DIR_NAME, CHUNKS_HEAD_DIR_NAME, META_FILE_NAME, WAL_DIR_NAME, chunk_file_name},
        meta::{BlockMeta, BlockStats, META_VERSION},
    },
    record::{RecordReceiver, TimeSeriesRecord},
    storage::{
        StorageError, create_dir_all_blocking, remove_tree_blocking, rename_blocking,
        write_atomic_blocking,
    },
};

/// Tunables of the block builder and of the channel feeding it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuilderOptions {
    /// Time span covered by one sub-block, in milliseconds. Default: 2 hours.
    pub block_duration_ms: i64,
    /// Samples written to one chunk file before rolling to the next.
    /// Default: 100 000 000.
    pub max_samples_per_writer: u64,
    /// Records buffered per head before a row group is written. Default: 1000.
    pub flush_threshold: usize,
    /// Threads used to finalise sub-blocks. Default: 32.
    pub concurrency: usize,
    /// Capacity of the record channel, in pages. Default: 128.
    pub channel_capacity: usize,
    /// Expected number of records per cycle; only used to size buffers.
    /// Default: 20 000.
    pub expected_records: usize,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            block_duration_ms: 2 * 60 * 60 * 1000,
            max_samples_per_writer: 100_000_000,
            flush_threshold: 1_000,
            concurrency: 32,
            channel_capacity: 128,
            expected_records: 20_000,
        }
    }
}

/// Errors raised while building a block.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BuildError {
    /// Filesystem failure.
    #[snafu(display("Block storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        source: StorageError,
    },

    /// Creating a chunk file failed.
    #[snafu(display("Failed to create chunk {path}: {source}"))]
    CreateChunk {
        /// Chunk path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Writing a chunk failed.
    #[snafu(display("Failed to write chunk {path}: {source}"))]
    WriteChunk {
        /// Chunk path.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Assembling an Arrow batch failed.
    #[snafu(display("Failed to assemble record batch: {source}"))]
    Batch {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Serialising `meta.json` failed.
    #[snafu(display("Failed to encode block metadata for {path}: {source}"))]
    EncodeMeta {
        /// Sub-block directory.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// The finalisation thread pool could not be started.
    #[snafu(display("Failed to start finalisation pool: {source}"))]
    ThreadPool {
        /// Underlying rayon error.
        source: rayon::ThreadPoolBuildError,
    },
}

/// What a finished build produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockSummary {
    /// Metadata of every sub-block written, ordered by time slot.
    pub blocks: Vec<BlockMeta>,
    /// Records consumed from the channel.
    pub records: usize,
}

impl BlockSummary {
    /// Largest series count over all sub-blocks.
    pub fn max_series(&self) -> u64 {
        self.blocks
            .iter()
            .map(|b| b.stats.num_series)
            .max()
            .unwrap_or(0)
    }
}

/// Produces a block directory from a stream of records.
pub trait BlockBuilder: Send + Sync {
    /// Capacity of the record channel feeding [`BlockBuilder::build`], in pages.
    fn channel_capacity(&self) -> usize;

    /// Drain `records` until the channel closes and leave a complete block
    /// directory at `dir`.
    ///
    /// Runs on a blocking thread: implementations receive with
    /// [`tokio::sync::mpsc::Receiver::blocking_recv`]. A channel closed
    /// without any record is a valid, empty result.
    fn build(&self, dir: &Path, records: RecordReceiver) -> Result<BlockSummary, BuildError>;
}

/// [`BlockBuilder`] writing Arrow/Parquet chunks.
#[derive(Clone, Debug, Default)]
pub struct ParquetBlockBuilder {
    options: BuilderOptions,
}

impl ParquetBlockBuilder {
    /// Create a builder with the given tunables.
    pub fn new(options: BuilderOptions) -> Self {
        Self { options }
    }

    /// The tunables in use.
    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }
}

impl BlockBuilder for ParquetBlockBuilder {
    fn channel_capacity(&self) -> usize {
        self.options.channel_capacity
    }

    fn build(&self, dir: &Path, mut records: RecordReceiver) -> Result<BlockSummary, BuildError> {
        let opts = &self.options;
        let block_duration = opts.block_duration_ms.max(1);

        create_dir_all_blocking(&dir.join(WAL_DIR_NAME)).context(StorageSnafu)?;
        let head_root = dir.join(CHUNKS_HEAD_DIR_NAME);
        create_dir_all_blocking(&head_root).context(StorageSnafu)?;

        let schema = chunk_schema();
        let mut heads: BTreeMap<i64, Head> = BTreeMap::new();
        let mut received = 0usize;

        while let Some(page) = records.blocking_recv() {
            received += page.len();
            for record in page {
                let slot = record.timestamp.div_euclid(block_duration);
                let head = heads.entry(slot).or_insert_with(|| {
                    Head::new(head_root.join(slot.to_string()), schema.clone(), opts)
                });
                head.append(record)?;
            }
        }
        debug!(
            "Channel closed after {received} records; finalising {} heads under {}",
            heads.len(),
            dir.display()
        );

        let blocks = if heads.is_empty() {
            Vec::new()
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(opts.concurrency.clamp(1, heads.len()))
                .build()
                .context(ThreadPoolSnafu)?;
            pool.install(|| {
                heads
                    .into_par_iter()
                    .map(|(_, head)| head.finish(dir))
                    .collect::<Result<Vec<_>, _>>()
            })?
        };

        let summary = BlockSummary {
            blocks,
            records: received,
        };
        info!(
            "Built {} sub-block(s) from {} records at {} (max series per block: {})",
            summary.blocks.len(),
            summary.records,
            dir.display(),
            summary.max_series()
        );
        Ok(summary)
    }
}

fn chunk_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Millisecond, None),
            false,
        ),
        Field::new("value", DataType::Float64, false),
        Field::new("series", DataType::Utf8, false),
    ]))
}

struct ChunkWriter {
    path: PathBuf,
    writer: ArrowWriter<File>,
    samples: u64,
}

/// In-progress data of one time slot.
struct Head {
    dir: PathBuf,
    schema: SchemaRef,
    flush_threshold: usize,
    max_samples_per_writer: u64,
    buffer: Vec<(TimeSeriesRecord, String)>,
    current: Option<ChunkWriter>,
    closed_chunks: Vec<PathBuf>,
    series: HashSet<String>,
    min_time: i64,
    max_time: i64,
    samples: u64,
}

impl Head {
    fn new(dir: PathBuf, schema: SchemaRef, opts: &BuilderOptions) -> Self {
        let flush_threshold = opts.flush_threshold.max(1);
        Self {
            dir,
            schema,
            flush_threshold,
            max_samples_per_writer: opts.max_samples_per_writer.max(1),
            buffer: Vec::with_capacity(flush_threshold.min(opts.expected_records.max(1))),
            current: None,
            closed_chunks: Vec::new(),
            series: HashSet::new(),
            min_time: i64::MAX,
            max_time: i64::MIN,
            samples: 0,
        }
    }

    fn append(&mut self, record: TimeSeriesRecord) -> Result<(), BuildError> {
        let key = record.series_key();
        if !self.series.contains(&key) {
            self.series.insert(key.clone());
        }
        self.min_time = self.min_time.min(record.timestamp);
        self.max_time = self.max_time.max(record.timestamp);
        self.samples += 1;
        self.buffer.push((record, key));

        if self.buffer.len() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BuildError> {
        while !self.buffer.is_empty() {
            let full = self
                .current
                .as_ref()
                .is_some_and(|c| c.samples >= self.max_samples_per_writer);
            if full {
                self.close_current()?;
            }
            if self.current.is_none() {
                self.open_chunk()?;
            }

            let written = self.current.as_ref().map_or(0, |c| c.samples);
            let room = self.max_samples_per_writer.saturating_sub(written);
            let n = usize::try_from(room)
                .unwrap_or(usize::MAX)
                .min(self.buffer.len());
            let batch = self.take_batch(n)?;
            if let Some(chunk) = self.current.as_mut() {
                chunk.writer.write(&batch).context(WriteChunkSnafu {
                    path: chunk.path.display().to_string(),
                })?;
                chunk.samples += batch.num_rows() as u64;
            }
        }
        Ok(())
    }

    /// Drain the first `n` buffered records into one batch.
    fn take_batch(&mut self, n: usize) -> Result<RecordBatch, BuildError> {
        let mut ts = TimestampMillisecondBuilder::with_capacity(n);
        let mut values = Float64Builder::with_capacity(n);
        let mut series =
            StringBuilder::with_capacity(n, self.buffer[..n].iter().map(|(_, k)| k.len()).sum());

        for (record, key) in self.buffer.drain(..n) {
            ts.append_value(record.timestamp);
            values.append_value(record.value);
            series.append_value(key);
        }

        RecordBatch::try_new(
            self.schema.clone(),
            vec![
                Arc::new(ts.finish()),
                Arc::new(values.finish()),
                Arc::new(series.finish()),
            ],
        )
        .context(BatchSnafu)
    }

    fn open_chunk(&mut self) -> Result<(), BuildError> {
        create_dir_all_blocking(&self.dir).context(StorageSnafu)?;
        let seq = self.closed_chunks.len() + 1;
        let path = self.dir.join(chunk_file_name(seq));
        let file = File::create(&path).context(CreateChunkSnafu {
            path: path.display().to_string(),
        })?;
        let props = WriterProperties::builder().build();
        let writer = ArrowWriter::try_new(file, self.schema.clone(), Some(props)).context(
            WriteChunkSnafu {
                path: path.display().to_string(),
            },
        )?;
        self.current = Some(ChunkWriter {
            path,
            writer,
            samples: 0,
        });
        Ok(())
    }

    fn close_current(&mut self) -> Result<(), BuildError> {
        if let Some(chunk) = self.current.take() {
            chunk.writer.close().context(WriteChunkSnafu {
                path: chunk.path.display().to_string(),
            })?;
            self.closed_chunks.push(chunk.path);
        }
        Ok(())
    }

    /// Seal this head into `<dir>/<block id>/` and return its metadata.
    fn finish(mut self, dir: &Path) -> Result<BlockMeta, BuildError> {
        self.flush()?;
        self.close_current()?;

        let ulid = Uuid::now_v7().to_string();
        let block_dir = dir.join(&ulid);
        let chunks_dir = block_dir.join(CHUNKS_DIR_NAME);
        create_dir_all_blocking(&chunks_dir).context(StorageSnafu)?;

        for (idx, chunk) in self.closed_chunks.iter().enumerate() {
            rename_blocking(chunk, &chunks_dir.join(chunk_file_name(idx + 1)))
                .context(StorageSnafu)?;
        }

        let meta = BlockMeta {
            ulid,
            min_time: self.min_time,
            max_time: self.max_time,
            stats: BlockStats {
                num_samples: self.samples,
                num_series: self.series.len() as u64,
                num_chunks: self.closed_chunks.len() as u64,
            },
            version: META_VERSION,
        };

        let encoded = serde_json::to_vec_pretty(&meta).context(EncodeMetaSnafu {
            path: block_dir.display().to_string(),
        })?;
        write_atomic_blocking(&block_dir.join(META_FILE_NAME), &encoded).context(StorageSnafu)?;
        remove_tree_blocking(&self.dir).context(StorageSnafu)?;

        Ok(meta)
    }
}
