//! Configuration file model and validation.
//!
//! The on-disk format is YAML:
//!
//! ```yaml
//! queries:
//!   - name: cpu
//!     region: us-east-1
//!     assumeRoleArn: arn:aws:iam::123456789012:role/backfill
//!     query: SELECT timestamp, value, host FROM metrics
//!     workgroup: primary
//!     interval: 1h
//!     offset: -5m
//!     maxSeries: 10000
//! builder:
//!   blockDuration: 2h
//! ```
//!
//! [`BackfillConfig`] mirrors the file 1:1 with string durations. Validation
//! turns each entry into an immutable [`QuerySpec`] and the `builder` section
//! into [`BuilderOptions`]. All failures surface as [`ConfigError`], which is
//! fatal at startup.

use std::{collections::HashSet, path::Path, time::Duration};

use chrono::TimeDelta;
use serde::Deserialize;
use snafu::prelude::*;

use crate::{block::BuilderOptions, query::PollPolicy};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[snafu(display("Failed to read configuration file {path}: {source}"))]
    ReadFile {
        /// Path of the configuration file.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML for this schema.
    #[snafu(display("Malformed configuration: {source}"))]
    Yaml {
        /// Underlying YAML error (carries line/column).
        source: serde_yaml::Error,
    },

    /// The file lists no query definitions.
    #[snafu(display("Configuration defines no queries"))]
    NoQueries,

    /// A required field is empty.
    #[snafu(display("Query {query}: field '{field}' must not be empty"))]
    EmptyField {
        /// Name of the offending query definition.
        query: String,
        /// Field that was empty.
        field: &'static str,
    },

    /// A duration string could not be parsed.
    #[snafu(display("Query {query}: invalid {field} '{value}': {source}"))]
    InvalidDuration {
        /// Name of the offending query definition.
        query: String,
        /// Field holding the duration.
        field: &'static str,
        /// Raw duration string.
        value: String,
        /// Underlying humantime error.
        source: humantime::DurationError,
    },

    /// A duration parsed but is too large to represent.
    #[snafu(display("Query {query}: {field} '{value}' is out of range"))]
    DurationOutOfRange {
        /// Name of the offending query definition.
        query: String,
        /// Field holding the duration.
        field: &'static str,
        /// Raw duration string.
        value: String,
    },

    /// A duration that must be strictly positive is zero or negative.
    #[snafu(display("Query {query}: {field} '{value}' must be greater than zero"))]
    NonPositiveDuration {
        /// Name of the offending query definition.
        query: String,
        /// Field holding the duration.
        field: &'static str,
        /// Raw duration string.
        value: String,
    },

    /// A query name cannot be used as a directory name component.
    #[snafu(display(
        "Invalid query name '{name}': use letters, digits, '_', '-' or '.', and no '..'"
    ))]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// Two query definitions share a name.
    #[snafu(display("Duplicate query name '{name}'"))]
    DuplicateName {
        /// The repeated name.
        name: String,
    },

    /// A block-builder tunable is invalid.
    #[snafu(display("Invalid builder option {field}: {reason}"))]
    InvalidBuilderOption {
        /// Offending option.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// One query definition exactly as written in the file.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDefinition {
    /// Optional display name; defaults to `query-<index>`.
    #[serde(default)]
    pub name: Option<String>,
    /// Remote region identifier.
    pub region: String,
    /// Optional role to assume before talking to the query service.
    #[serde(default)]
    pub assume_role_arn: Option<String>,
    /// Query text.
    pub query: String,
    /// Execution workgroup.
    pub workgroup: String,
    /// Scheduling interval, e.g. `1h`.
    pub interval: String,
    /// Scheduling offset, e.g. `-5m`; defaults to `0s`.
    #[serde(default)]
    pub offset: Option<String>,
    /// Maximum series per block; `0` or absent means unlimited.
    #[serde(default)]
    pub max_series: u64,
    /// Status poll cadence; defaults to `1s`.
    #[serde(default)]
    pub poll_interval: Option<String>,
    /// Consecutive status-check failures tolerated; absent means unlimited.
    #[serde(default)]
    pub max_poll_errors: Option<u32>,
}

/// Optional `builder` section of the file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuilderSection {
    /// Time span covered by one block, e.g. `2h`.
    pub block_duration: Option<String>,
    /// Samples written to one chunk file before rolling to the next.
    pub max_samples_per_writer: Option<u64>,
    /// Records buffered per head before a row group is written.
    pub flush_threshold: Option<usize>,
    /// Threads used to finalise blocks.
    pub concurrency: Option<usize>,
    /// Capacity of the record channel, in pages.
    pub channel_capacity: Option<usize>,
    /// Sizing hint for the number of records one cycle produces.
    pub expected_records: Option<usize>,
}

/// The whole configuration file.
#[derive(Clone, Debug, Deserialize)]
pub struct BackfillConfig {
    /// Query definitions, scheduled sequentially.
    pub queries: Vec<QueryDefinition>,
    /// Block builder tunables.
    #[serde(default)]
    pub builder: BuilderSection,
}

/// Validated, immutable configuration for one ingest source.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySpec {
    /// Unique name, used in logs and temporary paths.
    pub name: String,
    /// Remote region identifier.
    pub region: String,
    /// Optional role to assume.
    pub assume_role_arn: Option<String>,
    /// Query text.
    pub query: String,
    /// Execution workgroup.
    pub workgroup: String,
    /// Scheduling interval (strictly positive).
    pub interval: TimeDelta,
    /// Scheduling offset relative to the interval boundary (may be negative).
    pub offset: TimeDelta,
    /// Maximum series per sub-block; `None` means unlimited.
    pub max_series: Option<u64>,
    /// How the status of a submitted query is polled.
    pub poll: PollPolicy,
}

impl BackfillConfig {
    /// Parse a configuration document.
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        serde_yaml::from_str(yaml).context(YamlSnafu)
    }

    /// Read and parse the configuration file at `path`.
    pub async fn load(path: &Path) -> ConfigResult<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .context(ReadFileSnafu {
                path: path.display().to_string(),
            })?;
        Self::from_yaml_str(&raw)
    }

    /// Validate every query definition.
    pub fn query_specs(&self) -> ConfigResult<Vec<QuerySpec>> {
        ensure!(!self.queries.is_empty(), NoQueriesSnafu);

        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.queries.len());
        for (idx, def) in self.queries.iter().enumerate() {
            let spec = def.validate(idx)?;
            ensure!(
                seen.insert(spec.name.clone()),
                DuplicateNameSnafu {
                    name: spec.name.clone()
                }
            );
            specs.push(spec);
        }
        Ok(specs)
    }

    /// Resolve the builder tunables, falling back to defaults.
    pub fn builder_options(&self) -> ConfigResult<BuilderOptions> {
        let section = &self.builder;
        let mut opts = BuilderOptions::default();

        if let Some(raw) = &section.block_duration {
            let d = parse_signed_duration("builder", "blockDuration", raw)?;
            ensure!(
                d > TimeDelta::zero(),
                NonPositiveDurationSnafu {
                    query: "builder",
                    field: "blockDuration",
                    value: raw.clone(),
                }
            );
            opts.block_duration_ms = d.num_milliseconds();
        }
        if let Some(v) = section.max_samples_per_writer {
            opts.max_samples_per_writer = positive("maxSamplesPerWriter", v)?;
        }
        if let Some(v) = section.flush_threshold {
            opts.flush_threshold = positive("flushThreshold", v)?;
        }
        if let Some(v) = section.concurrency {
            opts.concurrency = positive("concurrency", v)?;
        }
        if let Some(v) = section.channel_capacity {
            opts.channel_capacity = positive("channelCapacity", v)?;
        }
        if let Some(v) = section.expected_records {
            opts.expected_records = v;
        }
        Ok(opts)
    }
}

fn positive<T: Default + PartialEq + Copy>(field: &'static str, v: T) -> ConfigResult<T> {
    ensure!(
        v != T::default(),
        InvalidBuilderOptionSnafu {
            field,
            reason: "must be greater than zero",
        }
    );
    Ok(v)
}

/// Names end up in temporary directory names, so they must stay one plain
/// path component.
fn is_valid_name(name: &str) -> bool {
    !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

impl QueryDefinition {
    fn validate(&self, idx: usize) -> ConfigResult<QuerySpec> {
        let name = match self.name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => format!("query-{idx}"),
        };
        ensure!(is_valid_name(&name), InvalidNameSnafu { name });

        for (field, value) in [
            ("region", &self.region),
            ("query", &self.query),
            ("workgroup", &self.workgroup),
        ] {
            ensure!(
                !value.trim().is_empty(),
                EmptyFieldSnafu {
                    query: name.clone(),
                    field
                }
            );
        }

        let interval = parse_signed_duration(&name, "interval", &self.interval)?;
        ensure!(
            interval > TimeDelta::zero(),
            NonPositiveDurationSnafu {
                query: name.clone(),
                field: "interval",
                value: self.interval.clone(),
            }
        );

        let offset = match self.offset.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_signed_duration(&name, "offset", raw)?,
            _ => TimeDelta::zero(),
        };

        let mut poll = PollPolicy::default();
        if let Some(raw) = self.poll_interval.as_deref() {
            let d = parse_signed_duration(&name, "pollInterval", raw)?;
            let d = d
                .to_std()
                .ok()
                .filter(|d| !d.is_zero())
                .context(NonPositiveDurationSnafu {
                    query: name.clone(),
                    field: "pollInterval",
                    value: raw.to_string(),
                })?;
            poll.interval = d;
        }
        poll.max_consecutive_errors = self.max_poll_errors;

        Ok(QuerySpec {
            name,
            region: self.region.clone(),
            assume_role_arn: self
                .assume_role_arn
                .clone()
                .filter(|arn| !arn.trim().is_empty()),
            query: self.query.clone(),
            workgroup: self.workgroup.clone(),
            interval,
            offset,
            max_series: (self.max_series > 0).then_some(self.max_series),
            poll,
        })
    }
}

/// Parse a humantime duration with an optional leading `-` or `+`.
pub fn parse_signed_duration(query: &str, field: &'static str, raw: &str) -> ConfigResult<TimeDelta> {
    let trimmed = raw.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let std_duration: Duration =
        humantime::parse_duration(body.trim()).context(InvalidDurationSnafu {
            query,
            field,
            value: raw,
        })?;

    let delta = TimeDelta::from_std(std_duration).ok().context(DurationOutOfRangeSnafu {
        query,
        field,
        value: raw,
    })?;

    Ok(if negative { -delta } else { delta })
}
