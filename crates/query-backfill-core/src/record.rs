//! The typed time-series record produced for every result row.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use tokio::sync::mpsc;

/// Column name holding the sample timestamp.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Column name holding the sample value.
pub const VALUE_COLUMN: &str = "value";

/// One parsed output row.
///
/// `timestamp` and `value` come from the reserved columns; every other column
/// lands in `labels`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TimeSeriesRecord {
    /// Sample timestamp as produced by the query (epoch milliseconds or seconds).
    pub timestamp: i64,
    /// Sample value.
    pub value: f64,
    /// Label name to label value.
    pub labels: BTreeMap<String, String>,
}

impl TimeSeriesRecord {
    /// Canonical identity of the series this record belongs to.
    ///
    /// Rendered as `{name="value",...}` with names in sorted order and `"` / `\`
    /// escaped, so two records share a key exactly when their label sets match.
    pub fn series_key(&self) -> String {
        let mut out = String::from("{");
        for (i, (name, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{name}=\"");
            for c in value.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
        out.push('}');
        out
    }
}

/// A page worth of parsed records, as pushed through the record channel.
pub type ParsedPage = Vec<TimeSeriesRecord>;

/// Producer half of the bounded record channel.
pub type RecordSender = mpsc::Sender<ParsedPage>;

/// Consumer half of the bounded record channel.
pub type RecordReceiver = mpsc::Receiver<ParsedPage>;

/// Create the bounded channel shared by the result streamer and the block
/// builder. `capacity` counts batches, not records.
pub fn record_channel(capacity: usize) -> (RecordSender, RecordReceiver) {
    mpsc::channel(capacity.max(1))
}
