//! Turn raw result rows into [`TimeSeriesRecord`]s.
//!
//! Column semantics are positional: the n-th cell of a row belongs to the
//! n-th column of the page. Two column names are reserved, matched exactly
//! and case-sensitively:
//!
//! - `timestamp`: parsed as a base-10 `i64`;
//! - `value`: parsed as an `f64`.
//!
//! Every other column becomes a label. When a label name repeats, the last
//! occurrence wins. A row missing either reserved column, or carrying an
//! unparseable one, is an error: rows are never silently dropped.

use std::collections::BTreeMap;

use snafu::prelude::*;

use crate::{
    query::ResultPage,
    record::{TIMESTAMP_COLUMN, TimeSeriesRecord, VALUE_COLUMN},
};

/// Errors raised while parsing result rows.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum ParseError {
    /// A reserved column holds something that is not a number.
    #[snafu(display("Row {row}: column '{column}' has unparseable value '{raw}'"))]
    InvalidNumber {
        /// Zero-based row index within the page (after the header skip).
        row: usize,
        /// Reserved column name.
        column: &'static str,
        /// Raw cell text.
        raw: String,
    },

    /// A reserved column holds SQL `NULL`.
    #[snafu(display("Row {row}: column '{column}' is NULL"))]
    NullReserved {
        /// Zero-based row index within the page.
        row: usize,
        /// Reserved column name.
        column: &'static str,
    },

    /// A reserved column is absent from the result set.
    #[snafu(display("Row {row}: result has no '{column}' column"))]
    MissingReserved {
        /// Zero-based row index within the page.
        row: usize,
        /// Reserved column name.
        column: &'static str,
    },

    /// A row has more cells than the result set has columns.
    #[snafu(display("Row {row}: cell {index} has no matching column ({columns} columns known)"))]
    UnknownColumn {
        /// Zero-based row index within the page.
        row: usize,
        /// Zero-based cell index.
        index: usize,
        /// Number of known columns.
        columns: usize,
    },
}

/// Parse one row.
///
/// `row` is only used to label errors.
pub fn parse_row(
    columns: &[String],
    cells: &[Option<String>],
    row: usize,
) -> Result<TimeSeriesRecord, ParseError> {
    let mut timestamp = None;
    let mut value = None;
    let mut labels = BTreeMap::new();

    for (index, cell) in cells.iter().enumerate() {
        let name = columns.get(index).context(UnknownColumnSnafu {
            row,
            index,
            columns: columns.len(),
        })?;

        match name.as_str() {
            TIMESTAMP_COLUMN => {
                let raw = cell.as_deref().context(NullReservedSnafu {
                    row,
                    column: TIMESTAMP_COLUMN,
                })?;
                let parsed = raw.parse::<i64>().ok().context(InvalidNumberSnafu {
                    row,
                    column: TIMESTAMP_COLUMN,
                    raw,
                })?;
                timestamp = Some(parsed);
            }
            VALUE_COLUMN => {
                let raw = cell.as_deref().context(NullReservedSnafu {
                    row,
                    column: VALUE_COLUMN,
                })?;
                let parsed = raw.parse::<f64>().ok().context(InvalidNumberSnafu {
                    row,
                    column: VALUE_COLUMN,
                    raw,
                })?;
                value = Some(parsed);
            }
            _ => match cell {
                Some(v) => {
                    labels.insert(name.clone(), v.clone());
                }
                // NULL label: a later duplicate column must not resurrect an
                // earlier value.
                None => {
                    labels.remove(name);
                }
            },
        }
    }

    Ok(TimeSeriesRecord {
        timestamp: timestamp.context(MissingReservedSnafu {
            row,
            column: TIMESTAMP_COLUMN,
        })?,
        value: value.context(MissingReservedSnafu {
            row,
            column: VALUE_COLUMN,
        })?,
        labels,
    })
}

/// Parse every data row of `page`.
///
/// On the first page of a result set the leading header row is skipped, so a
/// first page of `n` rows yields `n - 1` records and any other page yields `n`.
pub fn parse_page(page: &ResultPage, is_first_page: bool) -> Result<Vec<TimeSeriesRecord>, ParseError> {
    let skip = usize::from(is_first_page);
    page.rows
        .iter()
        .skip(skip)
        .enumerate()
        .map(|(row, cells)| parse_row(&page.columns, cells, row))
        .collect()
}
