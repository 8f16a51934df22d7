use query_backfill_core::{ConfigError, CycleError};
use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Invalid configuration: {source}"))]
    Config { source: ConfigError },

    #[snafu(display(
        "Destination store not found or not accessible: {path}. \
         Create it before starting the backfill."
    ))]
    DestinationMissing {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Destination store is not a directory: {path}"))]
    DestinationNotDir { path: String },

    #[snafu(display("Failed to create temporary block root {path}: {source}"))]
    CreateTmpRoot {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Backfill stopped: {source}"))]
    Cycle {
        #[snafu(source(from(CycleError, Box::new)))]
        source: Box<CycleError>,
    },
}
