//! Error types for sl-run

use sl_core::CoreError;
use sl_db::DbError;
use sl_test::TestGenError;
use thiserror::Error;

/// Run errors.
///
/// Pre-flight variants abort the whole run; the rest are recorded against
/// a single node in the report.
#[derive(Error, Debug)]
pub enum RunError {
    /// Core error (cycles, configuration shape, templates, state)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Adapter error
    #[error(transparent)]
    Db(#[from] DbError),

    /// A test node whose check cannot be turned into SQL
    #[error("[R001] Invalid test '{test}': {source}")]
    InvalidTest {
        test: String,
        #[source]
        source: TestGenError,
    },

    /// Invalid run options
    #[error("[R002] Invalid run options: {0}")]
    InvalidOptions(String),

    /// A data test returned failing rows
    #[error("[R003] Test returned {failing_rows} failing row(s)")]
    TestFailed { failing_rows: u64 },

    /// A selector that matched nothing
    #[error("[R004] Selector '{0}' matched no node")]
    UnknownSelection(String),
}

/// Result type alias for RunError
pub type RunResult<T> = Result<T, RunError>;
