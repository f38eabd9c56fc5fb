pub mod block;
pub mod comparator;
pub mod engine;
pub mod error;
pub mod expectation;
pub mod extractor;
pub mod linker;
pub mod objects;
pub mod report;
pub mod session;
pub mod sql;

// Re-exports
pub use block::{Block, BlockKind};
pub use comparator::{compare, Verdict, DEFAULT_EPSILON};
pub use engine::{
    ErrorPolicy, ExecutionResult, ExecutionStatus, RunOptions, RunOutcome, TeardownMode, Verifier,
};
pub use error::{BlockError, Error, Result};
pub use expectation::{Check, CountOp, Expectation};
pub use extractor::extract;
pub use linker::{link, ExecutionPlan};
pub use objects::{DbObject, ObjectKind};
pub use report::{BlockOutcome, Report, Summary, EXIT_FAILURE, EXIT_FATAL, EXIT_OK};
pub use session::{QueryOutput, SqlSession, StatementError, StatementErrorKind};
