//! Remote execution harness for grading student submissions
//!
//! Runs grader-supplied validator logic against a submitted program on a
//! test machine: batch and interactive subprocess execution under timeouts,
//! dual-audience failure classification, and exactly one authenticated
//! result report per job.

pub mod compiler;
pub mod config;
pub mod execution;
pub mod failure;
pub mod filesystem;
pub mod job;
pub mod loader;
pub mod report;
pub mod result;
pub mod running;

pub use compiler::Compiler;
pub use config::ExecutorConfig;
pub use failure::{classify, ClassifiedOutcome, FailureKind, HarnessFailure, UNSPECIFIC_ERROR};
pub use job::Job;
pub use loader::{register_validator, ValidatorUnit};
pub use report::Reporter;
pub use result::ToolResult;
pub use running::{ProgramSession, RunningProgram};
