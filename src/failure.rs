//! Failure taxonomy and classification
//!
//! Every failure is tagged at the site where it happens (timeout,
//! termination, tool failure, ...) and carries both audience messages plus
//! the output captured so far. The orchestrator catches it exactly once and
//! turns it into the `ClassifiedOutcome` handed to the reporter.

use thiserror::Error;

use crate::result::ToolResult;

/// Reserved error code meaning "failure occurred but is not otherwise
/// classified". Error code 0 always means full success.
pub const UNSPECIFIC_ERROR: i32 = -9999;

/// Low-level cause of a harness failure, tagged at the failure site
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    /// An expected pattern never appeared within the bound
    Timeout { limit_secs: u64 },
    /// The program ended before the expected pattern appeared
    Termination { exit_status: Option<i32> },
    /// Any other problem while interacting with a running program
    Interactive,
    /// A configure/make/compiler invocation returned non-ok
    Tool,
    /// Unanticipated failure in harness or validator code
    Internal,
}

/// A classified failure raised out of harness operations
#[derive(Debug, Error)]
#[error("{grader_message}")]
pub struct HarnessFailure {
    pub kind: FailureKind,
    /// Plain, non-technical text for the submitter
    pub submitter_message: String,
    /// Technical text for the grader
    pub grader_message: String,
    /// More specific error code, when one exists
    pub code: Option<i32>,
    /// Output captured up to the point of failure
    pub partial_output: String,
}

impl HarnessFailure {
    /// Interactive wait exceeded its bound
    pub fn timeout(limit_secs: u64, partial_output: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout { limit_secs },
            submitter_message: format!(
                "The execution of your program was cancelled, since it took longer than {} seconds.",
                limit_secs
            ),
            grader_message: format!(
                "The execution of the program was cancelled due to the timeout of {} seconds.",
                limit_secs
            ),
            code: None,
            partial_output: partial_output.into(),
        }
    }

    /// Process ended before the expected output appeared
    pub fn termination(exit_status: Option<i32>, partial_output: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Termination { exit_status },
            submitter_message: "Your program terminated unexpectedly.".into(),
            grader_message: "The student program terminated unexpectedly.".into(),
            code: exit_status,
            partial_output: partial_output.into(),
        }
    }

    /// Any other problem during program interaction
    pub fn interactive(cause: impl std::fmt::Display, partial_output: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Interactive,
            submitter_message: format!(
                "Unexpected problem during the execution of your program. {}",
                cause
            ),
            grader_message: format!(
                "Unknown exception during the execution of the student program. {}",
                cause
            ),
            code: None,
            partial_output: partial_output.into(),
        }
    }

    /// Tool invocation returned a non-ok result
    pub fn tool(step: &str, result: &ToolResult) -> Self {
        Self {
            kind: FailureKind::Tool,
            submitter_message: format!("Running '{}' failed:\n\n{}", step, result.output),
            grader_message: format!("Running '{}' failed:\n\n{}", step, result.output),
            code: result.exit_status,
            partial_output: result.output.clone(),
        }
    }

    /// Unanticipated harness-side failure
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        Self {
            kind: FailureKind::Internal,
            submitter_message: format!(
                "Internal problem while validating your submission. {}",
                cause
            ),
            grader_message: format!("Unknown exception while running the validator. {}", cause),
            code: None,
            partial_output: String::new(),
        }
    }
}

/// The triple handed to the result reporter, exactly one per job
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedOutcome {
    pub error_code: i32,
    pub submitter_message: String,
    pub grader_message: String,
}

impl ClassifiedOutcome {
    pub fn success(submitter_message: impl Into<String>, grader_message: impl Into<String>) -> Self {
        Self {
            error_code: 0,
            submitter_message: submitter_message.into(),
            grader_message: grader_message.into(),
        }
    }
}

/// Map a failure caught at the top of the orchestrator into the outcome
/// reported to the server.
pub fn classify(error: &anyhow::Error) -> ClassifiedOutcome {
    let Some(failure) = error.downcast_ref::<HarnessFailure>() else {
        // Something really unexpected
        return ClassifiedOutcome {
            error_code: UNSPECIFIC_ERROR,
            submitter_message: format!(
                "Internal problem while validating your submission. {}",
                error
            ),
            grader_message: format!("Unknown exception while running the validator. {}", error),
        };
    };

    let (submitter, grader) = match failure.kind {
        FailureKind::Timeout { .. }
        | FailureKind::Termination { .. }
        | FailureKind::Interactive => (
            format!(
                "{}\n\nOutput so far: {}",
                failure.submitter_message, failure.partial_output
            ),
            format!(
                "{}\n\nOutput so far: {}",
                failure.grader_message, failure.partial_output
            ),
        ),
        // Tool and internal failures carry their final text verbatim
        FailureKind::Tool | FailureKind::Internal => (
            failure.submitter_message.clone(),
            failure.grader_message.clone(),
        ),
    };

    ClassifiedOutcome {
        error_code: failure.code.unwrap_or(UNSPECIFIC_ERROR),
        submitter_message: submitter,
        grader_message: grader,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_carries_the_bound_and_output() {
        let error = anyhow::Error::new(HarnessFailure::timeout(5, "partial"));
        let outcome = classify(&error);
        assert_eq!(outcome.error_code, UNSPECIFIC_ERROR);
        assert!(outcome.submitter_message.contains("5 seconds"));
        assert!(outcome.submitter_message.contains("Output so far: partial"));
        assert!(outcome.grader_message.contains("timeout of 5 seconds"));
    }

    #[test]
    fn termination_uses_exit_status_as_error_code() {
        let error = anyhow::Error::new(HarnessFailure::termination(Some(42), "said hi"));
        let outcome = classify(&error);
        assert_eq!(outcome.error_code, 42);
        assert!(outcome
            .submitter_message
            .starts_with("Your program terminated unexpectedly."));
        assert!(outcome.grader_message.contains("Output so far: said hi"));
    }

    #[test]
    fn termination_without_exit_status_falls_back_to_sentinel() {
        let error = anyhow::Error::new(HarnessFailure::termination(None, ""));
        assert_eq!(classify(&error).error_code, UNSPECIFIC_ERROR);
    }

    #[test]
    fn tool_failure_text_is_verbatim_and_keeps_exit_status() {
        let result = ToolResult {
            ok: false,
            output: "main.c:1: error".into(),
            exit_status: Some(1),
        };
        let error = anyhow::Error::new(HarnessFailure::tool("gcc", &result));
        let outcome = classify(&error);
        assert_eq!(outcome.error_code, 1);
        assert!(outcome.submitter_message.contains("main.c:1: error"));
        assert!(!outcome.submitter_message.contains("Output so far"));
    }

    #[test]
    fn unanticipated_errors_classify_as_internal() {
        let error = anyhow::anyhow!("registry poisoned");
        let outcome = classify(&error);
        assert_eq!(outcome.error_code, UNSPECIFIC_ERROR);
        assert!(outcome
            .submitter_message
            .contains("Internal problem while validating your submission."));
        assert!(outcome.grader_message.contains("registry poisoned"));
    }
}
