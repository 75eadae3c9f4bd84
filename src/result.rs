//! Outcome of a single tool invocation
//!
//! Every batch command, make run or compiler call produces exactly one
//! `ToolResult`. The caller either accepts it or raises it into a
//! `HarnessFailure` (mandatory build steps, failed program runs).

use std::process::Output;

/// Result of running one tool to completion
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Did the tool exit successfully?
    pub ok: bool,
    /// Combined captured output (stdout followed by stderr, lossy-decoded)
    pub output: String,
    /// Exit status, if the process ran to a normal exit
    pub exit_status: Option<i32>,
}

impl ToolResult {
    /// Successful invocation with the given output
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: output.into(),
            exit_status: Some(0),
        }
    }

    /// Failed invocation that never produced an exit status
    /// (spawn failure, hard timeout)
    pub fn broken(output: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: output.into(),
            exit_status: None,
        }
    }

    /// Build a result from a captured process output
    pub fn from_output(output: &Output) -> Self {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Self {
            ok: output.status.success(),
            output: text,
            exit_status: output.status.code(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }
}
