//! Build and compile tool invocations
//!
//! Thin, uniform wrappers over the batch engine for the configure / make /
//! compiler steps. Each call yields exactly one `ToolResult`; whether a
//! non-ok result aborts the job is decided by the orchestrator's mandatory
//! flag, not here.

use std::path::Path;

use tracing::debug;

use crate::execution::shell_execution;
use crate::result::ToolResult;

/// Time limit for a single build tool invocation
pub const BUILD_TIMEOUT_SECS: u64 = 60;

/// A compiler the test machine may invoke
#[derive(Debug, Clone)]
pub struct Compiler {
    /// Program name, resolved over PATH
    pub program: String,
    /// Flags placed before inputs and output
    pub flags: Vec<String>,
}

impl Compiler {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            flags: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.flags = flags.into_iter().map(Into::into).collect();
        self
    }

    /// The default compiler for submissions without a build system
    pub fn gcc() -> Self {
        Self::new("gcc")
    }

    /// Full command line for the given inputs and output name
    pub fn command_line(&self, inputs: &[String], output: Option<&str>) -> Vec<String> {
        let mut cmdline = Vec::with_capacity(self.flags.len() + inputs.len() + 3);
        cmdline.push(self.program.clone());
        cmdline.extend(self.flags.iter().cloned());
        if let Some(output) = output {
            cmdline.push("-o".into());
            cmdline.push(output.into());
        }
        cmdline.extend(inputs.iter().cloned());
        cmdline
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::gcc()
    }
}

/// Run the compiler in `work_dir`
pub async fn call_compiler(
    work_dir: &Path,
    compiler: &Compiler,
    inputs: &[String],
    output: Option<&str>,
) -> ToolResult {
    let cmdline = compiler.command_line(inputs, output);
    debug!("Running compiler {:?}", cmdline);
    shell_execution(&cmdline, work_dir, BUILD_TIMEOUT_SECS).await
}

/// Run the configured make tool in `work_dir`
pub async fn call_make(work_dir: &Path, make_command: &[String]) -> ToolResult {
    debug!("Running make {:?}", make_command);
    shell_execution(make_command, work_dir, BUILD_TIMEOUT_SECS).await
}
