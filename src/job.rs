//! Job orchestration
//!
//! A `Job` binds one submission, its validator, a working directory and a
//! timeout, and owns the outcome of the run. The orchestrator drives the
//! validator unit to completion, catches any failure exactly once, has it
//! classified and hands the outcome to the reporter. A validator that
//! returns cleanly without reporting gets the automatic pass result; no run
//! finishes without exactly one result.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::compiler::{call_compiler, call_make, Compiler};
use crate::config::ExecutorConfig;
use crate::execution::{kill_longrunning, shell_execution, track_longrunning};
use crate::failure::{classify, ClassifiedOutcome, HarnessFailure, UNSPECIFIC_ERROR};
use crate::filesystem::has_file;
use crate::loader;
use crate::report::{ReportPayload, Reporter};
use crate::result::ToolResult;
use crate::running::RunningProgram;

/// Default messages for the automatic pass result
pub const PASS_MESSAGE_SUBMITTER: &str = "All tests passed. Awesome!";
pub const PASS_MESSAGE_GRADER: &str = "All tests passed.";

const CONFIGURE_NAME: &str = "configure";

/// One grading attempt on this test machine
pub struct Job {
    config: ExecutorConfig,
    reporter: Arc<Reporter>,
    working_dir: PathBuf,
    timeout_secs: u64,
    online: bool,
    result_sent: bool,

    /// Download source of the student submission
    pub submission_url: Option<String>,
    /// Download source of the validator
    pub validator_url: Option<String>,
    /// Server-side submission identifier
    pub submission_id: String,
    /// Server-side submission file identifier
    pub file_id: String,
    /// Action requested by the server
    pub action: String,
    /// Name of the submitting student
    pub submitter_name: String,
    /// Student ID of the submitting student
    pub submitter_student_id: String,
    /// Names of the submission authors
    pub author_names: Vec<String>,
    /// Study program of the submitter
    pub submitter_study_program: String,
    /// Course this submission belongs to
    pub course: String,
    /// Assignment this submission belongs to
    pub assignment: String,
}

impl Job {
    /// Create a job over an exclusive working directory. The timeout bounds
    /// every execution started for this job and must be positive.
    pub fn new(
        config: ExecutorConfig,
        reporter: Arc<Reporter>,
        working_dir: impl Into<PathBuf>,
        timeout_secs: u64,
        online: bool,
    ) -> Result<Self> {
        if timeout_secs == 0 {
            anyhow::bail!("Job timeout must be positive");
        }

        Ok(Self {
            config,
            reporter,
            working_dir: working_dir.into(),
            timeout_secs,
            online,
            result_sent: false,
            submission_url: None,
            validator_url: None,
            submission_id: String::new(),
            file_id: String::new(),
            action: String::new(),
            submitter_name: String::new(),
            submitter_student_id: String::new(),
            author_names: Vec::new(),
            submitter_study_program: String::new(),
            course: String::new(),
            assignment: String::new(),
        })
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Execution timeout in seconds, always positive
    pub fn timeout(&self) -> u64 {
        self.timeout_secs
    }

    /// Has a result been reported for this job?
    pub fn result_sent(&self) -> bool {
        self.result_sent
    }

    /// Location of the on-disk validator, after unpacking and renaming
    pub fn validator_path(&self) -> PathBuf {
        self.working_dir.join(loader::VALIDATOR_BASE_NAME)
    }

    /// Load a fresh validator unit for this job's working directory and
    /// drive it to completion. Any failure raised out of the unit is caught
    /// here exactly once, classified and reported; it is never re-raised.
    /// A unit that returns without reporting gets the automatic pass result.
    pub async fn run_validation(&mut self) -> Result<()> {
        info!("Running validation in {:?}", self.working_dir);

        let mut unit = match loader::load(&self.working_dir) {
            Ok(unit) => unit,
            Err(e) => {
                warn!("Could not load a validator unit: {:#}", e);
                let outcome = classify(&e);
                return self.send_result(outcome).await;
            }
        };

        match unit.validate(self).await {
            Err(e) => {
                debug!("Validator raised a failure: {:#}", e);
                let outcome = classify(&e);
                self.send_result(outcome).await
            }
            Ok(()) => {
                if self.result_sent {
                    return Ok(());
                }
                debug!("Validator finished without reporting, assuming a pass");
                self.send_pass_result().await
            }
        }
    }

    /// Run the configure tool shipped with the submission, if any. A missing
    /// or failing configure only aborts the job when `mandatory` is set.
    pub async fn run_configure(&mut self, mandatory: bool) -> Result<()> {
        debug!("Running configure ...");
        if !has_file(&self.working_dir, CONFIGURE_NAME) {
            if mandatory {
                anyhow::bail!("Could not find a configure script for execution.");
            }
            debug!("No configure script present, skipping");
            return Ok(());
        }

        info!("Running ./{} in {:?}", CONFIGURE_NAME, self.working_dir);
        let mut prog =
            RunningProgram::spawn(&self.working_dir, CONFIGURE_NAME, &[], self.timeout_secs)?;
        match prog.wait_for_end(None).await {
            Ok(_) => Ok(()),
            Err(e) if mandatory => Err(e.into()),
            Err(e) => {
                warn!("Non-mandatory configure step failed: {}", e);
                Ok(())
            }
        }
    }

    /// Run the make tool configured for this machine.
    pub async fn run_make(&mut self, mandatory: bool) -> Result<()> {
        debug!("Running make ...");
        let result = call_make(&self.working_dir, &self.config.make_command).await;
        if result.is_ok() {
            return Ok(());
        }
        if mandatory {
            return Err(HarnessFailure::tool("make", &result).into());
        }
        warn!("Non-mandatory make step failed:\n{}", result.output);
        Ok(())
    }

    /// Run the compiler. Always mandatory.
    pub async fn run_compiler(
        &mut self,
        compiler: &Compiler,
        inputs: &[String],
        output: Option<&str>,
    ) -> Result<()> {
        debug!("Running compiler ...");
        let result = call_compiler(&self.working_dir, compiler, inputs, output).await;
        if !result.is_ok() {
            return Err(HarnessFailure::tool(&compiler.program, &result).into());
        }
        Ok(())
    }

    /// Optional configure, optional make, mandatory compile - the common
    /// case for submissions that may or may not ship a build system.
    pub async fn run_build(
        &mut self,
        compiler: &Compiler,
        inputs: &[String],
        output: Option<&str>,
    ) -> Result<()> {
        self.run_configure(false).await?;
        self.run_make(false).await?;
        self.run_compiler(compiler, inputs, output).await
    }

    /// Run a program in the working directory to completion. A non-ok
    /// result raises a harness failure carrying it. The caller can demand
    /// exclusive execution on this machine.
    pub async fn run_program(
        &mut self,
        name: &str,
        arguments: &[String],
        timeout_secs: Option<u64>,
        exclusive: bool,
    ) -> Result<ToolResult> {
        debug!("Running program {} to completion ...", name);
        if exclusive {
            kill_longrunning();
        }

        let mut cmdline = vec![self.resolve_tool(name)];
        cmdline.extend(arguments.iter().cloned());
        let limit = timeout_secs.unwrap_or(self.timeout_secs);

        let result = shell_execution(&cmdline, &self.working_dir, limit).await;
        if !result.is_ok() {
            return Err(HarnessFailure::tool(name, &result).into());
        }
        Ok(result)
    }

    /// Spawn a program in the working directory for interaction. The caller
    /// can demand exclusive execution on this machine; the spawned process
    /// then becomes the occupant a later exclusive run will kill.
    pub async fn spawn_program(
        &mut self,
        name: &str,
        arguments: &[String],
        timeout_secs: Option<u64>,
        exclusive: bool,
    ) -> Result<RunningProgram> {
        debug!("Spawning program {} for interaction ...", name);
        if exclusive {
            kill_longrunning();
        }

        let limit = timeout_secs.unwrap_or(self.timeout_secs);
        let prog = RunningProgram::spawn(&self.working_dir, name, arguments, limit)?;

        if exclusive {
            if let Some(pid) = prog.pid() {
                track_longrunning(pid);
            }
        }
        Ok(prog)
    }

    /// Is every requested file present in the working directory? Vacuously
    /// true for an empty request. Pure query, no side effects.
    pub fn ensure_files(&self, filenames: &[&str]) -> Result<bool> {
        debug!(
            "Testing {:?} for the following files: {:?}",
            self.working_dir, filenames
        );
        let mut present: HashSet<OsString> = HashSet::new();
        for entry in std::fs::read_dir(&self.working_dir)
            .with_context(|| format!("Could not list {:?}", self.working_dir))?
        {
            present.insert(entry?.file_name());
        }
        Ok(filenames
            .iter()
            .all(|name| present.contains(&OsString::from(name))))
    }

    /// Report a pass with the fixed default messages
    pub async fn send_pass_result(&mut self) -> Result<()> {
        self.send_pass_result_with(PASS_MESSAGE_SUBMITTER.into(), PASS_MESSAGE_GRADER.into())
            .await
    }

    /// Report a pass with custom messages
    pub async fn send_pass_result_with(
        &mut self,
        info_submitter: String,
        info_grader: String,
    ) -> Result<()> {
        self.send_result(ClassifiedOutcome::success(info_submitter, info_grader))
            .await
    }

    /// Report a failure decided by validator logic itself
    pub async fn send_fail_result(
        &mut self,
        info_submitter: String,
        info_grader: String,
    ) -> Result<()> {
        self.send_result(ClassifiedOutcome {
            error_code: UNSPECIFIC_ERROR,
            submitter_message: info_submitter,
            grader_message: info_grader,
        })
        .await
    }

    async fn send_result(&mut self, outcome: ClassifiedOutcome) -> Result<()> {
        if self.result_sent {
            // A validator may amend its verdict; only the automatic
            // fallback is suppressed after the first report.
            warn!("A result was already sent for this job, sending an amended verdict");
        }

        let payload = ReportPayload {
            submission_file_id: self.file_id.clone(),
            message: outcome.submitter_message,
            action: self.action.clone(),
            message_tutor: outcome.grader_message,
            executor_dir: self.working_dir.to_string_lossy().into_owned(),
            error_code: outcome.error_code,
            secret: self.config.secret.clone(),
            uuid: self.config.uuid.clone(),
        };

        self.reporter.send(payload, self.online).await?;
        self.result_sent = true;
        Ok(())
    }

    /// Tools named without a path component run from the working directory
    /// when present there, from PATH otherwise.
    fn resolve_tool(&self, name: &str) -> String {
        if !name.contains('/') && has_file(&self.working_dir, name) {
            return format!("./{}", name);
        }
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::register_validator;
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn test_job(dir: &TempDir) -> (Job, Arc<Reporter>) {
        test_job_with_timeout(dir, 10)
    }

    fn test_job_with_timeout(dir: &TempDir, timeout_secs: u64) -> (Job, Arc<Reporter>) {
        let config = ExecutorConfig {
            secret: "s3cret".into(),
            uuid: "machine-1".into(),
            ..ExecutorConfig::default()
        };
        let reporter = Arc::new(Reporter::new(&config).unwrap());
        let mut job = Job::new(
            config,
            Arc::clone(&reporter),
            dir.path(),
            timeout_secs,
            false,
        )
        .unwrap();
        job.file_id = "417".into();
        job.action = "test_full".into();
        (job, reporter)
    }

    fn write_script(dir: &TempDir, name: &str, body: &str) {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    struct SilentPass;

    #[async_trait]
    impl loader::ValidatorUnit for SilentPass {
        async fn validate(&mut self, _job: &mut Job) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExecutorConfig::default();
        let reporter = Arc::new(Reporter::new(&config).unwrap());
        assert!(Job::new(config, reporter, dir.path(), 0, false).is_err());
    }

    #[tokio::test]
    async fn silent_validator_gets_the_automatic_pass_result() {
        let dir = tempfile::tempdir().unwrap();
        register_validator(dir.path(), || Box::new(SilentPass));
        let (mut job, reporter) = test_job(&dir);

        job.run_validation().await.unwrap();

        assert!(job.result_sent());
        let payload = reporter.last_payload().unwrap();
        assert_eq!(payload.error_code, 0);
        assert_eq!(payload.message, PASS_MESSAGE_SUBMITTER);
        assert_eq!(payload.message_tutor, PASS_MESSAGE_GRADER);
        assert_eq!(payload.submission_file_id, "417");
        assert_eq!(payload.secret, "s3cret");
        assert_eq!(payload.uuid, "machine-1");
    }

    struct ExplicitFail;

    #[async_trait]
    impl loader::ValidatorUnit for ExplicitFail {
        async fn validate(&mut self, job: &mut Job) -> Result<()> {
            job.send_fail_result("Wrong output.".into(), "Line 3 differs.".into())
                .await
        }
    }

    #[tokio::test]
    async fn explicit_report_suppresses_the_automatic_fallback() {
        let dir = tempfile::tempdir().unwrap();
        register_validator(dir.path(), || Box::new(ExplicitFail));
        let (mut job, reporter) = test_job(&dir);

        job.run_validation().await.unwrap();

        let payload = reporter.last_payload().unwrap();
        assert_eq!(payload.error_code, UNSPECIFIC_ERROR);
        assert_eq!(payload.message, "Wrong output.");
        assert_eq!(payload.message_tutor, "Line 3 differs.");
    }

    struct AmendedVerdict;

    #[async_trait]
    impl loader::ValidatorUnit for AmendedVerdict {
        async fn validate(&mut self, job: &mut Job) -> Result<()> {
            job.send_fail_result("first".into(), "first".into()).await?;
            job.send_pass_result().await
        }
    }

    #[tokio::test]
    async fn a_second_explicit_report_amends_the_verdict() {
        let dir = tempfile::tempdir().unwrap();
        register_validator(dir.path(), || Box::new(AmendedVerdict));
        let (mut job, reporter) = test_job(&dir);

        job.run_validation().await.unwrap();

        let payload = reporter.last_payload().unwrap();
        assert_eq!(payload.error_code, 0);
        assert_eq!(payload.message, PASS_MESSAGE_SUBMITTER);
    }

    struct HangingProgram;

    #[async_trait]
    impl loader::ValidatorUnit for HangingProgram {
        async fn validate(&mut self, job: &mut Job) -> Result<()> {
            let args = vec!["-c".to_string(), "echo started; sleep 30".to_string()];
            let mut prog = job.spawn_program("sh", &args, None, false).await?;
            prog.expect("finished", None).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn interactive_timeout_reports_the_bound_and_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        register_validator(dir.path(), || Box::new(HangingProgram));
        let (mut job, reporter) = test_job_with_timeout(&dir, 2);

        job.run_validation().await.unwrap();

        let payload = reporter.last_payload().unwrap();
        assert_eq!(payload.error_code, UNSPECIFIC_ERROR);
        assert!(payload.message.contains("2 seconds"));
        assert!(payload.message.contains("started"));
        assert!(payload.message_tutor.contains("timeout of 2 seconds"));
    }

    struct DyingProgram;

    #[async_trait]
    impl loader::ValidatorUnit for DyingProgram {
        async fn validate(&mut self, job: &mut Job) -> Result<()> {
            let args = vec!["-c".to_string(), "echo bye; exit 9".to_string()];
            let mut prog = job.spawn_program("sh", &args, None, false).await?;
            prog.expect("never printed", None).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn termination_reports_the_exit_status_as_error_code() {
        let dir = tempfile::tempdir().unwrap();
        register_validator(dir.path(), || Box::new(DyingProgram));
        let (mut job, reporter) = test_job(&dir);

        job.run_validation().await.unwrap();

        let payload = reporter.last_payload().unwrap();
        assert_eq!(payload.error_code, 9);
        assert!(payload.message.contains("terminated unexpectedly"));
        assert!(payload.message.contains("bye"));
    }

    #[tokio::test]
    async fn missing_validator_reports_an_internal_problem() {
        let dir = tempfile::tempdir().unwrap();
        let (mut job, reporter) = test_job(&dir);

        job.run_validation().await.unwrap();

        let payload = reporter.last_payload().unwrap();
        assert_eq!(payload.error_code, UNSPECIFIC_ERROR);
        assert!(payload.message.contains("Internal problem"));
        assert!(job.result_sent());
    }

    #[tokio::test]
    async fn passing_validator_script_is_run_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir, "validator", "echo all good; exit 0");
        let (mut job, reporter) = test_job(&dir);

        job.run_validation().await.unwrap();

        let payload = reporter.last_payload().unwrap();
        assert_eq!(payload.error_code, 0);
        assert!(payload.message_tutor.contains("all good"));
    }

    #[tokio::test]
    async fn failing_validator_script_reports_its_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir, "validator", "echo broken >&2; exit 4");
        let (mut job, reporter) = test_job(&dir);

        job.run_validation().await.unwrap();

        let payload = reporter.last_payload().unwrap();
        assert_eq!(payload.error_code, 4);
        assert!(payload.message.contains("broken"));
    }

    #[tokio::test]
    async fn optional_build_steps_swallow_failures_mandatory_ones_do_not() {
        let dir = tempfile::tempdir().unwrap();
        let (mut job, _reporter) = test_job(&dir);
        job.config.make_command = vec!["sh".into(), "-c".into(), "exit 1".into()];

        job.run_make(false).await.unwrap();

        let err = job.run_make(true).await.unwrap_err();
        let failure = err.downcast_ref::<HarnessFailure>().unwrap();
        assert_eq!(failure.kind, crate::failure::FailureKind::Tool);
    }

    #[tokio::test]
    async fn mandatory_compile_failure_carries_the_non_ok_result() {
        let dir = tempfile::tempdir().unwrap();
        let (mut job, _reporter) = test_job(&dir);

        let compiler = Compiler::new("sh").with_flags(["-c", "echo bad code >&2; exit 2"]);
        let err = job.run_compiler(&compiler, &[], None).await.unwrap_err();
        let failure = err.downcast_ref::<HarnessFailure>().unwrap();
        assert_eq!(failure.kind, crate::failure::FailureKind::Tool);
        assert_eq!(failure.code, Some(2));
        assert!(failure.partial_output.contains("bad code"));
    }

    #[tokio::test]
    async fn run_build_tolerates_missing_build_system_but_not_a_failing_compile() {
        let dir = tempfile::tempdir().unwrap();
        let (mut job, _reporter) = test_job(&dir);
        // No configure script, and make fails: both steps are optional
        job.config.make_command = vec!["sh".into(), "-c".into(), "exit 1".into()];

        let compiler = Compiler::new("sh").with_flags(["-c", "exit 0"]);
        job.run_build(&compiler, &[], None).await.unwrap();

        let compiler = Compiler::new("sh").with_flags(["-c", "exit 3"]);
        let err = job.run_build(&compiler, &[], None).await.unwrap_err();
        let failure = err.downcast_ref::<HarnessFailure>().unwrap();
        assert_eq!(failure.kind, crate::failure::FailureKind::Tool);
        assert_eq!(failure.code, Some(3));
    }

    #[tokio::test]
    async fn configure_is_optional_when_absent_and_fatal_when_demanded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut job, _reporter) = test_job(&dir);

        job.run_configure(false).await.unwrap();
        assert!(job.run_configure(true).await.is_err());

        write_script(&dir, "configure", "echo checking environment; exit 0");
        job.run_configure(true).await.unwrap();
    }

    #[tokio::test]
    async fn failing_configure_is_swallowed_when_not_mandatory() {
        let dir = tempfile::tempdir().unwrap();
        write_script(&dir, "configure", "exit 1");
        let (mut job, _reporter) = test_job(&dir);

        job.run_configure(false).await.unwrap();
        assert!(job.run_configure(true).await.is_err());
    }

    #[tokio::test]
    async fn run_program_raises_a_tool_failure_on_non_ok_results() {
        let dir = tempfile::tempdir().unwrap();
        let (mut job, _reporter) = test_job(&dir);

        let args = vec!["-c".to_string(), "echo fine".to_string()];
        let result = job.run_program("sh", &args, None, false).await.unwrap();
        assert!(result.is_ok());
        assert!(result.output.contains("fine"));

        let args = vec!["-c".to_string(), "exit 2".to_string()];
        let err = job.run_program("sh", &args, None, false).await.unwrap_err();
        let failure = err.downcast_ref::<HarnessFailure>().unwrap();
        assert_eq!(failure.code, Some(2));
    }

    #[tokio::test]
    async fn exclusive_spawn_kills_the_previous_occupant() {
        let dir = tempfile::tempdir().unwrap();
        let (mut job, _reporter) = test_job(&dir);

        let args = vec!["-c".to_string(), "sleep 60".to_string()];
        let mut first = job.spawn_program("sh", &args, None, true).await.unwrap();

        // Starting the next exclusive run terminates the first program
        let args = vec!["-c".to_string(), "echo fresh".to_string()];
        let mut second = job.spawn_program("sh", &args, None, true).await.unwrap();
        second.expect("fresh", None).await.unwrap();

        let err = first.wait_for_end(Some(5)).await.unwrap_err();
        assert!(matches!(
            err.kind,
            crate::failure::FailureKind::Termination { .. }
        ));
        second.kill().await.ok();
    }

    #[tokio::test]
    async fn ensure_files_truth_table() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.c"), "").unwrap();
        std::fs::write(dir.path().join("README"), "").unwrap();
        let (job, _reporter) = test_job(&dir);

        assert!(job.ensure_files(&[]).unwrap());
        assert!(job.ensure_files(&["main.c"]).unwrap());
        assert!(job.ensure_files(&["main.c", "README"]).unwrap());
        assert!(!job.ensure_files(&["main.c", "test.c"]).unwrap());
    }
}
