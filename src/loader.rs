//! Validator loading
//!
//! A validator unit is grader-authored logic with a single entry point,
//! invoked once per job with the job as context. Units are constructed
//! fresh on every load from a process-wide registry keyed by working
//! directory, so repeated invocations in one long-lived worker never
//! observe state left behind by a previous load. The directory is an
//! explicit parameter; nothing mutates global search state.
//!
//! When no unit is registered for a directory, an executable with the fixed
//! base name `validator` in the working directory serves as the unit: it is
//! run to completion and exit code 0 counts as a pass.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::execution::shell_execution;
use crate::failure::HarnessFailure;
use crate::filesystem::has_file;
use crate::job::{Job, PASS_MESSAGE_SUBMITTER};

/// Base name of the on-disk validator in the working directory
pub const VALIDATOR_BASE_NAME: &str = "validator";

/// Grader-authored validation logic, one entry point per job
#[async_trait]
pub trait ValidatorUnit: Send {
    async fn validate(&mut self, job: &mut Job) -> Result<()>;
}

type Factory = Arc<dyn Fn() -> Box<dyn ValidatorUnit> + Send + Sync>;

struct Registered {
    version: u64,
    factory: Factory,
}

static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Registered>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<PathBuf, Registered>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn registry_key(dir: &Path) -> PathBuf {
    dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf())
}

/// Register validator logic for a working directory. Registering again for
/// the same directory replaces the previous unit and bumps its version.
pub fn register_validator<F>(dir: impl AsRef<Path>, factory: F)
where
    F: Fn() -> Box<dyn ValidatorUnit> + Send + Sync + 'static,
{
    let key = registry_key(dir.as_ref());
    let mut entries = registry().lock().unwrap_or_else(|e| e.into_inner());
    let version = entries.get(&key).map(|r| r.version + 1).unwrap_or(1);
    debug!("Registering validator for {:?}, version {}", key, version);
    entries.insert(
        key,
        Registered {
            version,
            factory: Arc::new(factory),
        },
    );
}

/// Construct a fresh validator unit for the given working directory
pub fn load(dir: &Path) -> Result<Box<dyn ValidatorUnit>> {
    let key = registry_key(dir);

    let registered = {
        let entries = registry().lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&key)
            .map(|entry| (entry.version, Arc::clone(&entry.factory)))
    };
    if let Some((version, factory)) = registered {
        debug!("Loading registered validator for {:?}, version {}", key, version);
        return Ok(factory());
    }

    if has_file(dir, VALIDATOR_BASE_NAME) {
        debug!("Loading on-disk validator script from {:?}", dir);
        return Ok(Box::new(ScriptValidator));
    }

    anyhow::bail!("No validator unit available for {:?}", dir)
}

/// Fallback unit wrapping the on-disk `validator` executable
struct ScriptValidator;

#[async_trait]
impl ValidatorUnit for ScriptValidator {
    async fn validate(&mut self, job: &mut Job) -> Result<()> {
        info!("Running the on-disk validator to completion");
        let cmdline = vec![format!("./{}", VALIDATOR_BASE_NAME)];
        let result = shell_execution(&cmdline, job.working_dir(), job.timeout()).await;
        if !result.is_ok() {
            return Err(HarnessFailure::tool(VALIDATOR_BASE_NAME, &result).into());
        }

        let grader = format!("Validator output:\n{}", result.output);
        job.send_pass_result_with(PASS_MESSAGE_SUBMITTER.into(), grader)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingUnit;

    #[async_trait]
    impl ValidatorUnit for CountingUnit {
        async fn validate(&mut self, _job: &mut Job) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn every_load_constructs_a_fresh_unit() {
        let dir = tempfile::tempdir().unwrap();
        let constructed = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&constructed);
        register_validator(dir.path(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(CountingUnit)
        });

        load(dir.path()).unwrap();
        load(dir.path()).unwrap();
        assert_eq!(constructed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn re_registration_replaces_the_previous_unit() {
        let dir = tempfile::tempdir().unwrap();
        register_validator(dir.path(), || Box::new(CountingUnit));

        let replacement_used = Arc::new(AtomicUsize::new(0));
        let marker = Arc::clone(&replacement_used);
        register_validator(dir.path(), move || {
            marker.fetch_add(1, Ordering::SeqCst);
            Box::new(CountingUnit)
        });

        load(dir.path()).unwrap();
        assert_eq!(replacement_used.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_directory_has_no_validator() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).is_err());
    }

    #[test]
    fn on_disk_script_is_picked_up_as_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VALIDATOR_BASE_NAME), "#!/bin/sh\nexit 0\n").unwrap();
        assert!(load(dir.path()).is_ok());
    }
}
