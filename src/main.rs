use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use executor::config::ExecutorConfig;
use executor::filesystem::unpack_submission;
use executor::job::Job;
use executor::report::Reporter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("executor=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let mut args = std::env::args().skip(1);
    let working_dir: PathBuf = args
        .next()
        .context("Usage: executor <working-dir> [submission-archive]")?
        .into();
    let archive = args.next().map(PathBuf::from);

    let config = match std::env::var("EXECUTOR_CONFIG") {
        Ok(path) => ExecutorConfig::load(Path::new(&path))?,
        Err(_) => ExecutorConfig::from_env()?,
    };

    // Stay offline unless explicitly told to talk to the server, so
    // validators can be exercised locally.
    let online = std::env::var("EXECUTOR_ONLINE")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    if let Some(archive) = archive {
        info!("Unpacking {:?} into {:?}", archive, working_dir);
        unpack_submission(&archive, &working_dir)?;
    }

    let reporter = Arc::new(Reporter::new(&config)?);
    let timeout_secs = config.default_timeout_secs;
    let mut job = Job::new(
        config,
        Arc::clone(&reporter),
        working_dir,
        timeout_secs,
        online,
    )?;

    job.run_validation().await?;

    if let Some(payload) = reporter.last_payload() {
        info!("Error code: {}", payload.error_code);
        info!("Submitter message: {}", payload.message);
        info!("Grader message: {}", payload.message_tutor);
    }

    Ok(())
}
