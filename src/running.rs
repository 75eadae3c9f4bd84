//! Interactive program controller
//!
//! Spawns a child process attached to a continuously-read output stream and
//! lets validator logic drive it: wait until the output matches, feed input,
//! wait for the end. Every wait either returns a match or raises a tagged
//! `HarnessFailure` carrying the output captured so far - there is no
//! "no match, no error" outcome.
//!
//! The execution substrate sits behind the `ProgramSession` trait so it can
//! be swapped (local process today; a container or remote agent would
//! implement the same four capabilities).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::failure::HarnessFailure;

/// How often the accumulated output is re-checked while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One live interactive session with a program under test
#[async_trait]
pub trait ProgramSession: Send {
    /// Write to the program's input stream
    async fn write(&mut self, data: &str) -> Result<(), HarnessFailure>;

    /// Block until the accumulated output contains `pattern`, the program
    /// ends, or the bound elapses. Returns the matched region.
    async fn read_until_match_or_timeout(
        &mut self,
        pattern: &str,
        limit_secs: u64,
    ) -> Result<String, HarnessFailure>;

    /// Block until the program exits or the bound elapses. A nonzero exit
    /// raises the same termination failure as an unmatched wait.
    async fn wait_for_exit_or_timeout(&mut self, limit_secs: u64) -> Result<i32, HarnessFailure>;

    /// Forcibly terminate the program
    async fn kill(&mut self) -> Result<(), HarnessFailure>;

    /// Output captured so far, best-effort decoded
    fn output_so_far(&self) -> String;

    /// Operating-system pid, while the program is alive
    fn pid(&self) -> Option<u32>;
}

/// `ProgramSession` backed by a local child process
pub struct LocalProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    output: Arc<Mutex<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
    /// Start of the not-yet-matched region in `output`
    scan_pos: usize,
}

impl LocalProcess {
    /// Spawn `name` with `args` in `work_dir`, both output streams feeding
    /// one shared buffer.
    pub fn spawn(work_dir: &Path, name: &str, args: &[String]) -> Result<Self, HarnessFailure> {
        let program = resolve_program(work_dir, name);
        debug!("Spawning {:?} {:?} in {:?}", program, args, work_dir);

        let mut child = Command::new(&program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarnessFailure::interactive(format!("Could not start '{}': {}", name, e), "")
            })?;

        let output = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(pump(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(pump(stderr, Arc::clone(&output)));
        }
        let stdin = child.stdin.take();

        Ok(Self {
            child,
            stdin,
            output,
            readers,
            scan_pos: 0,
        })
    }

    fn streams_closed(&self) -> bool {
        self.readers.iter().all(|r| r.is_finished())
    }

    fn search(&mut self, pattern: &[u8]) -> Option<String> {
        let buffer = self.output.lock().unwrap_or_else(|e| e.into_inner());
        let haystack = &buffer[self.scan_pos..];
        let hit = haystack
            .windows(pattern.len().max(1))
            .position(|window| window == pattern)?;
        let matched = String::from_utf8_lossy(&haystack[hit..hit + pattern.len()]).into_owned();
        self.scan_pos += hit + pattern.len();
        Some(matched)
    }
}

#[async_trait]
impl ProgramSession for LocalProcess {
    async fn write(&mut self, data: &str) -> Result<(), HarnessFailure> {
        let partial = self.output_so_far();
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(HarnessFailure::interactive(
                "The program's input stream is closed.",
                partial,
            ));
        };
        stdin
            .write_all(data.as_bytes())
            .await
            .map_err(|e| HarnessFailure::interactive(e, partial.clone()))?;
        stdin
            .flush()
            .await
            .map_err(|e| HarnessFailure::interactive(e, partial))
    }

    async fn read_until_match_or_timeout(
        &mut self,
        pattern: &str,
        limit_secs: u64,
    ) -> Result<String, HarnessFailure> {
        if pattern.is_empty() {
            return Err(HarnessFailure::interactive(
                "Cannot wait for an empty pattern.",
                self.output_so_far(),
            ));
        }

        let deadline = Instant::now() + Duration::from_secs(limit_secs);
        loop {
            // Snapshot liveness before searching: if the streams were
            // already closed, the buffer cannot grow after the search.
            let closed = self.streams_closed();

            if let Some(matched) = self.search(pattern.as_bytes()) {
                return Ok(matched);
            }

            if closed {
                // The program may have closed its streams without exiting;
                // reaping it must not outlast the caller's bound.
                return match timeout_at(deadline, self.child.wait()).await {
                    Ok(status) => Err(HarnessFailure::termination(
                        status.ok().and_then(|s| s.code()),
                        self.output_so_far(),
                    )),
                    Err(_) => Err(HarnessFailure::timeout(limit_secs, self.output_so_far())),
                };
            }

            if Instant::now() >= deadline {
                return Err(HarnessFailure::timeout(limit_secs, self.output_so_far()));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_exit_or_timeout(&mut self, limit_secs: u64) -> Result<i32, HarnessFailure> {
        // Let the program see EOF on its input
        self.stdin.take();

        let deadline = Instant::now() + Duration::from_secs(limit_secs);
        let status = match timeout_at(deadline, self.child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(HarnessFailure::interactive(e, self.output_so_far())),
            Err(_) => return Err(HarnessFailure::timeout(limit_secs, self.output_so_far())),
        };

        // Drain whatever the program wrote on its way out. A background
        // grandchild can keep the pipes open past the exit; waiting for the
        // readers must not outlast the bound either, so they are cut off at
        // the deadline and the output captured so far stands.
        for reader in self.readers.drain(..) {
            let abort = reader.abort_handle();
            if timeout_at(deadline, reader).await.is_err() {
                abort.abort();
            }
        }

        match status.code() {
            Some(0) => Ok(0),
            other => Err(HarnessFailure::termination(other, self.output_so_far())),
        }
    }

    async fn kill(&mut self) -> Result<(), HarnessFailure> {
        let partial = self.output_so_far();
        self.child
            .kill()
            .await
            .map_err(|e| HarnessFailure::interactive(e, partial))
    }

    fn output_so_far(&self) -> String {
        let buffer = self.output.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Continuously move bytes from one child stream into the shared buffer
fn pump(
    mut stream: impl AsyncRead + Unpin + Send + 'static,
    buffer: Arc<Mutex<Vec<u8>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
                    buffer.extend_from_slice(&chunk[..n]);
                }
            }
        }
    })
}

/// Program names without a path component run from the working directory
/// when a file of that name exists there, from PATH otherwise.
fn resolve_program(work_dir: &Path, name: &str) -> PathBuf {
    if !name.contains('/') && work_dir.join(name).is_file() {
        return work_dir.join(name);
    }
    PathBuf::from(name)
}

/// A spawned program, as handed to validator logic
pub struct RunningProgram {
    session: Box<dyn ProgramSession>,
    default_timeout_secs: u64,
}

impl RunningProgram {
    /// Spawn a local program in `work_dir`
    pub fn spawn(
        work_dir: &Path,
        name: &str,
        args: &[String],
        default_timeout_secs: u64,
    ) -> Result<Self, HarnessFailure> {
        let session = LocalProcess::spawn(work_dir, name, args)?;
        Ok(Self::new(Box::new(session), default_timeout_secs))
    }

    /// Wrap an already-established session
    pub fn new(session: Box<dyn ProgramSession>, default_timeout_secs: u64) -> Self {
        Self {
            session,
            default_timeout_secs,
        }
    }

    /// Wait until the program prints `pattern` (literal match). Returns the
    /// matched region and leaves the session positioned after it.
    pub async fn expect(
        &mut self,
        pattern: &str,
        timeout_secs: Option<u64>,
    ) -> Result<String, HarnessFailure> {
        let limit = timeout_secs.unwrap_or(self.default_timeout_secs);
        self.session
            .read_until_match_or_timeout(pattern, limit)
            .await
    }

    /// Write `text` to the program's input stream
    pub async fn send_input(&mut self, text: &str) -> Result<(), HarnessFailure> {
        self.session.write(text).await
    }

    /// Write `text` followed by a newline
    pub async fn send_line(&mut self, text: &str) -> Result<(), HarnessFailure> {
        self.session.write(text).await?;
        self.session.write("\n").await
    }

    /// Wait for the program to finish. Returns its (zero) exit code; a
    /// nonzero exit or a timeout raises the corresponding failure.
    pub async fn wait_for_end(&mut self, timeout_secs: Option<u64>) -> Result<i32, HarnessFailure> {
        let limit = timeout_secs.unwrap_or(self.default_timeout_secs);
        self.session.wait_for_exit_or_timeout(limit).await
    }

    /// Forcibly terminate the program
    pub async fn kill(&mut self) -> Result<(), HarnessFailure> {
        self.session.kill().await
    }

    /// Output captured so far
    pub fn output_so_far(&self) -> String {
        self.session.output_so_far()
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.session.pid()
    }
}
