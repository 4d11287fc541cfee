// src/sys/scanner.rs

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ToolCommand;
use crate::error::ScanError;
use crate::sys::job::{FailureReason, JobEnvironment, ScanOutcome, ScanResult};
use crate::sys::traits::ScanRunner;

/// Force-removes the named scanner container unless disarmed.
/// Covers timeout, cancellation (future dropped mid-scan) and panics alike.
struct ContainerGuard {
    runtime: ToolCommand,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(container = %self.name, "Force-removing scanner container");
        let status = self
            .runtime
            .blocking()
            .args(["rm", "-f", &self.name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = status {
            warn!(container = %self.name, error = %e, "Failed to remove scanner container");
        }
    }
}

pub struct ContainerScanRunner {
    runtime: ToolCommand,
    report_file: String,
    timeout: Duration,
    log_path: Option<PathBuf>,
}

impl ContainerScanRunner {
    pub fn new(runtime: ToolCommand, report_file: String, timeout: Duration) -> Self {
        Self {
            runtime,
            report_file,
            timeout,
            log_path: None,
        }
    }

    /// Also append scanner output to `path`.
    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_path = Some(path);
        self
    }

    fn container_name(env: &JobEnvironment) -> String {
        format!("scan-relay-{}-{}", env.run_id, std::process::id())
    }

    fn build_command(&self, env: &JobEnvironment, name: &str) -> Command {
        let ws = env.workspace_path.display().to_string();
        let mut cmd = self.runtime.tokio();
        // 🛡️ `-e VAR` without a value makes the runtime copy VAR from its own env,
        // so the credential never appears on any command line.
        cmd.args(["run", "--rm", "--name", name])
            .arg("-v")
            .arg(format!("{ws}:{ws}:rw"))
            .arg("-w")
            .arg(&ws)
            .arg("-e")
            .arg(&env.credential_var)
            .arg(&env.target_container_image)
            .arg(&ws)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        env.secret.inject_env(&mut cmd, &env.credential_var);
        cmd
    }

    async fn open_log(&self) -> Option<Arc<Mutex<fs::File>>> {
        let path = self.log_path.as_ref()?;
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        match fs::OpenOptions::new().create(true).append(true).open(path).await {
            Ok(file) => Some(Arc::new(Mutex::new(file))),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Scanner log file unavailable");
                None
            }
        }
    }
}

/// Streams one pipe of the scanner into tracing and the optional log file.
/// Runs to EOF whatever the bytes are: a pump that quits early leaves the
/// scanner writing into a closed pipe.
fn pump<R>(
    reader: R,
    stream: &'static str,
    log: Option<Arc<Mutex<fs::File>>>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(stream, error = %e, "Scanner output unreadable");
                    break;
                }
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            info!(target: "scanner", stream, "{}", line);
            if let Some(log) = &log {
                let mut file = log.lock().await;
                let _ = file.write_all(format!("[{}] {}\n", stream.to_uppercase(), line).as_bytes()).await;
            }
        }
    })
}

#[async_trait]
impl ScanRunner for ContainerScanRunner {
    async fn run(&self, env: &JobEnvironment) -> Result<ScanResult, ScanError> {
        let expected_report = env.workspace_path.join(&self.report_file);

        // 🛡️ A report left over from an earlier run must never be mistaken for this one.
        match fs::remove_file(&expected_report).await {
            Ok(()) => warn!(path = %expected_report.display(), "Removed stale report before scan"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ScanError::Prepare(e)),
        }

        let name = Self::container_name(env);
        let mut command = self.build_command(env, &name);
        let log = self.open_log().await;

        info!(
            container = %name,
            image = %env.target_container_image,
            timeout_secs = self.timeout.as_secs(),
            "Starting scanner container"
        );

        let started_at = Utc::now();
        let clock = Instant::now();

        let mut child = command.spawn().map_err(|source| ScanError::Spawn {
            program: self.runtime.program.clone(),
            source,
        })?;
        let mut guard = ContainerGuard {
            runtime: self.runtime.clone(),
            name: name.clone(),
            armed: true,
        };

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump(stdout, "stdout", log.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump(stderr, "stderr", log.clone()));
        }

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        let duration = clock.elapsed();
        let finished_at = Utc::now();

        let (exit_code, outcome, report_exists) = match waited {
            Ok(status) => {
                let status = status.map_err(ScanError::Wait)?;
                // A runtime client killed by a signal may leave the container behind.
                // On a normal exit `--rm` already cleaned it up.
                if status.code().is_some() {
                    guard.disarm();
                } else {
                    warn!(container = %name, status = %status, "Container runtime terminated by signal");
                }
                let exit_code = status.code().unwrap_or(-1);
                let report_exists = fs::metadata(&expected_report)
                    .await
                    .map(|m| m.is_file())
                    .unwrap_or(false);
                (exit_code, ScanOutcome::classify(exit_code, report_exists), report_exists)
            }
            Err(_) => {
                warn!(container = %name, elapsed_secs = duration.as_secs(), "Scanner exceeded its time bound, killing");
                let _ = child.kill().await;
                // Dropping the armed guard removes the container itself.
                drop(guard);
                (-1, ScanOutcome::HardFailure(FailureReason::Timeout), false)
            }
        };

        for handle in pumps {
            let _ = handle.await;
        }

        // A timed-out scan may have left a half-written report behind: never surface it.
        let report_path = match outcome {
            ScanOutcome::Success | ScanOutcome::PartialFailure if report_exists => {
                Some(expected_report.clone())
            }
            _ => None,
        };

        info!(
            exit_code,
            outcome = %outcome,
            duration_ms = duration.as_millis() as u64,
            report = ?report_path,
            "Scanner finished"
        );

        Ok(ScanResult {
            exit_code,
            report_path,
            expected_report,
            outcome,
            started_at,
            finished_at,
            duration,
            log_path: self.log_path.clone(),
        })
    }
}
