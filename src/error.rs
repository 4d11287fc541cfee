// src/error.rs
//
// Error taxonomy for a single pipeline run. Each stage owns its enum; the
// run-level `PipelineError` only carries the failures that abort a run.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::sys::job::{BackendKind, ScanOutcome, UploadCondition};

/// Exit code used when the run aborts on configuration.
pub const EXIT_CONFIG: u8 = 2;
/// Exit code used when the scanner exceeded its time bound (mirrors coreutils `timeout`).
pub const EXIT_TIMEOUT: u8 = 124;
/// Exit code used when a termination signal aborted the run.
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not detect the CI backend; set --backend or SCAN_RELAY_BACKEND")]
    UnknownBackend,

    #[error("{backend} did not provide a workspace path (expected ${var})")]
    MissingWorkspace { backend: BackendKind, var: &'static str },

    #[error("workspace path '{0}' must be absolute")]
    RelativeWorkspace(PathBuf),

    #[error("workspace path '{0}' is not a directory")]
    WorkspaceNotFound(PathBuf),

    #[error("required credential ${0} is missing or empty")]
    MissingCredential(String),

    #[error("scanner image reference is empty")]
    EmptyImage,

    #[error("invalid duration '{0}' (expected e.g. 90s, 30m, 2h, 7d)")]
    InvalidDuration(String),

    #[error("invalid report file name '{0}'")]
    InvalidReportName(String),
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("failed to spawn container runtime '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait on scanner container: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to prepare scan: {0}")]
    Prepare(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    /// The upload policy demands a report that the scan never produced.
    #[error("upload condition '{condition}' requires a report, but none exists ({outcome}){}", path_hint(.expected))]
    MissingArtifact {
        condition: UploadCondition,
        outcome: ScanOutcome,
        expected: Option<PathBuf>,
    },

    #[error("artifact I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact manifest is invalid: {0}")]
    Manifest(#[from] serde_json::Error),
}

fn path_hint(expected: &Option<PathBuf>) -> String {
    expected
        .as_ref()
        .map(|p| format!(" at '{}'", p.display()))
        .unwrap_or_default()
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("tunnel token ${0} is missing or empty")]
    MissingToken(String),

    #[error("public hostname is not configured")]
    MissingHostname,

    #[error("invalid public hostname '{0}'")]
    InvalidHostname(String),

    #[error("tunnel authentication rejected: {0}")]
    AuthRejected(String),

    #[error("public hostname '{hostname}' is already bound")]
    HostnameInUse { hostname: String },

    #[error("static file server failed to start: {0}")]
    ServerStart(String),

    #[error("static file server failed to stop: {0}")]
    ServerStop(String),

    #[error("tunnel failed to start: {0}")]
    Startup(String),

    #[error("tunnel did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("tunnel failed to stop: {0}")]
    Shutdown(String),

    #[error("publish was cancelled before the session became active")]
    Cancelled,

    #[error("artifact '{0}' has no servable parent directory")]
    Unservable(PathBuf),
}

/// Failures that abort a run before it can finish its stages.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("scanner invocation failed: {0}")]
    ScanInvocation(#[from] ScanError),

    #[error("scanner exceeded its time bound of {0:?}")]
    ScannerTimeout(Duration),

    #[error("run cancelled by termination signal")]
    Cancelled,
}

impl PipelineError {
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Config(_) => EXIT_CONFIG,
            PipelineError::ScanInvocation(_) => 1,
            PipelineError::ScannerTimeout(_) => EXIT_TIMEOUT,
            PipelineError::Cancelled => EXIT_CANCELLED,
        }
    }
}

/// Failures of the standalone `publish` step, where publishing is the whole job.
#[derive(Error, Debug)]
pub enum PublishStepError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::job::FailureReason;

    #[test]
    fn abort_exit_codes_are_distinct() {
        let codes = [
            PipelineError::Config(ConfigError::UnknownBackend).exit_code(),
            PipelineError::ScannerTimeout(Duration::from_secs(1)).exit_code(),
            PipelineError::Cancelled.exit_code(),
        ];
        assert_eq!(codes, [EXIT_CONFIG, EXIT_TIMEOUT, EXIT_CANCELLED]);
    }

    #[test]
    fn missing_artifact_message_names_policy_and_path() {
        let err = ArtifactError::MissingArtifact {
            condition: UploadCondition::Always,
            outcome: ScanOutcome::HardFailure(FailureReason::NoReport),
            expected: Some(PathBuf::from("/ws/report.html")),
        };
        let msg = err.to_string();
        assert!(msg.contains("always"));
        assert!(msg.contains("/ws/report.html"));
    }
}
