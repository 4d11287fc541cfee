// src/sys/job.rs
//
// Data model of one pipeline run:
// JobEnvironment -> ScanResult -> RetainedArtifact -> (TunnelSession)
// Nothing here is reused across runs.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::sys::secrets::ProviderCredential;

// ==============================================================================
// 1. Backend & Job Environment
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Server-hosted pipeline engine (Jenkins).
    #[value(name = "server-pipeline", alias = "jenkins")]
    ServerPipeline,
    /// Hosted workflow runner (GitHub Actions).
    #[value(name = "hosted-runner", alias = "github")]
    HostedRunner,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::ServerPipeline => f.write_str("server-pipeline"),
            BackendKind::HostedRunner => f.write_str("hosted-runner"),
        }
    }
}

/// Resolved once at job start and never mutated afterwards.
#[derive(Debug)]
pub struct JobEnvironment {
    pub backend_kind: BackendKind,
    pub run_id: String,
    pub workspace_path: PathBuf,
    pub credential_var: String,
    pub secret: ProviderCredential,
    pub target_container_image: String,
    /// `$GITHUB_OUTPUT` on hosted runners; unused on server pipelines.
    pub step_output_file: Option<PathBuf>,
}

// ==============================================================================
// 2. Scan Result & Classification
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoReport,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum ScanOutcome {
    Success,
    /// Non-zero exit, but the report was written.
    PartialFailure,
    HardFailure(FailureReason),
}

impl ScanOutcome {
    pub fn classify(exit_code: i32, report_exists: bool) -> Self {
        match (exit_code, report_exists) {
            (0, _) => ScanOutcome::Success,
            (_, true) => ScanOutcome::PartialFailure,
            (_, false) => ScanOutcome::HardFailure(FailureReason::NoReport),
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, ScanOutcome::Success)
    }
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanOutcome::Success => f.write_str("success"),
            ScanOutcome::PartialFailure => f.write_str("partial failure"),
            ScanOutcome::HardFailure(FailureReason::NoReport) => f.write_str("hard failure: no report"),
            ScanOutcome::HardFailure(FailureReason::Timeout) => f.write_str("hard failure: timeout"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    /// -1 when the scanner was killed before reporting a status.
    pub exit_code: i32,
    /// Present only when the scanner actually wrote its report.
    pub report_path: Option<PathBuf>,
    /// Where the report was expected, used for diagnostics.
    pub expected_report: PathBuf,
    pub outcome: ScanOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub log_path: Option<PathBuf>,
}

// ==============================================================================
// 3. Artifact Policy & Retained Artifact
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum UploadCondition {
    #[value(name = "always")]
    Always,
    #[value(name = "on_success", alias = "on-success")]
    OnSuccess,
    #[value(name = "on_failure", alias = "on-failure")]
    OnFailure,
}

impl UploadCondition {
    /// Whether this condition asks for the report of a run with `outcome`.
    pub fn demands(&self, outcome: ScanOutcome) -> bool {
        match self {
            UploadCondition::Always => true,
            UploadCondition::OnSuccess => !outcome.is_failure(),
            UploadCondition::OnFailure => outcome.is_failure(),
        }
    }
}

impl fmt::Display for UploadCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadCondition::Always => f.write_str("always"),
            UploadCondition::OnSuccess => f.write_str("on_success"),
            UploadCondition::OnFailure => f.write_str("on_failure"),
        }
    }
}

/// Retention policy attached to a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub source_path: PathBuf,
    pub retention_days: u32,
    pub upload_condition: UploadCondition,
}

impl ArtifactRecord {
    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

/// A report that has been copied into the artifact area and stamped with its policy.
/// Serialized as the run manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedArtifact {
    pub run_id: String,
    pub record: ArtifactRecord,
    pub file_name: String,
    pub stored_path: PathBuf,
    pub size_bytes: u64,
    pub outcome: ScanOutcome,
    pub exit_code: i32,
    pub scan_started_at: DateTime<Utc>,
    pub scan_finished_at: DateTime<Utc>,
    pub scan_duration_ms: u64,
    /// Captured scanner output, when the runner kept a log file.
    pub scanner_log: Option<PathBuf>,
    pub registered_at: DateTime<Utc>,
    /// Advisory only. The hosting artifact store performs the actual expiry.
    pub expires_at: DateTime<Utc>,
}

// ==============================================================================
// 4. Tunnel Session (public view)
// ==============================================================================

/// Public view of an active publish channel. The server and tunnel handles
/// themselves stay owned by the publisher so they are always released together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSession {
    pub artifact_path: PathBuf,
    pub public_hostname: String,
    pub public_url: String,
    pub local_port: u16,
    pub server_id: String,
    pub tunnel_id: String,
    pub started_at: DateTime<Utc>,
    pub lease_deadline: DateTime<Utc>,
    pub lease_expires: tokio::time::Instant,
}
