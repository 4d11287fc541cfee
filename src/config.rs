// src/config.rs

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use clap::{ArgAction, Args};
use regex::Regex;

use crate::error::ConfigError;
use crate::sys::job::{BackendKind, UploadCondition};

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*([smhd]?)\s*$").expect("static regex"));

/// Parses `90`, `90s`, `30m`, `2h`, `7d`. A bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let caps = DURATION_RE
        .captures(raw)
        .ok_or_else(|| ConfigError::InvalidDuration(raw.to_string()))?;
    let value: u64 = caps[1]
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;
    let unit = match &caps[2] {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return Err(ConfigError::InvalidDuration(raw.to_string())),
    };
    value
        .checked_mul(unit)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidDuration(raw.to_string()))
}

/// 🛡️ The report name is joined onto the workspace and served at the URL root,
/// so it must be a bare file name.
fn parse_report_name(raw: &str) -> Result<String, ConfigError> {
    let name = raw.trim();
    let bare = Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name);
    if name.is_empty() || !bare || name.starts_with('.') {
        return Err(ConfigError::InvalidReportName(raw.to_string()));
    }
    Ok(name.to_string())
}

// ==============================================================================
// 1. Pipeline Configuration
// ==============================================================================

#[derive(Args, Clone, Debug)]
pub struct PipelineConfig {
    /// CI backend driving this run (auto-detected when omitted)
    #[arg(long, env = "SCAN_RELAY_BACKEND", value_enum)]
    pub backend: Option<BackendKind>,

    /// Scanner container image (identifier + tag)
    #[arg(long, env = "SCAN_RELAY_IMAGE", default_value = "code-analyzer:latest")]
    pub image: String,

    /// Container runtime command, e.g. "docker" or "sudo docker"
    #[arg(long, env = "SCAN_RELAY_RUNTIME", default_value = "docker")]
    pub container_runtime: String,

    /// Report file the scanner writes at the workspace root
    #[arg(long, env = "SCAN_RELAY_REPORT", default_value = "report.html", value_parser = parse_report_name)]
    pub report_file: String,

    /// Upper bound on the scan's wall-clock time
    #[arg(long, env = "SCAN_RELAY_TIMEOUT", default_value = "30m", value_parser = parse_duration)]
    pub scan_timeout: Duration,

    /// When the report is retained as an artifact
    #[arg(long, env = "SCAN_RELAY_UPLOAD_CONDITION", value_enum, default_value_t = UploadCondition::Always)]
    pub upload_condition: UploadCondition,

    /// Advisory retention stamped on the artifact, in days
    #[arg(long, env = "SCAN_RELAY_RETENTION_DAYS", default_value_t = 5)]
    pub retention_days: u32,

    /// Artifact area; relative paths resolve against the workspace
    #[arg(long, env = "SCAN_RELAY_ARTIFACT_DIR", default_value = ".scan-relay")]
    pub artifact_dir: PathBuf,

    /// Fail the run when the scanner reports findings (non-zero exit with a report)
    #[arg(long, env = "SCAN_RELAY_FAIL_ON_FINDINGS", default_value_t = true, action = ArgAction::Set)]
    pub fail_on_findings: bool,

    /// Env var holding the scanner credential (defaults to the backend's convention)
    #[arg(long, env = "SCAN_RELAY_CREDENTIAL_ENV")]
    pub credential_env: Option<String>,

    #[command(flatten)]
    pub publish: PublishConfig,
}

impl PipelineConfig {
    /// Artifact area for a given workspace.
    pub fn artifact_root(&self, workspace: &Path) -> PathBuf {
        if self.artifact_dir.is_absolute() {
            self.artifact_dir.clone()
        } else {
            workspace.join(&self.artifact_dir)
        }
    }

    pub fn runtime_command(&self) -> ToolCommand {
        ToolCommand::parse(&self.container_runtime)
    }
}

// ==============================================================================
// 2. Publish Configuration
// ==============================================================================

#[derive(Args, Clone, Debug)]
pub struct PublishConfig {
    /// Expose the retained report through a tunnel once the scan finishes
    #[arg(long = "publish", env = "SCAN_RELAY_PUBLISH")]
    pub enabled: bool,

    /// Stable public hostname bound by the tunnel
    #[arg(long, env = "SCAN_RELAY_PUBLIC_HOSTNAME")]
    pub public_hostname: Option<String>,

    /// How long the published report stays reachable
    #[arg(long, env = "SCAN_RELAY_LEASE", default_value = "1h", value_parser = parse_duration)]
    pub lease: Duration,

    /// Local port of the static file server
    #[arg(long, env = "SCAN_RELAY_SERVER_PORT", default_value_t = 80)]
    pub server_port: u16,

    /// Image of the static file server
    #[arg(long, env = "SCAN_RELAY_SERVER_IMAGE", default_value = "nginx:alpine")]
    pub server_image: String,

    /// Tunnel client command
    #[arg(long, env = "SCAN_RELAY_TUNNEL_PROGRAM", default_value = "ngrok")]
    pub tunnel_program: String,

    /// Env var holding the tunnel auth token
    #[arg(long, env = "SCAN_RELAY_TUNNEL_TOKEN_ENV", default_value = "NGROK_AUTHTOKEN")]
    pub tunnel_token_env: String,

    /// How long to wait for the tunnel to report itself online
    #[arg(long, env = "SCAN_RELAY_TUNNEL_READY_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub tunnel_ready_timeout: Duration,
}

/// Standalone publish step: serve an already retained report for one lease.
#[derive(Args, Clone, Debug)]
pub struct PublishArgs {
    /// Manifest written by `scan-relay run`
    #[arg(long, env = "SCAN_RELAY_MANIFEST")]
    pub manifest: PathBuf,

    /// Container runtime command, e.g. "docker" or "sudo docker"
    #[arg(long, env = "SCAN_RELAY_RUNTIME", default_value = "docker")]
    pub container_runtime: String,

    #[command(flatten)]
    pub publish: PublishConfig,
}

// ==============================================================================
// 3. External Tool Commands
// ==============================================================================

/// A program plus leading arguments, so wrappers like `sudo docker` work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        Self::new(program, parts.collect())
    }

    pub fn tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.leading_args);
        cmd
    }

    /// Blocking variant for cleanup paths that run inside `Drop`.
    pub fn blocking(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.leading_args);
        cmd
    }
}

#[cfg(test)]
pub(crate) fn test_config(artifact_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        backend: Some(BackendKind::HostedRunner),
        image: "code-analyzer:latest".into(),
        container_runtime: "docker".into(),
        report_file: "report.html".into(),
        scan_timeout: Duration::from_secs(30),
        upload_condition: UploadCondition::Always,
        retention_days: 5,
        artifact_dir: artifact_dir.to_path_buf(),
        fail_on_findings: true,
        credential_env: None,
        publish: PublishConfig {
            enabled: false,
            public_hostname: Some("scans.example.ngrok.app".into()),
            lease: Duration::from_millis(200),
            server_port: 8089,
            server_image: "nginx:alpine".into(),
            tunnel_program: "ngrok".into(),
            tunnel_token_env: "NGROK_AUTHTOKEN".into(),
            tunnel_ready_timeout: Duration::from_secs(5),
        },
    }
}
