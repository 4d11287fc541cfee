// src/sys/backend.rs
//
// Normalizes the two CI backends into one JobEnvironment, and writes the
// run's outputs back in the convention each backend expects.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::error::{ArtifactError, ConfigError};
use crate::sys::job::{BackendKind, JobEnvironment, RetainedArtifact};
use crate::sys::secrets::ProviderCredential;

const DEFAULT_CREDENTIAL_VAR: &str = "GROQ_API_KEY";
pub const PROPERTIES_FILE: &str = "scan-relay.properties";

// ==============================================================================
// 1. Ambient Context
// ==============================================================================

/// Snapshot of the environment the CI backend handed us.
/// 🛡️ Values (credentials included) are zeroized when the snapshot is dropped.
pub struct AmbientContext {
    vars: HashMap<String, String>,
}

impl AmbientContext {
    pub fn from_process() -> Self {
        Self::from_os_pairs(std::env::vars_os())
    }

    /// Keeps only the entries that are valid UTF-8 on both sides. None of the
    /// variables we read are ever anything else.
    pub fn from_os_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        Self::from_pairs(pairs.into_iter().filter_map(|(key, value)| {
            match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => Some((key, value)),
                (Ok(key), Err(_)) => {
                    debug!(key = %key, "Skipping non-UTF-8 environment value");
                    None
                }
                _ => None,
            }
        }))
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Non-empty value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Copies `key` into a fresh credential. The snapshot's own copy is
    /// scrubbed when the snapshot drops.
    pub fn credential(&self, key: &str) -> Option<ProviderCredential> {
        self.get(key)
            .and_then(|v| ProviderCredential::from_env_value(v.to_string()))
    }
}

impl Drop for AmbientContext {
    fn drop(&mut self) {
        for value in self.vars.values_mut() {
            value.zeroize();
        }
    }
}

// ==============================================================================
// 2. Backend Conventions
// ==============================================================================

impl BackendKind {
    /// Picks the backend from the marker variables each platform always sets.
    pub fn detect(ctx: &AmbientContext) -> Option<Self> {
        if ctx.get("GITHUB_ACTIONS") == Some("true") {
            return Some(BackendKind::HostedRunner);
        }
        if ctx.get("JENKINS_URL").is_some() || ctx.get("JENKINS_HOME").is_some() {
            return Some(BackendKind::ServerPipeline);
        }
        None
    }

    pub fn workspace_var(&self) -> &'static str {
        match self {
            BackendKind::HostedRunner => "GITHUB_WORKSPACE",
            BackendKind::ServerPipeline => "WORKSPACE",
        }
    }

    pub fn credential_var(&self) -> &'static str {
        // Both platforms bind the secret under the scanner's own variable name:
        // `env: GROQ_API_KEY: ${{ secrets.GROQ_API_KEY }}` and
        // `withCredentials([string(... variable: 'GROQ_API_KEY')])`.
        DEFAULT_CREDENTIAL_VAR
    }

    fn run_id(&self, ctx: &AmbientContext) -> String {
        let raw = match self {
            BackendKind::HostedRunner => ctx.get("GITHUB_RUN_ID").map(|id| {
                format!("{}-{}", id, ctx.get("GITHUB_RUN_ATTEMPT").unwrap_or("1"))
            }),
            BackendKind::ServerPipeline => ctx
                .get("BUILD_TAG")
                .or_else(|| ctx.get("BUILD_NUMBER"))
                .map(str::to_string),
        };
        raw.map(|id| sanitize_id(&id))
            .unwrap_or_else(|| format!("local-{}", chrono::Utc::now().format("%Y%m%d%H%M%S")))
    }
}

/// Run ids end up in file and container names.
fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

fn normalize_image(raw: &str) -> Result<String, ConfigError> {
    let image = raw.trim();
    if image.is_empty() {
        return Err(ConfigError::EmptyImage);
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if image.contains('@') || last_segment.contains(':') {
        return Ok(image.to_string());
    }
    warn!(image = %image, "Scanner image has no tag, pinning to :latest");
    Ok(format!("{}:latest", image))
}

// ==============================================================================
// 3. BackendAdapter
// ==============================================================================

pub struct BackendAdapter {
    backend_override: Option<BackendKind>,
    credential_override: Option<String>,
    image: String,
}

impl BackendAdapter {
    pub fn new(
        backend_override: Option<BackendKind>,
        credential_override: Option<String>,
        image: String,
    ) -> Self {
        Self {
            backend_override,
            credential_override,
            image,
        }
    }

    /// Reads the ambient context into a JobEnvironment. No processes, no writes.
    pub fn resolve(&self, ctx: &AmbientContext) -> Result<JobEnvironment, ConfigError> {
        let backend_kind = self
            .backend_override
            .or_else(|| BackendKind::detect(ctx))
            .ok_or(ConfigError::UnknownBackend)?;

        let workspace_var = backend_kind.workspace_var();
        let workspace_path = ctx
            .get(workspace_var)
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingWorkspace {
                backend: backend_kind,
                var: workspace_var,
            })?;
        if !workspace_path.is_absolute() {
            return Err(ConfigError::RelativeWorkspace(workspace_path));
        }
        if !workspace_path.is_dir() {
            return Err(ConfigError::WorkspaceNotFound(workspace_path));
        }

        let credential_var = self
            .credential_override
            .clone()
            .unwrap_or_else(|| backend_kind.credential_var().to_string());
        let secret = ctx
            .credential(&credential_var)
            .ok_or_else(|| ConfigError::MissingCredential(credential_var.clone()))?;

        let target_container_image = normalize_image(&self.image)?;
        let run_id = backend_kind.run_id(ctx);

        let step_output_file = match backend_kind {
            BackendKind::HostedRunner => ctx.get("GITHUB_OUTPUT").map(PathBuf::from),
            BackendKind::ServerPipeline => None,
        };

        info!(
            backend = %backend_kind,
            run_id = %run_id,
            workspace = %workspace_path.display(),
            image = %target_container_image,
            "Resolved job environment"
        );

        Ok(JobEnvironment {
            backend_kind,
            run_id,
            workspace_path,
            credential_var,
            secret,
            target_container_image,
            step_output_file,
        })
    }
}

// ==============================================================================
// 4. Step Outputs ("artifact paths out")
// ==============================================================================

/// What downstream CI steps need to upload or archive the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutputs {
    pub retained: Option<RetainedArtifact>,
    pub outcome: String,
    pub exit_code: u8,
    pub public_url: Option<String>,
    /// Manifest for a later `scan-relay publish` step.
    pub manifest_path: Option<PathBuf>,
}

impl StepOutputs {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("retained", self.retained.is_some().to_string()),
            ("outcome", self.outcome.clone()),
            ("exit-code", self.exit_code.to_string()),
        ];
        if let Some(artifact) = &self.retained {
            pairs.push(("report-path", artifact.stored_path.display().to_string()));
            pairs.push(("retention-days", artifact.record.retention_days.to_string()));
            pairs.push(("expires-at", artifact.expires_at.to_rfc3339()));
            pairs.push(("upload-condition", artifact.record.upload_condition.to_string()));
        }
        if let Some(manifest) = &self.manifest_path {
            pairs.push(("manifest-path", manifest.display().to_string()));
        }
        if let Some(url) = &self.public_url {
            pairs.push(("public-url", url.clone()));
        }
        pairs
    }
}

/// Writes outputs the way `env.backend_kind` consumes them. Returns the file written, if any.
pub async fn export_outputs(
    env: &JobEnvironment,
    artifact_root: &Path,
    outputs: &StepOutputs,
) -> Result<Option<PathBuf>, ArtifactError> {
    let mut body = String::new();
    for (key, value) in outputs.pairs() {
        // Values never contain newlines: paths and timestamps only.
        let _ = writeln!(body, "{}={}", key, value.replace('\n', " "));
    }

    match env.backend_kind {
        BackendKind::HostedRunner => {
            let Some(path) = &env.step_output_file else {
                debug!("GITHUB_OUTPUT not set, skipping step outputs");
                return Ok(None);
            };
            // $GITHUB_OUTPUT is shared by every step of the job: append, never replace.
            let io_err = |source| ArtifactError::Io { path: path.clone(), source };
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(io_err)?;
            file.write_all(body.as_bytes()).await.map_err(io_err)?;
            file.flush().await.map_err(io_err)?;
            Ok(Some(path.clone()))
        }
        BackendKind::ServerPipeline => {
            let path = artifact_root.join(PROPERTIES_FILE);
            crate::sys::artifact::write_atomic(&path, body.as_bytes()).await?;
            Ok(Some(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BackendAdapter {
        BackendAdapter::new(None, None, "code-analyzer:1.2".into())
    }

    fn github_ctx(ws: &Path) -> AmbientContext {
        AmbientContext::from_pairs([
            ("GITHUB_ACTIONS", "true".to_string()),
            ("GITHUB_WORKSPACE", ws.display().to_string()),
            ("GITHUB_RUN_ID", "7781".to_string()),
            ("GITHUB_RUN_ATTEMPT", "2".to_string()),
            ("GROQ_API_KEY", "gsk_test".to_string()),
        ])
    }

    #[test]
    fn resolves_hosted_runner() {
        let ws = tempfile::tempdir().unwrap();
        let env = adapter().resolve(&github_ctx(ws.path())).unwrap();
        assert_eq!(env.backend_kind, BackendKind::HostedRunner);
        assert_eq!(env.workspace_path, ws.path());
        assert_eq!(env.run_id, "7781-2");
        assert_eq!(env.target_container_image, "code-analyzer:1.2");
        assert_eq!(env.secret.use_secret(|b| b.to_vec()), b"gsk_test".to_vec());
    }

    #[test]
    fn resolves_server_pipeline_with_same_contract() {
        let ws = tempfile::tempdir().unwrap();
        let ctx = AmbientContext::from_pairs([
            ("JENKINS_URL", "https://ci.internal/".to_string()),
            ("WORKSPACE", ws.path().display().to_string()),
            ("BUILD_TAG", "jenkins-scan-main-41".to_string()),
            ("GROQ_API_KEY", "gsk_test".to_string()),
        ]);
        let env = adapter().resolve(&ctx).unwrap();
        assert_eq!(env.backend_kind, BackendKind::ServerPipeline);
        assert_eq!(env.workspace_path, ws.path());
        assert_eq!(env.run_id, "jenkins-scan-main-41");
        assert!(env.step_output_file.is_none());
    }

    #[test]
    fn missing_credential_is_config_error() {
        let ws = tempfile::tempdir().unwrap();
        let ctx = AmbientContext::from_pairs([
            ("GITHUB_ACTIONS", "true".to_string()),
            ("GITHUB_WORKSPACE", ws.path().display().to_string()),
            ("GROQ_API_KEY", "  ".to_string()),
        ]);
        let err = adapter().resolve(&ctx).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential(ref v) if v == "GROQ_API_KEY"));
    }

    #[test]
    fn missing_workspace_is_config_error() {
        let ctx = AmbientContext::from_pairs([("GITHUB_ACTIONS", "true"), ("GROQ_API_KEY", "k")]);
        assert!(matches!(
            adapter().resolve(&ctx),
            Err(ConfigError::MissingWorkspace { var: "GITHUB_WORKSPACE", .. })
        ));
    }

    #[test]
    fn relative_or_absent_workspace_is_rejected() {
        let ctx = AmbientContext::from_pairs([
            ("JENKINS_HOME", "/var/jenkins"),
            ("WORKSPACE", "relative/ws"),
            ("GROQ_API_KEY", "k"),
        ]);
        assert!(matches!(adapter().resolve(&ctx), Err(ConfigError::RelativeWorkspace(_))));

        let ctx = AmbientContext::from_pairs([
            ("JENKINS_HOME", "/var/jenkins"),
            ("WORKSPACE", "/definitely/not/here/ws"),
            ("GROQ_API_KEY", "k"),
        ]);
        assert!(matches!(adapter().resolve(&ctx), Err(ConfigError::WorkspaceNotFound(_))));
    }

    #[test]
    fn unknown_backend_without_override() {
        let ctx = AmbientContext::from_pairs([("GROQ_API_KEY", "k")]);
        assert!(matches!(adapter().resolve(&ctx), Err(ConfigError::UnknownBackend)));
    }

    #[test]
    fn override_wins_over_detection() {
        let ws = tempfile::tempdir().unwrap();
        let ctx = AmbientContext::from_pairs([
            ("GITHUB_ACTIONS", "true".to_string()),
            ("WORKSPACE", ws.path().display().to_string()),
            ("SCANNER_TOKEN", "k".to_string()),
        ]);
        let adapter = BackendAdapter::new(
            Some(BackendKind::ServerPipeline),
            Some("SCANNER_TOKEN".into()),
            "scanner".into(),
        );
        let env = adapter.resolve(&ctx).unwrap();
        assert_eq!(env.backend_kind, BackendKind::ServerPipeline);
        assert_eq!(env.credential_var, "SCANNER_TOKEN");
        assert_eq!(env.target_container_image, "scanner:latest");
    }

    #[test]
    fn non_utf8_entries_are_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let ws = tempfile::tempdir().unwrap();
        let ctx = AmbientContext::from_os_pairs([
            (OsString::from("GITHUB_ACTIONS"), OsString::from("true")),
            (OsString::from("GITHUB_WORKSPACE"), ws.path().as_os_str().to_os_string()),
            (OsString::from("GITHUB_RUN_ID"), OsString::from("12")),
            (OsString::from("LANG_NOTE"), OsString::from_vec(b"caf\xe9".to_vec())),
            (OsString::from_vec(b"\xffKEY".to_vec()), OsString::from("x")),
            (OsString::from("GROQ_API_KEY"), OsString::from("gsk_test")),
        ]);
        assert_eq!(ctx.get("LANG_NOTE"), None);
        assert_eq!(ctx.vars.len(), 4);

        let env = adapter().resolve(&ctx).unwrap();
        assert_eq!(env.backend_kind, BackendKind::HostedRunner);
        assert_eq!(env.run_id, "12-1");
    }

    #[test]
    fn image_normalization() {
        assert_eq!(normalize_image("ghcr.io/acme/scan:2").unwrap(), "ghcr.io/acme/scan:2");
        assert_eq!(normalize_image("localhost:5000/scan").unwrap(), "localhost:5000/scan:latest");
        assert_eq!(normalize_image("scan@sha256:abc").unwrap(), "scan@sha256:abc");
        assert!(matches!(normalize_image(" "), Err(ConfigError::EmptyImage)));
    }

    #[test]
    fn run_ids_are_file_safe() {
        assert_eq!(sanitize_id("jenkins-org/repo#12"), "jenkins-org-repo-12");
    }

    #[tokio::test]
    async fn hosted_runner_appends_to_github_output() {
        let ws = tempfile::tempdir().unwrap();
        let output = ws.path().join("gh_output");
        std::fs::write(&output, "earlier=step\n").unwrap();
        let mut env = adapter().resolve(&github_ctx(ws.path())).unwrap();
        env.step_output_file = Some(output.clone());

        let outputs = StepOutputs {
            retained: None,
            outcome: "hard failure: no report".into(),
            exit_code: 3,
            public_url: None,
            manifest_path: None,
        };
        export_outputs(&env, ws.path(), &outputs).await.unwrap();

        let written = std::fs::read_to_string(&output).unwrap();
        assert!(written.starts_with("earlier=step\n"));
        assert!(written.contains("retained=false\n"));
        assert!(written.contains("exit-code=3\n"));
        assert!(!written.contains("report-path"));
    }

    #[tokio::test]
    async fn server_pipeline_writes_properties_file() {
        let ws = tempfile::tempdir().unwrap();
        let ctx = AmbientContext::from_pairs([
            ("JENKINS_URL", "https://ci/".to_string()),
            ("WORKSPACE", ws.path().display().to_string()),
            ("GROQ_API_KEY", "k".to_string()),
        ]);
        let env = adapter().resolve(&ctx).unwrap();
        let root = ws.path().join(".scan-relay");
        let outputs = StepOutputs {
            retained: None,
            outcome: "success".into(),
            exit_code: 0,
            public_url: Some("https://scans.example/report.html".into()),
            manifest_path: Some(root.join("41.manifest.json")),
        };
        let path = export_outputs(&env, &root, &outputs).await.unwrap().unwrap();
        assert_eq!(path, root.join(PROPERTIES_FILE));
        let body = std::fs::read_to_string(path).unwrap();
        assert!(body.contains("public-url=https://scans.example/report.html"));
        assert!(body.contains("manifest-path="));
    }
}
