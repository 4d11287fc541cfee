// src/pipeline.rs
//
// Orchestrates one run: resolve -> scan -> register -> publish+hold -> export.
// Configuration and scanner-invocation failures abort; artifact and tunnel
// failures are recorded on the summary and never roll back earlier stages.

use tracing::{error, info, warn};

use crate::config::{PipelineConfig, PublishArgs, PublishConfig, ToolCommand};
use crate::error::{ArtifactError, PipelineError, PublishStepError, TunnelError};
use crate::sys::artifact::ArtifactManager;
use crate::sys::backend::{export_outputs, AmbientContext, BackendAdapter, StepOutputs};
use crate::sys::job::{FailureReason, RetainedArtifact, ScanOutcome};
use crate::sys::publish::{PublishTunnel, TunnelSettings};
use crate::sys::scanner::ContainerScanRunner;
use crate::sys::shutdown::ShutdownToken;
use crate::sys::static_server::ContainerStaticServer;
use crate::sys::traits::ScanRunner;
use crate::sys::tunnel::NgrokTunnel;

/// Wires the container static server and the ngrok tunnel from configuration.
pub fn build_publisher(
    runtime: ToolCommand,
    config: &PublishConfig,
    ambient: &AmbientContext,
) -> Result<PublishTunnel, TunnelError> {
    let hostname = config
        .public_hostname
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(TunnelError::MissingHostname)?
        .to_string();
    let token = ambient
        .credential(&config.tunnel_token_env)
        .ok_or_else(|| TunnelError::MissingToken(config.tunnel_token_env.clone()))?;

    PublishTunnel::new(
        Box::new(ContainerStaticServer::new(
            runtime,
            config.server_image.clone(),
            config.tunnel_ready_timeout,
        )),
        Box::new(NgrokTunnel::new(ToolCommand::parse(&config.tunnel_program))),
        TunnelSettings {
            hostname,
            local_port: config.server_port,
            token,
            ready_timeout: config.tunnel_ready_timeout,
        },
    )
}

// ==============================================================================
// 1. Run Summary
// ==============================================================================

/// Everything a finished (non-aborted) run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    pub outcome: ScanOutcome,
    pub scanner_exit_code: i32,
    pub retained: Option<RetainedArtifact>,
    pub artifact_error: Option<ArtifactError>,
    pub public_url: Option<String>,
    pub tunnel_error: Option<TunnelError>,
    pub fail_on_findings: bool,
}

impl RunSummary {
    /// Process exit code. Tunnel failures never influence it.
    pub fn exit_code(&self) -> u8 {
        let scanner = self.scanner_exit_code.clamp(1, 255) as u8;
        match self.outcome {
            ScanOutcome::Success if self.artifact_error.is_some() => 1,
            ScanOutcome::Success => 0,
            ScanOutcome::PartialFailure if self.fail_on_findings => scanner,
            ScanOutcome::PartialFailure if self.artifact_error.is_some() => 1,
            ScanOutcome::PartialFailure => 0,
            ScanOutcome::HardFailure(_) => scanner,
        }
    }
}

// ==============================================================================
// 2. Pipeline
// ==============================================================================

pub struct ScanPipeline {
    config: PipelineConfig,
    /// Injected runner; the container runner is built per run otherwise.
    runner: Option<Box<dyn ScanRunner>>,
    /// Injected publisher; built from `config.publish` otherwise.
    publisher: Option<PublishTunnel>,
}

impl ScanPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            runner: None,
            publisher: None,
        }
    }

    #[cfg(test)]
    pub fn with_components(
        config: PipelineConfig,
        runner: Box<dyn ScanRunner>,
        publisher: Option<PublishTunnel>,
    ) -> Self {
        Self {
            config,
            runner: Some(runner),
            publisher,
        }
    }

    pub async fn run(
        &self,
        ambient: &AmbientContext,
        mut shutdown: ShutdownToken,
    ) -> Result<RunSummary, PipelineError> {
        let cfg = &self.config;

        // --- Stage 1: BackendAdapter ---
        let env = BackendAdapter::new(cfg.backend, cfg.credential_env.clone(), cfg.image.clone())
            .resolve(ambient)?;
        let artifacts = ArtifactManager::new(cfg.artifact_root(&env.workspace_path), cfg.retention_days);

        if shutdown.is_shutdown() {
            return Err(PipelineError::Cancelled);
        }

        // --- Stage 2: ScanJobRunner ---
        let container_runner;
        let runner: &dyn ScanRunner = match &self.runner {
            Some(runner) => runner.as_ref(),
            None => {
                container_runner = ContainerScanRunner::new(
                    cfg.runtime_command(),
                    cfg.report_file.clone(),
                    cfg.scan_timeout,
                )
                .with_log_file(artifacts.scanner_log_path(&env.run_id));
                &container_runner
            }
        };

        // Dropping the scan future kills the runtime process and removes the container.
        let result = tokio::select! {
            res = runner.run(&env) => res?,
            _ = shutdown.wait() => {
                warn!(run_id = %env.run_id, "Termination signal during scan, aborting run");
                return Err(PipelineError::Cancelled);
            }
        };

        if result.outcome == ScanOutcome::HardFailure(FailureReason::Timeout) {
            error!(run_id = %env.run_id, timeout_secs = cfg.scan_timeout.as_secs(), "Scanner timed out");
            return Err(PipelineError::ScannerTimeout(cfg.scan_timeout));
        }

        // --- Stage 3: ArtifactManager ---
        let (retained, artifact_error) =
            match artifacts.register(&env.run_id, &result, cfg.upload_condition).await {
                Ok(retained) => (retained, None),
                Err(e) => {
                    error!(run_id = %env.run_id, error = %e, "Artifact registration failed");
                    (None, Some(e))
                }
            };

        // --- Stage 4: PublishTunnel ---
        let mut public_url = None;
        let mut tunnel_error = None;
        if cfg.publish.enabled {
            match &retained {
                Some(artifact) => match self.publish_and_hold(ambient, artifact, &mut shutdown).await {
                    Ok(url) => public_url = Some(url),
                    Err(e) => {
                        warn!(run_id = %env.run_id, error = %e, "Publishing failed; report stays retained");
                        tunnel_error = Some(e);
                    }
                },
                None => info!(run_id = %env.run_id, "No retained report, nothing to publish"),
            }
        }

        let summary = RunSummary {
            run_id: env.run_id.clone(),
            outcome: result.outcome,
            scanner_exit_code: result.exit_code,
            retained,
            artifact_error,
            public_url,
            tunnel_error,
            fail_on_findings: cfg.fail_on_findings,
        };

        // --- Artifact paths out ---
        let outputs = StepOutputs {
            retained: summary.retained.clone(),
            outcome: summary.outcome.to_string(),
            exit_code: summary.exit_code(),
            public_url: summary.public_url.clone(),
            manifest_path: summary
                .retained
                .as_ref()
                .map(|artifact| artifacts.manifest_path(&artifact.run_id)),
        };
        match export_outputs(&env, artifacts.artifact_root(), &outputs).await {
            Ok(Some(path)) => info!(path = %path.display(), "Step outputs written"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to write step outputs"),
        }

        info!(
            run_id = %summary.run_id,
            backend = %env.backend_kind,
            outcome = %summary.outcome,
            exit_code = summary.exit_code(),
            retained = summary.retained.is_some(),
            scan_duration_ms = result.duration.as_millis() as u64,
            scanner_log = ?result.log_path,
            "Run finished"
        );
        Ok(summary)
    }

    async fn publish_and_hold(
        &self,
        ambient: &AmbientContext,
        artifact: &RetainedArtifact,
        shutdown: &mut ShutdownToken,
    ) -> Result<String, TunnelError> {
        let built;
        let publisher = match &self.publisher {
            Some(publisher) => publisher,
            None => {
                built = build_publisher(self.config.runtime_command(), &self.config.publish, ambient)?;
                &built
            }
        };
        hold_published(publisher, artifact, &self.config.publish, shutdown).await
    }
}

async fn hold_published(
    publisher: &PublishTunnel,
    artifact: &RetainedArtifact,
    config: &PublishConfig,
    shutdown: &mut ShutdownToken,
) -> Result<String, TunnelError> {
    let session = publisher
        .publish_or_cancel(artifact, config.lease, shutdown)
        .await?;
    let url = session.public_url.clone();
    // The URL was live; a teardown failure is logged, not treated as a failed publish.
    if let Err(e) = publisher.hold(&session, shutdown).await {
        error!(url = %url, error = %e, "Teardown after lease failed");
    }
    Ok(url)
}

// ==============================================================================
// 3. Standalone Publish
// ==============================================================================

/// Serves the report recorded in `args.manifest` for one lease.
pub async fn publish_manifest(
    args: &PublishArgs,
    ambient: &AmbientContext,
    mut shutdown: ShutdownToken,
) -> Result<String, PublishStepError> {
    let artifact = ArtifactManager::load_manifest(&args.manifest).await?;
    info!(
        run_id = %artifact.run_id,
        path = %artifact.stored_path.display(),
        expires_at = %artifact.expires_at.to_rfc3339(),
        "Loaded retained report"
    );
    let publisher = build_publisher(ToolCommand::parse(&args.container_runtime), &args.publish, ambient)?;
    Ok(hold_published(&publisher, &artifact, &args.publish, &mut shutdown).await?)
}
