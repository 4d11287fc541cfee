// src/sys/artifact.rs
//
// Turns a ScanResult into a retained artifact according to the upload policy.
//
// NOTE: the retention window is advisory metadata. It is stamped onto the
// manifest and the step outputs; expiry itself belongs to the hosting
// artifact store (upload-artifact `retention-days`, Jenkins build discarder).
// Do not add expiry timers here.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::{NamedTempFile, TempPath};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::ArtifactError;
use crate::sys::job::{ArtifactRecord, RetainedArtifact, ScanResult, UploadCondition};

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reserves a uniquely named temp file next to `path`, so the final rename
/// never crosses filesystems. Removed on drop unless persisted.
async fn temp_beside(path: &Path) -> Result<TempPath, ArtifactError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    Ok(NamedTempFile::new_in(parent).map_err(io_err(parent))?.into_temp_path())
}

fn persist(tmp: TempPath, path: &Path) -> Result<(), ArtifactError> {
    tmp.persist(path).map_err(|e| ArtifactError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })
}

/// Write-to-temp then rename, so readers never observe a half-written file.
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), ArtifactError> {
    let tmp = temp_beside(path).await?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&tmp)
        .await
        .map_err(io_err(path))?;
    file.write_all(content).await.map_err(io_err(path))?;
    file.sync_all().await.map_err(io_err(path))?;
    drop(file);
    persist(tmp, path)
}

/// Same as `write_atomic`, streaming from `source`. Returns the bytes copied.
async fn copy_atomic(source: &Path, path: &Path) -> Result<u64, ArtifactError> {
    let tmp = temp_beside(path).await?;
    let copied = fs::copy(source, &tmp).await.map_err(io_err(source))?;
    persist(tmp, path)?;
    Ok(copied)
}

pub struct ArtifactManager {
    artifact_root: PathBuf,
    retention_days: u32,
}

impl ArtifactManager {
    pub fn new(artifact_root: PathBuf, retention_days: u32) -> Self {
        Self {
            artifact_root,
            retention_days,
        }
    }

    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    /// Directory holding nothing but the retained report of `run_id`. This is what gets served.
    pub fn served_dir(&self, run_id: &str) -> PathBuf {
        self.artifact_root.join(run_id)
    }

    pub fn manifest_path(&self, run_id: &str) -> PathBuf {
        self.artifact_root.join(format!("{}.manifest.json", run_id))
    }

    pub fn scanner_log_path(&self, run_id: &str) -> PathBuf {
        self.artifact_root.join(format!("{}.scanner.log", run_id))
    }

    /// Applies `condition` to `result`.
    ///
    /// * `Ok(None)`: the policy does not ask for this run's report.
    /// * `Err(MissingArtifact)`: the policy asks for it but no report file exists.
    pub async fn register(
        &self,
        run_id: &str,
        result: &ScanResult,
        condition: UploadCondition,
    ) -> Result<Option<RetainedArtifact>, ArtifactError> {
        if !condition.demands(result.outcome) {
            info!(
                condition = %condition,
                outcome = %result.outcome,
                "Upload condition not met, report not retained"
            );
            return Ok(None);
        }

        // 🛡️ Never register a path that does not exist, even if the scanner claimed one.
        let claimed = match &result.report_path {
            Some(path) => fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false),
            None => false,
        };
        let source = match &result.report_path {
            Some(path) if claimed => path.clone(),
            _ => {
                return Err(ArtifactError::MissingArtifact {
                    condition,
                    outcome: result.outcome,
                    expected: Some(result.expected_report.clone()),
                });
            }
        };

        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| ArtifactError::MissingArtifact {
                condition,
                outcome: result.outcome,
                expected: Some(source.clone()),
            })?;

        let stored_path = self.served_dir(run_id).join(&file_name);
        let size_bytes = copy_atomic(&source, &stored_path).await?;

        let record = ArtifactRecord {
            source_path: source,
            retention_days: self.retention_days,
            upload_condition: condition,
        };
        let registered_at = Utc::now();
        let artifact = RetainedArtifact {
            run_id: run_id.to_string(),
            expires_at: registered_at + record.retention_window(),
            record,
            file_name,
            stored_path,
            size_bytes,
            outcome: result.outcome,
            exit_code: result.exit_code,
            scan_started_at: result.started_at,
            scan_finished_at: result.finished_at,
            scan_duration_ms: result.duration.as_millis() as u64,
            scanner_log: result.log_path.clone(),
            registered_at,
        };

        let manifest = serde_json::to_vec_pretty(&artifact)?;
        write_atomic(&self.manifest_path(run_id), &manifest).await?;

        info!(
            run_id = %run_id,
            path = %artifact.stored_path.display(),
            size_bytes = artifact.size_bytes,
            retention_days = artifact.record.retention_days,
            expires_at = %artifact.expires_at.to_rfc3339(),
            "Report retained"
        );

        Ok(Some(artifact))
    }

    /// Loads a manifest written by `register`, checking the report is still on disk.
    pub async fn load_manifest(path: &Path) -> Result<RetainedArtifact, ArtifactError> {
        let raw = fs::read(path).await.map_err(io_err(path))?;
        let artifact: RetainedArtifact = serde_json::from_slice(&raw)?;
        let present = fs::metadata(&artifact.stored_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !present {
            warn!(path = %artifact.stored_path.display(), "Manifest points at a missing report");
            return Err(ArtifactError::MissingArtifact {
                condition: artifact.record.upload_condition,
                outcome: artifact.outcome,
                expected: Some(artifact.stored_path),
            });
        }
        Ok(artifact)
    }
}
