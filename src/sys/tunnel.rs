// src/sys/tunnel.rs
//
// ngrok-backed reverse tunnel: binds a reserved public hostname to the local
// static server and reports readiness from ngrok's JSON log stream.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::config::ToolCommand;
use crate::error::TunnelError;
use crate::sys::secrets::ProviderCredential;
use crate::sys::traits::{TunnelHandle, TunnelProvider, TunnelRequest};

const TOKEN_VAR: &str = "NGROK_AUTHTOKEN";
const STOP_GRACE: Duration = Duration::from_secs(5);

static NGROK_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ERR_NGROK_(\d+)").expect("static regex"));

/// 🛡️ Strictly validates hostnames before they reach any command line.
pub fn validate_hostname(hostname: &str) -> Result<(), TunnelError> {
    let invalid = || TunnelError::InvalidHostname(hostname.to_string());
    if hostname.is_empty() || hostname.len() > 253 {
        return Err(invalid());
    }
    if hostname.starts_with('-') || hostname.starts_with('.') || hostname.ends_with('.') {
        return Err(invalid());
    }
    if hostname.contains("..") {
        return Err(invalid());
    }
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
        return Err(invalid());
    }
    Ok(())
}

/// Maps an ngrok failure message to our taxonomy.
pub fn classify_failure(hostname: &str, message: &str) -> TunnelError {
    let code = NGROK_CODE_RE
        .captures(message)
        .and_then(|c| c[1].parse::<u32>().ok());
    let summary = message.lines().find(|l| !l.trim().is_empty()).unwrap_or(message).trim().to_string();
    match code {
        // 105: malformed authtoken, 106: authtoken for another account, 107: revoked.
        Some(105..=107) => TunnelError::AuthRejected(summary),
        // 334: the endpoint is already online elsewhere.
        Some(334) => TunnelError::HostnameInUse {
            hostname: hostname.to_string(),
        },
        _ if message.contains("authentication failed") => TunnelError::AuthRejected(summary),
        _ => TunnelError::Startup(summary),
    }
}

/// One line of `ngrok --log-format json`.
#[derive(Debug, Deserialize)]
struct NgrokLogLine {
    #[serde(default)]
    lvl: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    err: Option<String>,
}

enum Readiness {
    Online(String),
    Failed(String),
}

fn interpret(line: &str) -> Option<Readiness> {
    let entry: NgrokLogLine = serde_json::from_str(line).ok()?;
    if entry.msg == "started tunnel" {
        return entry.url.map(Readiness::Online);
    }
    if matches!(entry.lvl.as_str(), "eror" | "crit") {
        let detail = entry.err.unwrap_or(entry.msg);
        // ngrok logs "<nil>" on clean session closes.
        if detail != "<nil>" {
            return Some(Readiness::Failed(detail));
        }
    }
    None
}

/// Logs one of ngrok's pipes until EOF so it never blocks on a full pipe.
async fn drain<R>(mut reader: R, stream: &'static str, token: &ProviderCredential)
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&buf);
        debug!(target: "tunnel", stream, "{}", token.scrub(line.trim_end()));
    }
}

pub struct NgrokTunnel {
    command: ToolCommand,
}

impl NgrokTunnel {
    pub fn new(command: ToolCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl TunnelProvider for NgrokTunnel {
    async fn open(&self, request: &TunnelRequest<'_>) -> Result<TunnelHandle, TunnelError> {
        validate_hostname(request.hostname)?;

        let mut cmd = self.command.tokio();
        cmd.arg("http")
            .arg(format!("http://127.0.0.1:{}", request.local_port))
            .arg("--url")
            .arg(request.hostname)
            .args(["--log", "stdout", "--log-format", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        request.token.inject_env(&mut cmd, TOKEN_VAR);

        let mut child = cmd
            .spawn()
            .map_err(|e| TunnelError::Startup(format!("failed to spawn '{}': {}", self.command.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TunnelError::Startup("tunnel stdout unavailable".into()))?;
        let mut lines = LinesStream::new(BufReader::new(stdout).lines());

        let ready = tokio::time::timeout(request.ready_timeout, async {
            while let Some(Ok(line)) = lines.next().await {
                debug!(target: "tunnel", "{}", request.token.scrub(&line));
                match interpret(&line) {
                    Some(state) => return Some(state),
                    None => continue,
                }
            }
            None
        })
        .await;

        let failure = match ready {
            Ok(Some(Readiness::Online(url))) => {
                let token = request.token.use_secret(|bytes| ProviderCredential::new(bytes.to_vec()));
                let stdout = lines.into_inner().into_inner();
                let stderr = child.stderr.take();
                tokio::spawn(async move {
                    let stderr = async {
                        if let Some(pipe) = stderr {
                            drain(BufReader::new(pipe), "stderr", &token).await;
                        }
                    };
                    tokio::join!(drain(stdout, "stdout", &token), stderr);
                });
                let id = child
                    .id()
                    .map(|pid| format!("ngrok-{}", pid))
                    .unwrap_or_else(|| "ngrok".to_string());
                info!(tunnel = %id, url = %url, "Tunnel online");
                return Ok(TunnelHandle {
                    id,
                    public_url: url,
                    process: Some(child),
                });
            }
            Ok(Some(Readiness::Failed(detail))) => detail,
            Ok(None) => {
                // stdout closed: the process is exiting. Its stderr says why.
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                let status = child.wait().await.ok().and_then(|s| s.code());
                if stderr.trim().is_empty() {
                    format!("tunnel exited with status {:?}", status)
                } else {
                    stderr
                }
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(TunnelError::StartupTimeout(request.ready_timeout));
            }
        };

        let _ = child.kill().await;
        let err = classify_failure(request.hostname, &request.token.scrub(&failure));
        warn!(hostname = %request.hostname, error = %err, "Tunnel failed to start");
        Err(err)
    }

    async fn close(&self, mut handle: TunnelHandle) -> Result<(), TunnelError> {
        let Some(mut child) = handle.process.take() else {
            return Ok(());
        };

        // 🛡️ SIGTERM first so ngrok deregisters the endpoint, then SIGKILL.
        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(tunnel = %handle.id, error = %e, "SIGTERM failed");
            }
            if let Ok(status) = tokio::time::timeout(STOP_GRACE, child.wait()).await {
                let status = status.map_err(|e| TunnelError::Shutdown(e.to_string()))?;
                info!(tunnel = %handle.id, ?status, "Tunnel closed");
                return Ok(());
            }
            warn!(tunnel = %handle.id, "Tunnel ignored SIGTERM, killing");
        }

        child
            .kill()
            .await
            .map_err(|e| TunnelError::Shutdown(e.to_string()))?;
        info!(tunnel = %handle.id, "Tunnel killed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    fn fake_ngrok(dir: &Path, body: &str) -> ToolCommand {
        let script = dir.join("fake-ngrok.sh");
        std::fs::write(&script, body).unwrap();
        ToolCommand::new("sh", vec![script.display().to_string()])
    }

    fn request<'a>(token: &'a ProviderCredential) -> TunnelRequest<'a> {
        TunnelRequest {
            hostname: "scans.example.ngrok.app",
            local_port: 8089,
            token,
            ready_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn hostname_validation() {
        assert!(validate_hostname("scans.example.ngrok.app").is_ok());
        assert!(validate_hostname("my-scan-01.example.com").is_ok());
        for bad in ["", "a..b", "-lead.com", "trail.com.", "has space.com", "semi;colon", "a/b", "x\ny"] {
            assert!(validate_hostname(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn error_codes_are_classified() {
        assert!(matches!(
            classify_failure("h", "authentication failed: bad token\n\nERR_NGROK_105\n"),
            TunnelError::AuthRejected(_)
        ));
        assert!(matches!(
            classify_failure("h", "The authtoken has been revoked. ERR_NGROK_107"),
            TunnelError::AuthRejected(_)
        ));
        assert!(matches!(
            classify_failure("h", "The endpoint is already online. ERR_NGROK_334"),
            TunnelError::HostnameInUse { ref hostname } if hostname == "h"
        ));
        assert!(matches!(classify_failure("h", "dial tcp: timeout"), TunnelError::Startup(_)));
    }

    #[test]
    fn log_lines_are_interpreted() {
        let online = r#"{"lvl":"info","msg":"started tunnel","url":"https://scans.example.ngrok.app"}"#;
        assert!(matches!(interpret(online), Some(Readiness::Online(u)) if u == "https://scans.example.ngrok.app"));

        let failed = r#"{"lvl":"eror","msg":"session closing","err":"authentication failed ERR_NGROK_105"}"#;
        assert!(matches!(interpret(failed), Some(Readiness::Failed(e)) if e.contains("ERR_NGROK_105")));

        let clean = r#"{"lvl":"eror","msg":"session closed","err":"<nil>"}"#;
        assert!(interpret(clean).is_none());
        assert!(interpret("not json").is_none());
    }

    #[tokio::test]
    async fn online_tunnel_is_returned_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        let args_log = dir.path().join("args.log");
        let body = format!(
            r#"echo "$@" > "{args}"
echo "$NGROK_AUTHTOKEN" >> "{args}"
echo '{{"lvl":"info","msg":"started tunnel","url":"https://scans.example.ngrok.app"}}'
exec sleep 30
"#,
            args = args_log.display()
        );
        let provider = NgrokTunnel::new(fake_ngrok(dir.path(), &body));
        let token = ProviderCredential::new(b"2abcTOKEN".to_vec());

        let handle = provider.open(&request(&token)).await.unwrap();
        assert_eq!(handle.public_url, "https://scans.example.ngrok.app");
        assert!(handle.process.is_some());

        let recorded = std::fs::read_to_string(&args_log).unwrap();
        let mut lines = recorded.lines();
        let argv = lines.next().unwrap();
        assert!(argv.contains("http http://127.0.0.1:8089 --url scans.example.ngrok.app"));
        assert!(!argv.contains("2abcTOKEN"));
        assert_eq!(lines.next(), Some("2abcTOKEN"));

        provider.close(handle).await.unwrap();
    }

    #[tokio::test]
    async fn chatty_stderr_after_startup_is_drained() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("past-stderr");
        let body = format!(
            r#"echo '{{"lvl":"info","msg":"started tunnel","url":"https://scans.example.ngrok.app"}}'
head -c 200000 /dev/zero | tr '\0' 'x' >&2
touch "{marker}"
exec sleep 30
"#,
            marker = marker.display()
        );
        let provider = NgrokTunnel::new(fake_ngrok(dir.path(), &body));
        let token = ProviderCredential::new(b"tok".to_vec());
        let handle = provider.open(&request(&token)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !marker.exists() {
            assert!(tokio::time::Instant::now() < deadline, "tunnel blocked writing stderr");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        provider.close(handle).await.unwrap();
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn drained_lines_are_scrubbed() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let token = ProviderCredential::new(b"2abcTOKEN".to_vec());
        let output: &[u8] = b"session uses 2abcTOKEN\n\xffbinary\nlast 2abcTOKEN line\n";
        drain(output, "stdout", &token).await;

        let logged = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(!logged.contains("2abcTOKEN"));
        assert_eq!(logged.matches("[REDACTED]").count(), 2);
        assert!(logged.contains("binary"));
    }

    #[tokio::test]
    async fn rejected_token_is_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"echo 'ERROR:  authentication failed: The authtoken you specified does not look like a proper ngrok tunnel authtoken.' >&2
echo 'ERROR:  ERR_NGROK_105' >&2
exit 1
"#;
        let provider = NgrokTunnel::new(fake_ngrok(dir.path(), body));
        let token = ProviderCredential::new(b"nope".to_vec());
        let err = provider.open(&request(&token)).await.unwrap_err();
        assert!(matches!(err, TunnelError::AuthRejected(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn json_error_line_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"echo '{"lvl":"eror","msg":"failed to start tunnel","err":"The endpoint is already online. ERR_NGROK_334"}'
exec sleep 30
"#;
        let provider = NgrokTunnel::new(fake_ngrok(dir.path(), body));
        let token = ProviderCredential::new(b"tok".to_vec());
        let err = provider.open(&request(&token)).await.unwrap_err();
        assert!(matches!(err, TunnelError::HostnameInUse { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn silent_tunnel_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let provider = NgrokTunnel::new(fake_ngrok(dir.path(), "exec sleep 30\n"));
        let token = ProviderCredential::new(b"tok".to_vec());
        let mut req = request(&token);
        req.ready_timeout = Duration::from_millis(300);
        let err = provider.open(&req).await.unwrap_err();
        assert!(matches!(err, TunnelError::StartupTimeout(_)));
    }

    #[tokio::test]
    async fn invalid_hostname_never_spawns() {
        let provider = NgrokTunnel::new(ToolCommand::new("/nonexistent/ngrok", vec![]));
        let token = ProviderCredential::new(b"tok".to_vec());
        let mut req = request(&token);
        req.hostname = "evil.com;rm -rf /";
        assert!(matches!(provider.open(&req).await, Err(TunnelError::InvalidHostname(_))));
    }
}
