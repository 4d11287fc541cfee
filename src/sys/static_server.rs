// src/sys/static_server.rs
//
// Serves the retained report from an nginx container bound to loopback.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ToolCommand;
use crate::error::TunnelError;
use crate::sys::traits::{ServerHandle, StaticServer};

const READY_POLL: Duration = Duration::from_millis(200);

/// nginx config for a single-file site: no listing, no sniffing, `/` -> report.
fn render_nginx_conf(index_file: &str) -> String {
    format!(
        r#"server {{
    listen 80;
    server_name _;
    root /usr/share/nginx/html;

    autoindex off;
    server_tokens off;
    add_header X-Content-Type-Options "nosniff" always;
    add_header Cache-Control "no-store" always;

    location = / {{
        return 302 /{index_file};
    }}

    location / {{
        try_files $uri =404;
    }}
}}
"#,
        index_file = index_file
    )
}

/// Waits until something accepts TCP connections on 127.0.0.1:`port`.
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let probe = async {
        loop {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return;
            }
            tokio::time::sleep(READY_POLL).await;
        }
    };
    tokio::time::timeout(timeout, probe).await.is_ok()
}

pub struct ContainerStaticServer {
    runtime: ToolCommand,
    image: String,
    ready_timeout: Duration,
    /// Generated nginx configs, kept alive while their container runs.
    configs: Mutex<Vec<(String, TempDir)>>,
}

impl ContainerStaticServer {
    pub fn new(runtime: ToolCommand, image: String, ready_timeout: Duration) -> Self {
        Self {
            runtime,
            image,
            ready_timeout,
            configs: Mutex::new(Vec::new()),
        }
    }

    fn container_name(port: u16) -> String {
        format!("scan-relay-web-{}-{}", port, std::process::id())
    }

    async fn index_file(root: &Path) -> String {
        // The served directory holds exactly one report.
        let first = match tokio::fs::read_dir(root).await {
            Ok(mut entries) => entries.next_entry().await.ok().flatten(),
            Err(_) => None,
        };
        first
            .and_then(|e| e.file_name().to_str().map(str::to_string))
            .unwrap_or_else(|| "index.html".to_string())
    }

    async fn remove_container(&self, name: &str) -> Result<(), TunnelError> {
        let out = self
            .runtime
            .tokio()
            .args(["rm", "-f", name])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TunnelError::ServerStop(format!("runtime spawn failed: {}", e)))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            // Already gone counts as stopped.
            if !stderr.contains("No such container") {
                return Err(TunnelError::ServerStop(stderr.trim().to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StaticServer for ContainerStaticServer {
    async fn start(&self, root: &Path, port: u16) -> Result<ServerHandle, TunnelError> {
        if port == 0 {
            return Err(TunnelError::ServerStart("port 0 is reserved".into()));
        }
        let root: PathBuf = root
            .canonicalize()
            .map_err(|e| TunnelError::ServerStart(format!("cannot serve '{}': {}", root.display(), e)))?;

        let conf_dir = tempfile::tempdir()
            .map_err(|e| TunnelError::ServerStart(format!("config dir: {}", e)))?;
        let conf_path = conf_dir.path().join("default.conf");
        tokio::fs::write(&conf_path, render_nginx_conf(&Self::index_file(&root).await))
            .await
            .map_err(|e| TunnelError::ServerStart(format!("config write: {}", e)))?;

        let name = Self::container_name(port);
        let out = self
            .runtime
            .tokio()
            .args(["run", "-d", "--rm", "--name", &name])
            .arg("-p")
            .arg(format!("127.0.0.1:{}:80", port))
            .arg("-v")
            .arg(format!("{}:/usr/share/nginx/html:ro", root.display()))
            .arg("-v")
            .arg(format!("{}:/etc/nginx/conf.d/default.conf:ro", conf_path.display()))
            .arg(&self.image)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TunnelError::ServerStart(format!("runtime spawn failed: {}", e)))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            // `run -d` can fail after creating the container (e.g. port already allocated).
            let _ = self.remove_container(&name).await;
            return Err(TunnelError::ServerStart(stderr.trim().to_string()));
        }

        let handle = ServerHandle {
            id: name.clone(),
            port,
            root,
        };
        self.configs.lock().await.push((name.clone(), conf_dir));

        if !wait_for_port(port, self.ready_timeout).await {
            warn!(container = %name, port, "Static server never accepted connections");
            let _ = self.stop(&handle).await;
            return Err(TunnelError::ServerStart(format!(
                "port {} not ready within {:?}",
                port, self.ready_timeout
            )));
        }

        info!(container = %name, port, root = %handle.root.display(), "Static file server ready");
        Ok(handle)
    }

    async fn stop(&self, handle: &ServerHandle) -> Result<(), TunnelError> {
        let result = self.remove_container(&handle.id).await;
        self.configs.lock().await.retain(|(id, _)| id != &handle.id);
        match &result {
            Ok(()) => info!(container = %handle.id, "Static file server stopped"),
            Err(e) => warn!(container = %handle.id, error = %e, "Static file server stop failed"),
        }
        result
    }

    fn force_stop(&self, handle: &ServerHandle) {
        debug!(container = %handle.id, "Force-stopping static file server");
        let _ = self
            .runtime
            .blocking()
            .args(["rm", "-f", &handle.id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fake_runtime(dir: &Path, run_body: &str) -> ToolCommand {
        let script = dir.join("fake-docker.sh");
        let content = format!(
            r#"echo "$@" >> "{calls}"
case "$1" in
  run) {run_body} ;;
  rm) exit 0 ;;
esac
"#,
            calls = dir.join("calls.log").display(),
            run_body = run_body
        );
        std::fs::write(&script, content).unwrap();
        ToolCommand::new("sh", vec![script.display().to_string()])
    }

    fn served_dir(dir: &Path) -> PathBuf {
        let root = dir.join("served");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("report.html"), "ok").unwrap();
        root
    }

    #[test]
    fn nginx_conf_disables_listing_and_redirects_root() {
        let conf = render_nginx_conf("report.html");
        assert!(conf.contains("autoindex off;"));
        assert!(conf.contains("return 302 /report.html;"));
        assert!(conf.contains("X-Content-Type-Options"));
        assert!(conf.contains("listen 80;"));
    }

    #[tokio::test]
    async fn index_is_the_single_report() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ContainerStaticServer::index_file(&served_dir(dir.path())).await, "report.html");
    }

    #[tokio::test]
    async fn start_binds_loopback_and_stop_removes_container() {
        let dir = tempfile::tempdir().unwrap();
        // Stand-in for the container: a listener the readiness probe can reach.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = ContainerStaticServer::new(
            fake_runtime(dir.path(), "echo cid"),
            "nginx:alpine".into(),
            Duration::from_secs(2),
        );
        let handle = server.start(&served_dir(dir.path()), port).await.unwrap();
        assert_eq!(handle.port, port);
        server.stop(&handle).await.unwrap();

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(calls.contains(&format!("-p 127.0.0.1:{}:80", port)));
        assert!(calls.contains(":/usr/share/nginx/html:ro"));
        assert!(calls.contains(&format!("rm -f {}", handle.id)));
        assert!(server.configs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failed_run_cleans_up_and_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let server = ContainerStaticServer::new(
            fake_runtime(dir.path(), "echo 'port is already allocated' >&2; exit 125"),
            "nginx:alpine".into(),
            Duration::from_secs(1),
        );
        let err = server.start(&served_dir(dir.path()), 8099).await.unwrap_err();
        assert!(matches!(err, TunnelError::ServerStart(ref m) if m.contains("already allocated")));
        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(calls.lines().any(|l| l.starts_with("rm -f scan-relay-web-8099")));
    }

    #[tokio::test]
    async fn unready_port_is_torn_down() {
        let dir = tempfile::tempdir().unwrap();
        // Grab a free port and release it so nothing is listening there.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let server = ContainerStaticServer::new(
            fake_runtime(dir.path(), "echo cid"),
            "nginx:alpine".into(),
            Duration::from_millis(400),
        );
        let err = server.start(&served_dir(dir.path()), port).await.unwrap_err();
        assert!(matches!(err, TunnelError::ServerStart(_)));
        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(calls.contains("rm -f scan-relay-web-"));
    }
}
