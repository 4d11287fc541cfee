// src/sys/traits.rs
//
// Contracts for everything that touches processes or the network. The
// pipeline and the publisher only ever see these traits.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Child;

use crate::error::{ScanError, TunnelError};
use crate::sys::job::{JobEnvironment, ScanResult};
use crate::sys::secrets::ProviderCredential;

// ==============================================================================
// 1. Scanner Execution
// ==============================================================================

#[async_trait]
pub trait ScanRunner: Send + Sync {
    /// Runs the scanner once against `env.workspace_path`. No retries.
    /// Non-zero exits and timeouts are classified in the result, not returned as errors.
    async fn run(&self, env: &JobEnvironment) -> Result<ScanResult, ScanError>;
}

// ==============================================================================
// 2. Static File Server
// ==============================================================================

/// A running static file server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandle {
    pub id: String,
    pub port: u16,
    pub root: PathBuf,
}

#[async_trait]
pub trait StaticServer: Send + Sync {
    /// Serves `root` on 127.0.0.1:`port` and returns once it accepts connections.
    async fn start(&self, root: &Path, port: u16) -> Result<ServerHandle, TunnelError>;

    async fn stop(&self, handle: &ServerHandle) -> Result<(), TunnelError>;

    /// Last-resort synchronous stop, used from `Drop` when no runtime is available to await.
    fn force_stop(&self, _handle: &ServerHandle) {}
}

// ==============================================================================
// 3. Reverse Tunnel
// ==============================================================================

pub struct TunnelRequest<'a> {
    pub hostname: &'a str,
    pub local_port: u16,
    pub token: &'a ProviderCredential,
    pub ready_timeout: Duration,
}

/// A live tunnel. `process` is killed on drop when the provider spawned one.
#[derive(Debug)]
pub struct TunnelHandle {
    pub id: String,
    pub public_url: String,
    pub process: Option<Child>,
}

#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Binds `request.hostname` to the local port and returns once traffic can flow.
    async fn open(&self, request: &TunnelRequest<'_>) -> Result<TunnelHandle, TunnelError>;

    async fn close(&self, handle: TunnelHandle) -> Result<(), TunnelError>;
}
