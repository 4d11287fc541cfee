// src/sys/publish.rs
//
// PublishTunnel: static server + reverse tunnel over one retained artifact,
// owned as a single scoped resource.
//
//   Idle -> Starting -> Active -> Stopping -> Idle
//   Starting -> Idle            (startup failure or cancellation, after cleanup)
//
// Both handles live inside `LiveChannel` and are only ever released together.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::sys::job::{RetainedArtifact, TunnelSession};
use crate::sys::secrets::ProviderCredential;
use crate::sys::shutdown::ShutdownToken;
use crate::sys::traits::{ServerHandle, StaticServer, TunnelHandle, TunnelProvider, TunnelRequest};
use crate::sys::tunnel::validate_hostname;

/// Leases beyond this are clamped; nobody keeps a CI job open for a century.
const MAX_LEASE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

pub struct TunnelSettings {
    pub hostname: String,
    pub local_port: u16,
    pub token: ProviderCredential,
    pub ready_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPhase {
    Idle,
    Starting,
    Active,
    Stopping,
}

struct LiveChannel {
    server: ServerHandle,
    tunnel: TunnelHandle,
    session: TunnelSession,
}

enum TunnelState {
    Idle,
    Starting { cancel: watch::Sender<bool> },
    Active(LiveChannel),
    Stopping,
}

/// What `publish` decided while holding the state lock.
enum Admission {
    Reuse(TunnelSession),
    Conflict(String),
    Wait,
    Start(watch::Receiver<bool>),
}

pub struct PublishTunnel {
    server: Box<dyn StaticServer>,
    tunnel: Box<dyn TunnelProvider>,
    settings: TunnelSettings,
    state: Mutex<TunnelState>,
    phase: watch::Sender<TunnelPhase>,
}

impl PublishTunnel {
    pub fn new(
        server: Box<dyn StaticServer>,
        tunnel: Box<dyn TunnelProvider>,
        settings: TunnelSettings,
    ) -> Result<Self, TunnelError> {
        validate_hostname(&settings.hostname)?;
        let (phase, _) = watch::channel(TunnelPhase::Idle);
        Ok(Self {
            server,
            tunnel,
            settings,
            state: Mutex::new(TunnelState::Idle),
            phase,
        })
    }

    #[cfg(test)]
    pub fn phase(&self) -> TunnelPhase {
        *self.phase.borrow()
    }

    /// Only called with the state lock held, so phase and state never disagree.
    fn set_phase(&self, next: TunnelPhase) {
        let prev = self.phase.send_replace(next);
        debug!(from = ?prev, to = ?next, "Tunnel phase");
    }

    async fn settled(mut rx: watch::Receiver<TunnelPhase>) {
        let _ = rx
            .wait_for(|p| matches!(p, TunnelPhase::Idle | TunnelPhase::Active))
            .await;
    }

    /// Serves `artifact` at the public hostname for `lease`.
    ///
    /// Idempotent per artifact: while a session for the same artifact is
    /// starting or active, callers get that session instead of a second
    /// server/tunnel pair.
    pub async fn publish(
        &self,
        artifact: &RetainedArtifact,
        lease: Duration,
    ) -> Result<TunnelSession, TunnelError> {
        let mut cancel = loop {
            let mut state = self.state.lock().await;
            let admission = match &*state {
                TunnelState::Active(live) if live.session.artifact_path == artifact.stored_path => {
                    Admission::Reuse(live.session.clone())
                }
                TunnelState::Active(live) => Admission::Conflict(live.session.public_hostname.clone()),
                TunnelState::Starting { .. } | TunnelState::Stopping => Admission::Wait,
                TunnelState::Idle => {
                    let (tx, rx) = watch::channel(false);
                    *state = TunnelState::Starting { cancel: tx };
                    self.set_phase(TunnelPhase::Starting);
                    Admission::Start(rx)
                }
            };

            match admission {
                Admission::Reuse(session) => {
                    debug!(url = %session.public_url, "Reusing active tunnel session");
                    return Ok(session);
                }
                Admission::Conflict(hostname) => {
                    return Err(TunnelError::HostnameInUse { hostname });
                }
                Admission::Wait => {
                    let rx = self.phase.subscribe();
                    drop(state);
                    Self::settled(rx).await;
                }
                Admission::Start(rx) => break rx,
            }
        };

        info!(
            artifact = %artifact.stored_path.display(),
            hostname = %self.settings.hostname,
            port = self.settings.local_port,
            "Publishing report"
        );
        let started = self.start_channel(artifact, lease, &mut cancel).await;

        let mut state = self.state.lock().await;
        // Teardown flips the flag under this lock, so this read cannot go stale.
        let cancelled = *cancel.borrow();
        let result = match started {
            Ok(live) if !cancelled => {
                let session = live.session.clone();
                *state = TunnelState::Active(live);
                self.set_phase(TunnelPhase::Active);
                info!(
                    url = %session.public_url,
                    lease_deadline = %session.lease_deadline.to_rfc3339(),
                    "Report published"
                );
                Ok(session)
            }
            Ok(live) => {
                // Teardown arrived while the channel was coming up.
                if let Err(e) = self.release(live).await {
                    warn!(error = %e, "Cleanup after cancelled publish failed");
                }
                Err(TunnelError::Cancelled)
            }
            Err(e) => Err(e),
        };
        if result.is_err() {
            *state = TunnelState::Idle;
            self.set_phase(TunnelPhase::Idle);
        }
        result
    }

    async fn start_channel(
        &self,
        artifact: &RetainedArtifact,
        lease: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<LiveChannel, TunnelError> {
        let root = artifact
            .stored_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| TunnelError::Unservable(artifact.stored_path.clone()))?;

        // Server start is bounded by its own readiness timeout and always runs to
        // completion, so its handle can never be lost to a cancellation.
        let server = self.server.start(root, self.settings.local_port).await?;
        if *cancel.borrow() {
            self.stop_server(&server).await;
            return Err(TunnelError::Cancelled);
        }

        let request = TunnelRequest {
            hostname: &self.settings.hostname,
            local_port: server.port,
            token: &self.settings.token,
            ready_timeout: self.settings.ready_timeout,
        };
        let opened = tokio::select! {
            res = self.tunnel.open(&request) => res,
            _ = cancel.wait_for(|c| *c) => Err(TunnelError::Cancelled),
        };

        let tunnel = match opened {
            Ok(tunnel) => tunnel,
            Err(e) => {
                // 🛡️ No orphaned listeners: the server goes down before the error surfaces.
                self.stop_server(&server).await;
                return Err(e);
            }
        };

        let lease = lease.min(MAX_LEASE);
        let started_at = Utc::now();
        let lease_deadline = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let session = TunnelSession {
            artifact_path: artifact.stored_path.clone(),
            public_hostname: self.settings.hostname.clone(),
            public_url: format!("{}/{}", tunnel.public_url.trim_end_matches('/'), artifact.file_name),
            local_port: server.port,
            server_id: server.id.clone(),
            tunnel_id: tunnel.id.clone(),
            started_at,
            lease_deadline,
            lease_expires: Instant::now() + lease,
        };

        Ok(LiveChannel {
            server,
            tunnel,
            session,
        })
    }

    async fn stop_server(&self, server: &ServerHandle) {
        if let Err(e) = self.server.stop(server).await {
            warn!(server = %server.id, error = %e, "Static server stop failed, forcing");
            self.server.force_stop(server);
        }
    }

    /// Tunnel first so no public traffic hits a dying server, then the server.
    /// Both are attempted regardless of the other's result.
    async fn release(&self, live: LiveChannel) -> Result<(), TunnelError> {
        let LiveChannel {
            server,
            tunnel,
            session,
        } = live;
        let tunnel_result = self.tunnel.close(tunnel).await;
        if let Err(e) = &tunnel_result {
            warn!(tunnel = %session.tunnel_id, error = %e, "Tunnel close failed");
        }
        let server_result = self.server.stop(&server).await;
        if server_result.is_err() {
            self.server.force_stop(&server);
        }
        info!(url = %session.public_url, "Publish channel torn down");
        tunnel_result.and(server_result)
    }

    /// Stops the active session. Safe to call concurrently and repeatedly:
    /// on Idle it is a no-op, during Starting it cancels the startup, during
    /// Stopping it waits for the in-flight teardown.
    pub async fn teardown(&self) -> Result<(), TunnelError> {
        loop {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, TunnelState::Stopping) {
                TunnelState::Idle => {
                    *state = TunnelState::Idle;
                    debug!("Teardown on idle publisher: nothing to do");
                    return Ok(());
                }
                TunnelState::Active(live) => {
                    self.set_phase(TunnelPhase::Stopping);
                    drop(state);
                    let result = self.release(live).await;
                    let mut state = self.state.lock().await;
                    *state = TunnelState::Idle;
                    self.set_phase(TunnelPhase::Idle);
                    return result;
                }
                in_flight => {
                    if let TunnelState::Starting { cancel } = &in_flight {
                        info!("Teardown requested during startup, cancelling");
                        cancel.send_replace(true);
                    }
                    *state = in_flight;
                    let rx = self.phase.subscribe();
                    drop(state);
                    Self::settled(rx).await;
                }
            }
        }
    }

    /// `publish`, abandoned cleanly if shutdown arrives while the channel is coming up.
    pub async fn publish_or_cancel(
        &self,
        artifact: &RetainedArtifact,
        lease: Duration,
        shutdown: &mut ShutdownToken,
    ) -> Result<TunnelSession, TunnelError> {
        let publishing = self.publish(artifact, lease);
        tokio::pin!(publishing);
        tokio::select! {
            res = &mut publishing => res,
            _ = shutdown.wait() => {
                info!("Termination signal during publish, cancelling startup");
                // The startup observes the cancel flag and cleans up after itself.
                let (torn_down, _) = tokio::join!(self.teardown(), publishing);
                torn_down.and(Err(TunnelError::Cancelled))
            }
        }
    }

    /// Keeps `session` up until its lease ends or shutdown is requested, whichever comes first.
    pub async fn hold(
        &self,
        session: &TunnelSession,
        shutdown: &mut ShutdownToken,
    ) -> Result<(), TunnelError> {
        tokio::select! {
            _ = tokio::time::sleep_until(session.lease_expires) => {
                info!(url = %session.public_url, "Lease expired");
            }
            _ = shutdown.wait() => {
                info!(url = %session.public_url, "Termination signal, closing publish channel");
            }
        }
        self.teardown().await
    }
}

impl Drop for PublishTunnel {
    fn drop(&mut self) {
        if let TunnelState::Active(live) = std::mem::replace(self.state.get_mut(), TunnelState::Idle) {
            warn!(url = %live.session.public_url, "Publisher dropped with a live session, forcing teardown");
            self.server.force_stop(&live.server);
            // The tunnel process is kill-on-drop.
            drop(live);
        }
    }
}
