// src/sys/secrets.rs

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;

use secrecy::{ExposeSecret, Secret};
use tokio::process::Command;

/// ProviderCredential is an ephemeral, memory-safe wrapper for the scanner's
/// API credential and the tunnel auth token.
///
/// 1. It cannot be accidentally logged (`{:?}` prints `[REDACTED]`).
/// 2. When the struct goes out of scope, the memory is zeroized.
pub struct ProviderCredential {
    token: Secret<Vec<u8>>,
}

impl ProviderCredential {
    /// Wraps raw bytes in a zeroizing Secret
    pub fn new(raw_token: Vec<u8>) -> Self {
        // 🛡️ Taking ownership moves the allocation straight into the Secret,
        // so no plaintext copy is left behind for the allocator to recycle.
        Self {
            token: Secret::new(raw_token),
        }
    }

    /// Builds a credential from an env value. Blank values count as absent.
    pub fn from_env_value(value: String) -> Option<Self> {
        if value.trim().is_empty() {
            return None;
        }
        Some(Self::new(value.into_bytes()))
    }

    /// Exposes the secret for the duration of `action` only.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        action(self.token.expose_secret())
    }

    /// 🛡️ Injects the secret into a child's environment. Never pass it via argv:
    /// argv is world-readable through /proc.
    pub fn inject_env(&self, command: &mut Command, var: &str) {
        self.use_secret(|bytes| {
            command.env(var, OsStr::from_bytes(bytes));
        });
    }

    /// Removes every occurrence of the secret from a line before it is logged.
    pub fn scrub(&self, line: &str) -> String {
        self.use_secret(|bytes| match std::str::from_utf8(bytes) {
            Ok(secret) if !secret.is_empty() && line.contains(secret) => {
                line.replace(secret, "[REDACTED]")
            }
            _ => line.to_string(),
        })
    }
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProviderCredential([REDACTED])")
    }
}
