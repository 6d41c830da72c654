//! Hooks: units of work invoked with (interface, new address). The built-in
//! echo hook only formats a line; the executable hook spawns a subprocess
//! with an address-describing environment and captures its output.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::types::{InterfaceRef, Result, WatchError};

/// A failed hook attempt. Carries the failure reason and whatever trimmed
/// output the hook produced before failing, so the dispatcher can print
/// both. Never escalated past the retry loop.
#[derive(Debug, Clone)]
pub struct HookError {
    pub reason: String,
    pub output: String,
}

#[async_trait]
pub trait Hook: Send + Sync {
    /// Stable descriptive name, used only for log correlation.
    fn name(&self) -> String;

    async fn run(&self, iface: &InterfaceRef, addr: IpAddr) -> std::result::Result<String, HookError>;
}

/// Parses a hook spec ("internal:echo" or "executable:<path>") into a hook
/// instance. `extra_env` is handed to every executable hook.
pub fn parse_hook(spec: &str, extra_env: &[(String, String)]) -> Result<Arc<dyn Hook>> {
    let invalid = || WatchError::Config(format!("invalid hook: {}", spec));

    let (kind, name) = spec.split_once(':').ok_or_else(invalid)?;
    match kind {
        "internal" => match name {
            "echo" => Ok(Arc::new(EchoHook)),
            _ => Err(invalid()),
        },
        "executable" if !name.is_empty() => Ok(Arc::new(ExecutableHook {
            program: PathBuf::from(name),
            extra_env: extra_env.to_vec(),
        })),
        _ => Err(invalid()),
    }
}

/// Diagnostic hook: formats a human-readable line and never fails.
pub struct EchoHook;

#[async_trait]
impl Hook for EchoHook {
    fn name(&self) -> String {
        "internal:echo".to_string()
    }

    async fn run(&self, iface: &InterfaceRef, addr: IpAddr) -> std::result::Result<String, HookError> {
        Ok(format!("New IP for {}: {}", iface, addr))
    }
}

/// Runs a configured program. The child inherits the parent environment plus
/// variables identifying the interface, the new address, and its family.
pub struct ExecutableHook {
    program: PathBuf,
    extra_env: Vec<(String, String)>,
}

#[async_trait]
impl Hook for ExecutableHook {
    fn name(&self) -> String {
        format!("executable:{}", self.program.display())
    }

    async fn run(&self, iface: &InterfaceRef, addr: IpAddr) -> std::result::Result<String, HookError> {
        let mut cmd = Command::new(&self.program);
        cmd.env("IFACE", iface.to_string())
            .env("IFINDEX", iface.index.to_string())
            .env("ADDR", addr.to_string())
            .env("IS_IP4", if addr.is_ipv4() { "1" } else { "0" })
            .env("IS_IP6", if addr.is_ipv6() { "1" } else { "0" });
        for (key, value) in &self.extra_env {
            cmd.env(key, value);
        }

        let output = cmd.output().await.map_err(|e| HookError {
            reason: format!("failed to start {}: {}", self.program.display(), e),
            output: String::new(),
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().to_string();

        if output.status.success() {
            Ok(combined)
        } else {
            Err(HookError {
                reason: format!("{} exited with {}", self.program.display(), output.status),
                output: combined,
            })
        }
    }
}
