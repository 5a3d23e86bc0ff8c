//! Process table queries for backend discovery.
//!
//! The probe is a pure read-only view of the OS: it lists the PIDs of
//! running backend processes and reads their command lines. It is a trait
//! so the scanner can be driven by a fake in tests.

use crate::error::ProbeError;
use async_trait::async_trait;
use tokio::process::Command;

/// Process name the scanner looks for.
pub const BACKEND_PROCESS: &str = "qbittorrent-nox";

/// Read-only view of the OS process table.
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    /// List PIDs of running backend processes.
    async fn list_pids(&self) -> Result<Vec<u32>, ProbeError>;

    /// Full command line of one process.
    async fn command_line(&self, pid: u32) -> Result<String, ProbeError>;
}

/// Probe backed by `pgrep` and `ps`, the tools available on the target
/// NAS systems.
pub struct PgrepProbe;

#[async_trait]
impl ProcessProbe for PgrepProbe {
    async fn list_pids(&self) -> Result<Vec<u32>, ProbeError> {
        let output = Command::new("pgrep")
            .args(["-f", BACKEND_PROCESS])
            .output()
            .await
            .map_err(|e| ProbeError::Query(format!("pgrep: {e}")))?;

        // pgrep exits 1 when nothing matched, >1 on actual errors.
        if !output.status.success() {
            return match output.status.code() {
                Some(1) => Err(ProbeError::NotFound),
                _ => Err(ProbeError::Query(format!(
                    "pgrep exited with {}",
                    output.status
                ))),
            };
        }

        let pids: Vec<u32> = String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect();

        if pids.is_empty() {
            return Err(ProbeError::NotFound);
        }
        Ok(pids)
    }

    async fn command_line(&self, pid: u32) -> Result<String, ProbeError> {
        let output = Command::new("ps")
            .args(["-p", &pid.to_string(), "-o", "command="])
            .output()
            .await
            .map_err(|e| ProbeError::Query(format!("ps: {e}")))?;

        if !output.status.success() {
            return Err(ProbeError::Query(format!(
                "ps exited with {} for pid {pid}",
                output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
