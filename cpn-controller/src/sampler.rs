//! Container CPU utilization probe
//!
//! Feeds the dynamic-feedback strategy. The probe runs a shell command that
//! prints one `name: 12.34%` line per container.

use async_trait::async_trait;
use cpn_router_core::{parse_container_stats, UtilizationSnapshot};
use tokio::process::Command;
use tracing::debug;

use crate::error::{ControllerError, ControllerResult};

/// Source of per-instance CPU utilization
#[async_trait]
pub trait UtilizationProbe: Send + Sync {
    /// Take one snapshot keyed by instance name
    async fn sample(&self) -> ControllerResult<UtilizationSnapshot>;

    fn name(&self) -> &'static str;
}

/// Runs the configured command through `sh -c`
#[derive(Debug, Clone)]
pub struct CommandProbe {
    command: String,
    prefix: String,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl UtilizationProbe for CommandProbe {
    async fn sample(&self) -> ControllerResult<UtilizationSnapshot> {
        let output = Command::new("sh").arg("-c").arg(&self.command).output().await?;
        if !output.status.success() {
            return Err(ControllerError::Probe(format!(
                "`{}` exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let snapshot = parse_container_stats(&stdout, &self.prefix);
        debug!(containers = snapshot.len(), "CPU utilization sampled");
        Ok(snapshot)
    }

    fn name(&self) -> &'static str {
        "CommandProbe"
    }
}
