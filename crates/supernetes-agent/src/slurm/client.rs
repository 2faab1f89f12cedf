//! Scheduler process invocation
//!
//! `srun` can only run synchronously, so submission goes through `sbatch`
//! with the script on stdin.

use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

use supernetes_common::{Error, Result};

use super::data::{decode, JobData, NodeData};

fn job_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Submitted batch job (\d+)\n$").unwrap())
}

/// Thin capability over the Slurm control utilities
#[derive(Debug, Clone, Default)]
pub struct SchedulerClient;

impl SchedulerClient {
    /// Create a new scheduler client
    pub fn new() -> Self {
        Self
    }

    /// Query Slurm for the full node inventory
    pub async fn nodes(&self) -> Result<NodeData> {
        decode(&self.scontrol(&["show", "node"]).await?)
    }

    /// Query Slurm for the full job inventory
    pub async fn jobs(&self) -> Result<JobData> {
        decode(&self.scontrol(&["show", "job"]).await?)
    }

    /// Submit a batch script, returning the tracking identifier parsed from
    /// the `sbatch` output.
    pub async fn submit(&self, script: &str) -> Result<String> {
        let mut child = Command::new("sbatch")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::scheduler("sbatch", format!("spawning failed: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::scheduler("sbatch", "stdin unavailable"))?;
        stdin.write_all(script.as_bytes()).await?;
        drop(stdin); // Close stdin so sbatch reads the full script

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::scheduler("sbatch", format!("execution failed: {e}")))?;

        if !output.status.success() {
            error!(
                stderr = %String::from_utf8_lossy(&output.stderr),
                "sbatch execution failed"
            );
            return Err(Error::scheduler(
                "sbatch",
                format!("exited with {}", output.status),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(captures) = job_id_regex().captures(&stdout) else {
            error!(stdout = %stdout, "sbatch didn't produce the expected output");
            return Err(Error::scheduler("sbatch", "failed to parse output"));
        };

        Ok(captures[1].to_string())
    }

    /// Cancel the job with the given identifier. For Slurm this is the best
    /// approximation of workload deletion there is.
    pub async fn cancel(&self, identifier: &str) -> Result<()> {
        debug!(id = %identifier, "invoking scancel");
        let status = Command::new("scancel")
            .arg(identifier)
            .status()
            .await
            .map_err(|e| Error::scheduler("scancel", format!("spawning failed: {e}")))?;

        if !status.success() {
            return Err(Error::scheduler(
                "scancel",
                format!("exited with {status}"),
            ));
        }

        Ok(())
    }

    async fn scontrol(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new("scontrol")
            .arg("--json")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::scheduler("scontrol", format!("execution failed: {e}")))?;

        if !output.status.success() {
            return Err(Error::scheduler(
                "scontrol",
                format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }

        Ok(output.stdout)
    }
}
