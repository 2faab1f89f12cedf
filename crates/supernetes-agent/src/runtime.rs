//! Workload runtime: composes batch scripts and dispatches them
//!
//! A workload becomes an `sbatch` script that runs the container through
//! Singularity/Apptainer and pipes all output through the agent's
//! `timestamp` subcommand into the per-job output artifact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use supernetes_common::config::SlurmConfig;
use supernetes_common::{Error, Result};
use supernetes_proto::Workload;
use tracing::{debug, info};

use crate::cache;
use crate::slurm::SchedulerClient;

/// Container runtimes probed in order of preference
const CONTAINER_RUNTIMES: &[&str] = &["singularity", "apptainer"];

/// Composes batch scripts for workloads and hands them to the scheduler
#[derive(Debug)]
pub struct Runtime {
    config: SlurmConfig,
    scheduler: SchedulerClient,
    container_runtime: PathBuf,
}

impl Runtime {
    /// Create a runtime, probing for a container runtime on the `PATH`
    pub fn new(config: SlurmConfig, scheduler: SchedulerClient) -> Result<Self> {
        Ok(Self {
            config,
            scheduler,
            container_runtime: container_runtime()?,
        })
    }

    /// Dispatch the given workload, returning its tracking identifier
    pub async fn run(&self, workload: &Workload) -> Result<String> {
        let agent_path = std::env::current_exe()
            .and_then(|path| path.canonicalize())
            .map_err(|e| Error::internal("runtime", format!("resolving agent binary failed: {e}")))?;

        let script = self.compose_script(workload, &agent_path)?;
        debug!(script = %script, "composed sbatch script");

        self.scheduler.submit(&script).await
    }

    /// Compose the sbatch script for a workload. The agent binary path is
    /// injected for the output timestamping pipeline.
    pub(crate) fn compose_script(&self, workload: &Workload, agent_path: &Path) -> Result<String> {
        let meta = workload.meta.clone().unwrap_or_default();
        let spec = workload
            .spec
            .clone()
            .ok_or_else(|| Error::validation("workload has no spec"))?;

        let output = cache::io_dir()?.join("%j.out"); // sbatch filename pattern

        let mut options = BTreeMap::from([
            ("job-name".to_string(), meta.name),
            ("account".to_string(), self.config.account.clone()),
            ("partition".to_string(), self.config.partition.clone()),
            ("output".to_string(), output.to_string_lossy().into_owned()),
            ("nodelist".to_string(), spec.node_names.join(",")),
        ]);

        if spec.node_names.is_empty() {
            options.remove("nodelist"); // No node list was given
        }

        for (option, value) in &spec.job_options {
            // Overriding the core-managed options is not permitted
            if options.contains_key(option) {
                return Err(Error::validation(format!(
                    "overriding option {option:?} is not permitted"
                )));
            }

            options.insert(option.clone(), value.clone());
        }

        let mut script = String::from("#!/bin/bash\n");
        for (option, value) in &options {
            script.push_str(&format!("#SBATCH --{option} {value:?}\n"));
        }

        // Safety options for the actual command
        script.push_str("set -eo pipefail\n");

        // `exec` allows overriding the container ENTRYPOINT
        let command = if spec.command.is_empty() { "run" } else { "exec" };

        let mut invocation = vec![
            self.container_runtime.to_string_lossy().into_owned(),
            command.to_string(),
            "--compat".to_string(),
            format!("docker://{}", spec.image),
        ];
        invocation.extend(spec.command);
        invocation.extend(spec.args);

        let quoted = shlex::try_join(invocation.iter().map(String::as_str))
            .map_err(|e| Error::validation(format!("unquotable workload command: {e}")))?;
        script.push_str(&quoted);

        // Pipe stdout and stderr through the agent's line timestamper
        script.push_str(&format!(" |& {:?} timestamp\n", agent_path.display()));

        Ok(script)
    }
}

/// Probe for a container runtime on the `PATH`, first match wins
fn container_runtime() -> Result<PathBuf> {
    for runtime in CONTAINER_RUNTIMES {
        debug!(runtime, "locating container runtime");
        match which::which(runtime) {
            Ok(path) => {
                info!(path = %path.display(), "located container runtime");
                return Ok(path);
            }
            Err(which::Error::CannotFindBinaryPath) => continue,
            Err(e) => {
                return Err(Error::config(format!(
                    "failed to locate container runtime {runtime:?}: {e}"
                )))
            }
        }
    }

    Err(Error::config(format!(
        "no container runtime found, probed {CONTAINER_RUNTIMES:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use supernetes_common::Filter;
    use supernetes_proto::{WorkloadMeta, WorkloadSpec};

    fn test_runtime() -> Runtime {
        Runtime {
            config: SlurmConfig {
                account: "project_123456789".into(),
                partition: "standard".into(),
                filter: Filter::default(),
            },
            scheduler: SchedulerClient::new(),
            container_runtime: PathBuf::from("/usr/bin/singularity"),
        }
    }

    fn test_workload(command: Vec<&str>, nodes: Vec<&str>) -> Workload {
        Workload {
            meta: Some(WorkloadMeta {
                name: "hello".into(),
                ..Default::default()
            }),
            spec: Some(WorkloadSpec {
                image: "alpine:latest".into(),
                command: command.into_iter().map(String::from).collect(),
                args: vec![],
                node_names: nodes.into_iter().map(String::from).collect(),
                job_options: Default::default(),
            }),
            status: None,
        }
    }

    #[test]
    fn test_compose_script_basics() {
        std::env::set_var("HOME", "/home/test");
        let runtime = test_runtime();
        let workload = test_workload(vec!["sh"], vec!["nid001", "nid002"]);
        let script = runtime
            .compose_script(&workload, Path::new("/opt/supernetes-agent"))
            .unwrap();

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --job-name \"hello\"\n"));
        assert!(script.contains("#SBATCH --account \"project_123456789\"\n"));
        assert!(script.contains("#SBATCH --partition \"standard\"\n"));
        assert!(script.contains("#SBATCH --nodelist \"nid001,nid002\"\n"));
        assert!(script.contains("%j.out"));
        assert!(script.contains("set -eo pipefail\n"));
        // Command given, so the entrypoint is overridden via exec
        assert!(script.contains("/usr/bin/singularity exec --compat docker://alpine:latest sh"));
        assert!(script.contains("|& \"/opt/supernetes-agent\" timestamp\n"));
    }

    #[test]
    fn test_compose_script_run_without_command() {
        std::env::set_var("HOME", "/home/test");
        let runtime = test_runtime();
        let workload = test_workload(vec![], vec![]);
        let script = runtime
            .compose_script(&workload, Path::new("/opt/supernetes-agent"))
            .unwrap();

        assert!(script.contains("singularity run --compat docker://alpine:latest"));
        // No node list was given
        assert!(!script.contains("--nodelist"));
    }

    #[test]
    fn test_compose_script_rejects_core_option_override() {
        std::env::set_var("HOME", "/home/test");
        let runtime = test_runtime();
        let mut workload = test_workload(vec![], vec![]);
        workload
            .spec
            .as_mut()
            .unwrap()
            .job_options
            .insert("partition".into(), "gpu".into());

        let err = runtime
            .compose_script(&workload, Path::new("/opt/supernetes-agent"))
            .unwrap_err();
        assert!(err.to_string().contains("partition"));
    }

    #[test]
    fn test_compose_script_merges_extra_options() {
        std::env::set_var("HOME", "/home/test");
        let runtime = test_runtime();
        let mut workload = test_workload(vec![], vec![]);
        workload
            .spec
            .as_mut()
            .unwrap()
            .job_options
            .insert("time".into(), "00:10:00".into());

        let script = runtime
            .compose_script(&workload, Path::new("/opt/supernetes-agent"))
            .unwrap();
        assert!(script.contains("#SBATCH --time \"00:10:00\"\n"));
    }

    #[test]
    fn test_compose_script_quotes_arguments() {
        std::env::set_var("HOME", "/home/test");
        let runtime = test_runtime();
        let mut workload = test_workload(vec!["sh", "-c"], vec![]);
        workload
            .spec
            .as_mut()
            .unwrap()
            .args
            .push("echo 'hello world'".into());

        let script = runtime
            .compose_script(&workload, Path::new("/opt/supernetes-agent"))
            .unwrap();
        // The embedded quotes must survive shell-escaping as one argument
        assert!(script.contains(r#"sh -c "echo 'hello world'""#));
    }
}
