//! Container dispatch helper
//!
//! The `dispatch` subcommand takes a Base64-encoded array of container
//! specifications and executes them in parallel, prepending an RFC 3339
//! timestamp and the container name to each output line. The HPC scheduler
//! executes this inside the batch allocation.

use std::process::Stdio;

use base64::Engine;
use chrono::{Local, SecondsFormat};
use prost::Message;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use supernetes_common::{Error, Result};
use supernetes_proto::{WorkloadContainer, WorkloadContainers};

/// Decode and dispatch the given container specifications, returning the
/// process exit code: the highest container exit code wins, with a generic
/// failure mapping to 1.
pub async fn run(container_specs: &str) -> Result<i32> {
    let containers = decode_container_specs(container_specs)?;
    let runtime = container_runtime()?;

    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    let printer = tokio::spawn(async move {
        use std::io::Write;
        while let Some(line) = line_rx.recv().await {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(line.as_bytes());
        }
    });

    let mut handles = Vec::with_capacity(containers.len());
    for container in containers {
        handles.push(tokio::spawn(dispatch_container(
            runtime.clone(),
            container,
            line_tx.clone(),
        )));
    }
    drop(line_tx);

    let mut code = 0;
    for handle in handles {
        // Highest exit code wins
        code = code.max(handle.await.unwrap_or(1));
    }

    let _ = printer.await;
    Ok(code)
}

async fn dispatch_container(
    runtime: std::path::PathBuf,
    container: WorkloadContainer,
    lines: mpsc::Sender<String>,
) -> i32 {
    // `exec` allows overriding the container ENTRYPOINT
    let command = if container.command.is_empty() {
        "run"
    } else {
        "exec"
    };

    let mut args = vec![
        command.to_string(),
        "--compat".to_string(),
        format!("docker://{}", container.image),
    ];
    args.extend(container.command.iter().cloned());
    args.extend(container.args.iter().cloned());

    debug!(command = %runtime.display(), ?args, "composed command");

    let mut child = match Command::new(&runtime)
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            debug!(container = %container.name, error = %e, "spawning container failed");
            return 1; // Generic failure
        }
    };

    let name = container.name.clone();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(relay_lines(stdout, name.clone(), lines.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(relay_lines(stderr, name.clone(), lines.clone())));
    }

    let status = child.wait().await;
    for reader in readers {
        let _ = reader.await;
    }

    match status {
        Ok(status) => status.code().unwrap_or(1),
        Err(e) => {
            debug!(container = %name, error = %e, "command failed");
            1
        }
    }
}

async fn relay_lines(stream: impl AsyncRead + Unpin, name: String, lines: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stream).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        let stamped = format!(
            "{} {} {}\n",
            Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            name,
            line
        );
        if lines.send(stamped).await.is_err() {
            return;
        }
    }
}

fn decode_container_specs(container_specs: &str) -> Result<Vec<WorkloadContainer>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(container_specs)
        .map_err(|e| Error::validation(format!("invalid container specification encoding: {e}")))?;

    let containers = WorkloadContainers::decode(bytes.as_slice())
        .map_err(|e| Error::validation(format!("decoding container specifications failed: {e}")))?;

    Ok(containers.array)
}

fn container_runtime() -> Result<std::path::PathBuf> {
    for runtime in ["singularity", "apptainer"] {
        if let Ok(path) = which::which(runtime) {
            return Ok(path);
        }
    }

    Err(Error::config("no container runtime found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_container_specs_round_trip() {
        let containers = WorkloadContainers {
            array: vec![WorkloadContainer {
                name: "main".into(),
                image: "alpine:latest".into(),
                command: vec!["sh".into()],
                args: vec!["-c".into(), "true".into()],
            }],
        };

        let encoded =
            base64::engine::general_purpose::STANDARD.encode(containers.encode_to_vec());
        let decoded = decode_container_specs(&encoded).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "main");
        assert_eq!(decoded[0].command, vec!["sh"]);
    }

    #[test]
    fn test_decode_container_specs_rejects_garbage() {
        assert!(decode_container_specs("not-base64!").is_err());
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"not-a-proto");
        assert!(decode_container_specs(&encoded).is_err());
    }
}
