//! Thin wrapper over the docker CLI.
//!
//! Both container drivers provision through the host's `docker` binary.
//! Children are spawned with `kill_on_drop` so a timed-out run kills the
//! in-flight process when its future is dropped.

use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

use imagetest_core::error::{ImagetestError, Result};

/// How much trailing stderr to quote in failure diagnostics.
pub const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Poll interval for readiness loops.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Run a docker command and capture its output.
///
/// Spawn failures (docker missing) map to `Io`; non-zero exits are
/// returned to the caller for interpretation.
pub async fn docker(args: &[&str]) -> Result<Output> {
    tracing::debug!(args = ?args, "docker");
    Command::new("docker")
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(ImagetestError::Io)
}

/// Run a docker command, treating a non-zero exit as an error whose
/// message quotes trailing stderr.
pub async fn docker_ok(args: &[&str]) -> Result<Output> {
    let output = docker(args).await?;
    if !output.status.success() {
        return Err(ImagetestError::Other(format!(
            "docker {} failed (exit {}): {}",
            args.first().unwrap_or(&""),
            output.status.code().unwrap_or(-1),
            stderr_tail(&output, STDERR_TAIL_BYTES)
        )));
    }
    Ok(output)
}

/// Run a docker command feeding bytes on stdin.
pub async fn docker_with_stdin(args: &[&str], input: &[u8]) -> Result<Output> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    tracing::debug!(args = ?args, "docker (stdin)");
    let mut child = Command::new("docker")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(ImagetestError::Io)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await.map_err(ImagetestError::Io)?;
        // Close stdin so the child sees EOF.
        drop(stdin);
    }

    child
        .wait_with_output()
        .await
        .map_err(ImagetestError::Io)
}

/// Trailing stderr as lossy UTF-8, bounded to `limit` bytes.
pub fn stderr_tail(output: &Output, limit: usize) -> String {
    let stderr = &output.stderr;
    let start = stderr.len().saturating_sub(limit);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

/// Remove a container by name. Idempotent: a missing container is fine.
pub async fn remove_container(name: &str) -> Result<()> {
    let output = docker(&["rm", "-f", name]).await?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No such container") {
        return Ok(());
    }
    Err(ImagetestError::Teardown(format!(
        "failed to remove container {}: {}",
        name,
        stderr.trim()
    )))
}

/// Remove all volumes carrying the given label. Idempotent.
pub async fn remove_volumes_labeled(label: &str) -> Result<()> {
    let output = docker_ok(&["volume", "ls", "-q", "--filter", &format!("label={}", label)])
        .await
        .map_err(|e| ImagetestError::Teardown(e.to_string()))?;

    let names = String::from_utf8_lossy(&output.stdout);
    for name in names.lines().filter(|l| !l.trim().is_empty()) {
        let removed = docker(&["volume", "rm", "-f", name.trim()]).await?;
        if !removed.status.success() {
            let stderr = String::from_utf8_lossy(&removed.stderr);
            if !stderr.contains("no such volume") {
                return Err(ImagetestError::Teardown(format!(
                    "failed to remove volume {}: {}",
                    name.trim(),
                    stderr.trim()
                )));
            }
        }
    }
    Ok(())
}

/// Poll `probe` every [`POLL_INTERVAL`] until it reports ready.
///
/// The surrounding deadline is the caller's; this loop runs until
/// cancelled or ready, with a bounded attempt count as a backstop.
pub async fn wait_until_ready<F, Fut>(what: &str, max_attempts: u32, probe: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    for attempt in 1..=max_attempts {
        match probe().await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                tracing::debug!(what, attempt, "not ready yet");
            }
            Err(err) => {
                tracing::debug!(what, attempt, error = %err, "readiness probe failed");
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Err(ImagetestError::Timeout(format!(
        "{} did not become ready after {} attempts",
        what, max_attempts
    )))
}

/// Package one file as an uncompressed tar stream for `docker cp -`.
///
/// `path` may be nested (e.g. `rancher/k3s/registries.yaml`); extraction
/// creates intermediate directories under the copy destination.
pub fn tar_single_file(path: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, data)
        .map_err(ImagetestError::Io)?;
    builder.into_inner().map_err(ImagetestError::Io)
}

/// Translate a Kubernetes-style memory quantity ("2Gi", "512Mi") into a
/// docker `--memory` value ("2g", "512m"). Values already in docker
/// form pass through.
pub fn to_docker_memory(quantity: &str) -> String {
    let q = quantity.trim();
    if let Some(n) = q.strip_suffix("Gi") {
        format!("{}g", n)
    } else if let Some(n) = q.strip_suffix("Mi") {
        format!("{}m", n)
    } else if let Some(n) = q.strip_suffix("Ki") {
        format!("{}k", n)
    } else {
        q.to_lowercase()
    }
}
