//! k3s-in-docker driver.
//!
//! Provisions a single-node Kubernetes cluster inside a privileged
//! container, writes containerd registry configuration, waits for the
//! node and core system pods, then runs each test image as a pod with
//! `restartPolicy: Never`, streaming its logs until a terminal phase.
//!
//! All cluster interaction goes through the docker CLI and `kubectl`
//! executed inside the cluster container.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

use imagetest_core::error::{ImagetestError, Result};
use imagetest_core::policy::ENV_WORKSTATION;
use imagetest_core::spec::K3sInDockerConfig;

use crate::oci::credentials::resolve_for;
use crate::oci::ImageReference;

use super::docker::{
    docker, docker_ok, docker_with_stdin, remove_container, remove_volumes_labeled,
    tar_single_file, wait_until_ready,
};
use super::Driver;

/// Attempts to wait for node + core pod readiness (2s apart).
const CLUSTER_READY_ATTEMPTS: u32 = 150;

/// Attempts to wait for a test pod to leave `Pending` (2s apart).
const POD_START_ATTEMPTS: u32 = 150;

/// Attempts to wait for a test pod's terminal phase (2s apart).
const POD_TERMINAL_ATTEMPTS: u32 = 450;

/// Service account granted cluster-admin for test pods.
const TEST_SERVICE_ACCOUNT: &str = "imagetest";

/// Exit code reported when the terminated state carries none
/// (`OOMKilled` races).
const FALLBACK_EXIT_CODE: i32 = 137;

/// Where configured mount sources land inside the cluster container.
const MOUNT_BASE: &str = "/mnt/imagetest";

/// The k3s-in-docker execution environment.
pub struct K3sInDockerDriver {
    config: K3sInDockerConfig,
    run_id: String,
    container: String,
    volume: String,
    /// Resolved at construction; `WORKSTATION` forces "native".
    snapshotter: String,
    /// Registry test images are pushed to, for the loopback rewrite.
    target_registry: String,
    /// Holds the rewritten kubeconfig for the calling process.
    kubeconfig_dir: Option<tempfile::TempDir>,
}

impl K3sInDockerDriver {
    /// Create an unprovisioned driver for a run.
    pub fn new(config: K3sInDockerConfig, run_id: &str, target_registry: &str) -> Self {
        let snapshotter = if std::env::var(ENV_WORKSTATION).map_or(false, |v| !v.is_empty()) {
            "native".to_string()
        } else {
            config.snapshotter.clone()
        };
        Self {
            config,
            run_id: run_id.to_string(),
            container: format!("{}-k3s", run_id),
            volume: format!("{}-k3s-storage", run_id),
            snapshotter,
            target_registry: target_registry.to_string(),
            kubeconfig_dir: None,
        }
    }

    /// Path to the rewritten kubeconfig, once setup has completed.
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.kubeconfig_dir
            .as_ref()
            .map(|dir| dir.path().join("kubeconfig.yaml"))
    }

    /// k3s server arguments derived from the config toggles.
    fn server_args(&self) -> Vec<String> {
        let mut args = vec![
            "server".to_string(),
            format!("--snapshotter={}", self.snapshotter),
        ];
        if self.config.disable_traefik {
            args.push("--disable=traefik".to_string());
        }
        if self.config.disable_metrics_server {
            args.push("--disable=metrics-server".to_string());
        }
        if self.config.disable_network_policy {
            args.push("--disable-network-policy".to_string());
        }
        if self.config.disable_cni {
            args.push("--flannel-backend=none".to_string());
        }
        args
    }

    /// Render the containerd registries.yaml from the config map, adding
    /// the loopback mirror for the push registry when needed.
    fn render_registries_yaml(&self) -> Result<String> {
        let mut mirrors = serde_yaml::Mapping::new();
        let mut configs = serde_yaml::Mapping::new();

        for (registry, entry) in &self.config.registries {
            if let Some(mirror) = &entry.mirror {
                if !mirror.endpoints.is_empty() {
                    let mut m = serde_yaml::Mapping::new();
                    m.insert(
                        "endpoint".into(),
                        serde_yaml::to_value(&mirror.endpoints)?,
                    );
                    mirrors.insert(registry.as_str().into(), m.into());
                }
            }

            let mut config_entry = serde_yaml::Mapping::new();
            if let Some(auth) = &entry.auth {
                let mut a = serde_yaml::Mapping::new();
                if let Some(username) = &auth.username {
                    a.insert("username".into(), username.as_str().into());
                }
                if let Some(password) = &auth.password {
                    a.insert("password".into(), password.as_str().into());
                }
                if let Some(blob) = &auth.auth {
                    a.insert("auth".into(), blob.as_str().into());
                }
                if !a.is_empty() {
                    config_entry.insert("auth".into(), a.into());
                }
            }
            if let Some(tls) = &entry.tls {
                let mut t = serde_yaml::Mapping::new();
                if let Some(cert) = &tls.cert_file {
                    t.insert("cert_file".into(), cert.as_str().into());
                }
                if let Some(key) = &tls.key_file {
                    t.insert("key_file".into(), key.as_str().into());
                }
                if let Some(ca) = &tls.ca_file {
                    t.insert("ca_file".into(), ca.as_str().into());
                }
                if !t.is_empty() {
                    config_entry.insert("tls".into(), t.into());
                }
            }
            if !config_entry.is_empty() {
                configs.insert(registry.as_str().into(), config_entry.into());
            }
        }

        // A loopback push registry is unreachable from inside the
        // cluster container; mirror it through host.docker.internal.
        if is_loopback_registry(&self.target_registry) {
            let endpoint = format!(
                "http://{}",
                loopback_rewrite(&self.target_registry)
            );
            let mut m = serde_yaml::Mapping::new();
            m.insert(
                "endpoint".into(),
                serde_yaml::to_value(vec![endpoint])?,
            );
            mirrors.insert(self.target_registry.as_str().into(), m.into());
        }

        let mut root = serde_yaml::Mapping::new();
        root.insert("mirrors".into(), mirrors.into());
        if !configs.is_empty() {
            root.insert("configs".into(), configs.into());
        }
        Ok(serde_yaml::to_string(&serde_yaml::Value::Mapping(root))?)
    }

    /// Hooks to run after the cluster is ready: the CoreDNS rewrite for
    /// loopback mirrors first, then user hooks in declaration order.
    fn post_start_hooks(&self) -> Vec<String> {
        let mut hooks = Vec::new();
        if is_loopback_registry(&self.target_registry) {
            hooks.push(coredns_hook_script());
        }
        hooks.extend(self.config.hooks.post_start.iter().cloned());
        hooks
    }

    fn setup_error(&self, message: String) -> ImagetestError {
        ImagetestError::DriverSetup {
            driver: self.name().to_string(),
            message,
        }
    }

    /// Run kubectl inside the cluster container.
    async fn kubectl(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut full: Vec<&str> = vec!["exec", &self.container, "kubectl"];
        full.extend_from_slice(args);
        docker(&full).await
    }

    /// Run kubectl, treating non-zero exit as an error.
    async fn kubectl_ok(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut full: Vec<&str> = vec!["exec", &self.container, "kubectl"];
        full.extend_from_slice(args);
        docker_ok(&full).await
    }

    /// Current phase of a pod ("Pending", "Running", "Succeeded", ...),
    /// or empty when the pod is not visible yet.
    async fn pod_phase(&self, pod: &str) -> Result<String> {
        let output = self
            .kubectl(&[
                "get",
                "pod",
                pod,
                "-o",
                "jsonpath={.status.phase}",
            ])
            .await?;
        if !output.status.success() {
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Stream pod logs to the run logger until the stream closes.
    ///
    /// `kubectl logs -f` exits when the container terminates, so reading
    /// to EOF guarantees the last chunk is flushed before returning.
    async fn stream_logs(&self, test_name: &str, pod: &str) -> Result<()> {
        use std::process::Stdio;

        let mut child = tokio::process::Command::new("docker")
            .args(["exec", &self.container, "kubectl", "logs", "-f", pod])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(ImagetestError::Io)?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await.map_err(ImagetestError::Io)? {
                tracing::info!(test = test_name, "{}", line);
            }
        }
        let _ = child.wait().await;
        Ok(())
    }

    /// Exit code of the pod's terminated container, with the OOMKilled
    /// fallback when the race leaves no code behind.
    async fn terminated_exit_code(&self, pod: &str) -> (i32, String) {
        let code = self
            .kubectl(&[
                "get",
                "pod",
                pod,
                "-o",
                "jsonpath={.status.containerStatuses[0].state.terminated.exitCode}",
            ])
            .await
            .ok()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_default();

        let reason = self
            .kubectl(&[
                "get",
                "pod",
                pod,
                "-o",
                "jsonpath={.status.containerStatuses[0].state.terminated.reason}",
            ])
            .await
            .ok()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_default();

        match code.parse::<i32>() {
            Ok(parsed) => (parsed, reason),
            Err(_) => (FALLBACK_EXIT_CODE, reason),
        }
    }
}

#[async_trait]
impl Driver for K3sInDockerDriver {
    fn name(&self) -> &'static str {
        "k3s_in_docker"
    }

    async fn setup(&mut self) -> Result<()> {
        tracing::info!(
            container = %self.container,
            image = %self.config.image,
            snapshotter = %self.snapshotter,
            "Provisioning k3s cluster"
        );

        docker_ok(&["volume", "create", "--label",
            &format!("imagetest.id={}", self.run_id), &self.volume])
            .await
            .map_err(|e| self.setup_error(e.to_string()))?;

        let server_args = self.server_args();
        let mut create_args: Vec<String> = vec![
            "create".into(),
            "--privileged".into(),
            "--name".into(),
            self.container.clone(),
            "--label".into(),
            format!("imagetest.id={}", self.run_id),
            "--add-host".into(),
            "host.docker.internal:host-gateway".into(),
            "-p".into(),
            "6443".into(),
            "-v".into(),
            format!("{}:/var/lib/rancher/k3s", self.volume),
        ];
        for (index, mount) in self.config.mounts.iter().enumerate() {
            create_args.push("-v".into());
            create_args.push(format!(
                "{}:{}/{}",
                mount.source.display(),
                MOUNT_BASE,
                index
            ));
        }
        create_args.push(self.config.image.clone());
        create_args.extend(server_args);
        let args: Vec<&str> = create_args.iter().map(|s| s.as_str()).collect();
        docker_ok(&args)
            .await
            .map_err(|e| self.setup_error(e.to_string()))?;

        // Registry configuration has to land before k3s starts.
        let registries = self.render_registries_yaml()?;
        docker_with_stdin(
            &["cp", "-", &format!("{}:/etc", self.container)],
            &tar_single_file("rancher/k3s/registries.yaml", registries.as_bytes())?,
        )
        .await
        .map_err(|e| self.setup_error(e.to_string()))?;

        docker_ok(&["start", &self.container])
            .await
            .map_err(|e| self.setup_error(e.to_string()))?;

        // Node Ready, then core system pods settled.
        let container = self.container.clone();
        wait_until_ready("k3s node", CLUSTER_READY_ATTEMPTS, || {
            let container = container.clone();
            async move {
                let output = docker(&[
                    "exec", &container, "kubectl", "get", "nodes", "--no-headers",
                ])
                .await?;
                if !output.status.success() {
                    return Ok(false);
                }
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(node_lines_ready(&stdout))
            }
        })
        .await
        .map_err(|e| self.setup_error(e.to_string()))?;

        let container = self.container.clone();
        wait_until_ready("core system pods", CLUSTER_READY_ATTEMPTS, || {
            let container = container.clone();
            async move {
                let output = docker(&[
                    "exec", &container, "kubectl", "get", "pods",
                    "-n", "kube-system", "--no-headers",
                ])
                .await?;
                if !output.status.success() {
                    return Ok(false);
                }
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(system_pod_lines_settled(&stdout))
            }
        })
        .await
        .map_err(|e| self.setup_error(e.to_string()))?;

        // Kubeconfig for the calling process, with the server rewritten
        // to the published port.
        let kubeconfig = docker_ok(&[
            "exec",
            &self.container,
            "cat",
            "/etc/rancher/k3s/k3s.yaml",
        ])
        .await
        .map_err(|e| self.setup_error(e.to_string()))?;
        let port_output = docker_ok(&["port", &self.container, "6443/tcp"])
            .await
            .map_err(|e| self.setup_error(e.to_string()))?;
        let host_port = parse_published_port(&String::from_utf8_lossy(&port_output.stdout))
            .ok_or_else(|| {
                self.setup_error("could not determine the published API port".to_string())
            })?;
        let rewritten = rewrite_kubeconfig(
            &String::from_utf8_lossy(&kubeconfig.stdout),
            &host_port,
        );
        let dir = tempfile::TempDir::new().map_err(ImagetestError::Io)?;
        std::fs::write(dir.path().join("kubeconfig.yaml"), rewritten)
            .map_err(ImagetestError::Io)?;
        self.kubeconfig_dir = Some(dir);

        // Service account with cluster-admin for test pods.
        self.kubectl_ok(&["create", "serviceaccount", TEST_SERVICE_ACCOUNT])
            .await
            .map_err(|e| self.setup_error(e.to_string()))?;
        self.kubectl_ok(&[
            "create",
            "clusterrolebinding",
            "imagetest-cluster-admin",
            "--clusterrole=cluster-admin",
            &format!("--serviceaccount=default:{}", TEST_SERVICE_ACCOUNT),
        ])
        .await
        .map_err(|e| self.setup_error(e.to_string()))?;

        for (index, hook) in self.post_start_hooks().iter().enumerate() {
            tracing::info!(index, "Running post-start hook");
            let output = docker(&["exec", &self.container, "sh", "-c", hook]).await?;
            if !output.status.success() {
                return Err(self.setup_error(format!(
                    "post-start hook {} failed (exit {}): {}",
                    index,
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }

        tracing::info!(container = %self.container, "Cluster ready");
        Ok(())
    }

    async fn run(&self, test_name: &str, image: &ImageReference) -> Result<()> {
        let pod = pod_name(&self.run_id, test_name);
        tracing::info!(test = test_name, pod = %pod, image = %image, "Scheduling test pod");

        // Image pull secret for the test image's registry, when the
        // keychain yields credentials for it.
        let credentials = resolve_for(&self.config.registries, &image.registry)?;
        let pull_secret = if let Some((username, password)) = credentials.basic_pair() {
            let secret = format!("{}-pull", pod);
            self.kubectl_ok(&[
                "create",
                "secret",
                "docker-registry",
                &secret,
                &format!("--docker-server={}", image.registry),
                &format!("--docker-username={}", username),
                &format!("--docker-password={}", password),
            ])
            .await
            .map_err(|e| ImagetestError::Other(format!("pull secret: {}", e)))?;
            Some(secret)
        } else {
            None
        };

        let manifest = pod_manifest(
            &pod,
            &self.run_id,
            image,
            &self.config.resources.memory,
            &self.config.resources.cpu,
            pull_secret.as_deref(),
            &self.config.mounts,
        );
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let output = docker_with_stdin(
            &["exec", "-i", &self.container, "kubectl", "apply", "-f", "-"],
            &manifest_bytes,
        )
        .await?;
        if !output.status.success() {
            return Err(ImagetestError::Other(format!(
                "failed to create pod {}: {}",
                pod,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // Wait for the pod to start, stream logs to EOF, then wait for
        // the terminal phase.
        let this = &*self;
        let pod_ref = pod.clone();
        wait_until_ready("test pod start", POD_START_ATTEMPTS, || {
            let pod = pod_ref.clone();
            async move {
                let phase = this.pod_phase(&pod).await?;
                Ok(matches!(phase.as_str(), "Running" | "Succeeded" | "Failed"))
            }
        })
        .await?;

        self.stream_logs(test_name, &pod).await?;

        let pod_ref = pod.clone();
        wait_until_ready("test pod completion", POD_TERMINAL_ATTEMPTS, || {
            let pod = pod_ref.clone();
            async move {
                let phase = this.pod_phase(&pod).await?;
                Ok(matches!(phase.as_str(), "Succeeded" | "Failed"))
            }
        })
        .await?;

        let phase = self.pod_phase(&pod).await?;
        if phase == "Succeeded" {
            tracing::info!(test = test_name, pod = %pod, "Test pod succeeded");
            return Ok(());
        }

        let (exit_code, reason) = self.terminated_exit_code(&pod).await;
        let mut detail = format!("image {}", image);
        if !reason.is_empty() {
            detail.push_str(&format!(", reason {}", reason));
        }
        Err(ImagetestError::TestFailed {
            test: test_name.to_string(),
            exit_code,
            detail,
        })
    }

    async fn teardown(&self) -> Result<()> {
        tracing::info!(container = %self.container, "Tearing down cluster");
        remove_container(&self.container).await?;
        remove_volumes_labeled(&format!("imagetest.id={}", self.run_id)).await?;
        Ok(())
    }
}

/// True when every reported node line carries the Ready condition.
fn node_lines_ready(stdout: &str) -> bool {
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    !lines.is_empty()
        && lines.iter().all(|line| {
            line.split_whitespace()
                .nth(1)
                .map_or(false, |status| status.split(',').any(|s| s == "Ready"))
        })
}

/// True when every core system pod is Running or Completed.
fn system_pod_lines_settled(stdout: &str) -> bool {
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    !lines.is_empty()
        && lines.iter().all(|line| {
            line.split_whitespace()
                .nth(2)
                .map_or(false, |status| status == "Running" || status == "Completed")
        })
}

/// True when a registry host resolves to the host's loopback.
fn is_loopback_registry(registry: &str) -> bool {
    let host = registry.split(':').next().unwrap_or(registry);
    host == "localhost" || host == "127.0.0.1" || host.starts_with("127.")
}

/// Rewrite a loopback registry to its host.docker.internal equivalent,
/// preserving the port.
fn loopback_rewrite(registry: &str) -> String {
    match registry.split_once(':') {
        Some((_host, port)) => format!("host.docker.internal:{}", port),
        None => "host.docker.internal".to_string(),
    }
}

/// Post-start hook resolving host.docker.internal inside the cluster
/// and restarting CoreDNS so pods can reach the mirror.
fn coredns_hook_script() -> String {
    concat!(
        "GATEWAY=$(ip route | awk '/default/ {print $3}'); ",
        "kubectl -n kube-system patch configmap coredns --type merge ",
        "-p \"{\\\"data\\\":{\\\"NodeHosts\\\":\\\"$GATEWAY host.docker.internal\\\"}}\" ",
        "&& kubectl -n kube-system rollout restart deployment coredns",
    )
    .to_string()
}

/// Parse the host port out of `docker port` output
/// (e.g. `0.0.0.0:32768`).
fn parse_published_port(output: &str) -> Option<String> {
    output
        .lines()
        .next()?
        .trim()
        .rsplit_once(':')
        .map(|(_, port)| port.to_string())
}

/// Rewrite the kubeconfig server URL to the published host port.
fn rewrite_kubeconfig(kubeconfig: &str, host_port: &str) -> String {
    kubeconfig.replace(
        "https://127.0.0.1:6443",
        &format!("https://127.0.0.1:{}", host_port),
    )
}

/// DNS-1123-safe pod name for a test.
fn pod_name(run_id: &str, test_name: &str) -> String {
    let mut name = format!("{}-{}", run_id, test_name)
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>();
    name.truncate(63);
    name.trim_matches('-').to_string()
}

/// Pod manifest for one test image.
fn pod_manifest(
    pod: &str,
    run_id: &str,
    image: &ImageReference,
    memory: &str,
    cpu: &str,
    pull_secret: Option<&str>,
    mounts: &[imagetest_core::spec::SandboxMount],
) -> serde_json::Value {
    let volume_mounts: Vec<serde_json::Value> = mounts
        .iter()
        .enumerate()
        .map(|(index, mount)| {
            serde_json::json!({
                "name": format!("mount-{}", index),
                "mountPath": mount.target,
            })
        })
        .collect();
    let volumes: Vec<serde_json::Value> = mounts
        .iter()
        .enumerate()
        .map(|(index, _mount)| {
            serde_json::json!({
                "name": format!("mount-{}", index),
                "hostPath": { "path": format!("{}/{}", MOUNT_BASE, index) },
            })
        })
        .collect();

    let mut spec = serde_json::json!({
        "restartPolicy": "Never",
        "serviceAccountName": TEST_SERVICE_ACCOUNT,
        "containers": [{
            "name": "test",
            "image": image.to_string(),
            "resources": {
                "requests": { "memory": memory, "cpu": cpu },
                "limits": { "memory": memory, "cpu": cpu }
            }
        }]
    });
    if !mounts.is_empty() {
        spec["containers"][0]["volumeMounts"] = serde_json::json!(volume_mounts);
        spec["volumes"] = serde_json::json!(volumes);
    }
    if let Some(secret) = pull_secret {
        spec["imagePullSecrets"] = serde_json::json!([{ "name": secret }]);
    }
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod,
            "labels": {
                "app.kubernetes.io/managed-by": "imagetest",
                "imagetest.dev/id": run_id
            }
        },
        "spec": spec
    })
}
