//! docker-in-docker driver.
//!
//! Provisions a privileged sandbox container running an inner dockerd,
//! configures the inner daemon's mirrors and credentials, then runs each
//! test image with `docker run --rm` inside the sandbox. The verdict is
//! the container exit code.

use async_trait::async_trait;

use imagetest_core::error::{ImagetestError, Result};
use imagetest_core::spec::DockerInDockerConfig;

use crate::oci::credentials::resolve_for;
use crate::oci::ImageReference;

use super::docker::{
    docker, docker_ok, docker_with_stdin, remove_container, remove_volumes_labeled,
    stderr_tail, tar_single_file, to_docker_memory, wait_until_ready, STDERR_TAIL_BYTES,
};
use super::Driver;

/// Attempts to wait for the inner daemon socket (2s apart).
const DAEMON_READY_ATTEMPTS: u32 = 60;

/// Where sandbox-side bind mount sources land inside the sandbox.
const MOUNT_BASE: &str = "/mnt/imagetest";

/// The docker-in-docker execution environment.
pub struct DockerInDockerDriver {
    config: DockerInDockerConfig,
    run_id: String,
    container: String,
    volume: String,
}

impl DockerInDockerDriver {
    /// Create an unprovisioned driver for a run.
    pub fn new(config: DockerInDockerConfig, run_id: &str) -> Self {
        Self {
            config,
            run_id: run_id.to_string(),
            container: format!("{}-dind", run_id),
            volume: format!("{}-dind-docker", run_id),
        }
    }

    /// The inner daemon configuration (mirrors only; auth goes through
    /// `docker login`).
    fn daemon_config(&self) -> serde_json::Value {
        serde_json::json!({
            "registry-mirrors": self.config.mirrors,
        })
    }

    /// `docker create` arguments for the sandbox container.
    fn create_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--privileged".into(),
            "--name".into(),
            self.container.clone(),
            "--label".into(),
            format!("imagetest.id={}", self.run_id),
            "-e".into(),
            "DOCKER_TLS_CERTDIR=".into(),
            "-v".into(),
            format!("{}:/var/lib/docker", self.volume),
        ];
        for (index, mount) in self.config.mounts.iter().enumerate() {
            args.push("-v".into());
            args.push(format!(
                "{}:{}/{}",
                mount.source.display(),
                MOUNT_BASE,
                index
            ));
        }
        args.push(self.config.image.clone());
        args
    }

    /// `docker run` arguments for one test container inside the sandbox.
    fn run_args(&self, image: &ImageReference) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "exec".into(),
            self.container.clone(),
            "docker".into(),
            "run".into(),
            "--rm".into(),
            "--memory".into(),
            to_docker_memory(&self.config.resources.memory),
            "--cpus".into(),
            self.config.resources.cpu.clone(),
        ];
        for (index, mount) in self.config.mounts.iter().enumerate() {
            args.push("-v".into());
            args.push(format!("{}/{}:{}", MOUNT_BASE, index, mount.target));
        }
        args.push(image.to_string());
        args
    }

    fn setup_error(&self, message: String) -> ImagetestError {
        ImagetestError::DriverSetup {
            driver: self.name().to_string(),
            message,
        }
    }
}

#[async_trait]
impl Driver for DockerInDockerDriver {
    fn name(&self) -> &'static str {
        "docker_in_docker"
    }

    async fn setup(&mut self) -> Result<()> {
        tracing::info!(
            container = %self.container,
            image = %self.config.image,
            "Provisioning docker-in-docker sandbox"
        );

        docker_ok(&["volume", "create", "--label",
            &format!("imagetest.id={}", self.run_id), &self.volume])
            .await
            .map_err(|e| self.setup_error(e.to_string()))?;

        let create_args_owned = self.create_args();
        let create_args: Vec<&str> = create_args_owned.iter().map(|s| s.as_str()).collect();
        docker_ok(&create_args)
            .await
            .map_err(|e| self.setup_error(e.to_string()))?;

        // Inner daemon config has to be in place before dockerd starts.
        let daemon_json = serde_json::to_vec_pretty(&self.daemon_config())?;
        docker_with_stdin(
            &["cp", "-", &format!("{}:/etc/docker", self.container)],
            &tar_single_file("daemon.json", &daemon_json)?,
        )
        .await
        .map_err(|e| self.setup_error(e.to_string()))?;

        docker_ok(&["start", &self.container])
            .await
            .map_err(|e| self.setup_error(e.to_string()))?;

        let container = self.container.clone();
        wait_until_ready("inner docker daemon", DAEMON_READY_ATTEMPTS, || {
            let container = container.clone();
            async move {
                let output = docker(&["exec", &container, "docker", "info"]).await?;
                Ok(output.status.success())
            }
        })
        .await
        .map_err(|e| self.setup_error(e.to_string()))?;

        // Log the inner daemon into every registry with credentials.
        for (registry, _config) in &self.config.registries {
            let credentials = resolve_for(&self.config.registries, registry)?;
            if let Some((username, password)) = credentials.basic_pair() {
                docker_ok(&[
                    "exec",
                    &self.container,
                    "docker",
                    "login",
                    "--username",
                    username,
                    "--password",
                    password,
                    registry,
                ])
                .await
                .map_err(|e| self.setup_error(format!("login to {}: {}", registry, e)))?;
            }
        }

        tracing::info!(container = %self.container, "Sandbox ready");
        Ok(())
    }

    async fn run(&self, test_name: &str, image: &ImageReference) -> Result<()> {
        tracing::info!(test = test_name, image = %image, "Running test container");

        let run_args = self.run_args(image);
        let args: Vec<&str> = run_args.iter().map(|s| s.as_str()).collect();
        let output = docker(&args).await?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::info!(test = test_name, "{}", line);
        }

        if output.status.success() {
            return Ok(());
        }

        let exit_code = output.status.code().unwrap_or(-1);
        Err(ImagetestError::TestFailed {
            test: test_name.to_string(),
            exit_code,
            detail: format!(
                "image {}: {}",
                image,
                stderr_tail(&output, STDERR_TAIL_BYTES)
            ),
        })
    }

    async fn teardown(&self) -> Result<()> {
        tracing::info!(container = %self.container, "Tearing down sandbox");
        remove_container(&self.container).await?;
        remove_volumes_labeled(&format!("imagetest.id={}", self.run_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagetest_core::spec::{SandboxMount, SandboxResources};
    use std::path::PathBuf;

    fn driver_with(config: DockerInDockerConfig) -> DockerInDockerDriver {
        DockerInDockerDriver::new(config, "suite-docker_in_docker-ab12")
    }

    #[test]
    fn test_names_derive_from_run_id() {
        let driver = driver_with(DockerInDockerConfig::default());
        assert_eq!(driver.container, "suite-docker_in_docker-ab12-dind");
        assert_eq!(driver.volume, "suite-docker_in_docker-ab12-dind-docker");
        assert_eq!(driver.name(), "docker_in_docker");
    }

    #[test]
    fn test_create_args_privileged_and_labeled() {
        let driver = driver_with(DockerInDockerConfig::default());
        let args = driver.create_args();
        assert!(args.contains(&"--privileged".to_string()));
        assert!(args.contains(&"imagetest.id=suite-docker_in_docker-ab12".to_string()));
        assert!(args.contains(&"DOCKER_TLS_CERTDIR=".to_string()));
        assert_eq!(args.last().unwrap(), &driver.config.image);
    }

    #[test]
    fn test_create_args_mounts_are_namespaced() {
        let mut config = DockerInDockerConfig::default();
        config.mounts.push(SandboxMount {
            source: PathBuf::from("/tmp/fixtures"),
            target: "/data".to_string(),
        });
        let driver = driver_with(config);
        let args = driver.create_args();
        assert!(args.contains(&"/tmp/fixtures:/mnt/imagetest/0".to_string()));
    }

    #[test]
    fn test_run_args_resource_limits() {
        let mut config = DockerInDockerConfig::default();
        config.resources = SandboxResources {
            memory: "4Gi".to_string(),
            cpu: "2".to_string(),
        };
        let driver = driver_with(config);
        let image = ImageReference::parse(
            "cgr.dev/example/test@sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890",
        )
        .unwrap();

        let args = driver.run_args(&image);
        let memory_pos = args.iter().position(|a| a == "--memory").unwrap();
        assert_eq!(args[memory_pos + 1], "4g");
        let cpus_pos = args.iter().position(|a| a == "--cpus").unwrap();
        assert_eq!(args[cpus_pos + 1], "2");
        assert!(args.contains(&"--rm".to_string()));
        assert_eq!(args.last().unwrap(), &image.to_string());
    }

    #[test]
    fn test_run_args_translate_mount_targets() {
        let mut config = DockerInDockerConfig::default();
        config.mounts.push(SandboxMount {
            source: PathBuf::from("/tmp/fixtures"),
            target: "/data".to_string(),
        });
        let driver = driver_with(config);
        let image = ImageReference::parse("busybox:latest").unwrap();
        let args = driver.run_args(&image);
        assert!(args.contains(&"/mnt/imagetest/0:/data".to_string()));
    }

    #[test]
    fn test_daemon_config_mirrors() {
        let mut config = DockerInDockerConfig::default();
        config.mirrors.push("https://mirror.example".to_string());
        let driver = driver_with(config);
        let daemon = driver.daemon_config();
        assert_eq!(
            daemon["registry-mirrors"],
            serde_json::json!(["https://mirror.example"])
        );
    }
}
