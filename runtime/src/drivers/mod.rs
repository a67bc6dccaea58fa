//! Execution drivers.
//!
//! A driver provisions an ephemeral sandbox environment, runs test
//! images inside it, and tears it down. Drivers are tagged variants
//! behind one operation set; the orchestrator never branches on the
//! variant beyond construction.

mod dind;
mod docker;
mod k3s;

pub use dind::DockerInDockerDriver;
pub use k3s::K3sInDockerDriver;

use async_trait::async_trait;

use imagetest_core::error::{ImagetestError, Result};
use imagetest_core::spec::{DriverKind, TestsSpec};

use crate::oci::ImageReference;

/// One provisioned execution environment.
///
/// Log capture ordering is driver-specific: docker-in-docker keeps
/// stdout and stderr separate as the docker CLI delivers them, while
/// k3s streams the pod's merged log stream in arrival order. Faithful
/// interleaving across drivers is not guaranteed.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The driver's wire name (e.g. "docker_in_docker").
    fn name(&self) -> &'static str;

    /// Provision the environment. Called exactly once per run.
    async fn setup(&mut self) -> Result<()>;

    /// Run one test image to completion. Success iff the sandbox
    /// process exits zero.
    async fn run(&self, test_name: &str, image: &ImageReference) -> Result<()>;

    /// Remove all provisioned resources. Idempotent; receives a fresh
    /// scope decoupled from per-test cancellation.
    async fn teardown(&self) -> Result<()>;
}

/// Construct the driver selected by a spec.
///
/// `target_registry` is the registry test images are pushed to; the k3s
/// driver inspects it for the loopback mirror rewrite. Cloud variants
/// share the `Driver` contract but are provisioned by external
/// collaborators; selecting one here is an input error.
pub fn create_driver(
    spec: &TestsSpec,
    run_id: &str,
    target_registry: &str,
) -> Result<Box<dyn Driver>> {
    match spec.driver {
        DriverKind::K3sInDocker => {
            let config = spec
                .drivers
                .k3s_in_docker
                .clone()
                .unwrap_or_default();
            Ok(Box::new(K3sInDockerDriver::new(config, run_id, target_registry)))
        }
        DriverKind::DockerInDocker => {
            let config = spec
                .drivers
                .docker_in_docker
                .clone()
                .unwrap_or_default();
            Ok(Box::new(DockerInDockerDriver::new(config, run_id)))
        }
        other => Err(ImagetestError::InvalidInput(format!(
            "driver '{}' is not supported by this build",
            other
        ))),
    }
}
