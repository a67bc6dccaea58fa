//! Declarative test specification records.
//!
//! These are the on-wire configuration types: plain data, deserialized from
//! YAML (or built directly by API consumers) and validated once. Resolved
//! run state lives in the runtime crate, not here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ImagetestError, Result};

/// Default top-level run timeout.
pub const DEFAULT_RUN_TIMEOUT: &str = "30m";

/// Default per-test timeout.
pub const DEFAULT_TEST_TIMEOUT: &str = "15m";

/// Default target path for test content inside the image.
pub const DEFAULT_CONTENT_TARGET: &str = "/imagetest";

/// Execution environment variant for a test suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    K3sInDocker,
    DockerInDocker,
    Eks,
    Ec2,
    Aks,
    Lambda,
}

impl DriverKind {
    /// The wire name, as used in specs and in the `IMAGETEST_DRIVER` env var.
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::K3sInDocker => "k3s_in_docker",
            DriverKind::DockerInDocker => "docker_in_docker",
            DriverKind::Eks => "eks",
            DriverKind::Ec2 => "ec2",
            DriverKind::Aks => "aks",
            DriverKind::Lambda => "lambda",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DriverKind {
    type Err = ImagetestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "k3s_in_docker" => Ok(DriverKind::K3sInDocker),
            "docker_in_docker" => Ok(DriverKind::DockerInDocker),
            "eks" => Ok(DriverKind::Eks),
            "ec2" => Ok(DriverKind::Ec2),
            "aks" => Ok(DriverKind::Aks),
            "lambda" => Ok(DriverKind::Lambda),
            other => Err(ImagetestError::InvalidInput(format!(
                "unknown driver '{}'",
                other
            ))),
        }
    }
}

/// A file tree mounted into the test image as a content layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentMount {
    /// Directory on the host to package.
    pub source: PathBuf,
    /// Target path prefix inside the image.
    #[serde(default = "default_content_target")]
    pub target: String,
}

fn default_content_target() -> String {
    DEFAULT_CONTENT_TARGET.to_string()
}

/// A single test: a shell command run inside a purpose-built image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    /// Test name, used in ids and diagnostics.
    pub name: String,
    /// Base image the test image is layered on. Must carry a digest.
    pub image: String,
    /// Content layers appended to the base image.
    #[serde(default)]
    pub content: Vec<ContentMount>,
    /// Extra environment variables for the test container.
    #[serde(default)]
    pub envs: HashMap<String, String>,
    /// Shell command whose exit code is the verdict.
    pub cmd: String,
    /// Per-test timeout (e.g. "15m"). Defaults to 15 minutes.
    #[serde(default)]
    pub timeout: Option<String>,
}

impl TestSpec {
    /// Effective per-test timeout.
    pub fn timeout(&self) -> Result<Duration> {
        parse_duration(self.timeout.as_deref().unwrap_or(DEFAULT_TEST_TIMEOUT))
    }
}

/// Registry authentication block in a driver config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryAuthConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Pre-encoded `user:pass` blob, as docker config files carry.
    #[serde(default)]
    pub auth: Option<String>,
}

/// Registry TLS material in a driver config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryTlsConfig {
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub ca_file: Option<String>,
}

/// Mirror endpoint list for a registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryMirrorConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Per-registry configuration block shared by the container drivers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub auth: Option<RegistryAuthConfig>,
    #[serde(default)]
    pub tls: Option<RegistryTlsConfig>,
    #[serde(default)]
    pub mirror: Option<RegistryMirrorConfig>,
}

/// Resource requests/limits applied to the sandbox running a test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResources {
    /// Memory request/limit (e.g. "2Gi").
    #[serde(default = "default_memory")]
    pub memory: String,
    /// CPU request/limit (e.g. "1").
    #[serde(default = "default_cpu")]
    pub cpu: String,
}

fn default_memory() -> String {
    "2Gi".to_string()
}

fn default_cpu() -> String {
    "1".to_string()
}

impl Default for SandboxResources {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpu: default_cpu(),
        }
    }
}

/// Hooks run inside the cluster container after it becomes ready.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverHooks {
    #[serde(default)]
    pub post_start: Vec<String>,
}

/// Configuration for the k3s-in-docker driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct K3sInDockerConfig {
    /// Cluster image.
    #[serde(default = "default_k3s_image")]
    pub image: String,
    /// Disable the builtin CNI.
    #[serde(default)]
    pub disable_cni: bool,
    /// Disable the builtin Traefik ingress.
    #[serde(default = "default_true")]
    pub disable_traefik: bool,
    /// Disable the builtin metrics-server.
    #[serde(default = "default_true")]
    pub disable_metrics_server: bool,
    /// Disable the builtin network policy controller.
    #[serde(default)]
    pub disable_network_policy: bool,
    /// containerd snapshotter. Forced to "native" when `WORKSTATION` is set.
    #[serde(default = "default_snapshotter")]
    pub snapshotter: String,
    /// Per-registry auth, TLS, and mirror configuration.
    #[serde(default)]
    pub registries: HashMap<String, RegistryConfig>,
    #[serde(default)]
    pub hooks: DriverHooks,
    #[serde(default)]
    pub resources: SandboxResources,
    /// Volume mounts exposed to test pods.
    #[serde(default)]
    pub mounts: Vec<SandboxMount>,
}

fn default_k3s_image() -> String {
    "rancher/k3s:v1.30.4-k3s1".to_string()
}

fn default_snapshotter() -> String {
    "overlayfs".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for K3sInDockerConfig {
    fn default() -> Self {
        Self {
            image: default_k3s_image(),
            disable_cni: false,
            disable_traefik: true,
            disable_metrics_server: true,
            disable_network_policy: false,
            snapshotter: default_snapshotter(),
            registries: HashMap::new(),
            hooks: DriverHooks::default(),
            resources: SandboxResources::default(),
            mounts: Vec::new(),
        }
    }
}

/// A bind mount translated into the sandbox namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMount {
    pub source: PathBuf,
    pub target: String,
}

/// Configuration for the docker-in-docker driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerInDockerConfig {
    /// Sandbox image running the inner daemon.
    #[serde(default = "default_dind_image")]
    pub image: String,
    /// Registry mirrors for the inner daemon.
    #[serde(default)]
    pub mirrors: Vec<String>,
    /// Per-registry auth for the inner daemon.
    #[serde(default)]
    pub registries: HashMap<String, RegistryConfig>,
    /// Bind mounts exposed to test containers.
    #[serde(default)]
    pub mounts: Vec<SandboxMount>,
    #[serde(default)]
    pub resources: SandboxResources,
}

fn default_dind_image() -> String {
    "docker:27-dind".to_string()
}

impl Default for DockerInDockerConfig {
    fn default() -> Self {
        Self {
            image: default_dind_image(),
            mirrors: Vec::new(),
            registries: HashMap::new(),
            mounts: Vec::new(),
            resources: SandboxResources::default(),
        }
    }
}

/// Nested per-driver configuration, keyed by driver name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfigs {
    #[serde(default)]
    pub k3s_in_docker: Option<K3sInDockerConfig>,
    #[serde(default)]
    pub docker_in_docker: Option<DockerInDockerConfig>,
}

/// A test suite: one driver, a set of resolved images, and an ordered
/// list of tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestsSpec {
    /// Suite name; feeds the generated run id.
    #[serde(default = "default_name")]
    pub name: String,
    /// Generated run id (`{name}-{driver}-{suffix}`). Set by the orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Selected execution driver. Exactly one per suite.
    pub driver: DriverKind,
    /// Driver-specific configuration, keyed by driver name.
    #[serde(default)]
    pub drivers: DriverConfigs,
    /// Images surfaced to every test via the `IMAGES` env var.
    /// Values must carry a digest.
    #[serde(default)]
    pub images: HashMap<String, String>,
    /// Tests, run strictly in declaration order.
    #[serde(default)]
    pub tests: Vec<TestSpec>,
    /// Top-level timeout bounding the whole run (e.g. "30m").
    #[serde(default)]
    pub timeout: Option<String>,
    /// Labels evaluated against the include/exclude policy.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_name() -> String {
    "test".to_string()
}

impl TestsSpec {
    /// Effective top-level timeout.
    pub fn timeout(&self) -> Result<Duration> {
        parse_duration(self.timeout.as_deref().unwrap_or(DEFAULT_RUN_TIMEOUT))
    }

    /// Validate the plain-data record once, before any driver work.
    ///
    /// Checks timeouts parse and that a config block, if present, matches
    /// the selected driver.
    pub fn validate(&self) -> Result<()> {
        self.timeout()?;
        for test in &self.tests {
            test.timeout()?;
            if test.cmd.trim().is_empty() {
                return Err(ImagetestError::InvalidInput(format!(
                    "test '{}' has an empty cmd",
                    test.name
                )));
            }
        }
        match self.driver {
            DriverKind::K3sInDocker | DriverKind::DockerInDocker => Ok(()),
            other => {
                // Cloud variants parse but are provisioned elsewhere.
                tracing::debug!(driver = %other, "cloud driver selected; config not validated here");
                Ok(())
            }
        }
    }
}

/// Parse a human-readable duration string (e.g. "30m", "90s", "1h", "45").
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ImagetestError::InvalidInput(
            "empty duration".to_string(),
        ));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let (num, mult) = if let Some(rest) = s.strip_suffix("ms") {
        return rest
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| invalid_duration(s));
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3600u64)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60u64)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1u64)
    } else {
        return Err(invalid_duration(s));
    };
    num.parse::<u64>()
        .map(|n| Duration::from_secs(n * mult))
        .map_err(|_| invalid_duration(s))
}

fn invalid_duration(s: &str) -> ImagetestError {
    ImagetestError::InvalidInput(format!(
        "invalid duration '{}' (expected forms: 30m, 90s, 1h, 500ms, 45)",
        s
    ))
}
