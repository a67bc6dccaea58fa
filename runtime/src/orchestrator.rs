//! Run orchestrator.
//!
//! Turns a declarative `TestsSpec` into a completed run: generates the
//! run id, establishes the deadline, evaluates skip policy, resolves
//! images, assembles per-test images, drives the driver lifecycle, and
//! applies the teardown policy. Tests run strictly sequentially in
//! declaration order; the first failure aborts the remainder.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;

use imagetest_core::diagnostics::{Diagnostic, Diagnostics};
use imagetest_core::error::{ImagetestError, Result};
use imagetest_core::policy::{
    ExecutionPolicy, TeardownDecision, TeardownPolicy, ENV_IMAGES, ENV_IMAGETEST_DRIVER,
    ENV_IMAGETEST_PAUSE_ON_ERROR,
};
use imagetest_core::spec::{TestSpec, TestsSpec};

use crate::drivers::{create_driver, Driver};
use crate::oci::bundle::{config_mutator, content_mutator, entrypoint_mutator, ImageMutator};
use crate::oci::resolved::{resolve_images, serialize_images};
use crate::oci::{Bundler, ContentLayer, EntrypointLayers, ImageReference, RegistryClient};

/// Sub-repository all test images are pushed under.
const TARGET_REPO_SUFFIX: &str = "imagetest";

/// Fresh scope applied to teardown, decoupled from run cancellation.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Per-invocation resolved state.
pub struct RunContext {
    /// Generated run id.
    pub id: String,
    /// Repository test images are pushed to.
    pub target_repo: String,
    /// Serialized `IMAGES` value injected into every test image.
    pub images_json: String,
    /// Absolute deadline for the whole run.
    pub deadline: Instant,
}

/// Assembles one test image per test spec.
///
/// Seam between the orchestrator and the registry-backed bundler, so
/// the run lifecycle is testable without a registry.
#[async_trait]
pub trait TestImageBuilder: Send + Sync {
    /// Ensure entrypoint layers are available before any build.
    async fn prepare(&self) -> Result<()>;

    /// Build the test image and return its digest reference.
    async fn build(
        &self,
        test: &TestSpec,
        env: Vec<(String, String)>,
        target_repo: &str,
    ) -> Result<ImageReference>;
}

/// The registry-backed builder: entrypoint + content + config mutators
/// applied through the bundler.
pub struct BundlerImageBuilder {
    client: Arc<RegistryClient>,
    entrypoint_ref: ImageReference,
    layers: tokio::sync::OnceCell<Arc<EntrypointLayers>>,
}

impl BundlerImageBuilder {
    /// Builder pulling entrypoint layers from the given reference.
    pub fn new(client: Arc<RegistryClient>, entrypoint_ref: ImageReference) -> Self {
        Self {
            client,
            entrypoint_ref,
            layers: tokio::sync::OnceCell::new(),
        }
    }

    async fn entrypoint_layers(&self) -> Result<Arc<EntrypointLayers>> {
        self.layers
            .get_or_try_init(|| async {
                EntrypointLayers::load(&self.client, &self.entrypoint_ref)
                    .await
                    .map(Arc::new)
            })
            .await
            .map(|layers| layers.clone())
    }
}

#[async_trait]
impl TestImageBuilder for BundlerImageBuilder {
    async fn prepare(&self) -> Result<()> {
        self.entrypoint_layers().await.map(|_| ())
    }

    async fn build(
        &self,
        test: &TestSpec,
        env: Vec<(String, String)>,
        target_repo: &str,
    ) -> Result<ImageReference> {
        let base = ImageReference::parse_pinned(&test.image)?;

        let mut content_layers = Vec::with_capacity(test.content.len());
        for mount in &test.content {
            content_layers.push(ContentLayer::from_mount(mount)?);
        }

        let mutators: Vec<ImageMutator> = vec![
            entrypoint_mutator(self.entrypoint_layers().await?),
            content_mutator(content_layers),
            config_mutator(env, test.cmd.clone()),
        ];

        let bundler = Bundler::new(&self.client);
        let built = bundler.mutate(&base, target_repo, &mutators).await?;
        tracing::info!(test = %test.name, reference = %built, "Built test image");
        Ok(built)
    }
}

/// Driver construction seam.
pub type DriverFactory =
    Box<dyn Fn(&TestsSpec, &str, &str) -> Result<Box<dyn Driver>> + Send + Sync>;

/// The run orchestrator.
///
/// Owns the driver and the run deadline; the driver owns its
/// provisioned resources; the bundler owns no long-lived state.
pub struct Orchestrator {
    user_repo: String,
    policy: ExecutionPolicy,
    teardown_policy: TeardownPolicy,
    builder: Arc<dyn TestImageBuilder>,
    driver_factory: DriverFactory,
}

impl Orchestrator {
    /// Orchestrator pushing test images under `{user_repo}/imagetest`,
    /// with entrypoint layers pulled from `entrypoint_ref`.
    pub fn new(
        client: Arc<RegistryClient>,
        entrypoint_ref: ImageReference,
        user_repo: &str,
        policy: ExecutionPolicy,
    ) -> Self {
        Self {
            user_repo: user_repo.to_string(),
            policy,
            teardown_policy: TeardownPolicy::from_env(),
            builder: Arc::new(BundlerImageBuilder::new(client, entrypoint_ref)),
            driver_factory: Box::new(|spec, run_id, target_registry| {
                create_driver(spec, run_id, target_registry)
            }),
        }
    }

    /// Override the teardown policy (embedders, tests).
    pub fn with_teardown_policy(mut self, policy: TeardownPolicy) -> Self {
        self.teardown_policy = policy;
        self
    }

    /// Override the image builder (embedders, tests).
    pub fn with_builder(mut self, builder: Arc<dyn TestImageBuilder>) -> Self {
        self.builder = builder;
        self
    }

    /// Override driver construction (embedders, tests).
    pub fn with_driver_factory(mut self, factory: DriverFactory) -> Self {
        self.driver_factory = factory;
        self
    }

    /// Execute a suite. All outcomes are reported as diagnostics; any
    /// error-severity entry fails the run.
    pub async fn run(&self, spec: &mut TestsSpec) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();

        let id = generate_run_id(&spec.name, spec.driver.as_str());
        spec.id = Some(id.clone());
        tracing::info!(id = %id, driver = %spec.driver, "Starting run");

        let run_timeout = match spec.timeout() {
            Ok(timeout) => timeout,
            Err(err) => {
                diagnostics.push(Diagnostic::from_error("invalid input", &err));
                return diagnostics;
            }
        };

        if let imagetest_core::labels::SkipVerdict::Skip(reason) =
            self.policy.evaluate(&spec.labels)
        {
            tracing::warn!(id = %id, reason = %reason, "Run skipped");
            diagnostics.push(Diagnostic::warn("skipped", reason));
            return diagnostics;
        }

        let images_json = match resolve_images(&spec.images).and_then(|r| serialize_images(&r))
        {
            Ok(json) => json,
            Err(err) => {
                diagnostics.push(Diagnostic::from_error("invalid input", &err));
                return diagnostics;
            }
        };

        let context = RunContext {
            id: id.clone(),
            target_repo: format!("{}/{}", self.user_repo, TARGET_REPO_SUFFIX),
            images_json,
            deadline: Instant::now() + run_timeout,
        };

        // The driver outlives the timed section so a timed-out run can
        // still be torn down.
        let mut driver_slot: Option<Box<dyn Driver>> = None;
        let setup_attempted = AtomicBool::new(false);

        let outcome = tokio::time::timeout(
            run_timeout,
            self.execute(spec, &context, &mut driver_slot, &setup_attempted),
        )
        .await;

        let run_result: Result<()> = match outcome {
            Ok(result) => result,
            Err(_) => Err(ImagetestError::Timeout(format!(
                "run {} exceeded its {}s timeout",
                context.id,
                run_timeout.as_secs()
            ))),
        };

        if let Err(err) = &run_result {
            diagnostics.push(Diagnostic::from_error(error_summary(err), err));
        }

        self.maybe_teardown(
            driver_slot.as_deref(),
            setup_attempted.load(Ordering::SeqCst),
            run_result.is_err(),
            &mut diagnostics,
        )
        .await;

        diagnostics
    }

    /// The deadline-scoped run body: build, setup, per-test runs.
    async fn execute(
        &self,
        spec: &TestsSpec,
        context: &RunContext,
        driver_slot: &mut Option<Box<dyn Driver>>,
        setup_attempted: &AtomicBool,
    ) -> Result<()> {
        self.builder.prepare().await?;

        let pause_on_error = self.teardown_policy.pause_on_error();

        // Image build order equals declaration order.
        let mut built = Vec::with_capacity(spec.tests.len());
        for test in &spec.tests {
            let env = build_test_env(
                &test.envs,
                &context.images_json,
                spec.driver.as_str(),
                pause_on_error,
            );
            let reference = self
                .builder
                .build(test, env, &context.target_repo)
                .await?;
            built.push((test, reference));
        }

        let target_registry = context
            .target_repo
            .split('/')
            .next()
            .unwrap_or(&context.target_repo)
            .to_string();
        let driver = (self.driver_factory)(spec, &context.id, &target_registry)?;
        *driver_slot = Some(driver);
        let driver = driver_slot.as_mut().map(|d| &mut **d).ok_or_else(|| {
            ImagetestError::Other("driver construction yielded nothing".to_string())
        })?;

        setup_attempted.store(true, Ordering::SeqCst);
        driver.setup().await?;

        // Test run order equals declaration order; first error aborts.
        for (test, reference) in &built {
            let test_timeout = test.timeout()?;
            let remaining = context.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ImagetestError::Timeout(format!(
                    "run deadline expired before test '{}'",
                    test.name
                )));
            }
            let effective = test_timeout.min(remaining);

            match tokio::time::timeout(effective, driver.run(&test.name, reference)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ImagetestError::Timeout(format!(
                        "test '{}' exceeded its {}s deadline (image {})",
                        test.name,
                        effective.as_secs(),
                        reference
                    )));
                }
            }
        }

        Ok(())
    }

    /// Apply the teardown predicate once, with a fresh scope.
    async fn maybe_teardown(
        &self,
        driver: Option<&dyn Driver>,
        setup_attempted: bool,
        run_failed: bool,
        diagnostics: &mut Diagnostics,
    ) {
        match self.teardown_policy.evaluate(run_failed) {
            TeardownDecision::Skip(reason) => {
                tracing::warn!(reason = %reason, "Skipping teardown");
                diagnostics.push(Diagnostic::warn("teardown", reason));
            }
            TeardownDecision::Teardown => {
                let driver = match driver {
                    Some(driver) if setup_attempted => driver,
                    _ => return,
                };
                match tokio::time::timeout(TEARDOWN_TIMEOUT, driver.teardown()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        diagnostics.push(Diagnostic::from_error("teardown", &err));
                    }
                    Err(_) => {
                        diagnostics.push(Diagnostic::error(
                            "teardown",
                            format!(
                                "teardown exceeded its {}s timeout",
                                TEARDOWN_TIMEOUT.as_secs()
                            ),
                        ));
                    }
                }
            }
        }
    }
}

/// `{name}-{driver}-{4-char-random}`, spaces replaced by underscores.
pub fn generate_run_id(name: &str, driver: &str) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{}-{}-{}", name, driver, suffix).replace(' ', "_")
}

/// The ordered env overlay for one test image: user envs in stable key
/// order, then the injected variables. Appended after the base image's
/// env by the config mutator, so later entries win at runtime.
pub fn build_test_env(
    envs: &std::collections::HashMap<String, String>,
    images_json: &str,
    driver: &str,
    pause_on_error: bool,
) -> Vec<(String, String)> {
    let sorted: BTreeMap<&String, &String> = envs.iter().collect();
    let mut env: Vec<(String, String)> = sorted
        .into_iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.push((ENV_IMAGES.to_string(), images_json.to_string()));
    env.push((ENV_IMAGETEST_DRIVER.to_string(), driver.to_string()));
    if pause_on_error {
        env.push((ENV_IMAGETEST_PAUSE_ON_ERROR.to_string(), "true".to_string()));
    }
    env
}

/// Component-keyed summary for a run error.
fn error_summary(err: &ImagetestError) -> String {
    match err {
        ImagetestError::InvalidInput(_) => "invalid input".to_string(),
        ImagetestError::ImageAssembly { .. } => "image assembly".to_string(),
        ImagetestError::Registry { .. } => "registry".to_string(),
        ImagetestError::DriverSetup { .. } => "driver setup".to_string(),
        ImagetestError::TestFailed { test, .. } => format!("test {}", test),
        ImagetestError::Timeout(_) => "timeout".to_string(),
        ImagetestError::Teardown(_) => "teardown".to_string(),
        _ => "run".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagetest_core::diagnostics::Severity;
    use imagetest_core::spec::{DriverConfigs, DriverKind};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    /// Builder that mints deterministic refs without touching a registry.
    struct MockBuilder {
        built: Mutex<Vec<String>>,
    }

    impl MockBuilder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                built: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TestImageBuilder for MockBuilder {
        async fn prepare(&self) -> Result<()> {
            Ok(())
        }

        async fn build(
            &self,
            test: &TestSpec,
            _env: Vec<(String, String)>,
            target_repo: &str,
        ) -> Result<ImageReference> {
            self.built.lock().unwrap().push(test.name.clone());
            ImageReference::parse(&format!("{}@{}", target_repo, DIGEST))
        }
    }

    #[derive(Clone, Default)]
    struct MockDriverState {
        setup_calls: Arc<AtomicU32>,
        teardown_calls: Arc<AtomicU32>,
        runs: Arc<Mutex<Vec<String>>>,
    }

    struct MockDriver {
        state: MockDriverState,
        fail_setup: bool,
        fail_test: Option<String>,
        hang_test: Option<String>,
    }

    #[async_trait]
    impl Driver for MockDriver {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn setup(&mut self) -> Result<()> {
            self.state.setup_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_setup {
                return Err(ImagetestError::DriverSetup {
                    driver: "mock".to_string(),
                    message: "sandbox never became ready".to_string(),
                });
            }
            Ok(())
        }

        async fn run(&self, test_name: &str, _image: &ImageReference) -> Result<()> {
            self.state.runs.lock().unwrap().push(test_name.to_string());
            if self.hang_test.as_deref() == Some(test_name) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail_test.as_deref() == Some(test_name) {
                return Err(ImagetestError::TestFailed {
                    test: test_name.to_string(),
                    exit_code: 213,
                    detail: "image mock".to_string(),
                });
            }
            Ok(())
        }

        async fn teardown(&self) -> Result<()> {
            self.state.teardown_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_spec(name: &str, timeout: Option<&str>) -> TestSpec {
        TestSpec {
            name: name.to_string(),
            image: format!("cgr.dev/example/base@{}", DIGEST),
            content: Vec::new(),
            envs: HashMap::new(),
            cmd: "echo hello".to_string(),
            timeout: timeout.map(|t| t.to_string()),
        }
    }

    fn suite(tests: Vec<TestSpec>) -> TestsSpec {
        TestsSpec {
            name: "suite".to_string(),
            id: None,
            driver: DriverKind::DockerInDocker,
            drivers: DriverConfigs::default(),
            images: HashMap::new(),
            tests,
            timeout: None,
            labels: HashMap::new(),
        }
    }

    fn orchestrator_with(
        state: MockDriverState,
        fail_setup: bool,
        fail_test: Option<&str>,
        hang_test: Option<&str>,
        policy: ExecutionPolicy,
        teardown: TeardownPolicy,
    ) -> Orchestrator {
        let fail_test = fail_test.map(|s| s.to_string());
        let hang_test = hang_test.map(|s| s.to_string());
        Orchestrator {
            user_repo: "ttl.sh/example".to_string(),
            policy,
            teardown_policy: teardown,
            builder: MockBuilder::new(),
            driver_factory: Box::new(move |_spec, _id, _registry| {
                Ok(Box::new(MockDriver {
                    state: state.clone(),
                    fail_setup,
                    fail_test: fail_test.clone(),
                    hang_test: hang_test.clone(),
                }))
            }),
        }
    }

    fn default_orchestrator(state: MockDriverState) -> Orchestrator {
        orchestrator_with(
            state,
            false,
            None,
            None,
            ExecutionPolicy::default(),
            TeardownPolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_basic_pass() {
        let state = MockDriverState::default();
        let orchestrator = default_orchestrator(state.clone());
        let mut spec = suite(vec![test_spec("smoke", None)]);

        let diagnostics = orchestrator.run(&mut spec).await;
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
        assert_eq!(state.setup_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.teardown_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*state.runs.lock().unwrap(), vec!["smoke"]);
        assert!(spec.id.is_some());
    }

    #[tokio::test]
    async fn test_failure_carries_exit_code_and_aborts_remaining() {
        let state = MockDriverState::default();
        let orchestrator = orchestrator_with(
            state.clone(),
            false,
            Some("t2"),
            None,
            ExecutionPolicy::default(),
            TeardownPolicy::default(),
        );
        let mut spec = suite(vec![
            test_spec("t1", None),
            test_spec("t2", None),
            test_spec("t3", None),
        ]);

        let diagnostics = orchestrator.run(&mut spec).await;
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.count(Severity::Error), 1);
        let error = &diagnostics.entries()[0];
        assert!(error.summary.contains("t2"));
        assert!(error.detail.contains("213"));

        // t3 never ran; teardown still happened exactly once.
        assert_eq!(*state.runs.lock().unwrap(), vec!["t1", "t2"]);
        assert_eq!(state.teardown_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tag_only_image_rejected_before_driver() {
        let state = MockDriverState::default();
        let orchestrator = default_orchestrator(state.clone());
        let mut spec = suite(vec![test_spec("smoke", None)]);
        spec.images
            .insert("foo".to_string(), "repo/bar:latest".to_string());

        let diagnostics = orchestrator.run(&mut spec).await;
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.entries()[0].summary, "invalid input");
        // No driver was ever created.
        assert_eq!(state.setup_calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.teardown_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skip_all_emits_single_warning() {
        let state = MockDriverState::default();
        let policy = ExecutionPolicy {
            include_by_label: HashMap::new(),
            exclude_by_label: HashMap::new(),
            skip_all: true,
        };
        let orchestrator = orchestrator_with(
            state.clone(),
            false,
            None,
            None,
            policy,
            TeardownPolicy::default(),
        );
        let mut spec = suite(vec![test_spec("smoke", None)]);

        let diagnostics = orchestrator.run(&mut spec).await;
        assert_eq!(diagnostics.len(), 1);
        assert!(!diagnostics.has_errors());
        assert_eq!(diagnostics.entries()[0].severity, Severity::Warn);
        assert_eq!(state.setup_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_include_label_mismatch_skips() {
        let state = MockDriverState::default();
        let mut include = HashMap::new();
        include.insert("foo".to_string(), "baz".to_string());
        let policy = ExecutionPolicy {
            include_by_label: include,
            exclude_by_label: HashMap::new(),
            skip_all: false,
        };
        let orchestrator = orchestrator_with(
            state.clone(),
            false,
            None,
            None,
            policy,
            TeardownPolicy::default(),
        );
        let mut spec = suite(vec![test_spec("smoke", None)]);
        spec.labels.insert("foo".to_string(), "bar".to_string());

        let diagnostics = orchestrator.run(&mut spec).await;
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics.entries()[0].severity, Severity::Warn);
        assert!(diagnostics.entries()[0]
            .detail
            .contains("does not match include labels"));
        assert_eq!(state.setup_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_setup_failure_still_tears_down() {
        let state = MockDriverState::default();
        let orchestrator = orchestrator_with(
            state.clone(),
            true,
            None,
            None,
            ExecutionPolicy::default(),
            TeardownPolicy::default(),
        );
        let mut spec = suite(vec![test_spec("smoke", None)]);

        let diagnostics = orchestrator.run(&mut spec).await;
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.entries()[0].summary, "driver setup");
        assert_eq!(state.teardown_calls.load(Ordering::SeqCst), 1);
        assert!(state.runs.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_test_timeout() {
        let state = MockDriverState::default();
        let orchestrator = orchestrator_with(
            state.clone(),
            false,
            None,
            Some("slow"),
            ExecutionPolicy::default(),
            TeardownPolicy::default(),
        );
        let mut spec = suite(vec![test_spec("slow", Some("1s")), test_spec("after", None)]);

        let diagnostics = orchestrator.run(&mut spec).await;
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.entries()[0].summary, "timeout");
        assert!(diagnostics.entries()[0].detail.contains("slow"));

        // The subsequent test never started; teardown ran once.
        assert_eq!(*state.runs.lock().unwrap(), vec!["slow"]);
        assert_eq!(state.teardown_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_still_tears_down() {
        let state = MockDriverState::default();
        let orchestrator = orchestrator_with(
            state.clone(),
            false,
            None,
            Some("slow"),
            ExecutionPolicy::default(),
            TeardownPolicy::default(),
        );
        let mut spec = suite(vec![test_spec("slow", Some("2h"))]);
        spec.timeout = Some("1s".to_string());

        let diagnostics = orchestrator.run(&mut spec).await;
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.entries()[0].summary, "timeout");
        assert_eq!(state.teardown_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skip_teardown_preserves_failure_and_warns() {
        let state = MockDriverState::default();
        let orchestrator = orchestrator_with(
            state.clone(),
            false,
            Some("smoke"),
            None,
            ExecutionPolicy::default(),
            TeardownPolicy::new(true, false),
        );
        let mut spec = suite(vec![test_spec("smoke", None)]);

        let diagnostics = orchestrator.run(&mut spec).await;
        assert!(diagnostics.has_errors());
        assert_eq!(diagnostics.count(Severity::Warn), 1);
        assert!(diagnostics
            .entries()
            .iter()
            .any(|d| d.summary == "teardown" && d.detail.contains("SKIP_TEARDOWN")));
        assert_eq!(state.teardown_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_generate_run_id_shape() {
        let id = generate_run_id("my suite", "docker_in_docker");
        assert!(id.starts_with("my_suite-docker_in_docker-"));
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!id.contains(' '));
    }

    #[test]
    fn test_build_test_env_ordering() {
        let mut envs = HashMap::new();
        envs.insert("ZED".to_string(), "z".to_string());
        envs.insert("ALPHA".to_string(), "a".to_string());

        let env = build_test_env(&envs, "{}", "docker_in_docker", true);
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "ALPHA",
                "ZED",
                "IMAGES",
                "IMAGETEST_DRIVER",
                "IMAGETEST_PAUSE_ON_ERROR"
            ]
        );
    }

    #[test]
    fn test_build_test_env_no_pause() {
        let env = build_test_env(&HashMap::new(), "{}", "k3s_in_docker", false);
        assert!(!env.iter().any(|(k, _)| k == "IMAGETEST_PAUSE_ON_ERROR"));
        assert!(env
            .iter()
            .any(|(k, v)| k == "IMAGETEST_DRIVER" && v == "k3s_in_docker"));
    }

    #[test]
    fn test_error_summary_mapping() {
        assert_eq!(
            error_summary(&ImagetestError::InvalidInput("x".to_string())),
            "invalid input"
        );
        assert_eq!(
            error_summary(&ImagetestError::TestFailed {
                test: "smoke".to_string(),
                exit_code: 1,
                detail: String::new()
            }),
            "test smoke"
        );
        assert_eq!(
            error_summary(&ImagetestError::Timeout("x".to_string())),
            "timeout"
        );
    }
}
