//! `imagetest run` — execute a test suite from a spec file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use comfy_table::{presets::UTF8_FULL, Table};

use imagetest_core::diagnostics::{Diagnostics, Severity};
use imagetest_core::policy::ExecutionPolicy;
use imagetest_core::spec::TestsSpec;
use imagetest_runtime::{ImageReference, Keychain, Orchestrator, RegistryClient};

use super::parse_labels;

/// Default entrypoint image; override with a digest-pinned reference
/// for deterministic test-image digests across runs.
const DEFAULT_ENTRYPOINT_IMAGE: &str = "ghcr.io/imagetest-dev/entrypoint:latest";

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    /// Path to the tests-spec YAML file
    pub spec: PathBuf,

    /// Repository test images are pushed under (e.g. ttl.sh/myuser)
    #[arg(long)]
    pub repo: String,

    /// Entrypoint image reference
    #[arg(long, default_value = DEFAULT_ENTRYPOINT_IMAGE)]
    pub entrypoint: String,

    /// Only run suites matching this label (repeatable, key=value)
    #[arg(long = "include-label")]
    pub include_labels: Vec<String>,

    /// Skip suites matching this label (repeatable, key=value)
    #[arg(long = "exclude-label")]
    pub exclude_labels: Vec<String>,
}

/// Execute the run command.
pub async fn execute(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(&args.spec)
        .map_err(|e| format!("failed to read {}: {}", args.spec.display(), e))?;
    let mut spec: TestsSpec = serde_yaml::from_str(&contents)
        .map_err(|e| format!("failed to parse {}: {}", args.spec.display(), e))?;
    spec.validate()?;

    let include = parse_labels(&args.include_labels)?;
    let exclude = parse_labels(&args.exclude_labels)?;
    let policy = ExecutionPolicy::from_env(include, exclude);

    let entrypoint = ImageReference::parse(&args.entrypoint)?;
    let client = Arc::new(RegistryClient::new(Keychain::new()));
    let orchestrator = Orchestrator::new(client, entrypoint, &args.repo, policy);

    let diagnostics = orchestrator.run(&mut spec).await;

    print_summary(&spec, &diagnostics);

    if diagnostics.has_errors() {
        return Err(format!(
            "run {} failed with {} error(s)",
            spec.id.as_deref().unwrap_or("unknown"),
            diagnostics.count(Severity::Error)
        )
        .into());
    }
    Ok(())
}

/// Render the diagnostics table for a completed run.
fn print_summary(spec: &TestsSpec, diagnostics: &Diagnostics) {
    let id = spec.id.as_deref().unwrap_or("unknown");

    if diagnostics.is_empty() {
        println!(
            "Run {} passed: {} test(s), no diagnostics",
            id,
            spec.tests.len()
        );
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["SEVERITY", "COMPONENT", "DETAIL"]);
    for diagnostic in diagnostics.entries() {
        table.add_row(vec![
            diagnostic.severity.to_string(),
            diagnostic.summary.clone(),
            diagnostic.detail.clone(),
        ]);
    }
    println!("Run {}:", id);
    println!("{table}");
}
