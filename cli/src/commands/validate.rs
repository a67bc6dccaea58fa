//! `imagetest validate` — parse and check a spec without running it.

use std::path::PathBuf;

use clap::Args;
use comfy_table::{presets::UTF8_FULL, Table};

use imagetest_core::spec::{DriverKind, TestsSpec};
use imagetest_runtime::ImageReference;

/// Arguments for the validate command.
#[derive(Args)]
pub struct ValidateArgs {
    /// Path to the tests-spec YAML file
    pub spec: PathBuf,
}

/// Execute the validate command.
pub async fn execute(args: ValidateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(&args.spec)
        .map_err(|e| format!("failed to read {}: {}", args.spec.display(), e))?;
    let spec: TestsSpec = serde_yaml::from_str(&contents)
        .map_err(|e| format!("failed to parse {}: {}", args.spec.display(), e))?;

    spec.validate()?;

    // Every reference must carry a digest, tests and images alike.
    for (name, reference) in &spec.images {
        ImageReference::parse_pinned(reference)
            .map_err(|e| format!("images.{}: {}", name, e))?;
    }
    for test in &spec.tests {
        ImageReference::parse_pinned(&test.image)
            .map_err(|e| format!("test '{}': {}", test.name, e))?;
    }

    if matches!(
        spec.driver,
        DriverKind::Eks | DriverKind::Ec2 | DriverKind::Aks | DriverKind::Lambda
    ) {
        println!(
            "note: driver '{}' is provisioned externally; this build runs \
             k3s_in_docker and docker_in_docker",
            spec.driver
        );
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["TEST", "BASE IMAGE", "TIMEOUT", "CMD"]);
    for test in &spec.tests {
        table.add_row(vec![
            test.name.clone(),
            test.image.clone(),
            test.timeout.clone().unwrap_or_else(|| "15m".to_string()),
            test.cmd.clone(),
        ]);
    }

    println!(
        "{} is valid: driver {}, {} test(s)",
        args.spec.display(),
        spec.driver,
        spec.tests.len()
    );
    println!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    fn write_spec(dir: &TempDir, contents: &str) -> ValidateArgs {
        let path = dir.path().join("spec.yaml");
        fs::write(&path, contents).unwrap();
        ValidateArgs { spec: path }
    }

    #[tokio::test]
    async fn test_validate_accepts_pinned_spec() {
        let dir = TempDir::new().unwrap();
        let args = write_spec(
            &dir,
            &format!(
                r#"
driver: docker_in_docker
images:
  app: "cgr.dev/example/app@{d}"
tests:
  - name: smoke
    image: "cgr.dev/example/base@{d}"
    cmd: "echo hello"
"#,
                d = DIGEST
            ),
        );
        assert!(execute(args).await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_rejects_tag_only_image() {
        let dir = TempDir::new().unwrap();
        let args = write_spec(
            &dir,
            r#"
driver: docker_in_docker
images:
  foo: "repo/bar:latest"
tests: []
"#,
        );
        let result = execute(args).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("digest"));
    }

    #[tokio::test]
    async fn test_validate_rejects_tag_only_test_base() {
        let dir = TempDir::new().unwrap();
        let args = write_spec(
            &dir,
            r#"
driver: docker_in_docker
tests:
  - name: smoke
    image: "cgr.dev/example/base:latest"
    cmd: "echo hello"
"#,
        );
        assert!(execute(args).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_rejects_missing_file() {
        let args = ValidateArgs {
            spec: PathBuf::from("/nonexistent/spec.yaml"),
        };
        assert!(execute(args).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_driver() {
        let dir = TempDir::new().unwrap();
        let args = write_spec(
            &dir,
            r#"
driver: firecracker
tests: []
"#,
        );
        assert!(execute(args).await.is_err());
    }
}
