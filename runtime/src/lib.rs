//! Imagetest Runtime - Test orchestration engine.
//!
//! This crate provides the engine behind the declarative test specs:
//! OCI reference handling, the registry client, the test-image bundler,
//! the execution drivers, and the run orchestrator.

pub mod drivers;
pub mod oci;
pub mod orchestrator;

// Re-export common types
pub use oci::{ContentLayer, EntrypointLayers, ImageMutator, ImageReference, ResolvedImage};
pub use oci::{Bundler, Keychain, RegistryClient, RegistryCredentials, TestImage};
pub use drivers::{create_driver, Driver};
pub use orchestrator::{Orchestrator, RunContext};

/// Imagetest runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Architectures test images are assembled for.
pub const SUPPORTED_ARCHITECTURES: [&str; 2] = ["amd64", "arm64"];

/// The canonical entrypoint binary installed by the entrypoint layers.
pub const DEFAULT_ENTRYPOINT: [&str; 1] = ["/imagetest/entrypoint"];

/// Working directory test containers default to.
pub const DEFAULT_WORKDIR: &str = "/imagetest";
