//! OCI subsystem: references, registry access, layers, and the bundler.
//!
//! The bundler assembles per-test images by appending entrypoint and
//! content layers on top of a user-supplied base and rewriting the OCI
//! config, then pushes the result to the run's target repository.

pub mod bundle;
pub mod credentials;
pub mod entrypoint;
pub mod layer;
pub mod reference;
pub mod registry;
pub mod resolved;

pub use bundle::{Bundler, ImageMutator, TestImage};
pub use credentials::{Keychain, RegistryCredentials};
pub use entrypoint::EntrypointLayers;
pub use layer::ContentLayer;
pub use reference::ImageReference;
pub use registry::RegistryClient;
pub use resolved::ResolvedImage;
