//! Per-architecture entrypoint layer store.
//!
//! Every test image gets the entrypoint layers for its architecture
//! appended, standardizing process launch, environment normalization,
//! signal handling, and pause-on-error behavior. Layer content is opaque
//! here; presence is required.
//!
//! The store is loaded once per run and read-only afterwards, so it is
//! safe to share across concurrent runs.

use std::collections::HashMap;

use oci_distribution::manifest::OciManifest;
use oci_spec::image::ImageConfiguration;

use imagetest_core::error::{ImagetestError, Result};

use crate::SUPPORTED_ARCHITECTURES;

use super::layer::ContentLayer;
use super::reference::ImageReference;
use super::registry::RegistryClient;

/// Architecture-keyed entrypoint layers.
pub struct EntrypointLayers {
    layers: HashMap<String, Vec<ContentLayer>>,
}

impl EntrypointLayers {
    /// Pull the entrypoint image and cache its layers per architecture.
    ///
    /// An index base contributes one entry per supported-platform child;
    /// a single-image base contributes its config's architecture. Fails
    /// when no supported architecture yields layers.
    pub async fn load(client: &RegistryClient, reference: &ImageReference) -> Result<Self> {
        let (manifest, _digest) = client.pull_manifest(reference).await?;

        let mut layers: HashMap<String, Vec<ContentLayer>> = HashMap::new();

        match manifest {
            OciManifest::ImageIndex(index) => {
                for entry in &index.manifests {
                    let arch = match entry.platform.as_ref() {
                        Some(p) if p.os == "linux" => p.architecture.clone(),
                        _ => continue,
                    };
                    if !SUPPORTED_ARCHITECTURES.contains(&arch.as_str()) {
                        continue;
                    }
                    let child_ref = reference.with_digest(&entry.digest);
                    let pulled = client.pull_image(&child_ref).await?;
                    layers.insert(arch, raw_layers(&pulled.layers)?);
                }
            }
            OciManifest::Image(_) => {
                let pulled = client.pull_image(reference).await?;
                let arch = architecture_of(&pulled.config_data)?;
                if SUPPORTED_ARCHITECTURES.contains(&arch.as_str()) {
                    layers.insert(arch, raw_layers(&pulled.layers)?);
                }
            }
        }

        if layers.is_empty() {
            return Err(ImagetestError::InvalidInput(
                "invalid entrypoint image provided".to_string(),
            ));
        }

        tracing::info!(
            reference = %reference,
            architectures = ?{
                let mut archs: Vec<&str> = layers.keys().map(|s| s.as_str()).collect();
                archs.sort_unstable();
                archs
            },
            "Loaded entrypoint layers"
        );

        Ok(Self { layers })
    }

    /// Build a store from pre-assembled layers (tests, embedders).
    pub fn from_layers(layers: HashMap<String, Vec<ContentLayer>>) -> Result<Self> {
        if layers.is_empty() {
            return Err(ImagetestError::InvalidInput(
                "invalid entrypoint image provided".to_string(),
            ));
        }
        Ok(Self { layers })
    }

    /// Layers for an architecture, if any were loaded for it.
    pub fn layers_for(&self, arch: &str) -> Option<&[ContentLayer]> {
        self.layers.get(arch).map(|v| v.as_slice())
    }

    /// Loaded architectures, sorted.
    pub fn architectures(&self) -> Vec<&str> {
        let mut archs: Vec<&str> = self.layers.keys().map(|s| s.as_str()).collect();
        archs.sort_unstable();
        archs
    }
}

/// Read the architecture field from a config blob.
fn architecture_of(config_data: &[u8]) -> Result<String> {
    let config: ImageConfiguration = serde_json::from_slice(config_data)?;
    Ok(config.architecture().to_string())
}

/// Re-wrap pulled layers, keeping bytes unchanged.
fn raw_layers(
    layers: &[oci_distribution::client::ImageLayer],
) -> Result<Vec<ContentLayer>> {
    layers
        .iter()
        .map(|l| ContentLayer::from_raw(l.data.clone()))
        .collect()
}
