//! Test-image bundler (the Appender).
//!
//! Takes a base reference, applies a pipeline of pure image mutators
//! (append entrypoint layers, append content layers, rewrite config),
//! pushes the result into the target repository, and returns the digest
//! reference. An index base fans out to its amd64/arm64 children; other
//! platforms are dropped from the output index.
//!
//! Nothing here stamps wall-clock timestamps: byte-identical inputs
//! produce byte-identical manifests and digests.

use std::sync::Arc;

use oci_distribution::client::ImageLayer;
use oci_distribution::manifest::{
    ImageIndexEntry, OciImageIndex, OciImageManifest, OciManifest,
};

use imagetest_core::error::{ImagetestError, Result};

use crate::{DEFAULT_ENTRYPOINT, DEFAULT_WORKDIR, SUPPORTED_ARCHITECTURES};

use super::entrypoint::EntrypointLayers;
use super::layer::{sha256_bytes, ContentLayer};
use super::reference::ImageReference;
use super::registry::RegistryClient;

/// OCI media types used for assembled artifacts.
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// An in-memory view of a single-architecture image under mutation.
///
/// Mutators take a view and return a new one; nothing mutates in place.
#[derive(Clone)]
pub struct TestImage {
    /// The full OCI config document.
    pub config: serde_json::Value,
    /// Layers in order, base first.
    pub layers: Vec<ImageLayer>,
}

impl TestImage {
    /// The config's architecture field.
    pub fn architecture(&self) -> Option<&str> {
        self.config["architecture"].as_str()
    }

    /// A copy with a content layer appended (layer bytes and the
    /// config's rootfs diff_ids both grow by one).
    pub fn with_layer(&self, layer: &ContentLayer) -> Self {
        let mut next = self.clone();
        next.layers.push(layer.to_image_layer());
        if let Some(diff_ids) = next.config["rootfs"]["diff_ids"].as_array_mut() {
            diff_ids.push(serde_json::Value::String(layer.diff_id.clone()));
        }
        next
    }
}

/// A pure image transformation.
pub type ImageMutator = Box<dyn Fn(TestImage) -> Result<TestImage> + Send + Sync>;

/// Mutator appending the per-architecture entrypoint layers.
///
/// Returns the image unchanged when no layers exist for its arch.
pub fn entrypoint_mutator(store: Arc<EntrypointLayers>) -> ImageMutator {
    Box::new(move |image: TestImage| {
        let arch = match image.architecture() {
            Some(arch) => arch.to_string(),
            None => return Ok(image),
        };
        match store.layers_for(&arch) {
            Some(layers) => {
                let mut next = image;
                for layer in layers {
                    next = next.with_layer(layer);
                }
                Ok(next)
            }
            None => Ok(image),
        }
    })
}

/// Mutator appending user content layers, in declaration order.
pub fn content_mutator(layers: Vec<ContentLayer>) -> ImageMutator {
    Box::new(move |image: TestImage| {
        let mut next = image;
        for layer in &layers {
            next = next.with_layer(layer);
        }
        Ok(next)
    })
}

/// Mutator rewriting the container config:
///
/// - appends `env` pairs after the base env (no dedupe; last wins at
///   runtime, so user values override base values);
/// - sets the canonical entrypoint;
/// - sets `Cmd` to the test command;
/// - defaults the working directory when the base leaves it empty;
/// - forces `User = "0:0"`.
pub fn config_mutator(env: Vec<(String, String)>, cmd: String) -> ImageMutator {
    Box::new(move |image: TestImage| {
        let mut next = image;
        let config = next.config["config"]
            .as_object_mut()
            .ok_or_else(|| {
                ImagetestError::Serialization(
                    "base image config carries no config object".to_string(),
                )
            })?;

        let mut env_list: Vec<serde_json::Value> = config
            .get("Env")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for (key, value) in &env {
            env_list.push(serde_json::Value::String(format!("{}={}", key, value)));
        }
        config.insert("Env".to_string(), serde_json::Value::Array(env_list));

        config.insert(
            "Entrypoint".to_string(),
            serde_json::json!(DEFAULT_ENTRYPOINT),
        );
        config.insert("Cmd".to_string(), serde_json::json!([cmd.clone()]));

        let workdir_empty = config
            .get("WorkingDir")
            .and_then(|v| v.as_str())
            .map_or(true, |w| w.is_empty());
        if workdir_empty {
            config.insert(
                "WorkingDir".to_string(),
                serde_json::Value::String(DEFAULT_WORKDIR.to_string()),
            );
        }

        config.insert(
            "User".to_string(),
            serde_json::Value::String("0:0".to_string()),
        );

        Ok(next)
    })
}

/// The Appender.
pub struct Bundler<'a> {
    client: &'a RegistryClient,
}

impl<'a> Bundler<'a> {
    /// Create a bundler over the given registry client.
    pub fn new(client: &'a RegistryClient) -> Self {
        Self { client }
    }

    /// Apply mutators to `base`, push into `target_repo`, and return the
    /// resulting digest reference.
    pub async fn mutate(
        &self,
        base: &ImageReference,
        target_repo: &str,
        mutators: &[ImageMutator],
    ) -> Result<ImageReference> {
        let target = base.with_repository(target_repo)?;
        let (manifest, _digest) = self.client.pull_manifest(base).await?;

        match manifest {
            OciManifest::Image(_) => {
                let digest = self
                    .mutate_single(base, &target, mutators)
                    .await?;
                Ok(target.with_digest(&digest))
            }
            OciManifest::ImageIndex(index) => {
                let digest = self
                    .mutate_index(base, &target, &index, mutators)
                    .await?;
                Ok(target.with_digest(&digest))
            }
        }
    }

    /// Mutate and push a single image; returns the manifest digest.
    async fn mutate_single(
        &self,
        base: &ImageReference,
        target: &ImageReference,
        mutators: &[ImageMutator],
    ) -> Result<String> {
        let pulled = self.client.pull_image(base).await?;
        let image = TestImage {
            config: serde_json::from_slice(&pulled.config_data)?,
            layers: pulled.layers,
        };

        let mutated = apply_mutators(image, mutators).map_err(|e| {
            ImagetestError::ImageAssembly {
                reference: base.to_string(),
                message: e.to_string(),
            }
        })?;

        let (config_data, manifest) = assemble(&mutated)?;
        self.client
            .push_image(target, &mutated.layers, config_data, manifest)
            .await
    }

    /// Mutate each supported index child, reassemble the index, push it.
    async fn mutate_index(
        &self,
        base: &ImageReference,
        target: &ImageReference,
        index: &OciImageIndex,
        mutators: &[ImageMutator],
    ) -> Result<String> {
        let selected = supported_index_entries(index);
        if selected.is_empty() {
            return Err(ImagetestError::ImageAssembly {
                reference: base.to_string(),
                message: format!(
                    "index has no linux child for architectures {:?}",
                    SUPPORTED_ARCHITECTURES
                ),
            });
        }

        let mut children = Vec::with_capacity(selected.len());
        for entry in selected {
            let child_base = base.with_digest(&entry.digest);
            let pulled = self.client.pull_image(&child_base).await?;
            let image = TestImage {
                config: serde_json::from_slice(&pulled.config_data)?,
                layers: pulled.layers,
            };

            let mutated = apply_mutators(image, mutators).map_err(|e| {
                ImagetestError::ImageAssembly {
                    reference: child_base.to_string(),
                    message: e.to_string(),
                }
            })?;

            let (config_data, manifest) = assemble(&mutated)?;
            let manifest_bytes = serde_json::to_vec(&manifest)?;
            let child_digest = self
                .client
                .push_image(target, &mutated.layers, config_data, manifest)
                .await?;

            children.push(serde_json::json!({
                "mediaType": MANIFEST_MEDIA_TYPE,
                "digest": child_digest,
                "size": manifest_bytes.len(),
                "platform": entry.platform,
            }));
        }

        let new_index: OciImageIndex = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "mediaType": INDEX_MEDIA_TYPE,
            "manifests": children,
        }))?;
        self.client.push_index(target, new_index).await
    }
}

/// Apply a mutator pipeline in order.
fn apply_mutators(image: TestImage, mutators: &[ImageMutator]) -> Result<TestImage> {
    let mut current = image;
    for mutator in mutators {
        current = mutator(current)?;
    }
    Ok(current)
}

/// Index children eligible for mutation: linux, amd64 or arm64.
pub fn supported_index_entries(index: &OciImageIndex) -> Vec<&ImageIndexEntry> {
    index
        .manifests
        .iter()
        .filter(|entry| {
            entry.platform.as_ref().map_or(false, |p| {
                p.os == "linux" && SUPPORTED_ARCHITECTURES.contains(&p.architecture.as_str())
            })
        })
        .collect()
}

/// Serialize the config and build the manifest for an assembled image.
fn assemble(image: &TestImage) -> Result<(Vec<u8>, OciImageManifest)> {
    let config_data = serde_json::to_vec(&image.config)?;

    let layers: Vec<serde_json::Value> = image
        .layers
        .iter()
        .map(|layer| {
            serde_json::json!({
                "mediaType": layer.media_type,
                "digest": format!("sha256:{}", sha256_bytes(&layer.data)),
                "size": layer.data.len(),
            })
        })
        .collect();

    let manifest: OciImageManifest = serde_json::from_value(serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": CONFIG_MEDIA_TYPE,
            "digest": format!("sha256:{}", sha256_bytes(&config_data)),
            "size": config_data.len(),
        },
        "layers": layers,
    }))?;

    Ok((config_data, manifest))
}
