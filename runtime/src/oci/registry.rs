//! OCI registry client for pulling base images and pushing test images.
//!
//! Wraps the `oci-distribution` client with keychain-based auth and a
//! bounded exponential-backoff retry on transient failures. Retries are
//! applied only to idempotent operations (pulls, content-addressed
//! pushes); the orchestrator never retries a test.

use std::future::Future;
use std::time::Duration;

use oci_distribution::client::{Client, ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::{OciImageIndex, OciImageManifest, OciManifest};
use oci_distribution::{Reference, RegistryOperation};

use imagetest_core::error::{ImagetestError, Result};

use super::credentials::Keychain;
use super::layer::sha256_bytes;
use super::reference::ImageReference;

/// Attempts per idempotent operation (initial call + retries).
const RETRY_ATTEMPTS: u32 = 3;

/// Base delay before the first retry; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// An image pulled into memory: manifest, config blob, and layer blobs.
pub struct PulledImage {
    pub manifest: OciImageManifest,
    pub manifest_digest: String,
    pub config_data: Vec<u8>,
    pub layers: Vec<ImageLayer>,
}

/// Registry client shared by the bundler and the entrypoint store.
pub struct RegistryClient {
    client: Client,
    keychain: Keychain,
}

impl RegistryClient {
    /// Create a client resolving credentials through the given keychain.
    pub fn new(keychain: Keychain) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            keychain,
        }
    }

    /// Credential resolution for a reference's registry.
    fn auth_for(&self, reference: &ImageReference) -> oci_distribution::secrets::RegistryAuth {
        self.keychain.resolve(&reference.registry).to_oci_auth()
    }

    /// Convert to the distribution client's reference type.
    fn to_oci_reference(reference: &ImageReference) -> Reference {
        if let Some(ref digest) = reference.digest {
            Reference::with_digest(
                reference.registry.clone(),
                reference.repository.clone(),
                digest.clone(),
            )
        } else {
            Reference::with_tag(
                reference.registry.clone(),
                reference.repository.clone(),
                reference
                    .tag
                    .clone()
                    .unwrap_or_else(|| "latest".to_string()),
            )
        }
    }

    /// Pull the raw manifest for a reference. The result distinguishes a
    /// single image from a multi-arch index.
    pub async fn pull_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<(OciManifest, String)> {
        let oci_ref = Self::to_oci_reference(reference);
        let auth = self.auth_for(reference);
        with_retry("pull manifest", || async {
            self.client
                .pull_manifest(&oci_ref, &auth)
                .await
                .map_err(|e| ImagetestError::Registry {
                    registry: reference.registry.clone(),
                    message: format!("failed to pull manifest for {}: {}", reference, e),
                })
        })
        .await
    }

    /// Pull a single image (manifest, config, layers) into memory.
    ///
    /// For an index reference this resolves to the platform the registry
    /// selects; the bundler pulls index children by digest instead.
    pub async fn pull_image(&self, reference: &ImageReference) -> Result<PulledImage> {
        let oci_ref = Self::to_oci_reference(reference);
        let auth = self.auth_for(reference);

        let (manifest, manifest_digest) = with_retry("pull image manifest", || async {
            self.client
                .pull_image_manifest(&oci_ref, &auth)
                .await
                .map_err(|e| ImagetestError::Registry {
                    registry: reference.registry.clone(),
                    message: format!("failed to pull manifest for {}: {}", reference, e),
                })
        })
        .await?;

        let config_data = self
            .pull_blob(reference, &oci_ref, &manifest.config)
            .await?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for descriptor in &manifest.layers {
            tracing::debug!(
                digest = %descriptor.digest,
                size = descriptor.size,
                "Pulling layer"
            );
            let data = self.pull_blob(reference, &oci_ref, descriptor).await?;
            layers.push(ImageLayer::new(data, descriptor.media_type.clone(), None));
        }

        Ok(PulledImage {
            manifest,
            manifest_digest,
            config_data,
            layers,
        })
    }

    /// Pull a single blob into memory.
    async fn pull_blob(
        &self,
        reference: &ImageReference,
        oci_ref: &Reference,
        descriptor: &oci_distribution::manifest::OciDescriptor,
    ) -> Result<Vec<u8>> {
        with_retry("pull blob", || async {
            let mut data: Vec<u8> = Vec::new();
            self.client
                .pull_blob(oci_ref, descriptor, &mut data)
                .await
                .map_err(|e| ImagetestError::Registry {
                    registry: reference.registry.clone(),
                    message: format!("failed to pull blob {}: {}", descriptor.digest, e),
                })?;
            Ok(data)
        })
        .await
    }

    /// Push an assembled image and return its manifest digest.
    ///
    /// The digest is computed from the canonical manifest serialization,
    /// so byte-identical inputs yield byte-identical digests.
    pub async fn push_image(
        &self,
        target: &ImageReference,
        layers: &[ImageLayer],
        config_data: Vec<u8>,
        manifest: OciImageManifest,
    ) -> Result<String> {
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let digest = format!("sha256:{}", sha256_bytes(&manifest_bytes));

        let push_ref = Self::to_oci_reference(&target.with_digest(&digest));
        let auth = self.auth_for(target);

        tracing::info!(
            reference = %target.registry_repository(),
            digest = %digest,
            layers = layers.len(),
            "Pushing test image"
        );

        with_retry("push image", || async {
            let config = Config::new(
                config_data.clone(),
                manifest.config.media_type.clone(),
                None,
            );
            self.client
                .push(
                    &push_ref,
                    layers,
                    config,
                    &auth,
                    Some(manifest.clone()),
                )
                .await
                .map_err(|e| ImagetestError::Registry {
                    registry: target.registry.clone(),
                    message: format!("failed to push image to {}: {}", target, e),
                })?;
            Ok(())
        })
        .await?;

        Ok(digest)
    }

    /// Push an image index and return its digest.
    pub async fn push_index(
        &self,
        target: &ImageReference,
        index: OciImageIndex,
    ) -> Result<String> {
        let index_bytes = serde_json::to_vec(&index)?;
        let digest = format!("sha256:{}", sha256_bytes(&index_bytes));

        let push_ref = Self::to_oci_reference(&target.with_digest(&digest));
        let auth = self.auth_for(target);

        tracing::info!(
            reference = %target.registry_repository(),
            digest = %digest,
            children = index.manifests.len(),
            "Pushing test image index"
        );

        with_retry("push index", || async {
            self.client
                .auth(&push_ref, &auth, RegistryOperation::Push)
                .await
                .map_err(|e| ImagetestError::Registry {
                    registry: target.registry.clone(),
                    message: format!("failed to authenticate push to {}: {}", target, e),
                })?;
            self.client
                .push_manifest(&push_ref, &OciManifest::ImageIndex(index.clone()))
                .await
                .map_err(|e| ImagetestError::Registry {
                    registry: target.registry.clone(),
                    message: format!("failed to push index to {}: {}", target, e),
                })?;
            Ok(())
        })
        .await?;

        Ok(digest)
    }
}

/// Whether an error is worth retrying.
fn is_transient(err: &ImagetestError) -> bool {
    let message = err.to_string();
    ["timeout", "timed out", "connection", "reset", "429", "500", "502", "503", "504"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Run an idempotent operation with bounded exponential backoff.
pub async fn with_retry<T, F, Fut>(operation: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut last_err = None;

    for attempt in 1..=RETRY_ATTEMPTS {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt == RETRY_ATTEMPTS || !is_transient(&err) {
                    return Err(err);
                }
                tracing::warn!(
                    operation,
                    attempt,
                    error = %err,
                    "Transient registry failure, retrying"
                );
                last_err = Some(err);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        ImagetestError::Other(format!("{} failed without an error", operation))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_to_oci_reference_with_digest() {
        let r = ImageReference::parse(
            "cgr.dev/example/app@sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890",
        )
        .unwrap();
        let oci_ref = RegistryClient::to_oci_reference(&r);
        assert!(oci_ref.to_string().contains("@sha256:"));
    }

    #[test]
    fn test_to_oci_reference_with_tag() {
        let r = ImageReference::parse("cgr.dev/example/app:v1").unwrap();
        let oci_ref = RegistryClient::to_oci_reference(&r);
        assert_eq!(oci_ref.to_string(), "cgr.dev/example/app:v1");
    }

    #[test]
    fn test_to_oci_reference_defaults_latest() {
        let r = ImageReference {
            registry: "cgr.dev".to_string(),
            repository: "example/app".to_string(),
            tag: None,
            digest: None,
        };
        let oci_ref = RegistryClient::to_oci_reference(&r);
        assert!(oci_ref.to_string().contains("latest"));
    }

    #[test]
    fn test_is_transient() {
        let transient = ImagetestError::Registry {
            registry: "ghcr.io".to_string(),
            message: "503 Service Unavailable".to_string(),
        };
        assert!(is_transient(&transient));

        let fatal = ImagetestError::Registry {
            registry: "ghcr.io".to_string(),
            message: "401 Unauthorized".to_string(),
        };
        assert!(!is_transient(&fatal));
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = with_retry("op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ImagetestError>(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient() {
        let calls = AtomicU32::new(0);
        let result = with_retry("op", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(ImagetestError::Registry {
                    registry: "ghcr.io".to_string(),
                    message: "connection reset by peer".to_string(),
                })
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry("op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ImagetestError::Registry {
                registry: "ghcr.io".to_string(),
                message: "401 Unauthorized".to_string(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry("op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ImagetestError::Registry {
                registry: "ghcr.io".to_string(),
                message: "503 Service Unavailable".to_string(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_ATTEMPTS);
    }
}
