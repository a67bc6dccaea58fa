//! Content layer creation.
//!
//! Packages a host directory tree into a tar.gz OCI layer, with every
//! entry placed under the mount's target path prefix.

use std::io::Read;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use oci_distribution::client::ImageLayer;
use sha2::{Digest, Sha256};

use imagetest_core::error::{ImagetestError, Result};
use imagetest_core::spec::ContentMount;

/// Layer media type for gzipped tar content.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// An assembled content layer, ready to append to a test image.
#[derive(Debug, Clone)]
pub struct ContentLayer {
    /// Compressed layer bytes (tar.gz).
    pub data: Vec<u8>,
    /// SHA256 of the compressed bytes, with "sha256:" prefix.
    pub digest: String,
    /// SHA256 of the uncompressed tar (the config diff_id).
    pub diff_id: String,
}

impl ContentLayer {
    /// Build a layer from a directory tree, prefixing entries with the
    /// mount's target path.
    pub fn from_mount(mount: &ContentMount) -> Result<Self> {
        if !mount.source.exists() {
            return Err(ImagetestError::InvalidInput(format!(
                "content source '{}' does not exist",
                mount.source.display()
            )));
        }

        let prefix = mount.target.trim_start_matches('/');
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        {
            let mut builder = tar::Builder::new(&mut encoder);
            add_dir_to_tar(&mut builder, &mount.source, &mount.source, Path::new(prefix))?;
            builder.finish().map_err(|e| {
                ImagetestError::ImageAssembly {
                    reference: mount.source.display().to_string(),
                    message: format!("failed to finalize content layer: {}", e),
                }
            })?;
        }
        let data = encoder.finish().map_err(|e| ImagetestError::ImageAssembly {
            reference: mount.source.display().to_string(),
            message: format!("failed to compress content layer: {}", e),
        })?;

        let digest = format!("sha256:{}", sha256_bytes(&data));
        let diff_id = format!("sha256:{}", diff_id_of(&data)?);

        Ok(Self {
            data,
            digest,
            diff_id,
        })
    }

    /// Wrap raw layer bytes pulled from a registry.
    ///
    /// The bytes are kept as-is; the digest is recomputed so cached
    /// entrypoint layers stay byte-stable.
    pub fn from_raw(data: Vec<u8>) -> Result<Self> {
        let digest = format!("sha256:{}", sha256_bytes(&data));
        let diff_id = format!("sha256:{}", diff_id_of(&data)?);
        Ok(Self {
            data,
            digest,
            diff_id,
        })
    }

    /// Layer size in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Convert to the distribution client's layer type.
    pub fn to_image_layer(&self) -> ImageLayer {
        ImageLayer::new(self.data.clone(), LAYER_MEDIA_TYPE.to_string(), None)
    }
}

/// Recursively add a directory's contents to a tar builder.
fn add_dir_to_tar<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    current: &Path,
    target_prefix: &Path,
) -> Result<()> {
    let entries = std::fs::read_dir(current).map_err(|e| ImagetestError::ImageAssembly {
        reference: root.display().to_string(),
        message: format!("failed to read directory {}: {}", current.display(), e),
    })?;

    // Sorted so identical trees produce identical layer bytes.
    let mut entries: Vec<_> = entries
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ImagetestError::ImageAssembly {
            reference: root.display().to_string(),
            message: format!("failed to read directory entry: {}", e),
        })?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| ImagetestError::ImageAssembly {
                reference: root.display().to_string(),
                message: format!("failed to strip prefix: {}", e),
            })?;
        let tar_path = target_prefix.join(relative);

        if path.is_dir() {
            builder
                .append_dir(&tar_path, &path)
                .map_err(|e| ImagetestError::ImageAssembly {
                    reference: root.display().to_string(),
                    message: format!("failed to add directory to layer: {}", e),
                })?;
            add_dir_to_tar(builder, root, &path, target_prefix)?;
        } else {
            builder
                .append_path_with_name(&path, &tar_path)
                .map_err(|e| ImagetestError::ImageAssembly {
                    reference: root.display().to_string(),
                    message: format!("failed to add file to layer: {}", e),
                })?;
        }
    }

    Ok(())
}

/// Compute the diff_id (SHA256 of the uncompressed tar stream).
fn diff_id_of(compressed: &[u8]) -> Result<String> {
    let decoder = flate2::read::GzDecoder::new(compressed);
    let mut uncompressed = Vec::new();
    std::io::BufReader::new(decoder)
        .read_to_end(&mut uncompressed)
        .map_err(|e| {
            ImagetestError::Serialization(format!(
                "failed to decompress layer for diff_id: {}",
                e
            ))
        })?;
    Ok(sha256_bytes(&uncompressed))
}

/// Compute SHA256 digest of raw bytes as a hex string.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
