//! OCI image reference parsing.
//!
//! Parses image references like `cgr.dev/example/app@sha256:abc...` into
//! structured components. Test inputs must be pinned by digest; the
//! bundler mints digest-carrying output references in the target
//! repository.

use imagetest_core::error::{ImagetestError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "cgr.dev", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "example/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `cgr.dev/example/app:tag` → cgr.dev/example/app:tag
    /// - `cgr.dev/example/app@sha256:abc...` → digest-pinned reference
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ImagetestError::InvalidInput(
                "empty image reference".to_string(),
            ));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = if let Some(at_pos) = reference.rfind('@') {
            let digest_part = &reference[at_pos + 1..];
            if !digest_part.contains(':') {
                return Err(ImagetestError::InvalidInput(format!(
                    "invalid digest in reference '{}': expected algorithm:hex",
                    reference
                )));
            }
            (&reference[..at_pos], Some(digest_part.to_string()))
        } else {
            (reference, None)
        };

        // Split tag (: separator, but only after the last /)
        let (name, tag) = if let Some(slash_pos) = name_tag.rfind('/') {
            let after_slash = &name_tag[slash_pos + 1..];
            if let Some(colon_pos) = after_slash.rfind(':') {
                let tag = &after_slash[colon_pos + 1..];
                let name = &name_tag[..slash_pos + 1 + colon_pos];
                (name.to_string(), Some(tag.to_string()))
            } else {
                (name_tag.to_string(), None)
            }
        } else if let Some(colon_pos) = name_tag.rfind(':') {
            // Could be registry:port or name:tag — a purely numeric
            // remainder is a port
            let after_colon = &name_tag[colon_pos + 1..];
            if after_colon.chars().all(|c| c.is_ascii_digit()) {
                (name_tag.to_string(), None)
            } else {
                (
                    name_tag[..colon_pos].to_string(),
                    Some(after_colon.to_string()),
                )
            }
        } else {
            (name_tag.to_string(), None)
        };

        let (registry, repository) = Self::split_registry_repository(&name)?;

        // Apply default tag only for fully unpinned references
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // The first component is a registry hostname when it contains a
        // dot or colon, or is "localhost"
        if let Some(slash_pos) = name.find('/') {
            let first = &name[..slash_pos];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                let registry = first.to_string();
                let repo = name[slash_pos + 1..].to_string();
                if repo.is_empty() {
                    return Err(ImagetestError::InvalidInput(format!(
                        "empty repository in reference '{}'",
                        name
                    )));
                }
                return Ok((registry, repo));
            }
        }

        // No registry detected — use the default
        let repository = if name.contains('/') {
            name.to_string()
        } else {
            // Single name like "nginx" → "library/nginx" for Docker Hub
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Parse a reference and require that it carries a digest.
    ///
    /// Test-input references must be pinned; tag-only references are
    /// rejected with a typed error.
    pub fn parse_pinned(reference: &str) -> Result<Self> {
        let parsed = Self::parse(reference)?;
        parsed.require_digest()?;
        Ok(parsed)
    }

    /// Return a typed error unless this reference carries a digest.
    pub fn require_digest(&self) -> Result<&str> {
        self.digest.as_deref().ok_or_else(|| {
            ImagetestError::InvalidInput(format!(
                "reference '{}' must carry a digest; tag-only references are not allowed",
                self
            ))
        })
    }

    /// The registry-qualified repository, without tag or digest.
    pub fn registry_repository(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// A copy of this reference re-homed into another repository string
    /// of the form `registry/repo[/sub...]`. Tag and digest are cleared.
    pub fn with_repository(&self, target: &str) -> Result<Self> {
        let (registry, repository) = match target.split_once('/') {
            Some((reg, repo))
                if reg.contains('.') || reg.contains(':') || reg == "localhost" =>
            {
                (reg.to_string(), repo.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), target.to_string()),
        };
        if repository.is_empty() {
            return Err(ImagetestError::InvalidInput(format!(
                "empty target repository '{}'",
                target
            )));
        }
        Ok(Self {
            registry,
            repository,
            tag: None,
            digest: None,
        })
    }

    /// A copy of this reference pinned to the given digest.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: self.tag.clone(),
            digest: Some(digest.to_string()),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
