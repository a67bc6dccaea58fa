//! Resolved image projection surfaced to test containers.
//!
//! The orchestrator resolves the spec's `images` map once per run and
//! serializes it into every test container's environment as the
//! `IMAGES` JSON object. Keys are held in a `BTreeMap` so equal inputs
//! serialize byte-identically.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use imagetest_core::error::Result;

use super::reference::ImageReference;

/// Projection of a digest-pinned reference with the recognized fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedImage {
    /// Registry hostname.
    pub registry: String,
    /// Repository path within the registry.
    pub repo: String,
    /// `registry/repo`, without tag or digest.
    pub registry_repo: String,
    /// The pinning digest.
    pub digest: String,
    /// Tag-shaped alias (`latest@<digest>`) for template systems that
    /// require a tag-plus-digest form.
    pub pseudo_tag: String,
    /// The canonical digest reference.
    #[serde(rename = "ref")]
    pub reference: String,
}

impl ResolvedImage {
    /// Project a digest-carrying reference.
    pub fn from_reference(reference: &ImageReference) -> Result<Self> {
        let digest = reference.require_digest()?.to_string();
        let registry_repo = reference.registry_repository();
        Ok(Self {
            registry: reference.registry.clone(),
            repo: reference.repository.clone(),
            registry_repo: registry_repo.clone(),
            pseudo_tag: format!("latest@{}", digest),
            reference: format!("{}@{}", registry_repo, digest),
            digest,
        })
    }
}

/// Resolve a spec `images` map, rejecting tag-only references.
///
/// The result is ordered by key so serialization is stable.
pub fn resolve_images(
    images: &HashMap<String, String>,
) -> Result<BTreeMap<String, ResolvedImage>> {
    let mut resolved = BTreeMap::new();
    for (name, raw) in images {
        let reference = ImageReference::parse_pinned(raw)?;
        resolved.insert(name.clone(), ResolvedImage::from_reference(&reference)?);
    }
    Ok(resolved)
}

/// Serialize a resolved map to the `IMAGES` JSON value.
pub fn serialize_images(resolved: &BTreeMap<String, ResolvedImage>) -> Result<String> {
    Ok(serde_json::to_string(resolved)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    fn images(pairs: &[(&str, String)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_from_reference_fields() {
        let r = ImageReference::parse(&format!("cgr.dev/example/app@{}", DIGEST)).unwrap();
        let resolved = ResolvedImage::from_reference(&r).unwrap();
        assert_eq!(resolved.registry, "cgr.dev");
        assert_eq!(resolved.repo, "example/app");
        assert_eq!(resolved.registry_repo, "cgr.dev/example/app");
        assert_eq!(resolved.digest, DIGEST);
        assert_eq!(resolved.pseudo_tag, format!("latest@{}", DIGEST));
        assert_eq!(
            resolved.reference,
            format!("cgr.dev/example/app@{}", DIGEST)
        );
    }

    #[test]
    fn test_from_reference_requires_digest() {
        let r = ImageReference::parse("cgr.dev/example/app:v1").unwrap();
        assert!(ResolvedImage::from_reference(&r).is_err());
    }

    #[test]
    fn test_resolve_rejects_tag_only() {
        let input = images(&[("foo", "repo/bar:latest".to_string())]);
        assert!(resolve_images(&input).is_err());
    }

    #[test]
    fn test_resolve_multiple() {
        let input = images(&[
            ("app", format!("cgr.dev/example/app@{}", DIGEST)),
            ("base", format!("cgr.dev/example/base@{}", DIGEST)),
        ]);
        let resolved = resolve_images(&input).unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.contains_key("app"));
        assert!(resolved.contains_key("base"));
    }

    #[test]
    fn test_serialization_is_stable() {
        // HashMap iteration order varies; the serialized form must not.
        let input = images(&[
            ("zeta", format!("cgr.dev/example/zeta@{}", DIGEST)),
            ("alpha", format!("cgr.dev/example/alpha@{}", DIGEST)),
            ("mid", format!("cgr.dev/example/mid@{}", DIGEST)),
        ]);
        let first = serialize_images(&resolve_images(&input).unwrap()).unwrap();
        let second = serialize_images(&resolve_images(&input).unwrap()).unwrap();
        assert_eq!(first, second);

        // Keys appear in sorted order.
        let alpha_pos = first.find("alpha").unwrap();
        let mid_pos = first.find("mid").unwrap();
        let zeta_pos = first.find("zeta").unwrap();
        assert!(alpha_pos < mid_pos && mid_pos < zeta_pos);
    }

    #[test]
    fn test_serialized_shape() {
        let input = images(&[("app", format!("cgr.dev/example/app@{}", DIGEST))]);
        let json = serialize_images(&resolve_images(&input).unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["app"]["registry"], "cgr.dev");
        assert_eq!(value["app"]["repo"], "example/app");
        assert_eq!(value["app"]["digest"], DIGEST);
        // The reference field serializes under the wire name "ref".
        assert!(value["app"]["ref"].as_str().unwrap().contains('@'));
    }
}
