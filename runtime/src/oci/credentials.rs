//! Registry credential resolution.
//!
//! Resolution order: static credentials from the driver config, then the
//! local docker keychain (`$DOCKER_CONFIG/config.json`, falling back to
//! `~/.docker/config.json`), then the `REGISTRY_USERNAME` /
//! `REGISTRY_PASSWORD` environment pair, then anonymous.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use serde::Deserialize;

use imagetest_core::error::Result;
use imagetest_core::spec::RegistryAuthConfig;

/// Resolved credentials for a single registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryCredentials {
    /// Anonymous access (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// True when no credentials are present.
    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() || self.password.is_none()
    }

    /// Username/password pair, when both are present.
    pub fn basic_pair(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    /// Convert to the distribution client's auth type.
    pub fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// On-disk docker config entry. Either an `auth` blob or a plain pair.
#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// On-disk docker config file (`auths` section only).
#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

/// The ambient credential resolver.
pub struct Keychain {
    statics: HashMap<String, RegistryCredentials>,
    config_path: Option<PathBuf>,
}

impl Keychain {
    /// Keychain with no static credentials, reading the default docker
    /// config location.
    pub fn new() -> Self {
        Self {
            statics: HashMap::new(),
            config_path: default_config_path(),
        }
    }

    /// Keychain seeded with static per-registry credentials from a
    /// driver config's `registries` map.
    pub fn with_statics(registries: &HashMap<String, RegistryAuthConfig>) -> Self {
        let mut keychain = Self::new();
        for (registry, auth) in registries {
            if let Some(credentials) = credentials_from_config(auth) {
                keychain
                    .statics
                    .insert(normalize_registry(registry), credentials);
            }
        }
        keychain
    }

    /// Override the docker config path (used by tests).
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Add a static credential entry.
    pub fn insert_static(&mut self, registry: &str, credentials: RegistryCredentials) {
        self.statics
            .insert(normalize_registry(registry), credentials);
    }

    /// Resolve credentials for a registry.
    pub fn resolve(&self, registry: &str) -> RegistryCredentials {
        let normalized = normalize_registry(registry);

        if let Some(credentials) = self.statics.get(&normalized) {
            return credentials.clone();
        }

        if let Some(credentials) = self.resolve_from_docker_config(&normalized) {
            return credentials;
        }

        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();
        if let (Some(u), Some(p)) = (username, password) {
            return RegistryCredentials::basic(u, p);
        }

        RegistryCredentials::anonymous()
    }

    /// Look up the registry in the docker config file, if one exists.
    fn resolve_from_docker_config(&self, registry: &str) -> Option<RegistryCredentials> {
        let path = self.config_path.as_ref()?;
        if !path.exists() {
            return None;
        }
        let data = std::fs::read_to_string(path).ok()?;
        let config: DockerConfigFile = serde_json::from_str(&data).ok()?;

        let entry = config
            .auths
            .iter()
            .find(|(k, _)| normalize_registry(k) == registry)
            .map(|(_, v)| v)?;

        if let (Some(u), Some(p)) = (&entry.username, &entry.password) {
            return Some(RegistryCredentials::basic(u, p));
        }

        let blob = entry.auth.as_deref()?;
        decode_auth_blob(blob)
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}

/// Build credentials from a spec auth block, if it carries any.
fn credentials_from_config(auth: &RegistryAuthConfig) -> Option<RegistryCredentials> {
    if let (Some(u), Some(p)) = (&auth.username, &auth.password) {
        return Some(RegistryCredentials::basic(u, p));
    }
    if let Some(blob) = &auth.auth {
        return decode_auth_blob(blob);
    }
    None
}

/// Decode a docker-config `auth` blob (base64 of `user:pass`).
fn decode_auth_blob(blob: &str) -> Option<RegistryCredentials> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(blob.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(RegistryCredentials::basic(username, password))
}

/// Default docker config file, honoring `DOCKER_CONFIG`.
fn default_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir).join("config.json"));
        }
    }
    dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
}

/// Normalize registry names (Docker Hub aliases collapse to one entry).
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}

/// Resolve credentials, honoring static driver config first.
///
/// Convenience wrapper used by drivers holding a full `registries` map.
pub fn resolve_for(
    registries: &HashMap<String, imagetest_core::spec::RegistryConfig>,
    registry: &str,
) -> Result<RegistryCredentials> {
    let statics: HashMap<String, RegistryAuthConfig> = registries
        .iter()
        .filter_map(|(k, v)| v.auth.clone().map(|a| (k.clone(), a)))
        .collect();
    Ok(Keychain::with_statics(&statics).resolve(registry))
}
