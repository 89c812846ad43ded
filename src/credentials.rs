//! Registry credentials from the operator's engine config file.
//!
//! Reads the `auths` table of `config.json` once at startup and answers
//! host lookups for the registry client and image pulls. A missing or
//! unreadable file yields an empty store; anonymous access is valid.

use base64::Engine;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

const DOCKER_HUB_AUTH_KEYS: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "https://index.docker.io/v1/",
    "https://index.docker.io/v2/",
];

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(serde::Deserialize, Debug, Default, Clone)]
struct AuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
    identitytoken: Option<String>,
    registrytoken: Option<String>,
}

#[derive(serde::Deserialize, Debug, Default)]
struct EngineConfig {
    auths: Option<HashMap<String, AuthEntry>>,
}

/// Credentials for one registry host. Both fields empty means anonymous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub registry_host: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RegistryCredentials {
    pub fn anonymous(registry_host: &str) -> Self {
        Self {
            registry_host: registry_host.to_string(),
            username: None,
            password: None,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
            && self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Resolve the engine config file the way the docker CLI does:
/// `$DOCKER_CONFIG/config.json`, else `$HOME/.docker/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(dir) = env::var("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".docker").join("config.json"))
}

pub struct CredentialStore {
    auths: HashMap<String, AuthEntry>,
}

impl CredentialStore {
    pub fn empty() -> Self {
        Self {
            auths: HashMap::new(),
        }
    }

    /// Load from an explicit path, falling back to the auto-detected one.
    /// Errors degrade to an empty store so the agent still runs against
    /// public registries.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
            log::info!("No engine config file location available, using anonymous registry access");
            return Self::empty();
        };
        match Self::try_load(&path) {
            Ok(store) => {
                log::debug!(
                    "Loaded credentials for {} registries from {}",
                    store.auths.len(),
                    path.display()
                );
                store
            }
            Err(CredentialError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Engine config file {} not found", path.display());
                Self::empty()
            }
            Err(e) => {
                log::warn!("Failed to read engine config {}: {e}", path.display());
                Self::empty()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self, CredentialError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    fn from_json(content: &str) -> Result<Self, CredentialError> {
        let config: EngineConfig = serde_json::from_str(content)?;
        Ok(Self {
            auths: config.auths.unwrap_or_default(),
        })
    }

    /// Look up credentials for a registry host. Always returns a value;
    /// hosts without a matching `auths` entry get anonymous credentials.
    pub fn lookup(&self, registry_host: &str) -> RegistryCredentials {
        match self.find_entry(registry_host) {
            Some(entry) => {
                let (username, password) = resolve_entry(entry);
                RegistryCredentials {
                    registry_host: registry_host.to_string(),
                    username,
                    password,
                }
            }
            None => RegistryCredentials::anonymous(registry_host),
        }
    }

    fn find_entry(&self, registry_host: &str) -> Option<&AuthEntry> {
        // Direct key match first.
        if let Some(entry) = self.auths.get(registry_host) {
            return Some(entry);
        }
        // Stored keys vary between bare hosts and full endpoint URLs.
        for (key, entry) in &self.auths {
            if normalize_registry_key(key) == registry_host {
                return Some(entry);
            }
        }
        // Docker Hub is known under a family of aliases.
        if DOCKER_HUB_AUTH_KEYS.contains(&registry_host) {
            for key in DOCKER_HUB_AUTH_KEYS {
                if let Some(entry) = self.auths.get(*key) {
                    return Some(entry);
                }
            }
        }
        for suffix in ["", "/v1/", "/v2/"] {
            if let Some(entry) = self.auths.get(&format!("https://{registry_host}{suffix}")) {
                return Some(entry);
            }
        }
        None
    }
}

/// Strip scheme and version-path decoration from a stored registry key.
fn normalize_registry_key(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let key = key
        .strip_suffix("/v1/")
        .or_else(|| key.strip_suffix("/v2/"))
        .unwrap_or(key);
    key.strip_suffix('/').unwrap_or(key)
}

/// Turn an `auths` entry into a username/password pair. Token fields take
/// precedence over username/password; the base64 `auth` blob decodes to
/// `user:pass` split on the first colon.
fn resolve_entry(entry: &AuthEntry) -> (Option<String>, Option<String>) {
    if let Some(token) = entry
        .identitytoken
        .clone()
        .or_else(|| entry.registrytoken.clone())
    {
        return (Some("<token>".to_string()), Some(token));
    }
    if let Some(auth) = entry.auth.as_deref() {
        if let Some((user, pass)) = decode_auth(auth) {
            return (Some(user), Some(pass));
        }
        log::warn!("Ignoring malformed auth field in engine config");
    }
    (entry.username.clone(), entry.password.clone())
}

fn decode_auth(auth: &str) -> Option<(String, String)> {
    let decoded = base64::prelude::BASE64_STANDARD.decode(auth).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
