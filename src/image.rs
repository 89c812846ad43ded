//! Image reference parsing.
//!
//! A reference is `[host[:port]/]path[:tag]`. The tag split happens on the
//! last `:` only when it comes after the last `/`, so a registry port is
//! never mistaken for a tag.

pub const DEFAULT_TAG: &str = "latest";
pub const DOCKER_HUB: &str = "docker.io";

/// A parsed image reference: repository plus tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Self {
        let slash = reference.rfind('/');
        let colon = reference.rfind(':');
        let (repository, tag) = match (colon, slash) {
            (Some(c), Some(s)) if c > s => (&reference[..c], &reference[c + 1..]),
            (Some(c), None) => (&reference[..c], &reference[c + 1..]),
            _ => (reference, ""),
        };
        let tag = if tag.is_empty() { DEFAULT_TAG } else { tag };
        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Map a repository (without tag) to the registry host serving it and the
/// repository path on that registry.
///
/// Bare names live under `library/` on Docker Hub. A single path segment in
/// front of the name is only a host when it looks like one (contains a dot
/// or a port colon); otherwise it is a Docker Hub user namespace.
pub fn registry_parts(repository: &str) -> (String, String) {
    match repository.matches('/').count() {
        0 => (DOCKER_HUB.to_string(), format!("library/{repository}")),
        1 => {
            let (head, rest) = repository.split_once('/').expect("one slash");
            if head.contains('.') || head.contains(':') {
                (head.to_string(), rest.to_string())
            } else {
                (DOCKER_HUB.to_string(), repository.to_string())
            }
        }
        _ => {
            let (head, rest) = repository.split_once('/').expect("at least two slashes");
            (head.to_string(), rest.to_string())
        }
    }
}
