//! Tag normalization and strategy-bounded version selection.

/// Per-container update policy, read from the `relay.update` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStrategy {
    /// Re-pull the current reference and compare digests.
    #[default]
    Digest,
    /// Accept newer patch releases within the current major.minor.
    Patch,
    /// Accept newer minor releases within the current major.
    Minor,
    /// Accept any newer release.
    Major,
}

impl UpdateStrategy {
    pub fn requires_registry_query(self) -> bool {
        !matches!(self, UpdateStrategy::Digest)
    }

    /// Unset or unrecognized label values fall back to `Digest`.
    pub fn from_label(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return UpdateStrategy::Digest;
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "patch" => UpdateStrategy::Patch,
            "minor" => UpdateStrategy::Minor,
            "major" => UpdateStrategy::Major,
            _ => UpdateStrategy::Digest,
        }
    }
}

/// A numeric version triple. Prerelease and build suffixes survive in the
/// original tag string but never participate in ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Tags that name a channel rather than a version.
const CHANNEL_TAGS: &[&str] = &["latest", "stable", "edge", "dev", "nightly"];

/// Leading prefixes stripped before parsing, longest match first.
const VERSION_PREFIXES: &[&str] = &["version-", "release-", "v"];

fn strip_version_prefix(tag: &str) -> &str {
    for prefix in VERSION_PREFIXES {
        match tag.get(..prefix.len()) {
            Some(head) if tag.len() > prefix.len() && head.eq_ignore_ascii_case(prefix) => {
                return &tag[prefix.len()..];
            }
            _ => {}
        }
    }
    tag
}

/// Parse a tag into a version triple, or `None` when the tag does not name
/// a version. Strict semver is tried first; otherwise the tag is split on
/// `.`, `-` and `+` and as many leading numeric segments as exist are
/// taken, the rest defaulting to zero.
pub fn parse_tag(tag: &str) -> Option<Version> {
    let tag = tag.trim();
    if tag.is_empty() {
        return None;
    }
    if CHANNEL_TAGS.iter().any(|c| tag.eq_ignore_ascii_case(c)) {
        return None;
    }
    let bare = strip_version_prefix(tag);
    if let Ok(v) = semver::Version::parse(bare) {
        return Some(Version {
            major: v.major,
            minor: v.minor,
            patch: v.patch,
        });
    }
    let mut segments = bare.split(['.', '-', '+']);
    let major = segments.next()?.parse().ok()?;
    let minor = segments.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let patch = segments.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Some(Version {
        major,
        minor,
        patch,
    })
}

/// Whether `candidate` is an acceptable upgrade from `current` under the
/// given strategy.
pub fn is_newer(current: Version, candidate: Version, strategy: UpdateStrategy) -> bool {
    if candidate <= current {
        return false;
    }
    match strategy {
        UpdateStrategy::Digest => false,
        UpdateStrategy::Patch => {
            candidate.major == current.major && candidate.minor == current.minor
        }
        UpdateStrategy::Minor => candidate.major == current.major,
        UpdateStrategy::Major => true,
    }
}

/// Pick the newest candidate tag acceptable under the strategy.
///
/// Returns the original tag string of the winner so the caller can
/// reconstruct an image reference with any stripped prefix intact. `None`
/// when the current tag is not a version (version strategies only operate
/// on versioned tags) or no candidate qualifies. Ties keep the first
/// candidate encountered.
pub fn find_newest<'a, I>(current_tag: &str, candidates: I, strategy: UpdateStrategy) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let current = parse_tag(current_tag)?;
    let mut best: Option<(&str, Version)> = None;
    for candidate in candidates {
        let Some(version) = parse_tag(candidate) else {
            continue;
        };
        if !is_newer(current, version, strategy) {
            continue;
        }
        match best {
            Some((_, best_version)) if version <= best_version => {}
            _ => best = Some((candidate, version)),
        }
    }
    best.map(|(tag, _)| tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(major: u64, minor: u64, patch: u64) -> Version {
        Version {
            major,
            minor,
            patch,
        }
    }

    #[test]
    fn test_parse_strict_semver() {
        assert_eq!(parse_tag("1.25.3"), Some(v(1, 25, 3)));
        assert_eq!(parse_tag("1.2.3-beta.1"), Some(v(1, 2, 3)));
        assert_eq!(parse_tag("1.2.3+build5"), Some(v(1, 2, 3)));
    }

    #[test]
    fn test_parse_partial_versions_default_to_zero() {
        assert_eq!(parse_tag("1.25"), Some(v(1, 25, 0)));
        assert_eq!(parse_tag("22"), Some(v(22, 0, 0)));
        assert_eq!(parse_tag("22-alpine"), Some(v(22, 0, 0)));
    }

    #[test]
    fn test_parse_strips_prefixes() {
        assert_eq!(parse_tag("v1.2.3"), Some(v(1, 2, 3)));
        assert_eq!(parse_tag("V1.2.3"), Some(v(1, 2, 3)));
        assert_eq!(parse_tag("version-1.2.3"), Some(v(1, 2, 3)));
        assert_eq!(parse_tag("release-2.0"), Some(v(2, 0, 0)));
    }

    #[test]
    fn test_prefix_strip_prefers_longest_match() {
        // "version-" wins over a bare "v" strip that would leave "ersion-1.0".
        assert_eq!(parse_tag("Version-1.0"), Some(v(1, 0, 0)));
    }

    #[test]
    fn test_parse_rejects_channel_tags() {
        for tag in ["latest", "Stable", "EDGE", "dev", "nightly"] {
            assert_eq!(parse_tag(tag), None, "{tag} must not parse");
        }
    }

    #[test]
    fn test_parse_rejects_non_numeric_and_empty() {
        assert_eq!(parse_tag(""), None);
        assert_eq!(parse_tag("   "), None);
        assert_eq!(parse_tag("alpine"), None);
        assert_eq!(parse_tag("bookworm"), None);
        // "v" alone strips to nothing.
        assert_eq!(parse_tag("v"), None);
    }

    #[test]
    fn test_render_then_parse_round_trips() {
        for triple in [v(0, 0, 0), v(1, 2, 3), v(10, 0, 42)] {
            assert_eq!(parse_tag(&triple.to_string()), Some(triple));
        }
    }

    #[test]
    fn test_normalized_form_parses_to_same_version() {
        let first = parse_tag("v1.25.3").unwrap();
        let second = parse_tag(&first.to_string()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_is_newer_requires_strictly_greater() {
        assert!(!is_newer(v(1, 2, 3), v(1, 2, 3), UpdateStrategy::Major));
        assert!(!is_newer(v(1, 2, 3), v(1, 2, 2), UpdateStrategy::Major));
        assert!(is_newer(v(1, 2, 3), v(1, 2, 4), UpdateStrategy::Major));
    }

    #[test]
    fn test_digest_strategy_accepts_nothing() {
        assert!(!is_newer(v(1, 0, 0), v(9, 9, 9), UpdateStrategy::Digest));
    }

    #[test]
    fn test_strategy_bounds() {
        let current = v(1, 25, 0);
        // Patch: same major.minor only.
        assert!(is_newer(current, v(1, 25, 1), UpdateStrategy::Patch));
        assert!(!is_newer(current, v(1, 26, 0), UpdateStrategy::Patch));
        // Minor: same major only.
        assert!(is_newer(current, v(1, 26, 0), UpdateStrategy::Minor));
        assert!(!is_newer(current, v(2, 0, 0), UpdateStrategy::Minor));
        // Major: anything greater.
        assert!(is_newer(current, v(2, 0, 0), UpdateStrategy::Major));
    }

    #[test]
    fn test_acceptance_sets_nest() {
        let current = v(1, 25, 0);
        let candidates = [v(1, 25, 9), v(1, 30, 0), v(3, 0, 0)];
        for candidate in candidates {
            if is_newer(current, candidate, UpdateStrategy::Patch) {
                assert!(is_newer(current, candidate, UpdateStrategy::Minor));
            }
            if is_newer(current, candidate, UpdateStrategy::Minor) {
                assert!(is_newer(current, candidate, UpdateStrategy::Major));
            }
        }
    }

    #[test]
    fn test_find_newest_picks_greatest_acceptable() {
        let tags = ["1.25.0", "1.25.1", "1.26.0", "2.0.0"];
        assert_eq!(
            find_newest("1.25.0", tags, UpdateStrategy::Minor),
            Some("1.26.0")
        );
        assert_eq!(
            find_newest("1.25.0", tags, UpdateStrategy::Patch),
            Some("1.25.1")
        );
        assert_eq!(
            find_newest("1.25.0", tags, UpdateStrategy::Major),
            Some("2.0.0")
        );
    }

    #[test]
    fn test_find_newest_returns_original_tag_string() {
        let tags = ["v1.26.0", "alpine"];
        assert_eq!(
            find_newest("1.25.0", tags, UpdateStrategy::Minor),
            Some("v1.26.0")
        );
    }

    #[test]
    fn test_find_newest_none_when_current_is_not_a_version() {
        let tags = ["1.0.0", "2.0.0"];
        assert_eq!(find_newest("latest", tags, UpdateStrategy::Major), None);
        assert_eq!(find_newest("alpine", tags, UpdateStrategy::Major), None);
    }

    #[test]
    fn test_find_newest_none_when_nothing_qualifies() {
        let tags = ["1.25.0", "1.26.0"];
        assert_eq!(find_newest("1.25.0", tags, UpdateStrategy::Patch), None);
        assert_eq!(find_newest("9.0.0", tags, UpdateStrategy::Major), None);
    }

    #[test]
    fn test_find_newest_keeps_first_on_tie() {
        let tags = ["v2.0.0", "2.0.0"];
        assert_eq!(
            find_newest("1.0.0", tags, UpdateStrategy::Major),
            Some("v2.0.0")
        );
    }

    #[test]
    fn test_find_newest_result_is_strategy_newer() {
        let current = "1.25.0";
        let tags = ["1.24.0", "1.25.2", "1.26.0", "2.0.0", "bookworm"];
        for strategy in [
            UpdateStrategy::Patch,
            UpdateStrategy::Minor,
            UpdateStrategy::Major,
        ] {
            if let Some(newest) = find_newest(current, tags, strategy) {
                let parsed_current = parse_tag(current).unwrap();
                let parsed_newest = parse_tag(newest).unwrap();
                assert!(is_newer(parsed_current, parsed_newest, strategy));
                // Nothing acceptable is strictly greater than the winner.
                for tag in tags {
                    if let Some(candidate) = parse_tag(tag) {
                        if is_newer(parsed_current, candidate, strategy) {
                            assert!(candidate <= parsed_newest);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_strategy_from_label() {
        assert_eq!(UpdateStrategy::from_label(None), UpdateStrategy::Digest);
        assert_eq!(
            UpdateStrategy::from_label(Some("PATCH")),
            UpdateStrategy::Patch
        );
        assert_eq!(
            UpdateStrategy::from_label(Some("Minor")),
            UpdateStrategy::Minor
        );
        assert_eq!(
            UpdateStrategy::from_label(Some("major")),
            UpdateStrategy::Major
        );
        assert_eq!(
            UpdateStrategy::from_label(Some("weekly")),
            UpdateStrategy::Digest
        );
    }
}
