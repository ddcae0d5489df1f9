//! Locates rendered cache artifacts across application versions.

use std::path::{Path, PathBuf};

use tracing::debug;
use wildmatch::WildMatchPattern;

/// `*` is the only wildcard; NUL never occurs in a request URI.
type UriPattern = WildMatchPattern<'*', '\0'>;

/// URI patterns that must never be answered from an older version.
///
/// A pattern matches when it equals the URI, or when it contains `*` and
/// matches the whole URI with `*` standing for any run of characters.
#[derive(Debug, Clone, Default)]
pub struct ExcludePatterns {
    patterns: Vec<(String, UriPattern)>,
}

impl ExcludePatterns {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = patterns
            .into_iter()
            .map(Into::into)
            .filter(|pattern: &String| !pattern.is_empty())
            .map(|pattern| {
                let matcher = UriPattern::new(&pattern);
                (pattern, matcher)
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, uri: &str) -> bool {
        self.patterns.iter().any(|(raw, matcher)| {
            if raw.contains('*') {
                matcher.matches(uri)
            } else {
                raw == uri
            }
        })
    }
}

/// Where a lookup found its artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub path: PathBuf,
    pub version: String,
    /// True when the artifact came from a historical version.
    pub fallback: bool,
}

/// Version-aware artifact lookup over `<base>/<version>/<file>`.
#[derive(Debug, Clone)]
pub struct VersionResolver {
    base: PathBuf,
    current: String,
    historical: Vec<String>,
    exclude: ExcludePatterns,
}

impl VersionResolver {
    pub fn new(
        base: impl Into<PathBuf>,
        current: impl Into<String>,
        historical: Vec<String>,
        exclude: ExcludePatterns,
    ) -> Self {
        Self {
            base: base.into(),
            current: current.into(),
            historical,
            exclude,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn current_version(&self) -> &str {
        &self.current
    }

    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.base.join(version)
    }

    pub fn current_dir(&self) -> PathBuf {
        self.version_dir(&self.current)
    }

    /// Find `file_name`, trying the current version first.
    ///
    /// An excluded `uri` stops the search after the current version misses,
    /// so excluded routes never fall back to historical content.
    pub fn resolve(&self, file_name: &str, uri: Option<&str>) -> Option<Resolved> {
        let current = self.current_dir().join(file_name);
        if current.is_file() {
            return Some(Resolved {
                path: current,
                version: self.current.clone(),
                fallback: false,
            });
        }

        if let Some(uri) = uri
            && self.exclude.matches(uri)
        {
            debug!(
                op = "version::resolve",
                result = "excluded",
                uri,
                file_name,
                "Excluded URI skips historical versions"
            );
            return None;
        }

        self.historical
            .iter()
            .filter(|version| **version != self.current)
            .find_map(|version| {
                let candidate = self.version_dir(version).join(file_name);
                candidate.is_file().then(|| Resolved {
                    path: candidate,
                    version: version.clone(),
                    fallback: true,
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn place(base: &Path, version: &str, file: &str) {
        let dir = base.join(version);
        fs::create_dir_all(&dir).expect("version dir");
        fs::write(dir.join(file), b"x").expect("artifact");
    }

    fn resolver(base: &Path, exclude: &[&str]) -> VersionResolver {
        VersionResolver::new(
            base,
            "2.0",
            vec!["1.9".to_string(), "1.8".to_string()],
            ExcludePatterns::new(exclude.iter().copied()),
        )
    }

    #[test]
    fn current_version_wins() {
        let dir = TempDir::new().expect("temp dir");
        place(dir.path(), "2.0", "home.entry");
        place(dir.path(), "1.9", "home.entry");

        let found = resolver(dir.path(), &[])
            .resolve("home.entry", Some("/"))
            .expect("found");
        assert_eq!(found.version, "2.0");
        assert!(!found.fallback);
    }

    #[test]
    fn falls_back_in_supplied_order() {
        let dir = TempDir::new().expect("temp dir");
        place(dir.path(), "1.8", "home.entry");

        let found = resolver(dir.path(), &[])
            .resolve("home.entry", Some("/"))
            .expect("found");
        assert_eq!(found.version, "1.8");
        assert!(found.fallback);

        place(dir.path(), "1.9", "home.entry");
        let found = resolver(dir.path(), &[])
            .resolve("home.entry", None)
            .expect("found");
        assert_eq!(found.version, "1.9");
    }

    #[test]
    fn excluded_uri_never_falls_back() {
        let dir = TempDir::new().expect("temp dir");
        place(dir.path(), "1.8", "home.entry");

        assert!(
            resolver(dir.path(), &["/"])
                .resolve("home.entry", Some("/"))
                .is_none()
        );

        place(dir.path(), "2.0", "home.entry");
        assert!(
            resolver(dir.path(), &["/"])
                .resolve("home.entry", Some("/"))
                .is_some(),
            "exclusions only apply once the current version misses"
        );
    }

    #[test]
    fn wildcard_patterns_anchor_to_the_whole_uri() {
        let patterns = ExcludePatterns::new(["/account/*", "/"]);
        assert!(patterns.matches("/account/settings"));
        assert!(patterns.matches("/"));
        assert!(!patterns.matches("/blog/account/settings"));
        assert!(!patterns.matches("/about"));
    }

    #[test]
    fn question_mark_is_literal() {
        let patterns = ExcludePatterns::new(["/search?q=*"]);
        assert!(patterns.matches("/search?q=rust"));
        assert!(!patterns.matches("/searchXq=1"));
    }

    #[test]
    fn missing_everywhere_is_none() {
        let dir = TempDir::new().expect("temp dir");
        assert!(
            resolver(dir.path(), &[])
                .resolve("home.entry", None)
                .is_none()
        );
    }
}
