//! Selective sync: which paths this client materializes locally
//!
//! Rules are matched by path prefix, component-wise and ASCII
//! case-insensitively. The longest matching prefix wins; on a tie an
//! exclusion beats an inclusion, then the higher priority wins. An implicit
//! root rule includes everything no other rule covers.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SyncError};

/// One selective-sync rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRule {
    /// Scope-relative prefix; empty means the scope root
    #[serde(rename = "prefix")]
    pub path_prefix: String,
    #[serde(default = "default_included")]
    pub included: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_included() -> bool {
    true
}

impl ScopeRule {
    #[must_use]
    pub fn include(prefix: &str) -> Self {
        Self {
            path_prefix: normalize_path(prefix),
            included: true,
            priority: 0,
        }
    }

    #[must_use]
    pub fn exclude(prefix: &str) -> Self {
        Self {
            path_prefix: normalize_path(prefix),
            included: false,
            priority: 0,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn root() -> Self {
        Self {
            path_prefix: String::new(),
            included: true,
            priority: i32::MIN,
        }
    }

    /// Number of path components matched, or `None` if the rule doesn't apply
    fn match_len(&self, path: &str) -> Option<usize> {
        let mut prefix = components(&self.path_prefix);
        let mut target = components(path);
        let mut matched = 0;
        loop {
            match (prefix.next(), target.next()) {
                (None, _) => return Some(matched),
                (Some(_), None) => return None,
                (Some(p), Some(t)) if p.eq_ignore_ascii_case(t) => matched += 1,
                _ => return None,
            }
        }
    }

    /// Preference between two rules matching the same number of components
    fn tie_break(&self, other: &Self) -> Ordering {
        // false sorts first, so an exclusion compares greater
        other
            .included
            .cmp(&self.included)
            .then(self.priority.cmp(&other.priority))
    }
}

impl fmt::Display for ScopeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.included { "include" } else { "exclude" };
        let prefix = if self.path_prefix.is_empty() {
            "/"
        } else {
            &self.path_prefix
        };
        write!(f, "{verb} {prefix} (priority {})", self.priority)
    }
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}

/// Canonical scope-relative form: `/`-separated, no leading `./` or `/`,
/// no empty components. Case is preserved.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    components(&unified).collect::<Vec<_>>().join("/")
}

/// Check that `path` names a file strictly below the scope root and return
/// its canonical form.
///
/// Absolute paths, drive prefixes, `..` components and NUL bytes are
/// rejected rather than normalized away, since they usually come from a
/// remote that cannot be trusted to stay inside the root.
pub fn checked_path(path: &str) -> Result<String> {
    let invalid = |reason: &str| SyncError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    let unified = path.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(invalid("absolute path"));
    }
    let bytes = unified.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(invalid("drive prefix"));
    }
    if unified.contains('\0') {
        return Err(invalid("NUL byte"));
    }
    if unified.split('/').any(|c| c == "..") {
        return Err(invalid("parent directory component"));
    }
    let normalized = normalize_path(&unified);
    if normalized.is_empty() {
        return Err(invalid("empty path"));
    }
    Ok(normalized)
}

/// Immutable rule set; sessions hold an `Arc` snapshot of one
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    rules: Vec<ScopeRule>,
}

impl Default for ScopeFilter {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ScopeFilter {
    #[must_use]
    pub fn new(rules: Vec<ScopeRule>) -> Self {
        let mut all = Vec::with_capacity(rules.len() + 1);
        all.push(ScopeRule::root());
        all.extend(rules.into_iter().map(|mut rule| {
            rule.path_prefix = normalize_path(&rule.path_prefix);
            rule
        }));
        Self { rules: all }
    }

    /// Configured rules, without the implicit root rule
    pub fn rules(&self) -> impl Iterator<Item = &ScopeRule> {
        self.rules.iter().skip(1)
    }

    /// The single rule that governs `path`
    #[must_use]
    pub fn resolve_rule(&self, path: &str) -> &ScopeRule {
        let path = normalize_path(path);
        let mut best: Option<(usize, &ScopeRule)> = None;

        for rule in &self.rules {
            let Some(len) = rule.match_len(&path) else {
                continue;
            };
            best = match best {
                None => Some((len, rule)),
                Some((best_len, current)) => match len.cmp(&best_len) {
                    Ordering::Greater => Some((len, rule)),
                    Ordering::Less => Some((best_len, current)),
                    Ordering::Equal => {
                        if current.included != rule.included {
                            debug!(
                                path = %path,
                                a = %current,
                                b = %rule,
                                "scope conflict between equally specific rules"
                            );
                        }
                        if rule.tie_break(current) == Ordering::Greater {
                            Some((len, rule))
                        } else {
                            Some((best_len, current))
                        }
                    }
                },
            };
        }

        // The root rule matches every path
        best.map_or(&self.rules[0], |(_, rule)| rule)
    }

    #[must_use]
    pub fn is_in_scope(&self, path: &str) -> bool {
        self.resolve_rule(path).included
    }

    /// Classify `paths` by how their scope changes going from `previous` to
    /// this filter
    #[must_use]
    pub fn changes_from<'a>(
        &self,
        previous: &ScopeFilter,
        paths: impl IntoIterator<Item = &'a str>,
    ) -> ScopeChange {
        let mut change = ScopeChange::default();
        for path in paths {
            match (previous.is_in_scope(path), self.is_in_scope(path)) {
                (true, false) => change.newly_excluded.push(path.to_string()),
                (false, true) => change.newly_included.push(path.to_string()),
                _ => {}
            }
        }
        change
    }
}

/// Paths whose scope flipped between two rule sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeChange {
    pub newly_excluded: Vec<String>,
    pub newly_included: Vec<String>,
}

impl ScopeChange {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.newly_excluded.is_empty() && self.newly_included.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_path_rejects_escapes() {
        assert_eq!(checked_path("./docs//a.txt").unwrap(), "docs/a.txt");
        assert_eq!(checked_path("docs\\a.txt").unwrap(), "docs/a.txt");
        for bad in ["../x.txt", "docs/../../x", "/etc/passwd", "\\server\\x", "C:/x", "c:x", "", ".", "a\0b"] {
            assert!(
                matches!(checked_path(bad), Err(SyncError::InvalidPath { .. })),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn test_default_includes_everything() {
        let filter = ScopeFilter::default();
        assert!(filter.is_in_scope("anything/at/all.txt"));
        assert!(filter.resolve_rule("x").path_prefix.is_empty());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let filter = ScopeFilter::new(vec![
            ScopeRule::exclude("Documents"),
            ScopeRule::include("Documents/Shared"),
        ]);
        assert!(!filter.is_in_scope("Documents/plan.md"));
        assert!(filter.is_in_scope("Documents/Shared/plan.md"));
        assert!(filter.is_in_scope("Music/song.mp3"));
    }

    #[test]
    fn test_prefix_matches_whole_components() {
        let filter = ScopeFilter::new(vec![ScopeRule::exclude("Archive")]);
        assert!(!filter.is_in_scope("Archive/old.txt"));
        assert!(!filter.is_in_scope("Archive"));
        assert!(filter.is_in_scope("Archived.txt"));
    }

    #[test]
    fn test_exclusion_wins_ties() {
        let filter = ScopeFilter::new(vec![
            ScopeRule::include("Photos").with_priority(100),
            ScopeRule::exclude("Photos"),
        ]);
        assert!(!filter.is_in_scope("Photos/cat.jpg"));
    }

    #[test]
    fn test_priority_breaks_remaining_ties() {
        let filter = ScopeFilter::new(vec![
            ScopeRule::exclude("Photos").with_priority(1),
            ScopeRule::exclude("photos").with_priority(7),
        ]);
        assert_eq!(filter.resolve_rule("Photos/cat.jpg").priority, 7);
    }

    #[test]
    fn test_case_insensitive_match() {
        let filter = ScopeFilter::new(vec![ScopeRule::exclude("documents/archive")]);
        assert!(!filter.is_in_scope("Documents/Archive/2020.pdf"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./Documents\\Reports/"), "Documents/Reports");
        assert_eq!(normalize_path("/a//b/./c"), "a/b/c");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_changes_from() {
        let before = ScopeFilter::new(vec![ScopeRule::exclude("Music")]);
        let after = ScopeFilter::new(vec![ScopeRule::exclude("Documents")]);
        let change = after.changes_from(
            &before,
            ["Documents/a.txt", "Music/b.mp3", "Photos/c.jpg"],
        );
        assert_eq!(change.newly_excluded, vec!["Documents/a.txt".to_string()]);
        assert_eq!(change.newly_included, vec!["Music/b.mp3".to_string()]);
    }
}
