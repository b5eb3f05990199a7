//! Include/exclude rule matching.
//!
//! A [`FilterSet`] holds an ordered list of rules; the first rule matching
//! a candidate path decides its fate, and a path no rule matches is
//! included. Pattern grammar follows rsync: a leading `/` anchors the
//! pattern at the transfer root, a trailing `/` restricts it to
//! directories, `*` stays inside one path component, `**` crosses
//! components, `?` matches one non-slash character and `[...]` is a
//! character class.

use std::path::Path;

use globset::{GlobBuilder, GlobMatcher};

/// Errors raised while compiling rules.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// The glob pattern did not compile.
    #[error("invalid filter pattern {pattern:?}: {source}")]
    BadPattern {
        /// Offending pattern text.
        pattern: String,
        /// Underlying glob error.
        source: globset::Error,
    },

    /// A rule line had no recognizable prefix.
    #[error("unparsable filter rule {0:?}")]
    BadRule(String),
}

/// What a matching rule does with the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Keep the path in the transfer.
    Include,
    /// Drop the path (and, for directories, everything below it).
    Exclude,
}

/// One compiled filter rule.
#[derive(Debug, Clone)]
pub struct Rule {
    kind: RuleKind,
    dir_only: bool,
    matcher: GlobMatcher,
    pattern: String,
}

impl Rule {
    /// Compiles a rule from rsync pattern syntax.
    pub fn new(kind: RuleKind, pattern: &str) -> Result<Self, FilterError> {
        let text = pattern.to_string();
        let (anchored, rest) = match pattern.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };
        let (dir_only, rest) = match rest.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };

        // Unanchored patterns float: they may match at any directory
        // boundary, which `**/` expresses once `*` is kept inside one
        // component.
        let glob = if anchored {
            rest.to_string()
        } else {
            format!("**/{rest}")
        };

        let matcher = GlobBuilder::new(&glob)
            .literal_separator(true)
            .backslash_escape(true)
            .build()
            .map_err(|source| FilterError::BadPattern {
                pattern: text.clone(),
                source,
            })?
            .compile_matcher();

        Ok(Self {
            kind,
            dir_only,
            matcher,
            pattern: text,
        })
    }

    /// Parses a `+ pattern` / `- pattern` rule line.
    pub fn parse(line: &str) -> Result<Self, FilterError> {
        let line = line.trim();
        if let Some(pattern) = line.strip_prefix("+ ") {
            Self::new(RuleKind::Include, pattern.trim_start())
        } else if let Some(pattern) = line.strip_prefix("- ") {
            Self::new(RuleKind::Exclude, pattern.trim_start())
        } else {
            Err(FilterError::BadRule(line.to_string()))
        }
    }

    /// Original pattern text.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Rule kind.
    #[must_use]
    pub const fn kind(&self) -> RuleKind {
        self.kind
    }

    fn matches(&self, path: &Path, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        self.matcher.is_match(path)
    }
}

/// Ordered rule list with first-match-wins semantics.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    rules: Vec<Rule>,
}

impl FilterSet {
    /// An empty set including everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from `+`/`-` rule lines.
    pub fn parse(lines: impl IntoIterator<Item = impl AsRef<str>>) -> Result<Self, FilterError> {
        let rules = lines
            .into_iter()
            .map(|line| Rule::parse(line.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self { rules })
    }

    /// Appends an include rule.
    pub fn include(&mut self, pattern: &str) -> Result<&mut Self, FilterError> {
        self.rules.push(Rule::new(RuleKind::Include, pattern)?);
        Ok(self)
    }

    /// Appends an exclude rule.
    pub fn exclude(&mut self, pattern: &str) -> Result<&mut Self, FilterError> {
        self.rules.push(Rule::new(RuleKind::Exclude, pattern)?);
        Ok(self)
    }

    /// True when no rules are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Appends another set's rules after this set's own.
    pub fn extend_from(&mut self, other: &Self) {
        self.rules.extend(other.rules.iter().cloned());
    }

    /// Decides whether `path` (relative to the transfer root) stays in the
    /// transfer.
    #[must_use]
    pub fn keeps(&self, path: &Path, is_dir: bool) -> bool {
        for rule in &self.rules {
            if rule.matches(path, is_dir) {
                return rule.kind == RuleKind::Include;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(lines: &[&str]) -> FilterSet {
        FilterSet::parse(lines).expect("valid rules")
    }

    #[test]
    fn empty_set_keeps_everything() {
        let filters = FilterSet::new();
        assert!(filters.keeps(Path::new("any/path"), false));
    }

    #[test]
    fn basename_patterns_float_to_any_level() {
        let filters = set(&["- *.o"]);
        assert!(!filters.keeps(Path::new("main.o"), false));
        assert!(!filters.keeps(Path::new("deep/down/main.o"), false));
        assert!(filters.keeps(Path::new("main.c"), false));
    }

    #[test]
    fn leading_slash_anchors_at_the_root() {
        let filters = set(&["- /build"]);
        assert!(!filters.keeps(Path::new("build"), true));
        assert!(filters.keeps(Path::new("src/build"), true));
    }

    #[test]
    fn trailing_slash_restricts_to_directories() {
        let filters = set(&["- cache/"]);
        assert!(!filters.keeps(Path::new("cache"), true));
        assert!(filters.keeps(Path::new("cache"), false));
    }

    #[test]
    fn first_match_wins() {
        let filters = set(&["+ important.log", "- *.log"]);
        assert!(filters.keeps(Path::new("important.log"), false));
        assert!(!filters.keeps(Path::new("noise.log"), false));
    }

    #[test]
    fn star_stays_inside_one_component() {
        let filters = set(&["- /tmp*"]);
        assert!(!filters.keeps(Path::new("tmpfile"), false));
        assert!(filters.keeps(Path::new("tmp/inner"), false));
    }

    #[test]
    fn double_star_crosses_components() {
        let filters = set(&["- /target/**"]);
        assert!(!filters.keeps(Path::new("target/debug/app"), false));
        assert!(filters.keeps(Path::new("target"), true));
    }

    #[test]
    fn question_mark_and_classes_match_single_characters() {
        let filters = set(&["- file?.[ab]"]);
        assert!(!filters.keeps(Path::new("file1.a"), false));
        assert!(filters.keeps(Path::new("file12.a"), false));
        assert!(filters.keeps(Path::new("file1.c"), false));
    }

    #[test]
    fn unparsable_rules_are_rejected() {
        assert!(FilterSet::parse(["no prefix"]).is_err());
        assert!(Rule::new(RuleKind::Exclude, "broken[").is_err());
    }
}
