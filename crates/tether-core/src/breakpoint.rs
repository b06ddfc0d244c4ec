//! Source breakpoints.
//!
//! Breakpoints belong to the target, not to a session: the live set is kept
//! by the execution engine and every session re-reads it when it binds.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A line in a source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceLocation {
    pub source: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(source: impl Into<String>, line: u32) -> Self {
        Self {
            source: source.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.line)
    }
}

impl FromStr for SourceLocation {
    type Err = DomainError;

    /// Parses `file:line`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, line) = s
            .rsplit_once(':')
            .ok_or_else(|| DomainError::invalid("location", s, "file:line"))?;
        if source.is_empty() {
            return Err(DomainError::invalid("location", s, "file:line"));
        }
        let line = line
            .parse::<u32>()
            .ok()
            .filter(|l| *l > 0)
            .ok_or_else(|| DomainError::invalid("line", line, "a positive integer"))?;
        Ok(Self::new(source, line))
    }
}

/// Ordered, duplicate-free set of breakpoint locations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakpointSet(BTreeSet<SourceLocation>);

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a location. Returns false if it was already present.
    pub fn add(&mut self, location: SourceLocation) -> bool {
        self.0.insert(location)
    }

    /// Removes a location. Returns false if it was not present.
    pub fn remove(&mut self, location: &SourceLocation) -> bool {
        self.0.remove(location)
    }

    /// Removes every breakpoint.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Replaces all breakpoints in `source` with `lines`.
    ///
    /// Returns the locations that were removed and those that were added,
    /// so the caller can apply the difference to the engine.
    pub fn diff_for_source(
        &self,
        source: &str,
        lines: &[u32],
    ) -> (Vec<SourceLocation>, Vec<SourceLocation>) {
        let wanted: BTreeSet<SourceLocation> = lines
            .iter()
            .map(|line| SourceLocation::new(source, *line))
            .collect();

        let removed = self
            .0
            .iter()
            .filter(|loc| loc.source == source && !wanted.contains(*loc))
            .cloned()
            .collect();
        let added = wanted
            .into_iter()
            .filter(|loc| !self.0.contains(loc))
            .collect();

        (removed, added)
    }

    pub fn contains(&self, location: &SourceLocation) -> bool {
        self.0.contains(location)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceLocation> {
        self.0.iter()
    }

    pub fn to_vec(&self) -> Vec<SourceLocation> {
        self.0.iter().cloned().collect()
    }
}

impl FromIterator<SourceLocation> for BreakpointSet {
    fn from_iter<I: IntoIterator<Item = SourceLocation>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for BreakpointSet {
    type Item = SourceLocation;
    type IntoIter = std::collections::btree_set::IntoIter<SourceLocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_parse() {
        let loc: SourceLocation = "src/main.rs:42".parse().unwrap();
        assert_eq!(loc, SourceLocation::new("src/main.rs", 42));
        assert_eq!(loc.to_string(), "src/main.rs:42");

        assert!("main.rs".parse::<SourceLocation>().is_err());
        assert!("main.rs:0".parse::<SourceLocation>().is_err());
        assert!(":3".parse::<SourceLocation>().is_err());
    }

    #[test]
    fn test_add_is_duplicate_free() {
        let mut set = BreakpointSet::new();
        assert!(set.add(SourceLocation::new("a.rs", 1)));
        assert!(!set.add(SourceLocation::new("a.rs", 1)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut set: BreakpointSet = [
            SourceLocation::new("a.rs", 1),
            SourceLocation::new("b.rs", 2),
        ]
        .into_iter()
        .collect();

        assert!(set.remove(&SourceLocation::new("a.rs", 1)));
        assert!(!set.remove(&SourceLocation::new("a.rs", 1)));
        assert_eq!(set.len(), 1);

        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn test_diff_for_source_only_touches_that_source() {
        let set: BreakpointSet = [
            SourceLocation::new("a.rs", 1),
            SourceLocation::new("a.rs", 5),
            SourceLocation::new("b.rs", 1),
        ]
        .into_iter()
        .collect();

        let (removed, added) = set.diff_for_source("a.rs", &[5, 9]);
        assert_eq!(removed, vec![SourceLocation::new("a.rs", 1)]);
        assert_eq!(added, vec![SourceLocation::new("a.rs", 9)]);

        let (removed, added) = set.diff_for_source("a.rs", &[]);
        assert_eq!(removed.len(), 2);
        assert!(added.is_empty());
    }
}
