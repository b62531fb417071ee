// Copyright 2024 Yann Prado
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! The match table routing query names to upstream server lists.

use crate::upstream::Upstream;
use regex::Regex;
use std::sync::{Arc, RwLock};

/// Compiled routing table scanned in insertion order.
///
/// Lookup order is deterministic: upstream groups in the order they were handed
/// to [`MatchTable::build`] (the configuration authoring order, locally defined
/// groups ahead of feed-loaded ones), and within one group the patterns in
/// author order. The first matching pattern wins.
pub struct MatchTable {
    rules: Vec<(Regex, Arc<Vec<String>>)>,
}

impl MatchTable {
    /// Build a table from upstream groups, preserving iteration order.
    pub fn build<'a, I>(upstreams: I) -> Self
    where
        I: IntoIterator<Item = &'a Upstream>,
    {
        let mut rules = Vec::new();
        for u in upstreams {
            let servers = Arc::new(u.servers.clone());
            for pattern in &u.patterns {
                rules.push((pattern.clone(), servers.clone()));
            }
        }
        Self { rules }
    }

    /// Return the server list of the first pattern matching `name`.
    ///
    /// `name` is the raw query name as delivered, trailing dot included.
    pub fn lookup(&self, name: &str) -> Option<Arc<Vec<String>>> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(name))
            .map(|(_, servers)| servers.clone())
    }

    /// Number of compiled patterns.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no pattern is registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for MatchTable {
    fn default() -> Self {
        Self { rules: Vec::new() }
    }
}

/// Shared handle over the current [`MatchTable`] snapshot.
///
/// [`TableHandle::rebuild`] constructs a fresh table and swaps it in; a reader
/// sees either the old or the new table in its entirety, never a mixture.
pub struct TableHandle {
    current: RwLock<Arc<MatchTable>>,
}

impl TableHandle {
    /// Create a handle holding an empty table.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(MatchTable::default())),
        }
    }

    /// Replace the table with one built from `upstreams`.
    pub fn rebuild<'a, I>(&self, upstreams: I)
    where
        I: IntoIterator<Item = &'a Upstream>,
    {
        let table = Arc::new(MatchTable::build(upstreams));
        *self.current.write().unwrap() = table;
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<MatchTable> {
        self.current.read().unwrap().clone()
    }

    /// Look `name` up in the current snapshot.
    pub fn lookup(&self, name: &str) -> Option<Arc<Vec<String>>> {
        self.snapshot().lookup(name)
    }
}

impl Default for TableHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{MatchTable, TableHandle};
    use crate::upstream::Upstream;
    use regex::Regex;

    fn group(name: &str, server: &str, patterns: &[&str]) -> Upstream {
        Upstream::new(
            name,
            vec![server.to_owned()],
            patterns.iter().map(|p| Regex::new(p).unwrap()).collect(),
        )
    }

    #[test]
    fn first_match_wins() {
        let upstreams = vec![
            group("first", "10.0.0.1", &[r"\.example\.$"]),
            group("second", "10.0.0.2", &[r"^www\."]),
        ];
        let table = MatchTable::build(&upstreams);

        // Both patterns match; the earlier group is picked.
        assert_eq!(
            table.lookup("www.example.").unwrap().first().unwrap(),
            "10.0.0.1:53"
        );
        assert_eq!(
            table.lookup("www.other.").unwrap().first().unwrap(),
            "10.0.0.2:53"
        );
        assert!(table.lookup("plain.test.").is_none());
    }

    #[test]
    fn trailing_dot_is_matched_literally() {
        let upstreams = vec![group("strict", "10.0.0.1", &[r"^example\.com\.$"])];
        let table = MatchTable::build(&upstreams);
        assert!(table.lookup("example.com.").is_some());
        assert!(table.lookup("example.com").is_none());
    }

    #[test]
    fn rebuild_swaps_whole_snapshots() {
        let handle = TableHandle::new();
        assert!(handle.lookup("a.test.").is_none());

        handle.rebuild(&vec![group("a", "10.0.0.1", &[r"^a\."])]);
        let old = handle.snapshot();
        assert!(old.lookup("a.test.").is_some());

        handle.rebuild(&vec![group("b", "10.0.0.2", &[r"^b\."])]);
        // The held snapshot still answers with the old rules.
        assert!(old.lookup("a.test.").is_some());
        assert!(handle.lookup("a.test.").is_none());
        assert!(handle.lookup("b.test.").is_some());
    }

    #[test]
    fn empty_table() {
        let table = MatchTable::default();
        assert!(table.is_empty());
        assert_eq!(table.len(), 0);
        assert!(table.lookup("anything.").is_none());
    }
}
