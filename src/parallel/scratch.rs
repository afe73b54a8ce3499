//! Per-leaf staging for changes that touch shared point metadata
//!
//! Group creation, string interning and point migration mutate state shared
//! by every leaf, so the parallel phase records them here and the merge
//! phase applies them one leaf at a time.

use crate::runtime::Word;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Pending changes of one leaf
#[derive(Debug, Default)]
pub struct LeafScratch {
    positions: Option<Vec<Option<[Word; 3]>>>,
    strings: HashMap<(usize, usize), String>,
    new_groups: BTreeMap<String, BTreeSet<usize>>,
    deleted: BTreeSet<usize>,
}

impl LeafScratch {
    /// Empty scratch
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new position for point `i` of a leaf holding `len` points
    pub fn stage_position(&mut self, len: usize, i: usize, p: [Word; 3]) {
        let staged = self.positions.get_or_insert_with(|| vec![None; len]);
        if let Some(slot) = staged.get_mut(i) {
            *slot = Some(p);
        }
    }

    /// Staged position of point `i`
    pub fn position(&self, i: usize) -> Option<&[Word; 3]> {
        self.positions
            .as_ref()
            .and_then(|p| p.get(i))
            .and_then(Option::as_ref)
    }

    /// Staged positions, if any point moved
    pub fn positions(&self) -> Option<&[Option<[Word; 3]>]> {
        self.positions.as_deref()
    }

    /// Record a string value not yet present in the shared table
    pub fn stage_string(&mut self, column: usize, i: usize, value: String) {
        self.strings.insert((column, i), value);
    }

    /// Drop a staged string once the point is given an interned value
    pub fn clear_string(&mut self, column: usize, i: usize) {
        self.strings.remove(&(column, i));
    }

    /// Staged string of point `i` in `column`
    pub fn string(&self, column: usize, i: usize) -> Option<&str> {
        self.strings.get(&(column, i)).map(String::as_str)
    }

    /// Staged strings keyed by (column, point)
    pub fn strings(&self) -> impl Iterator<Item = (&(usize, usize), &String)> {
        self.strings.iter()
    }

    /// Add point `i` to a group the grid does not have yet
    pub fn add_to_new_group(&mut self, name: &str, i: usize) {
        self.new_groups.entry(name.to_string()).or_default().insert(i);
    }

    /// Remove point `i` from a group the grid does not have yet
    pub fn remove_from_new_group(&mut self, name: &str, i: usize) {
        if let Some(members) = self.new_groups.get_mut(name) {
            members.remove(&i);
            // a group left without members is not created at merge
            if members.is_empty() {
                self.new_groups.remove(name);
            }
        }
    }

    /// Membership of point `i` in a not yet created group
    pub fn in_new_group(&self, name: &str, i: usize) -> bool {
        self.new_groups
            .get(name)
            .map(|m| m.contains(&i))
            .unwrap_or(false)
    }

    /// Groups discovered by this leaf with their members
    pub fn new_groups(&self) -> &BTreeMap<String, BTreeSet<usize>> {
        &self.new_groups
    }

    /// Mark point `i` for deletion
    pub fn delete(&mut self, i: usize) {
        self.deleted.insert(i);
    }

    /// Points marked for deletion
    pub fn deleted(&self) -> &BTreeSet<usize> {
        &self.deleted
    }

    /// True when nothing was staged
    pub fn is_empty(&self) -> bool {
        self.positions.is_none()
            && self.strings.is_empty()
            && self.new_groups.is_empty()
            && self.deleted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_allocated_lazily() {
        let mut scratch = LeafScratch::new();
        assert!(scratch.is_empty());
        scratch.stage_position(4, 2, [Word::F32(1.0); 3]);
        assert_eq!(scratch.positions().map(<[_]>::len), Some(4));
        assert!(scratch.position(2).is_some());
        assert!(scratch.position(1).is_none());
    }

    #[test]
    fn test_new_group_membership() {
        let mut scratch = LeafScratch::new();
        scratch.add_to_new_group("new", 0);
        scratch.add_to_new_group("new", 3);
        scratch.remove_from_new_group("new", 0);
        assert!(!scratch.in_new_group("new", 0));
        assert!(scratch.in_new_group("new", 3));
        assert_eq!(scratch.new_groups().len(), 1);
    }

    #[test]
    fn test_emptied_new_group_is_dropped() {
        let mut scratch = LeafScratch::new();
        scratch.add_to_new_group("tmp", 1);
        scratch.remove_from_new_group("tmp", 1);
        assert!(scratch.new_groups().is_empty());
        assert!(scratch.is_empty());
        // removing from a group never staged is a no-op
        scratch.remove_from_new_group("other", 0);
        assert!(scratch.is_empty());
    }
}
