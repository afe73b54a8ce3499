//! Leaf-partitioned point storage
//!
//! Points live in leaves of `8 * voxel_size` world units. Every leaf stores
//! one flat column per attribute and one membership column per group. String
//! attributes store indices into the grid-wide [`StringTable`].

use crate::compiler::default_types::POSITION;
use crate::error::{Error, Result};
use crate::runtime::Word;
use crate::types::{ScalarKind, Type};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Voxels along one edge of a leaf
pub const LEAF_DIM: i32 = 8;

/// Interned strings shared by every leaf; index 0 is the empty string
#[derive(Debug, Clone)]
pub struct StringTable {
    values: Vec<String>,
    index: HashMap<String, i64>,
}

impl Default for StringTable {
    fn default() -> Self {
        let mut table = Self {
            values: Vec::new(),
            index: HashMap::new(),
        };
        table.intern("");
        table
    }
}

impl StringTable {
    /// Index of `s`, inserting it if needed
    pub fn intern(&mut self, s: &str) -> i64 {
        if let Some(i) = self.index.get(s) {
            return *i;
        }
        let i = self.values.len() as i64;
        self.values.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }

    /// Index of an already interned string
    pub fn lookup(&self, s: &str) -> Option<i64> {
        self.index.get(s).copied()
    }

    /// String at `index`
    pub fn get(&self, index: i64) -> Option<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.values.get(i))
            .map(String::as_str)
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Never true; the empty string is always present
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One attribute of one leaf
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Words per point
    pub stride: usize,
    /// Point values back to back
    pub values: Vec<Word>,
}

impl Column {
    fn point(&self, i: usize) -> &[Word] {
        &self.values[i * self.stride..(i + 1) * self.stride]
    }

    fn point_mut(&mut self, i: usize) -> &mut [Word] {
        &mut self.values[i * self.stride..(i + 1) * self.stride]
    }
}

/// Points of one leaf
#[derive(Debug, Clone)]
pub struct PointLeaf {
    coord: [i32; 3],
    len: usize,
    pub(crate) columns: Vec<Column>,
    pub(crate) groups: Vec<Vec<bool>>,
}

impl PointLeaf {
    fn new(coord: [i32; 3], layout: &[(String, Type)], groups: usize) -> Self {
        Self {
            coord,
            len: 0,
            columns: layout
                .iter()
                .map(|(_, ty)| Column {
                    stride: stride(*ty),
                    values: Vec::new(),
                })
                .collect(),
            groups: vec![Vec::new(); groups],
        }
    }

    /// Leaf coordinate (world position divided by the leaf extent)
    pub fn coord(&self) -> [i32; 3] {
        self.coord
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the leaf holds no points
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Values of attribute column `column` for point `i`
    pub fn values(&self, column: usize, i: usize) -> Option<&[Word]> {
        if i >= self.len {
            return None;
        }
        self.columns.get(column).map(|c| c.point(i))
    }

    pub(crate) fn values_mut(&mut self, column: usize, i: usize) -> Option<&mut [Word]> {
        if i >= self.len {
            return None;
        }
        self.columns.get_mut(column).map(|c| c.point_mut(i))
    }

    /// Membership of point `i` in group column `group`
    pub fn in_group(&self, group: usize, i: usize) -> bool {
        self.groups
            .get(group)
            .and_then(|g| g.get(i))
            .copied()
            .unwrap_or(false)
    }

    pub(crate) fn set_group(&mut self, group: usize, i: usize, member: bool) {
        if let Some(bit) = self.groups.get_mut(group).and_then(|g| g.get_mut(i)) {
            *bit = member;
        }
    }

    fn push_from(&mut self, other: &PointLeaf, i: usize) {
        for (dst, src) in self.columns.iter_mut().zip(&other.columns) {
            dst.values.extend_from_slice(src.point(i));
        }
        for (dst, src) in self.groups.iter_mut().zip(&other.groups) {
            dst.push(src.get(i).copied().unwrap_or(false));
        }
        self.len += 1;
    }

    fn push_default(&mut self, defaults: &[Vec<Word>]) {
        for (column, default) in self.columns.iter_mut().zip(defaults) {
            column.values.extend_from_slice(default);
        }
        for group in &mut self.groups {
            group.push(false);
        }
        self.len += 1;
    }

    /// Keep only the points whose flag in `keep` is set
    pub(crate) fn retain(&mut self, keep: &[bool]) -> usize {
        let kept: Vec<usize> = (0..self.len).filter(|i| keep.get(*i).copied().unwrap_or(true)).collect();
        let removed = self.len - kept.len();
        if removed == 0 {
            return 0;
        }
        for column in &mut self.columns {
            let mut values = Vec::with_capacity(kept.len() * column.stride);
            for i in &kept {
                values.extend_from_slice(column.point(*i));
            }
            column.values = values;
        }
        for group in &mut self.groups {
            *group = kept.iter().map(|i| group[*i]).collect();
        }
        self.len = kept.len();
        removed
    }
}

fn stride(ty: Type) -> usize {
    match ty {
        Type::String => 1,
        other => other.len(),
    }
}

fn default_values(ty: Type) -> Vec<Word> {
    match ty {
        // index of the empty string
        Type::String => vec![Word::I64(0)],
        other => {
            let kind = other.element().unwrap_or(ScalarKind::Float);
            vec![Word::zero(kind); other.len()]
        }
    }
}

/// Point set partitioned into leaves
#[derive(Debug, Clone)]
pub struct PointDataGrid {
    voxel_size: f64,
    layout: Vec<(String, Type)>,
    group_names: Vec<String>,
    strings: StringTable,
    leaves: Vec<PointLeaf>,
}

impl PointDataGrid {
    /// Empty grid holding only the position attribute
    pub fn new(voxel_size: f64) -> Self {
        Self {
            voxel_size,
            layout: vec![(POSITION.to_string(), Type::vec(ScalarKind::Float, 3))],
            group_names: Vec::new(),
            strings: StringTable::default(),
            leaves: Vec::new(),
        }
    }

    /// Grid holding one point per position
    pub fn from_positions(voxel_size: f64, positions: &[[f32; 3]]) -> Self {
        let mut grid = Self::new(voxel_size);
        for p in positions {
            grid.add_point(*p);
        }
        grid
    }

    /// World size of one voxel
    pub fn voxel_size(&self) -> f64 {
        self.voxel_size
    }

    /// World size of one leaf edge
    pub fn leaf_extent(&self) -> f64 {
        self.voxel_size * LEAF_DIM as f64
    }

    /// Leaf coordinate containing world position `p`
    pub fn leaf_coord(&self, p: [f64; 3]) -> [i32; 3] {
        let extent = self.leaf_extent();
        [
            (p[0] / extent).floor() as i32,
            (p[1] / extent).floor() as i32,
            (p[2] / extent).floor() as i32,
        ]
    }

    fn leaf_slot(&mut self, coord: [i32; 3]) -> usize {
        match self.leaves.binary_search_by(|l| l.coord.cmp(&coord)) {
            Ok(i) => i,
            Err(i) => {
                let leaf = PointLeaf::new(coord, &self.layout, self.group_names.len());
                self.leaves.insert(i, leaf);
                i
            }
        }
    }

    /// Append a point with default attribute values; returns (leaf, index)
    pub fn add_point(&mut self, p: [f32; 3]) -> (usize, usize) {
        let coord = self.leaf_coord([p[0] as f64, p[1] as f64, p[2] as f64]);
        let defaults: Vec<Vec<Word>> = self.layout.iter().map(|(_, ty)| default_values(*ty)).collect();
        let slot = self.leaf_slot(coord);
        let leaf = &mut self.leaves[slot];
        leaf.push_default(&defaults);
        let i = leaf.len - 1;
        if let Some(values) = leaf.values_mut(0, i) {
            for (v, x) in values.iter_mut().zip(p) {
                *v = Word::F32(x);
            }
        }
        (slot, i)
    }

    /// Leaves ordered by coordinate
    pub fn leaves(&self) -> &[PointLeaf] {
        &self.leaves
    }

    pub(crate) fn leaves_mut(&mut self) -> &mut [PointLeaf] {
        &mut self.leaves
    }

    /// Leaves borrowed mutably next to the shared metadata they read
    pub(crate) fn split_mut(&mut self) -> (&mut [PointLeaf], &StringTable, &[String]) {
        (&mut self.leaves, &self.strings, &self.group_names)
    }

    /// Drop leaves left without points
    pub fn prune_empty_leaves(&mut self) -> usize {
        let before = self.leaves.len();
        self.leaves.retain(|l| l.len > 0);
        before - self.leaves.len()
    }

    /// Number of leaves
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Number of points over all leaves
    pub fn point_count(&self) -> usize {
        self.leaves.iter().map(|l| l.len).sum()
    }

    /// Attributes as (name, type) in column order
    pub fn attributes(&self) -> &[(String, Type)] {
        &self.layout
    }

    /// Column of attribute `name`
    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.layout.iter().position(|(n, _)| n == name)
    }

    /// Type of attribute `name`
    pub fn attribute_type(&self, name: &str) -> Option<Type> {
        self.layout.iter().find(|(n, _)| n == name).map(|(_, ty)| *ty)
    }

    /// Add an attribute initialised to zero (or the empty string)
    ///
    /// Adding an existing attribute with the same type returns its column.
    pub fn add_attribute(&mut self, name: &str, ty: Type) -> Result<usize> {
        if let Some(existing) = self.attribute_type(name) {
            if existing != ty {
                return Err(Error::TypeMismatch {
                    name: name.to_string(),
                    expected: ty.to_string(),
                    actual: existing.to_string(),
                });
            }
            return self
                .attribute_index(name)
                .ok_or_else(|| Error::execution("attribute vanished"));
        }
        if ty.is_void() {
            return Err(Error::unsupported("attribute", "void"));
        }
        let default = default_values(ty);
        for leaf in &mut self.leaves {
            let mut values = Vec::with_capacity(leaf.len * default.len());
            for _ in 0..leaf.len {
                values.extend_from_slice(&default);
            }
            leaf.columns.push(Column {
                stride: stride(ty),
                values,
            });
        }
        self.layout.push((name.to_string(), ty));
        debug!(name, %ty, "added point attribute");
        Ok(self.layout.len() - 1)
    }

    fn column(&self, name: &str) -> Result<(usize, Type)> {
        self.attribute_index(name)
            .map(|i| (i, self.layout[i].1))
            .ok_or_else(|| Error::Lookup {
                name: name.to_string(),
                kind: "attribute".to_string(),
            })
    }

    fn point(&self, leaf: usize, i: usize) -> Result<&PointLeaf> {
        self.leaves
            .get(leaf)
            .filter(|l| i < l.len)
            .ok_or_else(|| Error::execution(format!("no point {} in leaf {}", i, leaf)))
    }

    /// Numeric values of one point's attribute
    pub fn value(&self, name: &str, leaf: usize, i: usize) -> Result<Vec<Word>> {
        let (column, ty) = self.column(name)?;
        if ty.is_string() {
            return Err(Error::TypeMismatch {
                name: name.to_string(),
                expected: "a numeric attribute".to_string(),
                actual: ty.to_string(),
            });
        }
        Ok(self
            .point(leaf, i)?
            .values(column, i)
            .map(<[Word]>::to_vec)
            .unwrap_or_default())
    }

    /// Overwrite one point's numeric attribute, casting to the attribute type
    pub fn set_value(&mut self, name: &str, leaf: usize, i: usize, values: &[Word]) -> Result<()> {
        let (column, ty) = self.column(name)?;
        let kind = ty.element().ok_or_else(|| Error::TypeMismatch {
            name: name.to_string(),
            expected: "a numeric attribute".to_string(),
            actual: ty.to_string(),
        })?;
        if values.len() != ty.len() {
            return Err(Error::TypeMismatch {
                name: name.to_string(),
                expected: ty.to_string(),
                actual: format!("{} value(s)", values.len()),
            });
        }
        self.point(leaf, i)?;
        if let Some(dst) = self.leaves[leaf].values_mut(column, i) {
            for (d, v) in dst.iter_mut().zip(values) {
                *d = v.cast(kind);
            }
        }
        Ok(())
    }

    /// String attribute of one point
    pub fn string(&self, name: &str, leaf: usize, i: usize) -> Result<&str> {
        let (column, ty) = self.column(name)?;
        if !ty.is_string() {
            return Err(Error::TypeMismatch {
                name: name.to_string(),
                expected: Type::String.to_string(),
                actual: ty.to_string(),
            });
        }
        let index = self
            .point(leaf, i)?
            .values(column, i)
            .and_then(|v| v.first())
            .map(Word::as_i64)
            .unwrap_or(0);
        Ok(self.strings.get(index).unwrap_or(""))
    }

    /// Overwrite one point's string attribute
    pub fn set_string(&mut self, name: &str, leaf: usize, i: usize, value: &str) -> Result<()> {
        let (column, ty) = self.column(name)?;
        if !ty.is_string() {
            return Err(Error::TypeMismatch {
                name: name.to_string(),
                expected: Type::String.to_string(),
                actual: ty.to_string(),
            });
        }
        self.point(leaf, i)?;
        let index = self.strings.intern(value);
        if let Some(dst) = self.leaves[leaf].values_mut(column, i) {
            dst[0] = Word::I64(index);
        }
        Ok(())
    }

    /// Shared string table
    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub(crate) fn strings_mut(&mut self) -> &mut StringTable {
        &mut self.strings
    }

    /// Group names in column order
    pub fn groups(&self) -> &[String] {
        &self.group_names
    }

    /// Column of group `name`
    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.group_names.iter().position(|g| g == name)
    }

    /// Create a group with no members; existing groups are left alone
    pub fn add_group(&mut self, name: &str) -> usize {
        if let Some(i) = self.group_index(name) {
            return i;
        }
        for leaf in &mut self.leaves {
            leaf.groups.push(vec![false; leaf.len]);
        }
        self.group_names.push(name.to_string());
        self.group_names.len() - 1
    }

    /// Membership of one point
    pub fn in_group(&self, name: &str, leaf: usize, i: usize) -> bool {
        match (self.group_index(name), self.leaves.get(leaf)) {
            (Some(g), Some(l)) => l.in_group(g, i),
            _ => false,
        }
    }

    /// Set membership of one point, creating the group if needed
    pub fn set_in_group(&mut self, name: &str, leaf: usize, i: usize, member: bool) -> Result<()> {
        self.point(leaf, i)?;
        let g = self.add_group(name);
        self.leaves[leaf].set_group(g, i, member);
        Ok(())
    }

    /// Number of points in group `name`
    pub fn group_count(&self, name: &str) -> usize {
        let Some(g) = self.group_index(name) else {
            return 0;
        };
        self.leaves
            .iter()
            .map(|l| l.groups[g].iter().filter(|b| **b).count())
            .sum()
    }

    /// Every position in leaf order
    pub fn positions(&self) -> Vec<[f32; 3]> {
        let mut out = Vec::with_capacity(self.point_count());
        for leaf in &self.leaves {
            for i in 0..leaf.len {
                if let Some(p) = leaf.values(0, i) {
                    out.push([p[0].as_f64() as f32, p[1].as_f64() as f32, p[2].as_f64() as f32]);
                }
            }
        }
        out
    }

    /// Numeric values of attribute `name` for every point in leaf order
    pub fn values(&self, name: &str) -> Result<Vec<Vec<Word>>> {
        let (column, _) = self.column(name)?;
        Ok(self
            .leaves
            .iter()
            .flat_map(|l| (0..l.len).filter_map(move |i| l.values(column, i).map(<[Word]>::to_vec)))
            .collect())
    }

    /// Move every point into the leaf containing its position
    ///
    /// Point order is preserved within each destination leaf. Empty leaves
    /// are dropped. Returns the number of points that changed leaf.
    pub fn migrate(&mut self) -> usize {
        let extent = self.leaf_extent();
        let mut rebuilt: BTreeMap<[i32; 3], PointLeaf> = BTreeMap::new();
        let mut moved = 0;
        for leaf in &self.leaves {
            for i in 0..leaf.len {
                let p = leaf.columns[0].point(i);
                let coord = [
                    (p[0].as_f64() / extent).floor() as i32,
                    (p[1].as_f64() / extent).floor() as i32,
                    (p[2].as_f64() / extent).floor() as i32,
                ];
                if coord != leaf.coord {
                    moved += 1;
                }
                rebuilt
                    .entry(coord)
                    .or_insert_with(|| PointLeaf::new(coord, &self.layout, self.group_names.len()))
                    .push_from(leaf, i);
            }
        }
        self.leaves = rebuilt.into_values().collect();
        debug!(moved, leaves = self.leaves.len(), "migrated points");
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_bucket_into_leaves() {
        let grid = PointDataGrid::from_positions(1.0, &[[0.5, 0.5, 0.5], [7.9, 0.0, 0.0], [8.1, 0.0, 0.0]]);
        assert_eq!(grid.leaf_count(), 2);
        assert_eq!(grid.point_count(), 3);
        assert_eq!(grid.leaves()[0].len(), 2);
        assert_eq!(grid.leaves()[1].coord(), [1, 0, 0]);
    }

    #[test]
    fn test_attribute_type_conflict() {
        let mut grid = PointDataGrid::from_positions(1.0, &[[0.0; 3]]);
        assert_eq!(grid.add_attribute("a", Type::FLOAT).unwrap(), 1);
        assert_eq!(grid.add_attribute("a", Type::FLOAT).unwrap(), 1);
        assert!(matches!(
            grid.add_attribute("a", Type::INT32),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_values_and_strings() {
        let mut grid = PointDataGrid::from_positions(1.0, &[[0.0; 3]]);
        grid.add_attribute("v", Type::vec(ScalarKind::Float, 3)).unwrap();
        grid.add_attribute("s", Type::String).unwrap();
        grid.set_value("v", 0, 0, &[Word::I32(1), Word::I32(2), Word::I32(3)]).unwrap();
        assert_eq!(grid.value("v", 0, 0).unwrap(), vec![Word::F32(1.0), Word::F32(2.0), Word::F32(3.0)]);
        assert_eq!(grid.string("s", 0, 0).unwrap(), "");
        grid.set_string("s", 0, 0, "hello").unwrap();
        assert_eq!(grid.string("s", 0, 0).unwrap(), "hello");
        assert!(grid.value("missing", 0, 0).is_err());
    }

    #[test]
    fn test_groups() {
        let mut grid = PointDataGrid::from_positions(1.0, &[[0.0; 3], [1.0; 3]]);
        grid.set_in_group("g", 0, 1, true).unwrap();
        assert!(grid.in_group("g", 0, 1));
        assert!(!grid.in_group("g", 0, 0));
        assert_eq!(grid.group_count("g"), 1);
        assert_eq!(grid.add_group("g"), 0);
    }

    #[test]
    fn test_migrate_and_retain() {
        let mut grid = PointDataGrid::from_positions(1.0, &[[0.0; 3], [1.0; 3]]);
        grid.add_attribute("id", Type::INT32).unwrap();
        grid.set_value("id", 0, 1, &[Word::I32(7)]).unwrap();
        grid.set_value("P", 0, 1, &[Word::F32(20.0), Word::F32(0.0), Word::F32(0.0)]).unwrap();
        assert_eq!(grid.migrate(), 1);
        assert_eq!(grid.leaf_count(), 2);
        assert_eq!(grid.value("id", 1, 0).unwrap(), vec![Word::I32(7)]);

        let removed = grid.leaves_mut()[0].retain(&[false]);
        assert_eq!(removed, 1);
        assert_eq!(grid.point_count(), 1);
    }
}
