//! Sparse voxel grids of `8^3` leaves

use crate::error::{Error, Result};
use crate::runtime::Word;
use crate::types::{ScalarKind, Type};
use std::collections::BTreeMap;
use tracing::debug;

/// Voxels along one edge of a leaf
pub const LEAF_DIM: i32 = 8;
/// Voxels per leaf
pub const LEAF_VOXELS: usize = (LEAF_DIM * LEAF_DIM * LEAF_DIM) as usize;

/// Origin of the leaf containing `coord`
pub fn leaf_origin(coord: [i32; 3]) -> [i32; 3] {
    [
        coord[0].div_euclid(LEAF_DIM) * LEAF_DIM,
        coord[1].div_euclid(LEAF_DIM) * LEAF_DIM,
        coord[2].div_euclid(LEAF_DIM) * LEAF_DIM,
    ]
}

fn offset(coord: [i32; 3]) -> usize {
    let x = coord[0].rem_euclid(LEAF_DIM) as usize;
    let y = coord[1].rem_euclid(LEAF_DIM) as usize;
    let z = coord[2].rem_euclid(LEAF_DIM) as usize;
    (x * LEAF_DIM as usize + y) * LEAF_DIM as usize + z
}

/// One allocated block of voxels
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeLeaf {
    origin: [i32; 3],
    stride: usize,
    values: Vec<Word>,
    active: Vec<bool>,
}

impl VolumeLeaf {
    fn new(origin: [i32; 3], background: &[Word]) -> Self {
        let mut values = Vec::with_capacity(LEAF_VOXELS * background.len());
        for _ in 0..LEAF_VOXELS {
            values.extend_from_slice(background);
        }
        Self {
            origin,
            stride: background.len(),
            values,
            active: vec![false; LEAF_VOXELS],
        }
    }

    /// Coordinate of the leaf's first voxel
    pub fn origin(&self) -> [i32; 3] {
        self.origin
    }

    /// Coordinate of voxel `n` (0..512) of this leaf
    pub fn coord(&self, n: usize) -> [i32; 3] {
        let d = LEAF_DIM as usize;
        [
            self.origin[0] + (n / (d * d)) as i32,
            self.origin[1] + ((n / d) % d) as i32,
            self.origin[2] + (n % d) as i32,
        ]
    }

    /// Value of the voxel at `coord`, which must lie inside this leaf
    pub fn get(&self, coord: [i32; 3]) -> &[Word] {
        let o = offset(coord) * self.stride;
        &self.values[o..o + self.stride]
    }

    /// Overwrite the voxel at `coord`
    pub fn set(&mut self, coord: [i32; 3], values: &[Word]) {
        let o = offset(coord) * self.stride;
        for (dst, v) in self.values[o..o + self.stride].iter_mut().zip(values) {
            *dst = *v;
        }
    }

    /// Active state of voxel `n`
    pub fn is_active(&self, n: usize) -> bool {
        self.active.get(n).copied().unwrap_or(false)
    }

    pub(crate) fn set_active(&mut self, coord: [i32; 3], on: bool) {
        self.active[offset(coord)] = on;
    }

    /// Number of active voxels
    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|a| **a).count()
    }
}

/// Named sparse grid of one numeric type
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeGrid {
    name: String,
    ty: Type,
    background: Vec<Word>,
    voxel_size: f64,
    leaves: BTreeMap<[i32; 3], VolumeLeaf>,
}

impl VolumeGrid {
    /// Empty grid with a zero background and unit voxels
    pub fn new(name: &str, ty: Type) -> Result<Self> {
        let kind = match ty {
            Type::Scalar(_) | Type::Array { .. } => ty.element().unwrap_or(ScalarKind::Float),
            other => {
                return Err(Error::unsupported(
                    "grid",
                    format!("{} grid \"{}\"", other, name),
                ))
            }
        };
        Ok(Self {
            name: name.to_string(),
            ty,
            background: vec![Word::zero(kind); ty.len()],
            voxel_size: 1.0,
            leaves: BTreeMap::new(),
        })
    }

    /// Set the world size of one voxel
    pub fn with_voxel_size(mut self, voxel_size: f64) -> Self {
        self.voxel_size = voxel_size;
        self
    }

    /// Set the value read outside allocated leaves
    pub fn with_background(mut self, background: &[Word]) -> Result<Self> {
        self.background = self.coerce(background)?;
        Ok(self)
    }

    fn coerce(&self, values: &[Word]) -> Result<Vec<Word>> {
        let kind = self.ty.element().unwrap_or(ScalarKind::Float);
        if values.len() != self.ty.len() {
            return Err(Error::TypeMismatch {
                name: self.name.clone(),
                expected: self.ty.to_string(),
                actual: format!("{} value(s)", values.len()),
            });
        }
        Ok(values.iter().map(|v| v.cast(kind)).collect())
    }

    /// Grid name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value type
    pub fn ty(&self) -> Type {
        self.ty
    }

    /// World size of one voxel
    pub fn voxel_size(&self) -> f64 {
        self.voxel_size
    }

    /// Background value
    pub fn background(&self) -> &[Word] {
        &self.background
    }

    /// Value at `coord`, the background outside allocated leaves
    pub fn get(&self, coord: [i32; 3]) -> &[Word] {
        match self.leaves.get(&leaf_origin(coord)) {
            Some(leaf) => leaf.get(coord),
            None => &self.background,
        }
    }

    /// Write an active voxel, allocating its leaf if needed
    pub fn set(&mut self, coord: [i32; 3], values: &[Word]) -> Result<()> {
        let values = self.coerce(values)?;
        let leaf = self.touch_leaf(leaf_origin(coord));
        leaf.set(coord, &values);
        leaf.set_active(coord, true);
        Ok(())
    }

    /// Change the active state of a voxel without touching its value
    pub fn set_active(&mut self, coord: [i32; 3], on: bool) {
        let leaf = self.touch_leaf(leaf_origin(coord));
        leaf.set_active(coord, on);
    }

    /// Active state of a voxel
    pub fn is_active(&self, coord: [i32; 3]) -> bool {
        self.leaves
            .get(&leaf_origin(coord))
            .map(|l| l.is_active(offset(coord)))
            .unwrap_or(false)
    }

    /// Leaf at `origin`, allocated with background values when missing
    pub fn touch_leaf(&mut self, origin: [i32; 3]) -> &mut VolumeLeaf {
        let background = &self.background;
        self.leaves
            .entry(origin)
            .or_insert_with(|| VolumeLeaf::new(origin, background))
    }

    /// Leaf at `origin`
    pub fn leaf(&self, origin: [i32; 3]) -> Option<&VolumeLeaf> {
        self.leaves.get(&origin)
    }

    /// Leaves ordered by origin
    pub fn leaves(&self) -> impl Iterator<Item = &VolumeLeaf> {
        self.leaves.values()
    }

    pub(crate) fn leaves_mut(&mut self) -> impl Iterator<Item = &mut VolumeLeaf> {
        self.leaves.values_mut()
    }

    /// Number of allocated leaves
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Number of active voxels
    pub fn active_voxel_count(&self) -> usize {
        self.leaves.values().map(VolumeLeaf::active_count).sum()
    }

    /// Allocate every leaf of `other` and copy its active states
    pub fn union_topology(&mut self, other: &VolumeGrid) {
        for (origin, src) in &other.leaves {
            let leaf = self.touch_leaf(*origin);
            for (dst, on) in leaf.active.iter_mut().zip(&src.active) {
                *dst |= *on;
            }
        }
    }
}

/// Named grids executed together
#[derive(Debug, Clone, Default)]
pub struct GridCollection {
    grids: Vec<VolumeGrid>,
}

impl GridCollection {
    /// Empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a grid, replacing any grid with the same name
    pub fn insert(&mut self, grid: VolumeGrid) {
        match self.position(grid.name()) {
            Some(i) => self.grids[i] = grid,
            None => self.grids.push(grid),
        }
        debug!(grids = self.grids.len(), "inserted grid");
    }

    /// Index of grid `name`
    pub fn position(&self, name: &str) -> Option<usize> {
        self.grids.iter().position(|g| g.name() == name)
    }

    /// Grid `name`
    pub fn get(&self, name: &str) -> Option<&VolumeGrid> {
        self.grids.iter().find(|g| g.name() == name)
    }

    /// Mutable grid `name`
    pub fn get_mut(&mut self, name: &str) -> Option<&mut VolumeGrid> {
        self.grids.iter_mut().find(|g| g.name() == name)
    }

    /// Remove and return grid `name`
    pub fn remove(&mut self, name: &str) -> Option<VolumeGrid> {
        self.position(name).map(|i| self.grids.remove(i))
    }

    /// Grid names in insertion order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.grids.iter().map(VolumeGrid::name)
    }

    /// All grids
    pub fn grids(&self) -> &[VolumeGrid] {
        &self.grids
    }

    /// Grid `i` borrowed mutably, every other grid shared, by collection index
    pub(crate) fn split_at(&mut self, i: usize) -> Option<(&mut VolumeGrid, Vec<Option<&VolumeGrid>>)> {
        if i >= self.grids.len() {
            return None;
        }
        let (left, rest) = self.grids.split_at_mut(i);
        let (target, right) = rest.split_first_mut()?;
        let left: &[VolumeGrid] = left;
        let right: &[VolumeGrid] = right;
        let mut others: Vec<Option<&VolumeGrid>> = left.iter().map(Some).collect();
        others.push(None);
        others.extend(right.iter().map(Some));
        Some((target, others))
    }

    /// Number of grids
    pub fn len(&self) -> usize {
        self.grids.len()
    }

    /// True when no grid is stored
    pub fn is_empty(&self) -> bool {
        self.grids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_origin_negative() {
        assert_eq!(leaf_origin([-1, 0, 9]), [-8, 0, 8]);
        let leaf = VolumeLeaf::new([-8, 0, 8], &[Word::F32(0.0)]);
        assert_eq!(leaf.coord(offset([-1, 0, 9])), [-1, 0, 9]);
    }

    #[test]
    fn test_get_set_background() {
        let mut grid = VolumeGrid::new("d", Type::FLOAT)
            .unwrap()
            .with_background(&[Word::F32(-1.0)])
            .unwrap();
        assert_eq!(grid.get([100, 0, 0]), &[Word::F32(-1.0)]);
        grid.set([1, 2, 3], &[Word::I32(4)]).unwrap();
        assert_eq!(grid.get([1, 2, 3]), &[Word::F32(4.0)]);
        assert_eq!(grid.get([1, 2, 4]), &[Word::F32(-1.0)]);
        assert!(grid.is_active([1, 2, 3]));
        assert_eq!(grid.active_voxel_count(), 1);
        assert_eq!(grid.leaf_count(), 1);
    }

    #[test]
    fn test_string_grid_rejected() {
        assert!(VolumeGrid::new("s", Type::String).is_err());
    }

    #[test]
    fn test_collection_replace() {
        let mut grids = GridCollection::new();
        grids.insert(VolumeGrid::new("a", Type::FLOAT).unwrap());
        grids.insert(VolumeGrid::new("a", Type::INT32).unwrap());
        assert_eq!(grids.len(), 1);
        assert_eq!(grids.get("a").map(VolumeGrid::ty), Some(Type::INT32));
    }

    #[test]
    fn test_union_topology() {
        let mut a = VolumeGrid::new("a", Type::FLOAT).unwrap();
        a.set([0, 0, 0], &[Word::F32(1.0)]).unwrap();
        a.set([20, 0, 0], &[Word::F32(1.0)]).unwrap();
        let mut b = VolumeGrid::new("b", Type::FLOAT).unwrap();
        b.union_topology(&a);
        assert_eq!(b.leaf_count(), 2);
        assert_eq!(b.active_voxel_count(), 2);
        assert_eq!(b.get([0, 0, 0]), &[Word::F32(0.0)]);
    }
}
