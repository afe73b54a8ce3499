//! Volume execution
//!
//! Every grid the program writes gets its own pass over its own leaves.
//! Within a pass only that grid is mutable; reads of the other grids go
//! through leaves resolved once per leaf, or through a copy taken before the
//! first pass when a grid is both written and read to compute another grid.

use super::executor::parallel_map;
use super::{bind_externals, handle_arrays, ExecutionOptions, ExecutionStats, VoxelIteration};
use crate::compiler::custom_data::CustomValue;
use crate::compiler::Executable;
use crate::data::volumes::LEAF_VOXELS;
use crate::data::{GridCollection, VolumeGrid, VolumeLeaf};
use crate::error::{Error, Result};
use crate::runtime::{KernelEnv, Memory, VoxelAccess, Word};
use std::collections::HashMap;
use tracing::{debug, info, trace};

/// Resolve every compiled grid access to a collection index
fn bind_grids(
    exe: &Executable,
    grids: &mut GridCollection,
    create_missing: bool,
    created: &mut Vec<String>,
) -> Result<Vec<usize>> {
    let mut missing = Vec::new();
    for entry in exe.access().attributes() {
        match grids.get(&entry.name) {
            Some(grid) if grid.ty() != entry.ty => {
                return Err(Error::TypeMismatch {
                    name: entry.name.clone(),
                    expected: entry.ty.to_string(),
                    actual: grid.ty().to_string(),
                })
            }
            Some(_) => {}
            None if create_missing => missing.push(entry),
            None => {
                return Err(Error::Lookup {
                    name: entry.name.clone(),
                    kind: "grid".to_string(),
                })
            }
        }
    }

    if !missing.is_empty() {
        let existing: Vec<&VolumeGrid> = exe
            .access()
            .attributes()
            .iter()
            .filter_map(|e| grids.get(&e.name))
            .collect();
        let voxel_size = existing.first().map(|g| g.voxel_size()).unwrap_or(1.0);
        let mut new_grids = Vec::with_capacity(missing.len());
        for entry in missing {
            let mut grid = VolumeGrid::new(&entry.name, entry.ty)?.with_voxel_size(voxel_size);
            for other in &existing {
                grid.union_topology(other);
            }
            debug!(name = %entry.name, leaves = grid.leaf_count(), "created grid");
            created.push(entry.name.clone());
            new_grids.push(grid);
        }
        for grid in new_grids {
            grids.insert(grid);
        }
    }

    exe.access()
        .attributes()
        .iter()
        .map(|e| {
            grids.position(&e.name).ok_or_else(|| Error::Lookup {
                name: e.name.clone(),
                kind: "grid".to_string(),
            })
        })
        .collect()
}

/// Read-only view of a grid other than the one being written
#[derive(Clone, Copy)]
struct Source<'a> {
    grid: &'a VolumeGrid,
}

impl<'a> Source<'a> {
    /// Leaf sharing `origin`, or the background for unallocated regions
    fn at(&self, origin: [i32; 3]) -> Cached<'a> {
        match self.grid.leaf(origin) {
            Some(leaf) => Cached::Leaf(leaf),
            None => Cached::Background(self.grid.background()),
        }
    }
}

enum Cached<'a> {
    Written,
    Leaf(&'a VolumeLeaf),
    Background(&'a [Word]),
}

/// Kernel environment of one leaf of the written grid
///
/// Writes to grids outside the pass are kept for the current voxel only, so
/// later reads in the same invocation observe them.
struct VoxelEnv<'a> {
    leaf: &'a mut VolumeLeaf,
    handles: Vec<Cached<'a>>,
    pending: Vec<Vec<Word>>,
    externals: &'a [Option<&'a CustomValue>],
    voxel_size: f64,
    current: [i32; 3],
}

impl KernelEnv for VoxelEnv<'_> {
    fn external(&self, handle: u32) -> Option<&CustomValue> {
        self.externals.get(handle as usize).copied().flatten()
    }

    fn voxels(&mut self) -> Option<&mut dyn VoxelAccess> {
        Some(self)
    }
}

impl VoxelAccess for VoxelEnv<'_> {
    fn enter(&mut self, coord: [i32; 3]) {
        self.current = coord;
        for values in &mut self.pending {
            values.clear();
        }
    }

    fn coord(&self) -> [i32; 3] {
        self.current
    }

    fn voxel_size(&self) -> f64 {
        self.voxel_size
    }

    fn get(&self, handle: u32) -> Result<&[Word]> {
        if let Some(values) = self.pending.get(handle as usize).filter(|v| !v.is_empty()) {
            return Ok(values);
        }
        match self.handles.get(handle as usize) {
            Some(Cached::Written) => Ok(self.leaf.get(self.current)),
            Some(Cached::Leaf(leaf)) => Ok(leaf.get(self.current)),
            Some(Cached::Background(values)) => Ok(values),
            None => Err(Error::execution(format!("invalid grid handle {}", handle))),
        }
    }

    fn set(&mut self, handle: u32, values: &[Word]) -> Result<()> {
        match self.handles.get(handle as usize) {
            Some(Cached::Written) => {
                self.leaf.set(self.current, values);
                self.leaf.set_active(self.current, true);
                Ok(())
            }
            Some(_) => {
                let pending = &mut self.pending[handle as usize];
                pending.clear();
                pending.extend_from_slice(values);
                Ok(())
            }
            None => Err(Error::execution(format!("invalid grid handle {}", handle))),
        }
    }
}

fn visits(iteration: VoxelIteration, active: bool) -> bool {
    match iteration {
        VoxelIteration::Active => active,
        VoxelIteration::Inactive => !active,
        VoxelIteration::All => true,
    }
}

/// Run the voxel kernel over one leaf; returns the voxels visited
fn run_leaf(
    exe: &Executable,
    leaf: &mut VolumeLeaf,
    written: u32,
    sources: &[Option<Source<'_>>],
    externals: &[Option<&CustomValue>],
    voxel_size: f64,
    iteration: VoxelIteration,
) -> Result<usize> {
    let origin = leaf.origin();
    let selected: Vec<usize> = (0..LEAF_VOXELS)
        .filter(|n| visits(iteration, leaf.is_active(*n)))
        .collect();
    if selected.is_empty() {
        return Ok(0);
    }

    let mut handles = Vec::with_capacity(sources.len());
    for (h, source) in sources.iter().enumerate() {
        handles.push(match source {
            _ if h as u32 == written => Cached::Written,
            Some(source) => source.at(origin),
            None => return Err(Error::execution(format!("grid handle {} is unbound", h))),
        });
    }

    let mut memory = Memory::new();
    let (h, e) = handle_arrays(&mut memory, sources.len(), externals.len());
    let mut env = VoxelEnv {
        leaf,
        pending: vec![Vec::new(); handles.len()],
        handles,
        externals,
        voxel_size,
        current: origin,
    };
    let engine = exe.engine();
    for n in &selected {
        let [x, y, z] = env.leaf.coord(*n);
        let args = [h, e, Word::I32(x), Word::I32(y), Word::I32(z)];
        engine.call(exe.element_kernel(), &args, &mut memory, &mut env)?;
    }
    trace!(?origin, voxels = selected.len(), "ran volume leaf");
    Ok(selected.len())
}

/// Execute a volume executable over `grids`
pub fn execute(
    exe: &Executable,
    grids: &mut GridCollection,
    options: &ExecutionOptions,
) -> Result<ExecutionStats> {
    let mut stats = ExecutionStats::default();
    let bound = bind_grids(exe, grids, options.create_missing, &mut stats.created)?;
    let externals = bind_externals(exe.access(), exe.custom_data())?;

    // grids written in one pass and read to compute another keep their
    // pre-execution values for every other pass
    let mut snapshots: HashMap<usize, VolumeGrid> = HashMap::new();
    for (entry, index) in exe.access().attributes().iter().zip(&bound) {
        if entry.writes && entry.affects_others {
            if let Some(grid) = grids.grids().get(*index) {
                snapshots.insert(*index, grid.clone());
            }
        }
    }

    let passes: Vec<(u32, usize)> = exe
        .access()
        .attributes()
        .iter()
        .zip(&bound)
        .enumerate()
        .filter(|(_, (entry, _))| entry.writes)
        .map(|(h, (_, index))| (h as u32, *index))
        .collect();
    info!(
        grids = grids.len(),
        passes = passes.len(),
        snapshots = snapshots.len(),
        iteration = ?options.iteration,
        "executing volume kernel"
    );

    let config = options.parallel();
    for (written, index) in passes {
        let (target, others) = grids
            .split_at(index)
            .ok_or_else(|| Error::execution(format!("grid index {} out of range", index)))?;
        let sources: Vec<Option<Source<'_>>> = bound
            .iter()
            .map(|i| {
                snapshots
                    .get(i)
                    .or_else(|| others.get(*i).copied().flatten())
                    .map(|grid| Source { grid })
            })
            .collect();
        let voxel_size = target.voxel_size();
        let name = target.name().to_string();
        let leaves: Vec<&mut VolumeLeaf> = target.leaves_mut().collect();
        stats.leaves += leaves.len();
        let counts = parallel_map(
            leaves,
            |leaf| {
                run_leaf(
                    exe,
                    leaf,
                    written,
                    &sources,
                    &externals,
                    voxel_size,
                    options.iteration,
                )
            },
            &config,
        )?;
        let voxels: usize = counts.iter().sum();
        stats.elements += voxels;
        debug!(grid = %name, voxels, "finished volume pass");
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, CustomData, Target};
    use crate::types::Type;

    fn run(source: &str, grids: &mut GridCollection, options: &ExecutionOptions) -> Result<ExecutionStats> {
        Compiler::default()
            .compile_source(source, Target::Volumes)?
            .execute_volumes(grids, options)
    }

    fn density() -> GridCollection {
        let mut grid = VolumeGrid::new("density", Type::FLOAT).unwrap();
        grid.set([0, 0, 0], &[Word::F32(1.0)]).unwrap();
        grid.set([1, 0, 0], &[Word::F32(2.0)]).unwrap();
        grid.set([20, 0, 0], &[Word::F32(3.0)]).unwrap();
        let mut grids = GridCollection::new();
        grids.insert(grid);
        grids
    }

    #[test]
    fn test_active_voxels_written() {
        let mut grids = density();
        let stats = run("f@density *= 2.0f;", &mut grids, &ExecutionOptions::default()).unwrap();
        assert_eq!(stats.elements, 3);
        assert_eq!(stats.leaves, 2);
        let grid = grids.get("density").unwrap();
        assert_eq!(grid.get([1, 0, 0]), &[Word::F32(4.0)]);
        assert_eq!(grid.get([20, 0, 0]), &[Word::F32(6.0)]);
        assert_eq!(grid.get([2, 0, 0]), &[Word::F32(0.0)]);
    }

    #[test]
    fn test_iteration_modes() {
        let mut grids = density();
        let inactive = ExecutionOptions {
            iteration: VoxelIteration::Inactive,
            ..ExecutionOptions::default()
        };
        let stats = run("f@density = 5.0f;", &mut grids, &inactive).unwrap();
        assert_eq!(stats.elements, 2 * LEAF_VOXELS - 3);
        let grid = grids.get("density").unwrap();
        assert_eq!(grid.get([0, 0, 0]), &[Word::F32(1.0)]);
        assert_eq!(grid.get([2, 0, 0]), &[Word::F32(5.0)]);

        let all = ExecutionOptions {
            iteration: VoxelIteration::All,
            ..ExecutionOptions::default()
        };
        let stats = run("f@density = 0.0f;", &mut grids, &all).unwrap();
        assert_eq!(stats.elements, 2 * LEAF_VOXELS);
    }

    #[test]
    fn test_created_grid_takes_union_topology() {
        let mut grids = density();
        let stats = run(
            "f@copy = f@density + float(getcoordx());",
            &mut grids,
            &ExecutionOptions::default(),
        )
        .unwrap();
        assert_eq!(stats.created, vec!["copy".to_string()]);
        let copy = grids.get("copy").unwrap();
        assert_eq!(copy.active_voxel_count(), 3);
        assert_eq!(copy.get([1, 0, 0]), &[Word::F32(3.0)]);
        assert_eq!(copy.get([20, 0, 0]), &[Word::F32(23.0)]);
        // read-only grid untouched
        assert_eq!(grids.get("density").unwrap().get([1, 0, 0]), &[Word::F32(2.0)]);
    }

    #[test]
    fn test_missing_grid_without_create() {
        let mut grids = density();
        let options = ExecutionOptions {
            create_missing: false,
            ..ExecutionOptions::default()
        };
        assert!(matches!(
            run("f@other = 1.0f;", &mut grids, &options),
            Err(Error::Lookup { .. })
        ));
    }

    #[test]
    fn test_grid_type_mismatch() {
        let mut grids = density();
        assert!(matches!(
            run("i@density = 1;", &mut grids, &ExecutionOptions::default()),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_cross_reads_see_original_values() {
        let mut grids = density();
        let mut b = VolumeGrid::new("b", Type::FLOAT).unwrap();
        b.union_topology(grids.get("density").unwrap());
        grids.insert(b);
        run(
            "f@b = f@density; f@density = 10.0f;",
            &mut grids,
            &ExecutionOptions::default(),
        )
        .unwrap();
        assert_eq!(grids.get("density").unwrap().get([0, 0, 0]), &[Word::F32(10.0)]);
        assert_eq!(grids.get("b").unwrap().get([0, 0, 0]), &[Word::F32(1.0)]);
    }

    #[test]
    fn test_reads_after_write_in_same_voxel() {
        let mut grids = density();
        let mut b = VolumeGrid::new("b", Type::FLOAT).unwrap();
        b.union_topology(grids.get("density").unwrap());
        grids.insert(b);
        run(
            "f@density = 10.0f; f@b = f@density + 1.0f;",
            &mut grids,
            &ExecutionOptions::default(),
        )
        .unwrap();
        assert_eq!(grids.get("b").unwrap().get([20, 0, 0]), &[Word::F32(11.0)]);
    }

    #[test]
    fn test_externals_read() {
        let mut grids = density();
        let mut data = CustomData::new();
        data.insert("scale", CustomValue::Float(3.0));
        let exe = Compiler::default()
            .compile_source("f@density *= $scale;", Target::Volumes)
            .unwrap()
            .with_custom_data(data);
        exe.execute_volumes(&mut grids, &ExecutionOptions::default()).unwrap();
        assert_eq!(grids.get("density").unwrap().get([0, 0, 0]), &[Word::F32(3.0)]);
    }
}
