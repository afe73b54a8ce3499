//! Two-phase point execution
//!
//! ```text
//! bind ──▶ parallel phase (one worker per leaf) ──▶ merge phase (serial)
//!          writes numeric attributes in place        creates new groups once
//!          stages strings, groups, P, deletions      interns strings, applies P
//!                                                    deletes, migrates
//! ```

use super::executor::parallel_map;
use super::scratch::LeafScratch;
use super::{bind_externals, handle_arrays, ExecutionOptions, ExecutionStats};
use crate::compiler::custom_data::CustomValue;
use crate::compiler::default_types::POSITION;
use crate::compiler::Executable;
use crate::data::{PointDataGrid, PointLeaf, StringTable};
use crate::error::{Error, Result};
use crate::runtime::{KernelEnv, Memory, PointAccess, Word};
use crate::types::{ScalarKind, Type};
use std::collections::BTreeSet;
use tracing::{debug, info, trace};

/// Resolve every compiled attribute to a grid column, creating missing ones
fn bind_attributes(
    exe: &Executable,
    grid: &mut PointDataGrid,
    create_missing: bool,
    created: &mut Vec<String>,
) -> Result<Vec<usize>> {
    let mut columns = Vec::with_capacity(exe.access().attributes().len());
    for entry in exe.access().attributes() {
        let column = match grid.attribute_type(&entry.name) {
            Some(ty) if ty != entry.ty => {
                return Err(Error::TypeMismatch {
                    name: entry.name.clone(),
                    expected: entry.ty.to_string(),
                    actual: ty.to_string(),
                })
            }
            Some(_) => grid.attribute_index(&entry.name),
            None if create_missing => {
                created.push(entry.name.clone());
                Some(grid.add_attribute(&entry.name, entry.ty)?)
            }
            None => None,
        };
        let column = column.ok_or_else(|| Error::Lookup {
            name: entry.name.clone(),
            kind: "attribute".to_string(),
        })?;
        columns.push(column);
    }
    Ok(columns)
}

/// Kernel environment of one leaf
struct PointEnv<'a> {
    leaf: &'a mut PointLeaf,
    columns: &'a [usize],
    strings: &'a StringTable,
    groups: &'a [String],
    externals: &'a [Option<&'a CustomValue>],
    scratch: LeafScratch,
    current: usize,
}

impl PointEnv<'_> {
    fn column(&self, handle: u32) -> Result<usize> {
        self.columns
            .get(handle as usize)
            .copied()
            .ok_or_else(|| Error::execution(format!("invalid attribute handle {}", handle)))
    }
}

impl KernelEnv for PointEnv<'_> {
    fn external(&self, handle: u32) -> Option<&CustomValue> {
        self.externals.get(handle as usize).copied().flatten()
    }

    fn points(&mut self) -> Option<&mut dyn PointAccess> {
        Some(self)
    }
}

impl PointAccess for PointEnv<'_> {
    fn enter(&mut self, index: usize) {
        self.current = index;
    }

    fn index(&self) -> usize {
        self.current
    }

    fn get(&self, handle: u32) -> Result<&[Word]> {
        let column = self.column(handle)?;
        self.leaf
            .values(column, self.current)
            .ok_or_else(|| Error::execution(format!("point {} out of range", self.current)))
    }

    fn set(&mut self, handle: u32, values: &[Word]) -> Result<()> {
        let column = self.column(handle)?;
        let dst = self
            .leaf
            .values_mut(column, self.current)
            .ok_or_else(|| Error::execution(format!("point {} out of range", self.current)))?;
        for (d, v) in dst.iter_mut().zip(values) {
            *d = *v;
        }
        Ok(())
    }

    fn get_string(&self, handle: u32) -> Result<&str> {
        let column = self.column(handle)?;
        if let Some(s) = self.scratch.string(column, self.current) {
            return Ok(s);
        }
        let index = self
            .leaf
            .values(column, self.current)
            .and_then(|v| v.first())
            .map(Word::as_i64)
            .unwrap_or(0);
        Ok(self.strings.get(index).unwrap_or(""))
    }

    fn set_string(&mut self, handle: u32, value: &str) -> Result<()> {
        let column = self.column(handle)?;
        match self.strings.lookup(value) {
            Some(index) => {
                self.scratch.clear_string(column, self.current);
                if let Some(dst) = self.leaf.values_mut(column, self.current) {
                    dst[0] = Word::I64(index);
                }
            }
            None => self
                .scratch
                .stage_string(column, self.current, value.to_string()),
        }
        Ok(())
    }

    fn position(&self) -> Result<&[Word]> {
        if let Some(p) = self.scratch.position(self.current) {
            return Ok(p);
        }
        self.leaf
            .values(0, self.current)
            .ok_or_else(|| Error::execution(format!("point {} out of range", self.current)))
    }

    fn stage_position(&mut self, values: &[Word]) -> Result<()> {
        let component = |i: usize| {
            values
                .get(i)
                .map(|w| w.cast(ScalarKind::Float))
                .unwrap_or(Word::F32(0.0))
        };
        let p = [component(0), component(1), component(2)];
        self.scratch.stage_position(self.leaf.len(), self.current, p);
        Ok(())
    }

    fn in_group(&self, name: &str) -> bool {
        match self.groups.iter().position(|g| g == name) {
            Some(g) => self.leaf.in_group(g, self.current),
            None => self.scratch.in_new_group(name, self.current),
        }
    }

    fn add_to_group(&mut self, name: &str) {
        match self.groups.iter().position(|g| g == name) {
            Some(g) => self.leaf.set_group(g, self.current, true),
            None => self.scratch.add_to_new_group(name, self.current),
        }
    }

    fn remove_from_group(&mut self, name: &str) {
        match self.groups.iter().position(|g| g == name) {
            Some(g) => self.leaf.set_group(g, self.current, false),
            None => self.scratch.remove_from_new_group(name, self.current),
        }
    }

    fn delete_point(&mut self) {
        self.scratch.delete(self.current);
    }
}

/// Run the kernel over one leaf and hand back its scratch
fn run_leaf(
    exe: &Executable,
    leaf: &mut PointLeaf,
    columns: &[usize],
    strings: &StringTable,
    groups: &[String],
    externals: &[Option<&CustomValue>],
    filter: Option<usize>,
) -> Result<(LeafScratch, usize)> {
    let len = leaf.len();
    let members: Option<Vec<usize>> =
        filter.map(|g| (0..len).filter(|i| leaf.in_group(g, *i)).collect());

    let mut memory = Memory::new();
    let (handles, ext) = handle_arrays(&mut memory, columns.len(), externals.len());
    let mut env = PointEnv {
        leaf,
        columns,
        strings,
        groups,
        externals,
        scratch: LeafScratch::new(),
        current: 0,
    };

    let engine = exe.engine();
    let count = match (&members, exe.range_kernel()) {
        (None, Some(range)) => {
            let args = [handles, ext, Word::I64(0), Word::I64(len as i64)];
            engine.call(range, &args, &mut memory, &mut env)?;
            len
        }
        (None, None) => {
            for i in 0..len {
                let args = [handles, ext, Word::I64(i as i64)];
                engine.call(exe.element_kernel(), &args, &mut memory, &mut env)?;
            }
            len
        }
        (Some(members), _) => {
            for i in members {
                let args = [handles, ext, Word::I64(*i as i64)];
                engine.call(exe.element_kernel(), &args, &mut memory, &mut env)?;
            }
            members.len()
        }
    };
    trace!(coord = ?env.leaf.coord(), points = count, "ran point leaf");
    Ok((env.scratch, count))
}

/// Apply every leaf's scratch; returns whether any position changed
fn merge(
    grid: &mut PointDataGrid,
    scratches: Vec<LeafScratch>,
    stats: &mut ExecutionStats,
) -> bool {
    let names: BTreeSet<&String> = scratches.iter().flat_map(|s| s.new_groups().keys()).collect();
    for name in names {
        if grid.group_index(name).is_none() {
            stats.new_groups.push(name.clone());
        }
        grid.add_group(name);
    }

    let mut moved = false;
    for (leaf_index, scratch) in scratches.iter().enumerate() {
        if scratch.is_empty() {
            continue;
        }
        for ((column, i), value) in scratch.strings() {
            let index = grid.strings_mut().intern(value);
            if let Some(dst) = grid.leaves_mut()[leaf_index].values_mut(*column, *i) {
                dst[0] = Word::I64(index);
            }
        }
        for (name, members) in scratch.new_groups() {
            if let Some(g) = grid.group_index(name) {
                for i in members {
                    grid.leaves_mut()[leaf_index].set_group(g, *i, true);
                }
            }
        }
        if let Some(positions) = scratch.positions() {
            let leaf = &mut grid.leaves_mut()[leaf_index];
            for (i, p) in positions.iter().enumerate() {
                if let (Some(p), Some(dst)) = (p, leaf.values_mut(0, i)) {
                    dst.copy_from_slice(p);
                    moved = true;
                }
            }
        }
        if !scratch.deleted().is_empty() {
            let leaf = &mut grid.leaves_mut()[leaf_index];
            let keep: Vec<bool> = (0..leaf.len()).map(|i| !scratch.deleted().contains(&i)).collect();
            stats.deleted += leaf.retain(&keep);
        }
    }
    moved
}

/// Execute a point executable over `grid`
pub fn execute(
    exe: &Executable,
    grid: &mut PointDataGrid,
    options: &ExecutionOptions,
) -> Result<ExecutionStats> {
    let mut stats = ExecutionStats::default();
    let position_type = Type::vec(ScalarKind::Float, 3);
    if let Some(p) = exe.access().attribute(POSITION) {
        if p.ty != position_type {
            return Err(Error::TypeMismatch {
                name: POSITION.to_string(),
                expected: p.ty.to_string(),
                actual: position_type.to_string(),
            });
        }
    }

    let columns = bind_attributes(exe, grid, options.create_missing, &mut stats.created)?;
    let externals = bind_externals(exe.access(), exe.custom_data())?;
    let filter = match &options.group {
        Some(name) => Some(grid.group_index(name).ok_or_else(|| Error::Lookup {
            name: name.clone(),
            kind: "group".to_string(),
        })?),
        None => None,
    };
    info!(
        leaves = grid.leaf_count(),
        points = grid.point_count(),
        group = ?options.group,
        "executing point kernel"
    );

    let (leaves, strings, groups) = grid.split_mut();
    stats.leaves = leaves.len();
    let items: Vec<&mut PointLeaf> = leaves.iter_mut().collect();
    let results = parallel_map(
        items,
        |leaf| run_leaf(exe, leaf, &columns, strings, groups, &externals, filter),
        &options.parallel(),
    )?;

    let mut scratches = Vec::with_capacity(results.len());
    for (scratch, count) in results {
        stats.elements += count;
        scratches.push(scratch);
    }

    if merge(grid, scratches, &mut stats) {
        stats.migrated = grid.migrate();
    } else if stats.deleted > 0 {
        grid.prune_empty_leaves();
    }
    debug!(
        new_groups = stats.new_groups.len(),
        deleted = stats.deleted,
        migrated = stats.migrated,
        strings = grid.strings().len(),
        "merged point leaves"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, Target};

    fn run(source: &str, grid: &mut PointDataGrid, options: &ExecutionOptions) -> Result<ExecutionStats> {
        Compiler::default()
            .compile_source(source, Target::Points)?
            .execute_points(grid, options)
    }

    fn two_leaves() -> PointDataGrid {
        PointDataGrid::from_positions(1.0, &[[0.5, 0.5, 0.5], [1.5, 0.5, 0.5], [10.0, 0.5, 0.5]])
    }

    #[test]
    fn test_numeric_attribute_write() {
        let mut grid = two_leaves();
        let stats = run("f@a = @P.x * 2.0f;", &mut grid, &ExecutionOptions::default()).unwrap();
        assert_eq!(stats.elements, 3);
        assert_eq!(stats.created, vec!["a".to_string()]);
        let values: Vec<f64> = grid.values("a").unwrap().iter().map(|v| v[0].as_f64()).collect();
        assert_eq!(values, vec![1.0, 3.0, 20.0]);
    }

    #[test]
    fn test_missing_attribute_without_create() {
        let mut grid = two_leaves();
        let options = ExecutionOptions {
            create_missing: false,
            ..ExecutionOptions::default()
        };
        assert!(matches!(
            run("f@a = 1;", &mut grid, &options),
            Err(Error::Lookup { .. })
        ));
    }

    #[test]
    fn test_attribute_type_mismatch() {
        let mut grid = two_leaves();
        grid.add_attribute("a", Type::INT32).unwrap();
        assert!(matches!(
            run("f@a = 1;", &mut grid, &ExecutionOptions::default()),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_new_group_created_once() {
        let mut grid = two_leaves();
        let stats = run("addtogroup(\"new\");", &mut grid, &ExecutionOptions::default()).unwrap();
        assert_eq!(stats.new_groups, vec!["new".to_string()]);
        assert_eq!(grid.groups().iter().filter(|g| *g == "new").count(), 1);
        assert_eq!(grid.group_count("new"), 3);
    }

    #[test]
    fn test_group_filter() {
        let mut grid = two_leaves();
        grid.set_in_group("sel", 1, 0, true).unwrap();
        let options = ExecutionOptions {
            group: Some("sel".into()),
            ..ExecutionOptions::default()
        };
        let stats = run("i@hit = 1;", &mut grid, &options).unwrap();
        assert_eq!(stats.elements, 1);
        let hits: i64 = grid.values("hit").unwrap().iter().map(|v| v[0].as_i64()).sum();
        assert_eq!(hits, 1);

        let missing = ExecutionOptions {
            group: Some("nope".into()),
            ..ExecutionOptions::default()
        };
        assert!(matches!(
            run("i@hit = 1;", &mut grid, &missing),
            Err(Error::Lookup { .. })
        ));
    }

    #[test]
    fn test_new_strings_interned_at_merge() {
        let mut grid = two_leaves();
        run("s@name = \"pt\" + \"x\"; s@copy = s@name;", &mut grid, &ExecutionOptions::default())
            .unwrap();
        assert_eq!(grid.string("name", 0, 0).unwrap(), "ptx");
        assert_eq!(grid.string("copy", 1, 0).unwrap(), "ptx");
        assert_eq!(grid.strings().lookup("ptx"), Some(1));
    }

    #[test]
    fn test_delete_and_migrate() {
        let mut grid = two_leaves();
        let stats = run(
            "if (@P.x > 5.0f) { deletepoint(); } else { @P.x += 8.0f; }",
            &mut grid,
            &ExecutionOptions::default(),
        )
        .unwrap();
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.migrated, 2);
        assert_eq!(grid.point_count(), 2);
        assert_eq!(grid.leaf_count(), 1);
        assert_eq!(grid.leaves()[0].coord(), [1, 0, 0]);
    }

    #[test]
    fn test_position_reads_see_staged_write() {
        let mut grid = two_leaves();
        run("@P = {1.0f, 2.0f, 3.0f}; f@y = @P.y;", &mut grid, &ExecutionOptions::default()).unwrap();
        let ys: Vec<f64> = grid.values("y").unwrap().iter().map(|v| v[0].as_f64()).collect();
        assert_eq!(ys, vec![2.0, 2.0, 2.0]);
        assert_eq!(grid.leaf_count(), 1);
    }

    #[test]
    fn test_single_threaded_matches_parallel() {
        let source = "f@a = sin(@P.x) + float(getpointindex());";
        let mut a = two_leaves();
        let mut b = two_leaves();
        run(source, &mut a, &ExecutionOptions::default()).unwrap();
        let serial = ExecutionOptions {
            max_parallelism: 1,
            ..ExecutionOptions::default()
        };
        run(source, &mut b, &serial).unwrap();
        assert_eq!(a.values("a").unwrap(), b.values("a").unwrap());
    }
}
