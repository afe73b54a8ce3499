//! Parallel execution of compiled kernels over leaves
//!
//! Points run in two phases: a parallel phase where every leaf runs the
//! kernel over its own points and stages shared-metadata changes in a
//! [`LeafScratch`], then a serial merge phase that applies them. Volumes run
//! one pass per written grid over that grid's leaves.

mod executor;
pub mod points;
mod scratch;
pub mod volumes;

pub use executor::{parallel_map, ParallelConfig};
pub use scratch::LeafScratch;

use crate::compiler::attribute_registry::AttributeRegistry;
use crate::compiler::custom_data::{CustomData, CustomValue};
use crate::error::{Error, Result};
use crate::runtime::{Memory, Ptr, Word};
use serde::{Deserialize, Serialize};

/// Which voxels of the allocated leaves a volume pass visits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VoxelIteration {
    /// Active voxels only
    #[default]
    Active,
    /// Inactive voxels only
    Inactive,
    /// Every voxel
    All,
}

/// Options of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Create missing attributes or grids instead of failing
    pub create_missing: bool,
    /// Only run points in this group (points only)
    pub group: Option<String>,
    /// Voxels visited (volumes only)
    pub iteration: VoxelIteration,
    /// Maximum worker threads
    pub max_parallelism: usize,
    /// Minimum leaves per work item
    pub grain_size: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            create_missing: true,
            group: None,
            iteration: VoxelIteration::Active,
            max_parallelism: num_cpus::get(),
            grain_size: 1,
        }
    }
}

impl ExecutionOptions {
    fn parallel(&self) -> ParallelConfig {
        ParallelConfig {
            max_parallelism: self.max_parallelism.max(1),
            grain_size: self.grain_size.max(1),
        }
    }
}

/// Summary of one execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Leaves processed
    pub leaves: usize,
    /// Kernel invocations (points or voxels)
    pub elements: usize,
    /// Attributes or grids created because they were missing
    pub created: Vec<String>,
    /// Groups created during the merge
    pub new_groups: Vec<String>,
    /// Points removed by `deletepoint`
    pub deleted: usize,
    /// Points moved to another leaf
    pub migrated: usize,
}

/// Custom data value for every external, by external index
///
/// Missing values read as zero; a value of the wrong type is an error.
fn bind_externals<'a>(
    access: &AttributeRegistry,
    data: Option<&'a CustomData>,
) -> Result<Vec<Option<&'a CustomValue>>> {
    access
        .externals()
        .iter()
        .map(|entry| {
            let value = data.and_then(|d| d.get(&entry.name));
            match value {
                Some(v) if v.ty() != entry.ty => Err(Error::TypeMismatch {
                    name: entry.name.clone(),
                    expected: entry.ty.to_string(),
                    actual: v.ty().to_string(),
                }),
                other => Ok(other),
            }
        })
        .collect()
}

/// Allocate the handle arrays a kernel indexes: (attributes, externals)
fn handle_arrays(memory: &mut Memory, attributes: usize, externals: usize) -> (Word, Word) {
    let words = |n: usize| (0..n as u32).map(Word::Handle).collect::<Vec<_>>();
    let h: Ptr = memory.alloc_words(&words(attributes));
    let e: Ptr = memory.alloc_words(&words(externals));
    (Word::Ptr(h), Word::Ptr(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, Target};

    #[test]
    fn test_bind_externals() {
        let exe = Compiler::default()
            .compile_source("@a = $x + $y;", Target::Points)
            .unwrap();
        let mut data = CustomData::new();
        data.insert("x", CustomValue::Float(1.0));
        let bound = bind_externals(exe.access(), Some(&data)).unwrap();
        assert!(bound[0].is_some());
        assert!(bound[1].is_none());

        data.insert("y", CustomValue::Int32(1));
        assert!(matches!(
            bind_externals(exe.access(), Some(&data)),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_handle_arrays() {
        let mut memory = Memory::new();
        let (h, e) = handle_arrays(&mut memory, 2, 1);
        let h = h.as_ptr().unwrap();
        assert_eq!(memory.load(h.offset(1)).unwrap(), Word::Handle(1));
        assert_eq!(memory.load(e.as_ptr().unwrap()).unwrap(), Word::Handle(0));
    }

    #[test]
    fn test_options_serde() {
        let options = ExecutionOptions {
            group: Some("g".into()),
            iteration: VoxelIteration::All,
            ..ExecutionOptions::default()
        };
        let json = serde_json::to_string(&options).unwrap();
        assert_eq!(serde_json::from_str::<ExecutionOptions>(&json).unwrap(), options);
    }
}
