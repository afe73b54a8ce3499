//! Runtime representation shared by the JIT, the native builtins and the
//! execution engines: register words, kernel memory and the environment
//! traits through which kernels reach bound data.

mod memory;
mod value;

pub use memory::{Memory, SlotType};
pub use value::{Ptr, Word};

use crate::compiler::custom_data::CustomValue;
use crate::error::Result;

/// Data a running kernel can reach through opaque handles
///
/// Each execution engine implements this for the per-leaf state it binds.
/// Domain builtins reach the point or voxel view through [`KernelEnv::points`]
/// and [`KernelEnv::voxels`]; a builtin called from the wrong domain sees
/// `None` and fails.
pub trait KernelEnv {
    /// External value bound to `handle`, `None` when the data is missing
    fn external(&self, _handle: u32) -> Option<&CustomValue> {
        None
    }

    /// Point view of the environment
    fn points(&mut self) -> Option<&mut dyn PointAccess> {
        None
    }

    /// Voxel view of the environment
    fn voxels(&mut self) -> Option<&mut dyn VoxelAccess> {
        None
    }
}

/// Per-leaf access used by point kernels
pub trait PointAccess {
    /// Select the point the following accesses refer to
    fn enter(&mut self, index: usize);

    /// Leaf-local index of the current point
    fn index(&self) -> usize;

    /// Elements of a numeric attribute for the current point
    fn get(&self, handle: u32) -> Result<&[Word]>;

    /// Overwrite a numeric attribute of the current point
    fn set(&mut self, handle: u32, values: &[Word]) -> Result<()>;

    /// String attribute of the current point
    fn get_string(&self, handle: u32) -> Result<&str>;

    /// Overwrite a string attribute of the current point
    fn set_string(&mut self, handle: u32, value: &str) -> Result<()>;

    /// Position of the current point, including staged edits
    fn position(&self) -> Result<&[Word]>;

    /// Stage a new position for the current point
    fn stage_position(&mut self, values: &[Word]) -> Result<()>;

    /// Membership test
    fn in_group(&self, name: &str) -> bool;

    /// Add the current point to a group, creating it on merge if needed
    fn add_to_group(&mut self, name: &str);

    /// Remove the current point from a group
    fn remove_from_group(&mut self, name: &str);

    /// Mark the current point for deletion
    fn delete_point(&mut self);
}

/// Per-leaf access used by volume kernels
pub trait VoxelAccess {
    /// Select the voxel the following accesses refer to
    fn enter(&mut self, coord: [i32; 3]);

    /// Index-space coordinate of the current voxel
    fn coord(&self) -> [i32; 3];

    /// World-space size of one voxel
    fn voxel_size(&self) -> f64;

    /// Value of a grid at the current voxel
    fn get(&self, handle: u32) -> Result<&[Word]>;

    /// Write a grid at the current voxel; grids outside the current pass ignore writes
    fn set(&mut self, handle: u32, values: &[Word]) -> Result<()>;
}

/// Environment with nothing bound; used when probing pure functions
#[derive(Debug, Default)]
pub struct NullEnv;

impl KernelEnv for NullEnv {}
