//! Minimal sparse containers the executors bind to
//!
//! Both containers partition their data into independent leaves, which is
//! the unit of parallel work.

pub mod points;
pub mod volumes;

pub use points::{PointDataGrid, PointLeaf, StringTable};
pub use volumes::{GridCollection, VolumeGrid, VolumeLeaf};
