//! # vdbax - an expression language for sparse points and volumes
//!
//! Small C-like kernels that read and write per-point attributes or
//! per-voxel grid values. Programs are compiled once into an executable and
//! run in parallel, leaf by leaf, over any number of data sets.
//!
//! ## Quick Start
//!
//! ```rust
//! use vdbax::{Compiler, ExecutionOptions, PointDataGrid, Target};
//!
//! # fn main() -> vdbax::Result<()> {
//! let mut points = PointDataGrid::from_positions(1.0, &[[0.0, 1.0, 0.0], [9.0, 2.0, 0.0]]);
//!
//! let exe = Compiler::default().compile_source(
//!     "f@height = @P.y * 2.0f; if (@height > 3.0f) addtogroup(\"tall\");",
//!     Target::Points,
//! )?;
//! exe.execute_points(&mut points, &ExecutionOptions::default())?;
//!
//! assert_eq!(points.group_count("tall"), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//!
//! ```text
//! source ─▶ lexer ─▶ parser ─▶ Tree ─▶ compiler ─▶ Executable ─▶ parallel ─▶ data
//!                                     (IR + JIT)                (per leaf)
//! ```
//!
//! - [`lexer`] / [`parser`]: text to [`parser::Tree`]
//! - [`compiler`]: typing, access registry, IR generation, optimization,
//!   verification and the Cranelift JIT
//! - [`parallel`]: leaf-parallel execution over [`data`]
//!
//! ## Diagnostics
//!
//! Compilation collects errors and warnings in a [`compiler::Logger`] and
//! fails with [`Error::Compilation`] listing them. Logging goes through
//! `tracing`; install any subscriber to see it.

#![allow(clippy::too_many_arguments)] // leaf runners take the whole binding
#![allow(clippy::needless_range_loop)] // index needed for handle lookups

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod compiler;
pub mod data;
pub mod error;
pub mod lexer;
pub mod parallel;
pub mod parser;
pub mod runtime;
pub mod types;

// Re-export main types
pub use compiler::{
    Compiler, CompilerOptions, CustomData, CustomValue, Executable, FunctionRegistry, OptLevel,
    Target,
};
pub use data::{GridCollection, PointDataGrid, VolumeGrid};
pub use error::{Error, ErrorSeverity, Result};
pub use parallel::{ExecutionOptions, ExecutionStats, VoxelIteration};
pub use parser::{parse, Tree};
pub use types::{ScalarKind, Type};
