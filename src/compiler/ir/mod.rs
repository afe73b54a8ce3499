//! # Intermediate Representation (IR)
//!
//! Kernels are lowered to a small block-structured, register based IR which
//! the optimizer rewrites and the JIT turns into callable code.
//!
//! ## Module Structure
//!
//! ```text
//! ir/
//! ├── mod.rs          # This file - module definition and re-exports
//! ├── instruction.rs  # Reg, BlockId, Inst, Terminator and operator enums
//! ├── program.rs      # BasicBlock, IrFunction, Module (CFG representation)
//! ├── builder.rs      # FunctionBuilder used by the generators and inline builtins
//! └── types.rs        # RegType, CellType and register type inference
//! ```
//!
//! ## Key Types
//!
//! - [`Reg`] - Virtual register, defined exactly once
//! - [`Inst`] - Scalar, memory, call and string instructions
//! - [`Terminator`] - Branches and returns ending each block
//! - [`Module`] - Functions plus the global symbols they reference
//! - [`RegType`] - Machine-level type of a register, used by the JIT
//!
//! Containers and strings live in frame slots created with `Alloca`; values of
//! those types are carried in registers as pointers.

mod builder;
mod instruction;
mod program;
mod types;

pub use builder::FunctionBuilder;
pub use instruction::{BinOp, BlockId, CmpOp, Inst, Reg, Terminator, UnOp};
pub use program::{BasicBlock, IrFunction, Linkage, Module};
pub use types::{register_types, CellType, RegType};
