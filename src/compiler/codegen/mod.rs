//! # Code Generation
//!
//! Lowers a typed [`Tree`] into an IR [`Module`] holding one element kernel
//! (a single point or a single voxel) plus any wrapper kernels the target
//! needs.
//!
//! ## Module Structure
//!
//! ```text
//! codegen/
//! ├── mod.rs           # Specialization trait, kernel ABI, generate()
//! ├── generator.rs     # Statements, control flow, expressions, calls
//! ├── arithmetic.rs    # Shared operator engine (scalars, containers, strings)
//! ├── symbol_table.rs  # Scoped locals
//! ├── value.rs         # Value, Place, Flow
//! ├── point.rs         # Point kernels: handle lookup, position staging, range wrapper
//! └── volume.rs        # Voxel kernels
//! ```
//!
//! ## Kernel ABI
//!
//! ```text
//! ax.compute.point(handles, externals, index)
//! ax.compute.point.range(handles, externals, begin, end)
//! ax.compute.voxel(handles, externals, x, y, z)
//! ```
//!
//! `handles` and `externals` point at arrays of opaque handles filled by the
//! executor. Generated code indexes them with the value of the global
//! `ax.attribute.<name>` / `ax.external.<name>`, bound by the driver to the
//! access registry index of that name.

mod arithmetic;
mod generator;
mod point;
mod symbol_table;
mod value;
mod volume;

pub use generator::CodeGenerator;
pub use point::PointKernel;
pub use symbol_table::{Declared, Local, SymbolTable};
pub use value::{Flow, Place, Value};
pub use volume::VolumeKernel;

use super::attribute_registry::AttributeRegistry;
use super::functions::FunctionRegistry;
use super::ir::{IrFunction, Module, Reg, RegType};
use super::logger::Logger;
use super::Target;
use crate::error::Result;
use crate::parser::Tree;
use crate::types::Type;
use tracing::debug;

/// Element kernel of point programs
pub const POINT_KERNEL: &str = "ax.compute.point";
/// Range wrapper looping the point kernel over `[begin, end)`
pub const POINT_RANGE_KERNEL: &str = "ax.compute.point.range";
/// Element kernel of volume programs
pub const VOXEL_KERNEL: &str = "ax.compute.voxel";

/// Register of the attribute handle array
pub const HANDLES: Reg = Reg(0);
/// Register of the external handle array
pub const EXTERNALS: Reg = Reg(1);

/// Target-specific lowering of attribute access
pub trait Specialization: Sized {
    /// Kernels produced for this target
    const TARGET: Target;
    /// Name of the element kernel
    const KERNEL: &'static str;
    /// Parameter types of the element kernel
    const PARAMS: &'static [RegType];

    /// Code run before the program body
    fn prologue(gen: &mut CodeGenerator<'_, Self>) -> Result<()>;

    /// Read attribute `name` of the current element
    fn read_attribute(gen: &mut CodeGenerator<'_, Self>, name: &str, ty: Type) -> Result<Value>;

    /// Write attribute `name` of the current element; `value` already has type `ty`
    fn write_attribute(
        gen: &mut CodeGenerator<'_, Self>,
        name: &str,
        ty: Type,
        value: Value,
    ) -> Result<()>;

    /// Additional kernels wrapping the element kernel
    fn wrappers() -> Vec<IrFunction> {
        Vec::new()
    }
}

/// Lower `tree` for target `S`
///
/// Statement errors go to `logger` and generation carries on; the caller
/// decides whether the module is usable by checking the logger.
pub fn generate<S: Specialization>(
    tree: &Tree,
    registry: &mut FunctionRegistry,
    access: &AttributeRegistry,
    logger: &mut Logger,
) -> Result<Module> {
    let mut gen = CodeGenerator::<S>::new(registry, access, logger);
    gen.kernel(tree)?;
    let (kernel, mut globals) = gen.finish();

    for entry in access.attributes() {
        globals.insert(AttributeRegistry::attribute_symbol(&entry.name));
    }
    for entry in access.externals() {
        globals.insert(AttributeRegistry::external_symbol(&entry.name));
    }

    let mut module = Module::new(S::KERNEL);
    module.functions.push(kernel);
    module.functions.extend(S::wrappers());
    module.globals = globals;
    debug!(
        kernel = S::KERNEL,
        functions = module.functions.len(),
        instructions = module.instruction_count(),
        "generated module"
    );
    Ok(module)
}
