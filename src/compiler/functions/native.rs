//! Argument helpers for native builtin bodies
//!
//! Scalars arrive as words already converted to the signature's parameter
//! kinds; containers and strings arrive as pointers into kernel memory.

use crate::compiler::jit::CallContext;
use crate::error::{Error, Result};
use crate::runtime::{PointAccess, VoxelAccess, Word};
use crate::types::ScalarKind;

/// Argument `i`
pub(super) fn arg(args: &[Word], i: usize) -> Result<Word> {
    args.get(i)
        .copied()
        .ok_or_else(|| Error::execution(format!("missing native argument {}", i)))
}

/// Scalar kind of argument `i`
pub(super) fn kind_of(args: &[Word], i: usize) -> Result<ScalarKind> {
    let w = arg(args, i)?;
    w.kind()
        .ok_or_else(|| Error::execution(format!("native argument {} is not a scalar: {}", i, w)))
}

/// Read `len` elements of the container passed as argument `i`
pub(super) fn array(ctx: &CallContext<'_>, args: &[Word], i: usize, len: usize) -> Result<Vec<f64>> {
    let ptr = arg(args, i)?.as_ptr()?;
    ctx.memory.read_f64s(ptr, len)
}

/// Element kind of the container passed as argument `i`
pub(super) fn elem_kind(ctx: &CallContext<'_>, args: &[Word], i: usize) -> Result<ScalarKind> {
    let ptr = arg(args, i)?.as_ptr()?;
    let w = ctx.memory.load(ptr)?;
    w.kind()
        .ok_or_else(|| Error::execution(format!("container argument {} holds {}", i, w)))
}

/// Write `values` into the container passed as argument `i`
pub(super) fn write_array(ctx: &mut CallContext<'_>, args: &[Word], i: usize, values: &[f64]) -> Result<()> {
    let ptr = arg(args, i)?.as_ptr()?;
    ctx.memory.write_f64s(ptr, values)
}

/// Copy of the string passed as argument `i`
pub(super) fn string(ctx: &CallContext<'_>, args: &[Word], i: usize) -> Result<String> {
    let ptr = arg(args, i)?.as_ptr()?;
    ctx.memory.read_string(ptr)
}

/// Point view of the calling kernel
pub(super) fn points<'c>(ctx: &'c mut CallContext<'_>) -> Result<&'c mut dyn PointAccess> {
    ctx.env
        .points()
        .ok_or_else(|| Error::execution("point builtin called outside a point kernel"))
}

/// Voxel view of the calling kernel
pub(super) fn voxels<'c>(ctx: &'c mut CallContext<'_>) -> Result<&'c mut dyn VoxelAccess> {
    ctx.env
        .voxels()
        .ok_or_else(|| Error::execution("volume builtin called outside a volume kernel"))
}

/// Result word of `kind` for a floating point computation
pub(super) fn float_result(kind: ScalarKind, v: f64) -> Word {
    if kind.is_float() {
        Word::from_f64(kind, v)
    } else {
        Word::F64(v)
    }
}
