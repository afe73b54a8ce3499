//! Point kernels
//!
//! Attributes are reached through the handle array. Position (`P` as
//! `vec3f`) is staged through dedicated accessors so a moved point is only
//! migrated after the whole leaf has run.

use super::generator::CodeGenerator;
use super::value::Value;
use super::{Specialization, POINT_KERNEL, POINT_RANGE_KERNEL};
use crate::compiler::default_types::POSITION;
use crate::compiler::ir::{BinOp, CmpOp, FunctionBuilder, IrFunction, RegType};
use crate::compiler::Target;
use crate::error::{Error, Result};
use crate::runtime::{SlotType, Word};
use crate::types::{ScalarKind, Type};

/// Point specialization
#[derive(Debug, Clone, Copy, Default)]
pub struct PointKernel;

fn is_position(name: &str, ty: Type) -> bool {
    name == POSITION && ty == Type::vec(ScalarKind::Float, 3)
}

impl Specialization for PointKernel {
    const TARGET: Target = Target::Points;
    const KERNEL: &'static str = POINT_KERNEL;
    const PARAMS: &'static [RegType] = &[RegType::HANDLES, RegType::HANDLES, RegType::INT64];

    fn prologue(gen: &mut CodeGenerator<'_, Self>) -> Result<()> {
        let index = gen.builder.param(2);
        gen.call_internal_void("ax.point.enter", vec![index])
    }

    fn read_attribute(gen: &mut CodeGenerator<'_, Self>, name: &str, ty: Type) -> Result<Value> {
        if is_position(name, ty) {
            let slot = gen.alloc(ty)?;
            gen.call_internal_void("ax.point.get.position", vec![slot])?;
            return Ok(Value::Slot { ptr: slot, ty });
        }
        let h = gen.attribute_handle(name)?;
        match ty {
            Type::Scalar(kind) => {
                let reg = gen.call_internal_value("ax.point.get.scalar", vec![h], kind)?;
                Ok(Value::Scalar { reg, kind })
            }
            Type::Array { .. } => {
                let slot = gen.alloc(ty)?;
                gen.call_internal_void("ax.point.get.array", vec![h, slot])?;
                Ok(Value::Slot { ptr: slot, ty })
            }
            Type::String => {
                let slot = gen.alloc(ty)?;
                gen.call_internal_void("ax.point.get.string", vec![h, slot])?;
                Ok(Value::Slot { ptr: slot, ty })
            }
            Type::Void => Err(Error::unsupported("@", "void")),
        }
    }

    fn write_attribute(
        gen: &mut CodeGenerator<'_, Self>,
        name: &str,
        ty: Type,
        value: Value,
    ) -> Result<()> {
        let reg = value
            .reg()
            .ok_or_else(|| Error::unsupported("=", format!("void into @{}", name)))?;
        if is_position(name, ty) {
            return gen.call_internal_void("ax.point.set.position", vec![reg]);
        }
        let h = gen.attribute_handle(name)?;
        let helper = match ty {
            Type::Scalar(_) => "ax.point.set.scalar",
            Type::Array { .. } => "ax.point.set.array",
            Type::String => "ax.point.set.string",
            Type::Void => return Err(Error::unsupported("@", "void")),
        };
        gen.call_internal_void(helper, vec![h, reg])
    }

    /// `ax.compute.point.range(handles, externals, begin, end)`
    fn wrappers() -> Vec<IrFunction> {
        let mut b = FunctionBuilder::new(
            POINT_RANGE_KERNEL,
            &[RegType::HANDLES, RegType::HANDLES, RegType::INT64, RegType::INT64],
            None,
        );
        let (handles, externals) = (b.param(0), b.param(1));
        let (begin, end) = (b.param(2), b.param(3));
        let counter = b.alloca(SlotType::Scalar(ScalarKind::Int64));
        b.store(counter, begin);

        let cond = b.create_block("range.cond");
        let body = b.create_block("range.body");
        let exit = b.create_block("range.end");
        b.br(cond);

        b.switch_to(cond);
        let i = b.load(counter);
        let more = b.compare(CmpOp::Lt, i, end);
        b.cond_br(more, body, exit);

        b.switch_to(body);
        let i = b.load(counter);
        b.call_void(POINT_KERNEL, vec![handles, externals, i]);
        let one = b.constant(Word::I64(1));
        let next = b.binary(BinOp::Add, i, one);
        b.store(counter, next);
        b.br(cond);

        b.switch_to(exit);
        b.ret(None);
        vec![b.finish()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::Inst;

    #[test]
    fn test_range_wrapper_calls_element_kernel() {
        let wrappers = PointKernel::wrappers();
        assert_eq!(wrappers.len(), 1);
        let range = &wrappers[0];
        assert_eq!(range.name, POINT_RANGE_KERNEL);
        assert_eq!(range.params.len(), 4);
        assert!(range
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .any(|i| matches!(i, Inst::Call { callee, .. } if callee == POINT_KERNEL)));
    }

    #[test]
    fn test_position_is_special_cased() {
        assert!(is_position("P", Type::vec(ScalarKind::Float, 3)));
        assert!(!is_position("P", Type::vec(ScalarKind::Double, 3)));
        assert!(!is_position("Q", Type::vec(ScalarKind::Float, 3)));
    }
}
