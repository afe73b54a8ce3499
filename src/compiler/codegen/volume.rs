//! Voxel kernels
//!
//! Every grid is read and written at the voxel the prologue entered. Grids
//! hold numeric values only, so string attributes are rejected.

use super::generator::CodeGenerator;
use super::value::Value;
use super::{Specialization, VOXEL_KERNEL};
use crate::compiler::ir::RegType;
use crate::compiler::Target;
use crate::error::{Error, Result};
use crate::types::Type;

/// Volume specialization
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeKernel;

impl Specialization for VolumeKernel {
    const TARGET: Target = Target::Volumes;
    const KERNEL: &'static str = VOXEL_KERNEL;
    const PARAMS: &'static [RegType] = &[
        RegType::HANDLES,
        RegType::HANDLES,
        RegType::INT32,
        RegType::INT32,
        RegType::INT32,
    ];

    fn prologue(gen: &mut CodeGenerator<'_, Self>) -> Result<()> {
        let coord = vec![gen.builder.param(2), gen.builder.param(3), gen.builder.param(4)];
        gen.call_internal_void("ax.volume.enter", coord)
    }

    fn read_attribute(gen: &mut CodeGenerator<'_, Self>, name: &str, ty: Type) -> Result<Value> {
        match ty {
            Type::Scalar(kind) => {
                let h = gen.attribute_handle(name)?;
                let reg = gen.call_internal_value("ax.volume.get.scalar", vec![h], kind)?;
                Ok(Value::Scalar { reg, kind })
            }
            Type::Array { .. } => {
                let h = gen.attribute_handle(name)?;
                let slot = gen.alloc(ty)?;
                gen.call_internal_void("ax.volume.get.array", vec![h, slot])?;
                Ok(Value::Slot { ptr: slot, ty })
            }
            other => Err(Error::unsupported("@", format!("{} grid \"{}\"", other, name))),
        }
    }

    fn write_attribute(
        gen: &mut CodeGenerator<'_, Self>,
        name: &str,
        ty: Type,
        value: Value,
    ) -> Result<()> {
        let helper = match ty {
            Type::Scalar(_) => "ax.volume.set.scalar",
            Type::Array { .. } => "ax.volume.set.array",
            other => {
                return Err(Error::unsupported("@", format!("{} grid \"{}\"", other, name)))
            }
        };
        let reg = value
            .reg()
            .ok_or_else(|| Error::unsupported("=", format!("void into @{}", name)))?;
        let h = gen.attribute_handle(name)?;
        gen.call_internal_void(helper, vec![h, reg])
    }
}
