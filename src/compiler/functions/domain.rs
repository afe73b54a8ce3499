//! Point and volume builtins and the accessors generated kernels call
//!
//! Accessors take the opaque handle loaded from the kernel's handle array.
//! Handles were checked against the compiled types when the data was bound,
//! so the bodies here trust the shapes they are given.

use super::native::{arg, points, string, voxels, write_array};
use super::{Availability, FunctionGroup, FunctionRegistry, Signature};
use crate::compiler::custom_data::CustomValue;
use crate::compiler::jit::{CallContext, NativeFn};
use crate::error::Result;
use crate::runtime::Word;
use crate::types::{ScalarKind, Type};

fn handle(args: &[Word], i: usize) -> Result<u32> {
    arg(args, i)?.as_handle()
}

fn first(values: &[Word]) -> Word {
    values.first().copied().unwrap_or(Word::Void)
}

// Points

fn point_enter(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let index = arg(args, 0)?.as_i64().max(0) as usize;
    points(ctx)?.enter(index);
    Ok(Word::Void)
}

fn point_get_scalar(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let h = handle(args, 0)?;
    Ok(first(points(ctx)?.get(h)?))
}

fn point_get_array(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let h = handle(args, 0)?;
    let values = points(ctx)?.get(h)?.to_vec();
    ctx.memory.write_words(arg(args, 1)?.as_ptr()?, &values)?;
    Ok(Word::Void)
}

fn point_get_string(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let h = handle(args, 0)?;
    let value = points(ctx)?.get_string(h)?.to_string();
    ctx.memory
        .write_string(arg(args, 1)?.as_ptr()?, value.as_bytes())?;
    Ok(Word::Void)
}

fn point_set_scalar(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let h = handle(args, 0)?;
    let value = arg(args, 1)?;
    points(ctx)?.set(h, &[value])?;
    Ok(Word::Void)
}

fn point_set_array(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let h = handle(args, 0)?;
    let n = points(ctx)?.get(h)?.len();
    let values = ctx.memory.read_words(arg(args, 1)?.as_ptr()?, n)?;
    points(ctx)?.set(h, &values)?;
    Ok(Word::Void)
}

fn point_set_string(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let h = handle(args, 0)?;
    let value = string(ctx, args, 1)?;
    points(ctx)?.set_string(h, &value)?;
    Ok(Word::Void)
}

fn point_get_position(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let values = points(ctx)?.position()?.to_vec();
    ctx.memory.write_words(arg(args, 0)?.as_ptr()?, &values)?;
    Ok(Word::Void)
}

fn point_set_position(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let values = ctx.memory.read_words(arg(args, 0)?.as_ptr()?, 3)?;
    points(ctx)?.stage_position(&values)?;
    Ok(Word::Void)
}

fn ingroup(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let name = string(ctx, args, 0)?;
    Ok(Word::Bool(points(ctx)?.in_group(&name)))
}

fn addtogroup(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let name = string(ctx, args, 0)?;
    points(ctx)?.add_to_group(&name);
    Ok(Word::Void)
}

fn removefromgroup(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let name = string(ctx, args, 0)?;
    points(ctx)?.remove_from_group(&name);
    Ok(Word::Void)
}

fn deletepoint(ctx: &mut CallContext<'_>, _: &[Word]) -> Result<Word> {
    points(ctx)?.delete_point();
    Ok(Word::Void)
}

fn getpointindex(ctx: &mut CallContext<'_>, _: &[Word]) -> Result<Word> {
    Ok(Word::I64(points(ctx)?.index() as i64))
}

// Volumes

fn volume_enter(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let c = [
        arg(args, 0)?.as_i64() as i32,
        arg(args, 1)?.as_i64() as i32,
        arg(args, 2)?.as_i64() as i32,
    ];
    voxels(ctx)?.enter(c);
    Ok(Word::Void)
}

fn volume_get_scalar(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let h = handle(args, 0)?;
    Ok(first(voxels(ctx)?.get(h)?))
}

fn volume_get_array(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let h = handle(args, 0)?;
    let values = voxels(ctx)?.get(h)?.to_vec();
    ctx.memory.write_words(arg(args, 1)?.as_ptr()?, &values)?;
    Ok(Word::Void)
}

fn volume_set_scalar(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let h = handle(args, 0)?;
    let value = arg(args, 1)?;
    voxels(ctx)?.set(h, &[value])?;
    Ok(Word::Void)
}

fn volume_set_array(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let h = handle(args, 0)?;
    let n = voxels(ctx)?.get(h)?.len();
    let values = ctx.memory.read_words(arg(args, 1)?.as_ptr()?, n)?;
    voxels(ctx)?.set(h, &values)?;
    Ok(Word::Void)
}

fn getcoord(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let c = voxels(ctx)?.coord();
    write_array(ctx, args, 0, &[c[0] as f64, c[1] as f64, c[2] as f64])?;
    Ok(Word::Void)
}

fn coord_axis<const AXIS: usize>(ctx: &mut CallContext<'_>, _: &[Word]) -> Result<Word> {
    Ok(Word::I32(voxels(ctx)?.coord()[AXIS]))
}

fn getvoxelpws(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let v = voxels(ctx)?;
    let (c, size) = (v.coord(), v.voxel_size());
    let world = [c[0] as f64 * size, c[1] as f64 * size, c[2] as f64 * size];
    write_array(ctx, args, 0, &world)?;
    Ok(Word::Void)
}

// Externals

fn external_value(ctx: &CallContext<'_>, args: &[Word]) -> Result<Option<CustomValue>> {
    Ok(ctx.env.external(handle(args, 0)?).cloned())
}

fn external_scalar(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let zero = arg(args, 1)?;
    let value = external_value(ctx, args)?
        .map(|v| first(&v.words()))
        .unwrap_or(zero);
    Ok(match zero.kind() {
        Some(kind) => value.cast(kind),
        None => value,
    })
}

fn external_array(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    if let Some(v) = external_value(ctx, args)? {
        ctx.memory.write_words(arg(args, 1)?.as_ptr()?, &v.words())?;
    }
    Ok(Word::Void)
}

fn external_string(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    if let Some(CustomValue::String(s)) = external_value(ctx, args)? {
        ctx.memory.write_string(arg(args, 1)?.as_ptr()?, s.as_bytes())?;
    }
    Ok(Word::Void)
}

fn internal(
    registry: &mut FunctionRegistry,
    name: &'static str,
    availability: Availability,
    params: Vec<Type>,
    ret: Type,
    func: NativeFn,
) {
    registry.insert(name, availability, move || {
        FunctionGroup::new(name)
            .internal()
            .with(Signature::native(params.clone(), ret, func).impure())
    });
}

fn user(
    registry: &mut FunctionRegistry,
    name: &'static str,
    availability: Availability,
    sig: fn(NativeFn) -> Signature,
    func: NativeFn,
) {
    registry.insert(name, availability, move || FunctionGroup::new(name).with(sig(func)));
}

pub(super) fn register(registry: &mut FunctionRegistry) {
    use Availability::{All, Points, Volumes};
    // handles are opaque words; the declared parameter types document intent
    let h = Type::INT64;
    let any = Type::DOUBLE;
    let ptr = Type::vec(ScalarKind::Double, 3);

    internal(registry, "ax.point.enter", Points, vec![Type::INT64], Type::Void, point_enter);
    internal(registry, "ax.point.get.scalar", Points, vec![h], any, point_get_scalar);
    internal(registry, "ax.point.get.array", Points, vec![h, ptr], Type::Void, point_get_array);
    internal(registry, "ax.point.get.string", Points, vec![h, Type::String], Type::Void, point_get_string);
    internal(registry, "ax.point.set.scalar", Points, vec![h, any], Type::Void, point_set_scalar);
    internal(registry, "ax.point.set.array", Points, vec![h, ptr], Type::Void, point_set_array);
    internal(registry, "ax.point.set.string", Points, vec![h, Type::String], Type::Void, point_set_string);
    internal(registry, "ax.point.get.position", Points, vec![ptr], Type::Void, point_get_position);
    internal(registry, "ax.point.set.position", Points, vec![ptr], Type::Void, point_set_position);

    internal(registry, "ax.volume.enter", Volumes, vec![Type::INT32; 3], Type::Void, volume_enter);
    internal(registry, "ax.volume.get.scalar", Volumes, vec![h], any, volume_get_scalar);
    internal(registry, "ax.volume.get.array", Volumes, vec![h, ptr], Type::Void, volume_get_array);
    internal(registry, "ax.volume.set.scalar", Volumes, vec![h, any], Type::Void, volume_set_scalar);
    internal(registry, "ax.volume.set.array", Volumes, vec![h, ptr], Type::Void, volume_set_array);

    internal(registry, "ax.external.scalar", All, vec![h, any], any, external_scalar);
    internal(registry, "ax.external.array", All, vec![h, ptr], Type::Void, external_array);
    internal(registry, "ax.external.string", All, vec![h, Type::String], Type::Void, external_string);

    user(registry, "ingroup", Points, |f| Signature::native(vec![Type::String], Type::BOOL, f).impure(), ingroup);
    user(registry, "addtogroup", Points, |f| Signature::native(vec![Type::String], Type::Void, f).impure(), addtogroup);
    user(
        registry,
        "removefromgroup",
        Points,
        |f| Signature::native(vec![Type::String], Type::Void, f).impure(),
        removefromgroup,
    );
    user(registry, "deletepoint", Points, |f| Signature::native(vec![], Type::Void, f).impure(), deletepoint);
    user(registry, "getpointindex", Points, |f| Signature::native(vec![], Type::INT64, f).impure(), getpointindex);

    let vec3i = Type::vec(ScalarKind::Int32, 3);
    let vec3f = Type::vec(ScalarKind::Float, 3);
    registry.insert("getcoord", Volumes, move || {
        FunctionGroup::new("getcoord").with(Signature::native_output(vec![], vec3i, getcoord).impure())
    });
    user(registry, "getcoordx", Volumes, |f| Signature::native(vec![], Type::INT32, f).impure(), coord_axis::<0>);
    user(registry, "getcoordy", Volumes, |f| Signature::native(vec![], Type::INT32, f).impure(), coord_axis::<1>);
    user(registry, "getcoordz", Volumes, |f| Signature::native(vec![], Type::INT32, f).impure(), coord_axis::<2>);
    registry.insert("getvoxelpws", Volumes, move || {
        FunctionGroup::new("getvoxelpws").with(Signature::native_output(vec![], vec3f, getvoxelpws).impure())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Target;
    use crate::runtime::{Memory, NullEnv};

    #[test]
    fn test_domain_builtins_fail_outside_their_domain() {
        let mut memory = Memory::new();
        let mut env = NullEnv;
        let mut ctx = CallContext {
            memory: &mut memory,
            env: &mut env,
        };
        assert!(deletepoint(&mut ctx, &[]).is_err());
        assert!(coord_axis::<0>(&mut ctx, &[]).is_err());
    }

    #[test]
    fn test_missing_external_reads_zero() {
        let mut memory = Memory::new();
        let mut env = NullEnv;
        let mut ctx = CallContext {
            memory: &mut memory,
            env: &mut env,
        };
        let w = external_scalar(&mut ctx, &[Word::Handle(0), Word::F32(0.0)]).unwrap();
        assert_eq!(w, Word::F32(0.0));
    }

    #[test]
    fn test_internal_helpers_are_hidden() {
        let mut registry = FunctionRegistry::new();
        for name in ["ax.point.get.scalar", "ax.external.scalar"] {
            assert!(registry.lookup(name, Target::Points, false).unwrap().is_none());
            assert!(registry.lookup(name, Target::Points, true).unwrap().is_some());
        }
    }
}
