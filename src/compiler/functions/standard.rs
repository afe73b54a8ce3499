//! Scalar math builtins
//!
//! Floating point overloads register `double` before `float`, so an integer
//! argument (an Implicit match against both) resolves to the double form.

use super::native::{arg, float_result, kind_of};
use super::{Availability, FunctionGroup, FunctionRegistry, InlineFn, Signature};
use crate::compiler::ir::{BinOp, FunctionBuilder, Reg};
use crate::compiler::jit::{CallContext, NativeFn};
use crate::error::{Error, Result};
use crate::runtime::Word;
use crate::types::{ScalarKind, Type};
use std::sync::Arc;

macro_rules! unary_float {
    ($($name:ident => $f:expr),* $(,)?) => {
        $(
            fn $name(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
                let x = arg(args, 0)?;
                let f: fn(f64) -> f64 = $f;
                Ok(float_result(kind_of(args, 0)?, f(x.as_f64())))
            }
        )*
    };
}

macro_rules! binary_float {
    ($($name:ident => $f:expr),* $(,)?) => {
        $(
            fn $name(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
                let (a, b) = (arg(args, 0)?, arg(args, 1)?);
                let f: fn(f64, f64) -> f64 = $f;
                Ok(float_result(kind_of(args, 0)?, f(a.as_f64(), b.as_f64())))
            }
        )*
    };
}

macro_rules! float_test {
    ($($name:ident => $f:expr),* $(,)?) => {
        $(
            fn $name(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
                let f: fn(f64) -> bool = $f;
                Ok(Word::Bool(f(arg(args, 0)?.as_f64())))
            }
        )*
    };
}

unary_float! {
    sqrt => f64::sqrt,
    cbrt => f64::cbrt,
    exp => f64::exp,
    exp2 => f64::exp2,
    log => f64::ln,
    log2 => f64::log2,
    log10 => f64::log10,
    floor => f64::floor,
    ceil => f64::ceil,
    round => f64::round,
    trunc => f64::trunc,
    sin => f64::sin,
    cos => f64::cos,
    tan => f64::tan,
    asin => f64::asin,
    acos => f64::acos,
    atan => f64::atan,
    sinh => f64::sinh,
    cosh => f64::cosh,
    tanh => f64::tanh,
}

binary_float! {
    atan2 => f64::atan2,
    hypot => f64::hypot,
    pow => f64::powf,
    fmod => |a, b| a % b,
}

float_test! {
    isfinite => f64::is_finite,
    isinf => f64::is_infinite,
    isnan => f64::is_nan,
    signbit => f64::is_sign_negative,
}

fn abs(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    Ok(match arg(args, 0)? {
        Word::I16(v) => Word::I16(v.wrapping_abs()),
        Word::I32(v) => Word::I32(v.wrapping_abs()),
        Word::I64(v) => Word::I64(v.wrapping_abs()),
        Word::F32(v) => Word::F32(v.abs()),
        Word::F64(v) => Word::F64(v.abs()),
        other => return Err(Error::execution(format!("abs of {}", other))),
    })
}

fn sign(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let x = arg(args, 0)?.as_f64();
    Ok(Word::I32(if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }))
}

/// Order-based builtins evaluate in the kind of their (identical) arguments
fn select_ordered(args: &[Word], pick_max: bool) -> Result<Word> {
    let (a, b) = (arg(args, 0)?, arg(args, 1)?);
    let a_wins = if kind_of(args, 0)?.is_float() {
        (a.as_f64() >= b.as_f64()) == pick_max
    } else {
        (a.as_i64() >= b.as_i64()) == pick_max
    };
    Ok(if a_wins { a } else { b })
}

fn min(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    select_ordered(args, false)
}

fn max(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    select_ordered(args, true)
}

fn clamp(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let (x, lo, hi) = (arg(args, 0)?, arg(args, 1)?, arg(args, 2)?);
    let kind = kind_of(args, 0)?;
    if kind.is_float() {
        Ok(Word::from_f64(kind, x.as_f64().max(lo.as_f64()).min(hi.as_f64())))
    } else {
        Ok(Word::from_i64(kind, x.as_i64().max(lo.as_i64()).min(hi.as_i64())))
    }
}

/// Remap `x` from `[omin, omax]` to `[nmin, nmax]`, clamped to the source range
fn fit(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let v: Vec<f64> = (0..5)
        .map(|i| arg(args, i).map(|w| w.as_f64()))
        .collect::<Result<_>>()?;
    let (x, omin, omax, nmin, nmax) = (v[0], v[1], v[2], v[3], v[4]);
    let kind = kind_of(args, 0)?;
    if omin == omax {
        return Ok(float_result(kind, nmin));
    }
    let (lo, hi) = if omin < omax { (omin, omax) } else { (omax, omin) };
    let t = (x.clamp(lo, hi) - omin) / (omax - omin);
    Ok(float_result(kind, nmin + t * (nmax - nmin)))
}

fn inline_arg(args: &[Reg], i: usize) -> Result<Reg> {
    args.get(i)
        .copied()
        .ok_or_else(|| Error::execution(format!("missing inline argument {}", i)))
}

/// x * factor, emitted inline
fn scale_inline(kind: ScalarKind, factor: f64) -> InlineFn {
    Arc::new(move |b: &mut FunctionBuilder, args: &[Reg]| {
        let x = inline_arg(args, 0)?;
        let k = b.constant(Word::from_f64(kind, factor));
        Ok(Some(b.binary(BinOp::Mul, x, k)))
    })
}

/// a + (b - a) * t, emitted inline
fn lerp_inline() -> InlineFn {
    Arc::new(|b: &mut FunctionBuilder, args: &[Reg]| {
        let (x, y, t) = (inline_arg(args, 0)?, inline_arg(args, 1)?, inline_arg(args, 2)?);
        let diff = b.binary(BinOp::Sub, y, x);
        let scaled = b.binary(BinOp::Mul, diff, t);
        Ok(Some(b.binary(BinOp::Add, x, scaled)))
    })
}

const FLOATS: [ScalarKind; 2] = [ScalarKind::Double, ScalarKind::Float];
const NUMERIC: [ScalarKind; 4] = [
    ScalarKind::Double,
    ScalarKind::Float,
    ScalarKind::Int64,
    ScalarKind::Int32,
];

/// One overload per kind, each taking `arity` arguments of that kind
fn uniform(name: &str, kinds: &[ScalarKind], arity: usize, ret: Option<Type>, func: NativeFn) -> FunctionGroup {
    kinds.iter().fold(FunctionGroup::new(name), |g, k| {
        let t = Type::Scalar(*k);
        g.with(Signature::native(vec![t; arity], ret.unwrap_or(t), func))
    })
}

fn register_uniform(
    registry: &mut FunctionRegistry,
    name: &'static str,
    kinds: &'static [ScalarKind],
    arity: usize,
    ret: Option<Type>,
    func: NativeFn,
) {
    registry.insert(name, Availability::All, move || uniform(name, kinds, arity, ret, func));
}

pub(super) fn register(registry: &mut FunctionRegistry) {
    let unary: [(&'static str, NativeFn); 20] = [
        ("sqrt", sqrt),
        ("cbrt", cbrt),
        ("exp", exp),
        ("exp2", exp2),
        ("log", log),
        ("log2", log2),
        ("log10", log10),
        ("floor", floor),
        ("ceil", ceil),
        ("round", round),
        ("trunc", trunc),
        ("sin", sin),
        ("cos", cos),
        ("tan", tan),
        ("asin", asin),
        ("acos", acos),
        ("atan", atan),
        ("sinh", sinh),
        ("cosh", cosh),
        ("tanh", tanh),
    ];
    for (name, func) in unary {
        register_uniform(registry, name, &FLOATS, 1, None, func);
    }

    let binary: [(&'static str, NativeFn); 4] =
        [("atan2", atan2), ("hypot", hypot), ("pow", pow), ("fmod", fmod)];
    for (name, func) in binary {
        register_uniform(registry, name, &FLOATS, 2, None, func);
    }

    let tests: [(&'static str, NativeFn); 4] = [
        ("isfinite", isfinite),
        ("isinf", isinf),
        ("isnan", isnan),
        ("signbit", signbit),
    ];
    for (name, func) in tests {
        register_uniform(registry, name, &FLOATS, 1, Some(Type::BOOL), func);
    }

    register_uniform(registry, "abs", &NUMERIC, 1, None, abs);
    register_uniform(registry, "sign", &NUMERIC, 1, Some(Type::INT32), sign);
    register_uniform(registry, "min", &NUMERIC, 2, None, min);
    register_uniform(registry, "max", &NUMERIC, 2, None, max);
    register_uniform(registry, "clamp", &NUMERIC, 3, None, clamp);
    register_uniform(registry, "fit", &FLOATS, 5, None, fit);

    registry.insert("lerp", Availability::All, || {
        FLOATS.iter().fold(FunctionGroup::new("lerp"), |g, k| {
            let t = Type::Scalar(*k);
            g.with(Signature::inline(vec![t; 3], t, lerp_inline()))
        })
    });
    registry.insert("radians", Availability::All, || {
        FLOATS.iter().fold(FunctionGroup::new("radians"), |g, k| {
            let t = Type::Scalar(*k);
            g.with(Signature::inline(vec![t], t, scale_inline(*k, std::f64::consts::PI / 180.0)))
        })
    });
    registry.insert("degrees", Availability::All, || {
        FLOATS.iter().fold(FunctionGroup::new("degrees"), |g, k| {
            let t = Type::Scalar(*k);
            g.with(Signature::inline(vec![t], t, scale_inline(*k, 180.0 / std::f64::consts::PI)))
        })
    });
}
