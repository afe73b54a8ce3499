//! Vector builtins

use super::native::{array, elem_kind, write_array};
use super::{Availability, FunctionGroup, FunctionRegistry, InlineFn, Signature};
use crate::compiler::ir::{BinOp, CmpOp, FunctionBuilder, Reg, RegType};
use crate::compiler::jit::{CallContext, NativeFn};
use crate::error::{Error, Result};
use crate::runtime::Word;
use crate::types::{ScalarKind, Type};
use std::sync::Arc;

const KINDS: [ScalarKind; 3] = [ScalarKind::Double, ScalarKind::Float, ScalarKind::Int32];

fn length<const N: usize>(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let v = array(ctx, args, 0, N)?;
    let len = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    Ok(match elem_kind(ctx, args, 0)? {
        ScalarKind::Float => Word::F32(len as f32),
        _ => Word::F64(len),
    })
}

fn cross(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let a = array(ctx, args, 0, 3)?;
    let b = array(ctx, args, 1, 3)?;
    let c = [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ];
    write_array(ctx, args, 2, &c)?;
    Ok(Word::Void)
}

fn reg(args: &[Reg], i: usize) -> Result<Reg> {
    args.get(i)
        .copied()
        .ok_or_else(|| Error::execution(format!("missing inline argument {}", i)))
}

/// Sum of element-wise products of two containers of `n` elements
fn emit_dot(b: &mut FunctionBuilder, lhs: Reg, rhs: Reg, n: usize) -> Reg {
    let mut acc = None;
    for i in 0..n {
        let pa = b.element_ptr_const(lhs, i, n);
        let pb = b.element_ptr_const(rhs, i, n);
        let x = b.load(pa);
        let y = b.load(pb);
        let prod = b.binary(BinOp::Mul, x, y);
        acc = Some(match acc {
            Some(sum) => b.binary(BinOp::Add, sum, prod),
            None => prod,
        });
    }
    acc.unwrap_or_else(|| b.constant(Word::I32(0)))
}

fn dot_inline(n: usize) -> InlineFn {
    Arc::new(move |b: &mut FunctionBuilder, args: &[Reg]| {
        let (x, y) = (reg(args, 0)?, reg(args, 1)?);
        Ok(Some(emit_dot(b, x, y, n)))
    })
}

fn lengthsq_inline(n: usize) -> InlineFn {
    Arc::new(move |b: &mut FunctionBuilder, args: &[Reg]| {
        let x = reg(args, 0)?;
        Ok(Some(emit_dot(b, x, x, n)))
    })
}

/// out = v / length(v); a zero vector stays zero
fn normalize_inline(n: usize, elem: ScalarKind, out_kind: ScalarKind) -> InlineFn {
    let input = Type::vec(elem, n);
    Arc::new(move |b: &mut FunctionBuilder, args: &[Reg]| {
        let (v, out) = (reg(args, 0)?, reg(args, 1)?);
        let len = b.call(
            &super::symbol_name("length", &[input]),
            vec![v],
            RegType::Scalar(float_result_kind(elem)),
        );
        let len = b.cast(len, out_kind);
        let zero = b.constant(Word::zero(out_kind));
        let one = b.constant(Word::one(out_kind));
        let is_zero = b.compare(CmpOp::Eq, len, zero);
        let divisor = b.select(is_zero, one, len);
        for i in 0..n {
            let src = b.element_ptr_const(v, i, n);
            let e = b.load(src);
            let e = b.cast(e, out_kind);
            let q = b.binary(BinOp::Div, e, divisor);
            let dst = b.element_ptr_const(out, i, n);
            b.store(dst, q);
        }
        Ok(None)
    })
}

fn length_native(n: usize) -> NativeFn {
    match n {
        2 => length::<2>,
        3 => length::<3>,
        _ => length::<4>,
    }
}

fn float_result_kind(elem: ScalarKind) -> ScalarKind {
    if elem == ScalarKind::Float {
        ScalarKind::Float
    } else {
        ScalarKind::Double
    }
}

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.insert("length", Availability::All, || {
        let mut g = FunctionGroup::new("length");
        for n in 2..=4 {
            for k in KINDS {
                g = g.with(Signature::native(
                    vec![Type::vec(k, n)],
                    Type::Scalar(float_result_kind(k)),
                    length_native(n),
                ));
            }
        }
        g
    });

    registry.insert("lengthsq", Availability::All, || {
        let mut g = FunctionGroup::new("lengthsq");
        for n in 2..=4 {
            for k in KINDS {
                g = g.with(Signature::inline(vec![Type::vec(k, n)], Type::Scalar(k), lengthsq_inline(n)));
            }
        }
        g
    });

    registry.insert("dot", Availability::All, || {
        let mut g = FunctionGroup::new("dot");
        for n in 2..=4 {
            for k in KINDS {
                let t = Type::vec(k, n);
                g = g.with(Signature::inline(vec![t, t], Type::Scalar(k), dot_inline(n)));
            }
        }
        g
    });

    registry.insert("cross", Availability::All, || {
        KINDS.iter().fold(FunctionGroup::new("cross"), |g, k| {
            let t = Type::vec(*k, 3);
            g.with(Signature::native_output(vec![t, t], t, cross))
        })
    });

    registry.insert("normalize", Availability::All, || {
        let mut g = FunctionGroup::new("normalize").depends_on("length");
        for n in 2..=4 {
            for k in KINDS {
                let out = float_result_kind(k);
                g = g.with(Signature::inline_output(
                    vec![Type::vec(k, n)],
                    Type::vec(out, n),
                    normalize_inline(n, k, out),
                ));
            }
        }
        g
    });
}
