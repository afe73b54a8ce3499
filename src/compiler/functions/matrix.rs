//! Matrix builtins
//!
//! Matrices are row-major. `transform` treats its vector as a row vector
//! (`v * M`, translation in the last row of a 4x4); `pretransform` treats it as
//! a column vector (`M * v`).

use super::native::{array, elem_kind, write_array};
use super::{Availability, FunctionGroup, FunctionRegistry, Signature};
use crate::compiler::jit::{CallContext, NativeFn};
use crate::error::Result;
use crate::runtime::Word;
use crate::types::{ScalarKind, Type};

const KINDS: [ScalarKind; 3] = [ScalarKind::Double, ScalarKind::Float, ScalarKind::Int32];
const FLOAT_KINDS: [ScalarKind; 2] = [ScalarKind::Double, ScalarKind::Float];

fn identity_values(n: usize) -> Vec<f64> {
    (0..n * n)
        .map(|i| if i / n == i % n { 1.0 } else { 0.0 })
        .collect()
}

fn multiply(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut c = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            c[i * n + j] = (0..n).map(|k| a[i * n + k] * b[k * n + j]).sum();
        }
    }
    c
}

fn transposed(m: &[f64], n: usize) -> Vec<f64> {
    (0..n * n).map(|i| m[(i % n) * n + i / n]).collect()
}

fn det3(m: &[f64]) -> f64 {
    m[0] * (m[4] * m[8] - m[5] * m[7]) - m[1] * (m[3] * m[8] - m[5] * m[6])
        + m[2] * (m[3] * m[7] - m[4] * m[6])
}

fn det(m: &[f64], n: usize) -> f64 {
    if n == 3 {
        return det3(m);
    }
    // cofactor expansion along the first row
    (0..4)
        .map(|col| {
            let minor: Vec<f64> = (1..4)
                .flat_map(|r| (0..4).filter(move |c| *c != col).map(move |c| (r, c)))
                .map(|(r, c)| m[r * 4 + c])
                .collect();
            let sign = if col % 2 == 0 { 1.0 } else { -1.0 };
            sign * m[col] * det3(&minor)
        })
        .sum()
}

fn inverse3(m: &[f64]) -> Option<Vec<f64>> {
    let d = det3(m);
    if d.abs() < 1e-12 {
        return None;
    }
    let cof = [
        m[4] * m[8] - m[5] * m[7],
        m[5] * m[6] - m[3] * m[8],
        m[3] * m[7] - m[4] * m[6],
        m[2] * m[7] - m[1] * m[8],
        m[0] * m[8] - m[2] * m[6],
        m[1] * m[6] - m[0] * m[7],
        m[1] * m[5] - m[2] * m[4],
        m[2] * m[3] - m[0] * m[5],
        m[0] * m[4] - m[1] * m[3],
    ];
    // adjugate is the transposed cofactor matrix
    Some(transposed(&cof, 3).iter().map(|c| c / d).collect())
}

/// Split `m` into an orthogonal and a symmetric factor, `m = Q * S`
///
/// Iterates `Q = (Q + Q^-T) / 2` until it converges; fails for singular input.
pub fn polar_decomposition(m: &[f64]) -> Option<(Vec<f64>, Vec<f64>)> {
    let mut q = m.to_vec();
    for _ in 0..100 {
        let inv_t = transposed(&inverse3(&q)?, 3);
        let next: Vec<f64> = q.iter().zip(&inv_t).map(|(a, b)| 0.5 * (a + b)).collect();
        let delta: f64 = next.iter().zip(&q).map(|(a, b)| (a - b).abs()).sum();
        q = next;
        if delta < 1e-10 {
            let s = multiply(&transposed(&q, 3), m, 3);
            return Some((q, s));
        }
    }
    None
}

fn apply(v: &[f64], m: &[f64], n: usize, pre: bool) -> Vec<f64> {
    let mut ext = v.to_vec();
    ext.resize(n, 1.0);
    (0..v.len())
        .map(|j| {
            (0..n)
                .map(|k| {
                    if pre {
                        m[j * n + k] * ext[k]
                    } else {
                        ext[k] * m[k * n + j]
                    }
                })
                .sum()
        })
        .collect()
}

fn identity<const N: usize>(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    write_array(ctx, args, 0, &identity_values(N))?;
    Ok(Word::Void)
}

fn determinant<const N: usize>(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let m = array(ctx, args, 0, N * N)?;
    Ok(Word::from_f64(elem_kind(ctx, args, 0)?, det(&m, N)))
}

fn trace<const N: usize>(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let m = array(ctx, args, 0, N * N)?;
    let t = (0..N).map(|i| m[i * N + i]).sum();
    Ok(Word::from_f64(elem_kind(ctx, args, 0)?, t))
}

fn transpose<const N: usize>(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let m = array(ctx, args, 0, N * N)?;
    write_array(ctx, args, 1, &transposed(&m, N))?;
    Ok(Word::Void)
}

fn mmmult<const N: usize>(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let a = array(ctx, args, 0, N * N)?;
    let b = array(ctx, args, 1, N * N)?;
    write_array(ctx, args, 2, &multiply(&a, &b, N))?;
    Ok(Word::Void)
}

fn transform<const V: usize, const N: usize>(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let v = array(ctx, args, 0, V)?;
    let m = array(ctx, args, 1, N * N)?;
    write_array(ctx, args, 2, &apply(&v, &m, N, false))?;
    Ok(Word::Void)
}

fn pretransform<const V: usize, const N: usize>(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let v = array(ctx, args, 0, V)?;
    let m = array(ctx, args, 1, N * N)?;
    write_array(ctx, args, 2, &apply(&v, &m, N, true))?;
    Ok(Word::Void)
}

fn polardecompose(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let m = array(ctx, args, 0, 9)?;
    match polar_decomposition(&m) {
        Some((q, s)) => {
            write_array(ctx, args, 1, &q)?;
            write_array(ctx, args, 2, &s)?;
            Ok(Word::Bool(true))
        }
        None => Ok(Word::Bool(false)),
    }
}

fn per_dim(n: usize, three: NativeFn, four: NativeFn) -> NativeFn {
    if n == 3 {
        three
    } else {
        four
    }
}

pub(super) fn register(registry: &mut FunctionRegistry) {
    registry.insert("identity3", Availability::All, || {
        FunctionGroup::new("identity3").with(Signature::native_output(
            vec![],
            Type::mat(ScalarKind::Float, 3),
            identity::<3>,
        ))
    });
    registry.insert("identity4", Availability::All, || {
        FunctionGroup::new("identity4").with(Signature::native_output(
            vec![],
            Type::mat(ScalarKind::Float, 4),
            identity::<4>,
        ))
    });

    registry.insert("determinant", Availability::All, || {
        let mut g = FunctionGroup::new("determinant");
        for n in [3, 4] {
            for k in KINDS {
                g = g.with(Signature::native(
                    vec![Type::mat(k, n)],
                    Type::Scalar(k),
                    per_dim(n, determinant::<3>, determinant::<4>),
                ));
            }
        }
        g
    });

    registry.insert("trace", Availability::All, || {
        let mut g = FunctionGroup::new("trace");
        for n in [3, 4] {
            for k in KINDS {
                g = g.with(Signature::native(
                    vec![Type::mat(k, n)],
                    Type::Scalar(k),
                    per_dim(n, trace::<3>, trace::<4>),
                ));
            }
        }
        g
    });

    registry.insert("transpose", Availability::All, || {
        let mut g = FunctionGroup::new("transpose");
        for n in [3, 4] {
            for k in KINDS {
                let t = Type::mat(k, n);
                g = g.with(Signature::native_output(
                    vec![t],
                    t,
                    per_dim(n, transpose::<3>, transpose::<4>),
                ));
            }
        }
        g
    });

    registry.insert("mmmult", Availability::All, || {
        let mut g = FunctionGroup::new("mmmult");
        for n in [3, 4] {
            for k in KINDS {
                let t = Type::mat(k, n);
                g = g.with(Signature::native_output(
                    vec![t, t],
                    t,
                    per_dim(n, mmmult::<3>, mmmult::<4>),
                ));
            }
        }
        g
    });

    registry.insert("transform", Availability::All, || {
        let mut g = FunctionGroup::new("transform");
        for k in KINDS {
            let (v3, v4) = (Type::vec(k, 3), Type::vec(k, 4));
            g = g
                .with(Signature::native_output(vec![v3, Type::mat(k, 3)], v3, transform::<3, 3>))
                .with(Signature::native_output(vec![v3, Type::mat(k, 4)], v3, transform::<3, 4>))
                .with(Signature::native_output(vec![v4, Type::mat(k, 4)], v4, transform::<4, 4>));
        }
        g
    });

    registry.insert("pretransform", Availability::All, || {
        let mut g = FunctionGroup::new("pretransform");
        for k in KINDS {
            let (v3, v4) = (Type::vec(k, 3), Type::vec(k, 4));
            g = g
                .with(Signature::native_output(vec![v3, Type::mat(k, 3)], v3, pretransform::<3, 3>))
                .with(Signature::native_output(vec![v3, Type::mat(k, 4)], v3, pretransform::<3, 4>))
                .with(Signature::native_output(vec![v4, Type::mat(k, 4)], v4, pretransform::<4, 4>));
        }
        g
    });

    registry.insert("polardecompose", Availability::All, || {
        FLOAT_KINDS.iter().fold(FunctionGroup::new("polardecompose"), |g, k| {
            let m = Type::mat(*k, 3);
            g.with(Signature::native(vec![m, m, m], Type::BOOL, polardecompose).impure())
        })
    });
}
