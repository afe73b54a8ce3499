//! Operator engine shared by both targets
//!
//! Scalars combine at the precedence of their kinds. Vectors combine
//! element-wise (a scalar operand broadcasts). A scalar against a matrix is
//! promoted to `s * I` first; matrices then support `+ - / % == !=`
//! element-wise and `*` as a matrix product. Strings support `+ == !=`.

use super::generator::CodeGenerator;
use super::value::Value;
use super::Specialization;
use crate::compiler::ir::{BinOp, CmpOp, Reg, UnOp};
use crate::error::{Error, Result};
use crate::parser::{BinaryOp, UnaryOp};
use crate::runtime::{SlotType, Word};
use crate::types::{ScalarKind, Type};

fn arithmetic_op(op: BinaryOp) -> Option<BinOp> {
    Some(match op {
        BinaryOp::Add => BinOp::Add,
        BinaryOp::Sub => BinOp::Sub,
        BinaryOp::Mul => BinOp::Mul,
        BinaryOp::Div => BinOp::Div,
        BinaryOp::Mod => BinOp::Rem,
        BinaryOp::BitAnd => BinOp::And,
        BinaryOp::BitOr => BinOp::Or,
        BinaryOp::BitXor => BinOp::Xor,
        BinaryOp::Shl => BinOp::Shl,
        BinaryOp::Shr => BinOp::Shr,
        _ => return None,
    })
}

fn compare_op(op: BinaryOp) -> Option<CmpOp> {
    Some(match op {
        BinaryOp::Eq => CmpOp::Eq,
        BinaryOp::NotEq => CmpOp::Ne,
        BinaryOp::Lt => CmpOp::Lt,
        BinaryOp::LtEq => CmpOp::Le,
        BinaryOp::Gt => CmpOp::Gt,
        BinaryOp::GtEq => CmpOp::Ge,
        _ => return None,
    })
}

fn unsupported(op: BinaryOp, l: Type, r: Type) -> Error {
    Error::unsupported(op.symbol(), format!("{} and {}", l, r))
}

impl<'a, S: Specialization> CodeGenerator<'a, S> {
    /// Apply a non short-circuit binary operator to two evaluated operands
    pub(super) fn binary_values(&mut self, op: BinaryOp, l: Value, r: Value) -> Result<Value> {
        let (lt, rt) = (l.ty(), r.ty());
        match (l, r) {
            (Value::Void, _) | (_, Value::Void) => Err(unsupported(op, lt, rt)),
            _ if lt.is_string() || rt.is_string() => self.string_binary(op, l, r),
            (Value::Scalar { reg: a, kind: ka }, Value::Scalar { reg: b, kind: kb }) => {
                self.scalar_binary(op, a, ka, b, kb)
            }
            _ => self.container_binary(op, l, r),
        }
    }

    fn scalar_binary(
        &mut self,
        op: BinaryOp,
        a: Reg,
        ka: ScalarKind,
        b: Reg,
        kb: ScalarKind,
    ) -> Result<Value> {
        if op.is_logical() {
            let a = self.truthy(Value::Scalar { reg: a, kind: ka })?;
            let b = self.truthy(Value::Scalar { reg: b, kind: kb })?;
            let bin = if op == BinaryOp::And { BinOp::And } else { BinOp::Or };
            return Ok(Value::Scalar {
                reg: self.builder.binary(bin, a, b),
                kind: ScalarKind::Bool,
            });
        }

        let mut kind = ScalarKind::precedence(ka, kb);
        if op.is_bitwise() && kind.is_float() {
            return Err(unsupported(op, Type::Scalar(ka), Type::Scalar(kb)));
        }
        // bools take part in arithmetic as int32
        if kind == ScalarKind::Bool && !op.is_equality() {
            kind = ScalarKind::Int32;
        }
        let a = self.cast_to(a, ka, kind);
        let b = self.cast_to(b, kb, kind);

        if let Some(cmp) = compare_op(op) {
            return Ok(Value::Scalar {
                reg: self.builder.compare(cmp, a, b),
                kind: ScalarKind::Bool,
            });
        }
        let bin = arithmetic_op(op)
            .ok_or_else(|| unsupported(op, Type::Scalar(ka), Type::Scalar(kb)))?;
        Ok(Value::Scalar {
            reg: self.builder.binary(bin, a, b),
            kind,
        })
    }

    fn container_binary(&mut self, op: BinaryOp, l: Value, r: Value) -> Result<Value> {
        let (lt, rt) = (l.ty(), r.ty());
        if op.is_logical() || op.is_bitwise() || op.is_ordering() {
            return Err(unsupported(op, lt, rt));
        }
        if lt.is_matrix() || rt.is_matrix() {
            return self.matrix_binary(op, l, r);
        }
        let ty = Type::precedence(&lt, &rt).ok_or_else(|| unsupported(op, lt, rt))?;
        self.elementwise(op, ty, l, r)
    }

    fn matrix_binary(&mut self, op: BinaryOp, l: Value, r: Value) -> Result<Value> {
        let (lt, rt) = (l.ty(), r.ty());
        let ty = match Type::precedence(&lt, &rt) {
            Some(ty) if ty.is_matrix() => ty,
            _ => return Err(unsupported(op, lt, rt)),
        };
        match op {
            BinaryOp::Mul => {
                let l = self.convert(l, ty)?;
                let r = self.convert(r, ty)?;
                let group = self
                    .registry()
                    .lookup("mmmult", S::TARGET, false)?
                    .ok_or_else(|| unsupported(op, lt, rt))?;
                let (sig, _) = group.match_signature(&[ty, ty], true);
                let sig = sig.ok_or_else(|| unsupported(op, lt, rt))?;
                self.emit_call(sig, &[l, r])
            }
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Div
            | BinaryOp::Mod
            | BinaryOp::Eq
            | BinaryOp::NotEq => self.elementwise(op, ty, l, r),
            _ => Err(unsupported(op, lt, rt)),
        }
    }

    fn element(&mut self, value: Value, i: usize, len: usize, to: ScalarKind) -> Result<Reg> {
        match value {
            Value::Scalar { reg, kind } => Ok(self.cast_to(reg, kind, to)),
            Value::Slot { ptr, ty } => {
                let from = ty
                    .element()
                    .ok_or_else(|| Error::unsupported("[]", ty.to_string()))?;
                let p = self.builder.element_ptr_const(ptr, i, len);
                let v = self.builder.load(p);
                Ok(self.cast_to(v, from, to))
            }
            Value::Void => Err(Error::unsupported("[]", "void")),
        }
    }

    fn elementwise(&mut self, op: BinaryOp, ty: Type, l: Value, r: Value) -> Result<Value> {
        let (elem, len) = match ty {
            Type::Array { elem, len } => (elem, len),
            other => return Err(unsupported(op, other, other)),
        };
        // a scalar operand of a matrix operation is s * I, never a broadcast
        let (l, r) = if ty.is_matrix() {
            (self.convert(l, ty)?, self.convert(r, ty)?)
        } else {
            (l, r)
        };

        if let Some(cmp) = compare_op(op) {
            let join = if op == BinaryOp::Eq { BinOp::And } else { BinOp::Or };
            let mut acc: Option<Reg> = None;
            for i in 0..len {
                let a = self.element(l, i, len, elem)?;
                let b = self.element(r, i, len, elem)?;
                let c = self.builder.compare(cmp, a, b);
                acc = Some(match acc {
                    Some(prev) => self.builder.binary(join, prev, c),
                    None => c,
                });
            }
            let reg = match acc {
                Some(reg) => reg,
                None => self.builder.constant(Word::Bool(op == BinaryOp::Eq)),
            };
            return Ok(Value::Scalar {
                reg,
                kind: ScalarKind::Bool,
            });
        }

        let bin = arithmetic_op(op).ok_or_else(|| unsupported(op, l.ty(), r.ty()))?;
        let slot = self.alloc(ty)?;
        for i in 0..len {
            let a = self.element(l, i, len, elem)?;
            let b = self.element(r, i, len, elem)?;
            let v = self.builder.binary(bin, a, b);
            let p = self.builder.element_ptr_const(slot, i, len);
            self.builder.store(p, v);
        }
        Ok(Value::Slot { ptr: slot, ty })
    }

    fn string_binary(&mut self, op: BinaryOp, l: Value, r: Value) -> Result<Value> {
        let (lt, rt) = (l.ty(), r.ty());
        let (Value::Slot { ptr: a, ty: Type::String }, Value::Slot { ptr: b, ty: Type::String }) =
            (l, r)
        else {
            return Err(unsupported(op, lt, rt));
        };
        match op {
            BinaryOp::Add => {
                let la = self.builder.str_len(a);
                let lb = self.builder.str_len(b);
                let total = self.builder.binary(BinOp::Add, la, lb);
                let out = self.builder.alloca(SlotType::Str);
                self.builder.str_resize(out, total);
                let zero = self.builder.constant(Word::I64(0));
                self.builder.str_copy(out, zero, a);
                self.builder.str_copy(out, la, b);
                Ok(Value::Slot {
                    ptr: out,
                    ty: Type::String,
                })
            }
            BinaryOp::Eq | BinaryOp::NotEq => {
                let c = self.call_internal_value("ax.strcmp", vec![a, b], ScalarKind::Int32)?;
                let zero = self.builder.constant(Word::I32(0));
                let cmp = if op == BinaryOp::Eq { CmpOp::Eq } else { CmpOp::Ne };
                Ok(Value::Scalar {
                    reg: self.builder.compare(cmp, c, zero),
                    kind: ScalarKind::Bool,
                })
            }
            _ => Err(unsupported(op, lt, rt)),
        }
    }

    /// Apply a unary operator
    pub(super) fn unary_value(&mut self, op: UnaryOp, v: Value) -> Result<Value> {
        let ty = v.ty();
        let fail = || Error::unsupported(op.to_string(), ty.to_string());
        match (op, v) {
            (UnaryOp::Plus, Value::Scalar { .. } | Value::Slot { ty: Type::Array { .. }, .. }) => {
                Ok(v)
            }
            (UnaryOp::Minus, Value::Scalar { reg, kind }) => {
                let kind_out = if kind == ScalarKind::Bool {
                    ScalarKind::Int32
                } else {
                    kind
                };
                let src = self.cast_to(reg, kind, kind_out);
                Ok(Value::Scalar {
                    reg: self.builder.unary(UnOp::Neg, src),
                    kind: kind_out,
                })
            }
            (UnaryOp::Minus, Value::Slot { ptr, ty: Type::Array { elem, len } }) => {
                let out_ty = Type::array(elem, len);
                let slot = self.alloc(out_ty)?;
                for i in 0..len {
                    let src = self.builder.element_ptr_const(ptr, i, len);
                    let x = self.builder.load(src);
                    let n = self.builder.unary(UnOp::Neg, x);
                    let dst = self.builder.element_ptr_const(slot, i, len);
                    self.builder.store(dst, n);
                }
                Ok(Value::Slot { ptr: slot, ty: out_ty })
            }
            (UnaryOp::Not, Value::Scalar { .. }) => {
                let b = self.truthy(v)?;
                Ok(Value::Scalar {
                    reg: self.builder.unary(UnOp::Not, b),
                    kind: ScalarKind::Bool,
                })
            }
            (UnaryOp::BitNot, Value::Scalar { reg, kind }) if !kind.is_float() => {
                let kind_out = if kind == ScalarKind::Bool {
                    ScalarKind::Int32
                } else {
                    kind
                };
                let src = self.cast_to(reg, kind, kind_out);
                Ok(Value::Scalar {
                    reg: self.builder.unary(UnOp::BitNot, src),
                    kind: kind_out,
                })
            }
            _ => Err(fail()),
        }
    }
}
