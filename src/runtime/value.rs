//! Runtime words: the values held in registers and memory cells of running kernels

use crate::compiler::ir::{BinOp, CmpOp, UnOp};
use crate::error::{Error, Result};
use crate::types::ScalarKind;
use std::fmt;

/// Integer arithmetic: wrapping, division by zero yields zero, floored modulo
macro_rules! int_binary {
    ($op:expr, $a:expr, $b:expr, $t:ty) => {{
        let (a, b): ($t, $t) = ($a, $b);
        let r: Result<$t> = match $op {
            BinOp::Add => Ok(a.wrapping_add(b)),
            BinOp::Sub => Ok(a.wrapping_sub(b)),
            BinOp::Mul => Ok(a.wrapping_mul(b)),
            BinOp::Div => Ok(if b == 0 { 0 } else { a.wrapping_div(b) }),
            BinOp::Rem => Ok(if b == 0 {
                0
            } else {
                let r = a.wrapping_rem(b);
                if r != 0 && ((r < 0) != (b < 0)) {
                    r.wrapping_add(b)
                } else {
                    r
                }
            }),
            BinOp::And => Ok(a & b),
            BinOp::Or => Ok(a | b),
            BinOp::Xor => Ok(a ^ b),
            BinOp::Shl => Ok(a.wrapping_shl(b as u32)),
            BinOp::Shr => Ok(a.wrapping_shr(b as u32)),
        };
        r
    }};
}

/// Float arithmetic: IEEE division, floored modulo; bitwise ops are rejected
macro_rules! float_binary {
    ($op:expr, $a:expr, $b:expr) => {{
        let (a, b) = ($a, $b);
        match $op {
            BinOp::Add => Ok(a + b),
            BinOp::Sub => Ok(a - b),
            BinOp::Mul => Ok(a * b),
            BinOp::Div => Ok(a / b),
            BinOp::Rem => Ok(a - b * (a / b).floor()),
            other => Err(Error::execution(format!(
                "bitwise operator {:?} applied to floating point operands",
                other
            ))),
        }
    }};
}

/// Address of a memory cell in a kernel's [`Memory`](super::Memory)
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ptr(pub u32);

impl Ptr {
    /// Pointer to the cell `index` cells further on
    pub fn offset(self, index: usize) -> Ptr {
        Ptr(self.0 + index as u32)
    }
}

/// Register / cell value
///
/// The layout is fixed so generated code can read and write cells in place:
/// a `u32` tag at offset 0 and the payload at [`Word::PAYLOAD_OFFSET`].
#[repr(C, u32)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Word {
    /// No value
    Void = 0,
    /// Boolean
    Bool(bool) = 1,
    /// 16-bit integer
    I16(i16) = 2,
    /// 32-bit integer
    I32(i32) = 3,
    /// 64-bit integer
    I64(i64) = 4,
    /// 32-bit float
    F32(f32) = 5,
    /// 64-bit float
    F64(f64) = 6,
    /// Pointer into kernel memory
    Ptr(Ptr) = 7,
    /// Opaque handle resolved by the kernel environment
    Handle(u32) = 8,
    /// String buffer owned by kernel memory; only ever stored in cells
    Str(u32) = 9,
}

impl Word {
    /// Size of a word in bytes
    pub const SIZE: usize = 16;
    /// Byte offset of the payload
    pub const PAYLOAD_OFFSET: i32 = 8;

    /// Tag of the void word
    pub const TAG_VOID: u32 = 0;
    /// Tag of pointer words
    pub const TAG_PTR: u32 = 7;
    /// Tag of handle words
    pub const TAG_HANDLE: u32 = 8;
    /// Tag of string cells
    pub const TAG_STR: u32 = 9;

    /// Tag written for scalars of `kind`
    pub fn tag_of(kind: ScalarKind) -> u32 {
        match kind {
            ScalarKind::Bool => 1,
            ScalarKind::Int16 => 2,
            ScalarKind::Int32 => 3,
            ScalarKind::Int64 => 4,
            ScalarKind::Float => 5,
            ScalarKind::Double => 6,
        }
    }

    /// Scalar kind carried by `tag`
    pub fn kind_of_tag(tag: u32) -> Option<ScalarKind> {
        ScalarKind::ALL.into_iter().find(|k| Word::tag_of(*k) == tag)
    }

    /// Tag of this word
    pub fn tag(&self) -> u32 {
        match self {
            Word::Void => Word::TAG_VOID,
            Word::Ptr(_) => Word::TAG_PTR,
            Word::Handle(_) => Word::TAG_HANDLE,
            Word::Str(_) => Word::TAG_STR,
            scalar => scalar.kind().map(Word::tag_of).unwrap_or(Word::TAG_VOID),
        }
    }

    /// Zero value of a scalar kind
    pub fn zero(kind: ScalarKind) -> Word {
        match kind {
            ScalarKind::Bool => Word::Bool(false),
            ScalarKind::Int16 => Word::I16(0),
            ScalarKind::Int32 => Word::I32(0),
            ScalarKind::Int64 => Word::I64(0),
            ScalarKind::Float => Word::F32(0.0),
            ScalarKind::Double => Word::F64(0.0),
        }
    }

    /// One value of a scalar kind
    pub fn one(kind: ScalarKind) -> Word {
        match kind {
            ScalarKind::Bool => Word::Bool(true),
            ScalarKind::Int16 => Word::I16(1),
            ScalarKind::Int32 => Word::I32(1),
            ScalarKind::Int64 => Word::I64(1),
            ScalarKind::Float => Word::F32(1.0),
            ScalarKind::Double => Word::F64(1.0),
        }
    }

    /// Build a word of `kind` from an f64
    pub fn from_f64(kind: ScalarKind, v: f64) -> Word {
        Word::F64(v).cast(kind)
    }

    /// Build a word of `kind` from an i64
    pub fn from_i64(kind: ScalarKind, v: i64) -> Word {
        Word::I64(v).cast(kind)
    }

    /// Scalar kind of the word, if it is a scalar
    pub fn kind(&self) -> Option<ScalarKind> {
        match self {
            Word::Bool(_) => Some(ScalarKind::Bool),
            Word::I16(_) => Some(ScalarKind::Int16),
            Word::I32(_) => Some(ScalarKind::Int32),
            Word::I64(_) => Some(ScalarKind::Int64),
            Word::F32(_) => Some(ScalarKind::Float),
            Word::F64(_) => Some(ScalarKind::Double),
            _ => None,
        }
    }

    /// Numeric value as f64 (bools are 0/1, non-scalars 0)
    pub fn as_f64(&self) -> f64 {
        match *self {
            Word::Bool(b) => b as i32 as f64,
            Word::I16(v) => v as f64,
            Word::I32(v) => v as f64,
            Word::I64(v) => v as f64,
            Word::F32(v) => v as f64,
            Word::F64(v) => v,
            _ => 0.0,
        }
    }

    /// Numeric value as i64, truncating floats
    pub fn as_i64(&self) -> i64 {
        match *self {
            Word::Bool(b) => b as i64,
            Word::I16(v) => v as i64,
            Word::I32(v) => v as i64,
            Word::I64(v) => v,
            Word::F32(v) => v as i64,
            Word::F64(v) => v as i64,
            _ => 0,
        }
    }

    /// Truthiness: comparison against zero
    pub fn truthy(&self) -> bool {
        match *self {
            Word::Bool(b) => b,
            Word::I16(v) => v != 0,
            Word::I32(v) => v != 0,
            Word::I64(v) => v != 0,
            Word::F32(v) => v != 0.0,
            Word::F64(v) => v != 0.0,
            _ => false,
        }
    }

    /// Numeric conversion to `kind`
    ///
    /// A bool target compares against zero rather than truncating bits.
    pub fn cast(self, kind: ScalarKind) -> Word {
        if self.kind() == Some(kind) {
            return self;
        }
        match kind {
            ScalarKind::Bool => Word::Bool(self.truthy()),
            ScalarKind::Int16 => Word::I16(self.int_bits() as i16),
            ScalarKind::Int32 => Word::I32(self.int_bits() as i32),
            ScalarKind::Int64 => Word::I64(self.int_bits()),
            ScalarKind::Float => Word::F32(self.as_f64() as f32),
            ScalarKind::Double => Word::F64(self.as_f64()),
        }
    }

    /// Integer conversion with float saturation and integer wrap-around
    fn int_bits(&self) -> i64 {
        match *self {
            Word::F32(v) => v as i64,
            Word::F64(v) => v as i64,
            _ => self.as_i64(),
        }
    }

    /// Pointer payload
    pub fn as_ptr(&self) -> Result<Ptr> {
        match self {
            Word::Ptr(p) => Ok(*p),
            other => Err(Error::execution(format!(
                "expected a pointer operand, found {}",
                other
            ))),
        }
    }

    /// Handle payload
    pub fn as_handle(&self) -> Result<u32> {
        match self {
            Word::Handle(h) => Ok(*h),
            other => Err(Error::execution(format!(
                "expected an opaque handle, found {}",
                other
            ))),
        }
    }

    /// Apply a binary arithmetic / bitwise operator to two words of one kind
    pub fn binary(op: BinOp, lhs: Word, rhs: Word) -> Result<Word> {
        use Word::*;
        let out = match (lhs, rhs) {
            (I16(a), I16(b)) => I16(int_binary!(op, a, b, i16)?),
            (I32(a), I32(b)) => I32(int_binary!(op, a, b, i32)?),
            (I64(a), I64(b)) => I64(int_binary!(op, a, b, i64)?),
            (F32(a), F32(b)) => F32(float_binary!(op, a, b)?),
            (F64(a), F64(b)) => F64(float_binary!(op, a, b)?),
            (Bool(a), Bool(b)) => match op {
                BinOp::And => Bool(a & b),
                BinOp::Or => Bool(a | b),
                BinOp::Xor => Bool(a ^ b),
                _ => {
                    let r = Word::binary(op, I32(a as i32), I32(b as i32))?;
                    Bool(r.truthy())
                }
            },
            (a, b) => {
                return Err(Error::execution(format!(
                    "operand kinds differ for {:?}: {} and {}",
                    op, a, b
                )))
            }
        };
        Ok(out)
    }

    /// Compare two words of one kind
    pub fn compare(op: CmpOp, lhs: Word, rhs: Word) -> Result<bool> {
        use std::cmp::Ordering;
        let ord = match (lhs, rhs) {
            (Word::Bool(a), Word::Bool(b)) => a.partial_cmp(&b),
            (Word::I16(a), Word::I16(b)) => a.partial_cmp(&b),
            (Word::I32(a), Word::I32(b)) => a.partial_cmp(&b),
            (Word::I64(a), Word::I64(b)) => a.partial_cmp(&b),
            (Word::F32(a), Word::F32(b)) => a.partial_cmp(&b),
            (Word::F64(a), Word::F64(b)) => a.partial_cmp(&b),
            (a, b) => {
                return Err(Error::execution(format!(
                    "operand kinds differ for {:?}: {} and {}",
                    op, a, b
                )))
            }
        };
        // unordered (NaN) compares false except for !=
        let Some(ord) = ord else {
            return Ok(op == CmpOp::Ne);
        };
        Ok(match op {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        })
    }

    /// Apply a unary operator
    pub fn unary(op: UnOp, value: Word) -> Result<Word> {
        use Word::*;
        let out = match (op, value) {
            (UnOp::Neg, I16(v)) => I16(v.wrapping_neg()),
            (UnOp::Neg, I32(v)) => I32(v.wrapping_neg()),
            (UnOp::Neg, I64(v)) => I64(v.wrapping_neg()),
            (UnOp::Neg, F32(v)) => F32(-v),
            (UnOp::Neg, F64(v)) => F64(-v),
            (UnOp::Neg, Bool(v)) => I32(-(v as i32)),
            (UnOp::BitNot, I16(v)) => I16(!v),
            (UnOp::BitNot, I32(v)) => I32(!v),
            (UnOp::BitNot, I64(v)) => I64(!v),
            (UnOp::BitNot, Bool(v)) => Bool(!v),
            (UnOp::Not, v) if v.kind().is_some() => Bool(!v.truthy()),
            (op, v) => {
                return Err(Error::execution(format!(
                    "invalid operand {} for {:?}",
                    v, op
                )))
            }
        };
        Ok(out)
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Word::Void => f.write_str("void"),
            Word::Bool(v) => write!(f, "{}", v),
            Word::I16(v) => write!(f, "{}i16", v),
            Word::I32(v) => write!(f, "{}", v),
            Word::I64(v) => write!(f, "{}i64", v),
            Word::F32(v) => write!(f, "{}f", v),
            Word::F64(v) => write!(f, "{}d", v),
            Word::Ptr(p) => write!(f, "ptr({})", p.0),
            Word::Handle(h) => write!(f, "handle({})", h),
            Word::Str(id) => write!(f, "str({})", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_cast_is_truthiness() {
        assert_eq!(Word::I32(2).cast(ScalarKind::Bool), Word::Bool(true));
        assert_eq!(Word::F32(0.5).cast(ScalarKind::Bool), Word::Bool(true));
        assert_eq!(Word::F64(0.0).cast(ScalarKind::Bool), Word::Bool(false));
        // 256 truncated to 8 bits would be 0
        assert_eq!(Word::I32(256).cast(ScalarKind::Bool), Word::Bool(true));
    }

    #[test]
    fn test_numeric_casts() {
        assert_eq!(Word::F32(2.75).cast(ScalarKind::Int32), Word::I32(2));
        assert_eq!(Word::I32(3).cast(ScalarKind::Double), Word::F64(3.0));
        assert_eq!(Word::I64(70000).cast(ScalarKind::Int16), Word::I16(4464));
        assert_eq!(Word::Bool(true).cast(ScalarKind::Float), Word::F32(1.0));
    }

    #[test]
    fn test_integer_division_and_modulo() {
        assert_eq!(
            Word::binary(BinOp::Div, Word::I32(7), Word::I32(0)).unwrap(),
            Word::I32(0)
        );
        assert_eq!(
            Word::binary(BinOp::Rem, Word::I32(-7), Word::I32(3)).unwrap(),
            Word::I32(2)
        );
        assert_eq!(
            Word::binary(BinOp::Rem, Word::I32(7), Word::I32(3)).unwrap(),
            Word::I32(1)
        );
    }

    #[test]
    fn test_float_bitwise_rejected() {
        assert!(Word::binary(BinOp::And, Word::F32(1.0), Word::F32(2.0)).is_err());
    }

    #[test]
    fn test_layout_is_tag_then_payload() {
        assert_eq!(std::mem::size_of::<Word>(), Word::SIZE);
        let words = [Word::I32(-7), Word::F64(2.5), Word::Bool(true), Word::Handle(3)];
        for w in words {
            let base = &w as *const Word as *const u8;
            let tag = unsafe { *(base as *const u32) };
            assert_eq!(tag, w.tag());
            let payload = unsafe { base.add(Word::PAYLOAD_OFFSET as usize) };
            match w {
                Word::I32(v) => assert_eq!(unsafe { *(payload as *const i32) }, v),
                Word::F64(v) => assert_eq!(unsafe { *(payload as *const f64) }, v),
                Word::Bool(v) => assert_eq!(unsafe { *payload }, v as u8),
                Word::Handle(v) => assert_eq!(unsafe { *(payload as *const u32) }, v),
                _ => unreachable!(),
            }
        }
        assert_eq!(Word::kind_of_tag(Word::F32(0.0).tag()), Some(ScalarKind::Float));
        assert_eq!(Word::kind_of_tag(Word::TAG_PTR), None);
    }

    #[test]
    fn test_compare_nan() {
        let nan = Word::F64(f64::NAN);
        assert!(!Word::compare(CmpOp::Eq, nan, nan).unwrap());
        assert!(Word::compare(CmpOp::Ne, nan, nan).unwrap());
    }
}
