//! Static register types
//!
//! Every register has one machine-level type. Parameters and call results
//! are declared; everything else follows from the defining instruction.

use super::instruction::{Inst, Reg, UnOp};
use super::program::IrFunction;
use crate::runtime::{SlotType, Word};
use crate::types::ScalarKind;
use std::fmt;

/// What a memory cell holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellType {
    /// Scalar of one kind
    Scalar(ScalarKind),
    /// Opaque handle
    Handle,
    /// String buffer
    Str,
}

impl CellType {
    /// Cell type of the slots `slot` allocates
    pub fn of_slot(slot: SlotType) -> CellType {
        match slot {
            SlotType::Scalar(k) | SlotType::Array(k, _) => CellType::Scalar(k),
            SlotType::Str => CellType::Str,
            SlotType::Handles(_) => CellType::Handle,
        }
    }
}

/// Type of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegType {
    /// Scalar value
    Scalar(ScalarKind),
    /// Opaque handle
    Handle,
    /// Cell index into kernel memory
    Ptr(CellType),
}

impl RegType {
    /// Bool register
    pub const BOOL: RegType = RegType::Scalar(ScalarKind::Bool);
    /// int32 register
    pub const INT32: RegType = RegType::Scalar(ScalarKind::Int32);
    /// int64 register
    pub const INT64: RegType = RegType::Scalar(ScalarKind::Int64);
    /// Pointer to a handle array
    pub const HANDLES: RegType = RegType::Ptr(CellType::Handle);

    /// Type of a constant word
    pub fn of_word(word: &Word) -> Option<RegType> {
        match word {
            Word::Handle(_) => Some(RegType::Handle),
            w => w.kind().map(RegType::Scalar),
        }
    }

    /// Scalar kind, if the register holds one
    pub fn scalar(&self) -> Option<ScalarKind> {
        match self {
            RegType::Scalar(k) => Some(*k),
            _ => None,
        }
    }

    /// Value type of the cell behind a pointer
    pub fn pointee(&self) -> Option<RegType> {
        match self {
            RegType::Ptr(CellType::Scalar(k)) => Some(RegType::Scalar(*k)),
            RegType::Ptr(CellType::Handle) => Some(RegType::Handle),
            _ => None,
        }
    }

    /// Word tag written for values of this type
    pub fn tag(&self) -> u32 {
        match self {
            RegType::Scalar(k) => Word::tag_of(*k),
            RegType::Handle => Word::TAG_HANDLE,
            RegType::Ptr(_) => Word::TAG_PTR,
        }
    }
}

impl fmt::Display for RegType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegType::Scalar(k) => write!(f, "{}", k),
            RegType::Handle => f.write_str("handle"),
            RegType::Ptr(CellType::Scalar(k)) => write!(f, "ptr<{}>", k),
            RegType::Ptr(CellType::Handle) => f.write_str("ptr<handle>"),
            RegType::Ptr(CellType::Str) => f.write_str("ptr<string>"),
        }
    }
}

fn infer(inst: &Inst, types: &[Option<RegType>]) -> Result<Option<RegType>, String> {
    let of = |r: &Reg| types.get(r.0 as usize).copied().flatten();
    let ty = match inst {
        Inst::Const { value, .. } => Some(
            RegType::of_word(value).ok_or_else(|| format!("constant {} has no register type", value))?,
        ),
        Inst::Alloca { slot, .. } => Some(RegType::Ptr(CellType::of_slot(*slot))),
        Inst::Load { ptr, .. } => match of(ptr) {
            Some(p) => Some(
                p.pointee()
                    .ok_or_else(|| format!("load through {} which is not a value pointer", p))?,
            ),
            None => None,
        },
        Inst::ElementPtr { base, .. } => of(base),
        Inst::Cast { to, .. } => Some(RegType::Scalar(*to)),
        Inst::Binary { lhs, .. } => of(lhs),
        Inst::Compare { .. } => Some(RegType::BOOL),
        Inst::Unary { op, src, .. } => match (op, of(src)) {
            (UnOp::Not, _) => Some(RegType::BOOL),
            (UnOp::Neg, Some(RegType::Scalar(ScalarKind::Bool))) => Some(RegType::INT32),
            (_, t) => t,
        },
        Inst::Select { then_value, .. } => of(then_value),
        Inst::Phi { incoming, .. } => incoming.iter().find_map(|(_, r)| of(r)),
        Inst::Call { dst, .. } => dst.map(|(_, t)| t),
        Inst::Global { .. } | Inst::StrLen { .. } => Some(RegType::INT64),
        Inst::Store { .. } | Inst::StoreStr { .. } | Inst::StrResize { .. } | Inst::StrCopy { .. } => {
            None
        }
    };
    Ok(ty)
}

/// Type of every register of `func`, indexed by register number
///
/// Runs to a fixpoint so phis may name registers defined later in block
/// order. A register left `None` is never defined.
pub fn register_types(func: &IrFunction) -> Result<Vec<Option<RegType>>, String> {
    let mut types = vec![None; func.reg_count.max(func.params.len() as u32) as usize];
    for (i, p) in func.params.iter().enumerate() {
        types[i] = Some(*p);
    }
    loop {
        let mut changed = false;
        for inst in func.blocks.iter().flat_map(|b| &b.insts) {
            let Some(dst) = inst.def() else { continue };
            let slot = types
                .get_mut(dst.0 as usize)
                .ok_or_else(|| format!("register {} exceeds the register count", dst))?;
            if slot.is_some() {
                continue;
            }
            let ty = infer(inst, &types)?;
            if let Some(t) = ty {
                types[dst.0 as usize] = Some(t);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    Ok(types)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{BinOp, CmpOp, FunctionBuilder};

    #[test]
    fn test_types_follow_definitions() {
        let mut b = FunctionBuilder::new("f", &[RegType::INT32], None);
        let x = b.param(0);
        let slot = b.alloca(SlotType::Array(ScalarKind::Float, 3));
        let e = b.element_ptr(slot, x, 3);
        let v = b.load(e);
        let d = b.cast(v, ScalarKind::Double);
        let s = b.binary(BinOp::Add, d, d);
        let c = b.compare(CmpOp::Gt, s, d);
        let n = b.unary(UnOp::Neg, c);
        b.ret(None);
        let f = b.finish();
        let types = register_types(&f).unwrap();
        let at = |r: Reg| types[r.0 as usize];
        assert_eq!(at(slot), Some(RegType::Ptr(CellType::Scalar(ScalarKind::Float))));
        assert_eq!(at(e), at(slot));
        assert_eq!(at(v), Some(RegType::Scalar(ScalarKind::Float)));
        assert_eq!(at(s), Some(RegType::Scalar(ScalarKind::Double)));
        assert_eq!(at(c), Some(RegType::BOOL));
        assert_eq!(at(n), Some(RegType::INT32));
    }

    #[test]
    fn test_phi_resolves_forward_reference() {
        let mut b = FunctionBuilder::new("f", &[], Some(RegType::INT64));
        let head = b.create_block("head");
        let body = b.create_block("body");
        let entry = b.current_block();
        let zero = b.constant(Word::I64(0));
        b.br(head);
        b.switch_to(body);
        let one = b.constant(Word::I64(1));
        b.br(head);
        b.switch_to(head);
        // first incoming value is defined after the phi in block order
        let p = b.phi(vec![(body, one), (entry, zero)]);
        b.ret(Some(p));
        let types = register_types(&b.finish()).unwrap();
        assert_eq!(types[p.0 as usize], Some(RegType::INT64));
    }

    #[test]
    fn test_string_cells_cannot_be_loaded() {
        let mut b = FunctionBuilder::new("f", &[], None);
        let s = b.alloca(SlotType::Str);
        b.load(s);
        b.ret(None);
        let err = register_types(&b.finish()).unwrap_err();
        assert!(err.contains("ptr<string>"));
    }
}
