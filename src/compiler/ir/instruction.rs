//! IR instruction definitions

use super::types::RegType;
use crate::runtime::{SlotType, Word};
use crate::types::ScalarKind;
use std::fmt;

/// Virtual register; each register is defined by exactly one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Index of a basic block within its function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Arithmetic and bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division (integer division by zero yields zero)
    Div,
    /// Floored remainder
    Rem,
    /// Bitwise and
    And,
    /// Bitwise or
    Or,
    /// Bitwise xor
    Xor,
    /// Shift left
    Shl,
    /// Arithmetic shift right
    Shr,
}

/// Comparison predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    /// Arithmetic negation
    Neg,
    /// Logical not (result is bool)
    Not,
    /// Bitwise complement
    BitNot,
}

/// IR instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    // Constants
    /// Load a scalar constant
    Const {
        /// Destination register
        dst: Reg,
        /// Constant value
        value: Word,
    },

    // Memory
    /// Reserve a zeroed slot in the function frame; only valid in the entry block
    Alloca {
        /// Receives the slot pointer
        dst: Reg,
        /// Slot layout
        slot: SlotType,
    },
    /// dst = *ptr
    Load {
        /// Destination register
        dst: Reg,
        /// Source pointer
        ptr: Reg,
    },
    /// *ptr = value
    Store {
        /// Destination pointer
        ptr: Reg,
        /// Stored value
        value: Reg,
    },
    /// dst = base + index, checked against the container length
    ElementPtr {
        /// Receives the element pointer
        dst: Reg,
        /// Container pointer
        base: Reg,
        /// Element index (any integer kind)
        index: Reg,
        /// Number of elements in the container
        len: usize,
    },

    // Scalar arithmetic
    /// Numeric conversion
    Cast {
        /// Destination register
        dst: Reg,
        /// Converted value
        src: Reg,
        /// Target kind
        to: ScalarKind,
    },
    /// dst = lhs op rhs (operands of one kind)
    Binary {
        /// Destination register
        dst: Reg,
        /// Operator
        op: BinOp,
        /// Left operand
        lhs: Reg,
        /// Right operand
        rhs: Reg,
    },
    /// dst = lhs op rhs as bool
    Compare {
        /// Destination register
        dst: Reg,
        /// Predicate
        op: CmpOp,
        /// Left operand
        lhs: Reg,
        /// Right operand
        rhs: Reg,
    },
    /// dst = op src
    Unary {
        /// Destination register
        dst: Reg,
        /// Operator
        op: UnOp,
        /// Operand
        src: Reg,
    },
    /// dst = cond ? then_value : else_value
    Select {
        /// Destination register
        dst: Reg,
        /// Bool condition
        cond: Reg,
        /// Value when true
        then_value: Reg,
        /// Value when false
        else_value: Reg,
    },
    /// Join of values flowing in from predecessor blocks
    Phi {
        /// Destination register
        dst: Reg,
        /// (predecessor, value) pairs
        incoming: Vec<(BlockId, Reg)>,
    },

    // Calls and symbols
    /// Call a module function or a native symbol
    Call {
        /// Result register and its type, `None` for void calls
        dst: Option<(Reg, RegType)>,
        /// Symbol name, bound at link time
        callee: String,
        /// Arguments
        args: Vec<Reg>,
    },
    /// Load the value bound to a global symbol at link time
    Global {
        /// Destination register (int64)
        dst: Reg,
        /// Global symbol name
        name: String,
    },

    // Strings
    /// Overwrite a string slot with constant bytes
    StoreStr {
        /// String slot
        ptr: Reg,
        /// Bytes
        value: Vec<u8>,
    },
    /// dst = byte length of the string at ptr (int64)
    StrLen {
        /// Destination register
        dst: Reg,
        /// String slot
        ptr: Reg,
    },
    /// Resize the string at ptr to `len` bytes, zero filling
    StrResize {
        /// String slot
        ptr: Reg,
        /// New length (int64)
        len: Reg,
    },
    /// Copy all bytes of `src` into `dst` starting at byte `offset`
    StrCopy {
        /// Destination string slot
        dst: Reg,
        /// Byte offset into the destination (int64)
        offset: Reg,
        /// Source string slot
        src: Reg,
    },
}

impl Inst {
    /// Register defined by this instruction
    pub fn def(&self) -> Option<Reg> {
        match self {
            Inst::Const { dst, .. }
            | Inst::Alloca { dst, .. }
            | Inst::Load { dst, .. }
            | Inst::ElementPtr { dst, .. }
            | Inst::Cast { dst, .. }
            | Inst::Binary { dst, .. }
            | Inst::Compare { dst, .. }
            | Inst::Unary { dst, .. }
            | Inst::Select { dst, .. }
            | Inst::Phi { dst, .. }
            | Inst::Global { dst, .. }
            | Inst::StrLen { dst, .. } => Some(*dst),
            Inst::Call { dst, .. } => dst.map(|(r, _)| r),
            Inst::Store { .. } | Inst::StoreStr { .. } | Inst::StrResize { .. } | Inst::StrCopy { .. } => {
                None
            }
        }
    }

    /// Registers read by this instruction
    pub fn uses(&self) -> Vec<Reg> {
        match self {
            Inst::Const { .. } | Inst::Alloca { .. } | Inst::Global { .. } => Vec::new(),
            Inst::Load { ptr, .. } | Inst::StrLen { ptr, .. } | Inst::StoreStr { ptr, .. } => {
                vec![*ptr]
            }
            Inst::Store { ptr, value } => vec![*ptr, *value],
            Inst::ElementPtr { base, index, .. } => vec![*base, *index],
            Inst::Cast { src, .. } | Inst::Unary { src, .. } => vec![*src],
            Inst::Binary { lhs, rhs, .. } | Inst::Compare { lhs, rhs, .. } => vec![*lhs, *rhs],
            Inst::Select {
                cond,
                then_value,
                else_value,
                ..
            } => vec![*cond, *then_value, *else_value],
            Inst::Phi { incoming, .. } => incoming.iter().map(|(_, r)| *r).collect(),
            Inst::Call { args, .. } => args.clone(),
            Inst::StrResize { ptr, len } => vec![*ptr, *len],
            Inst::StrCopy { dst, offset, src } => vec![*dst, *offset, *src],
        }
    }

    /// Rewrite every register read by this instruction
    pub fn map_uses(&mut self, f: &mut dyn FnMut(Reg) -> Reg) {
        match self {
            Inst::Const { .. } | Inst::Alloca { .. } | Inst::Global { .. } => {}
            Inst::Load { ptr, .. } | Inst::StrLen { ptr, .. } | Inst::StoreStr { ptr, .. } => {
                *ptr = f(*ptr)
            }
            Inst::Store { ptr, value } => {
                *ptr = f(*ptr);
                *value = f(*value);
            }
            Inst::ElementPtr { base, index, .. } => {
                *base = f(*base);
                *index = f(*index);
            }
            Inst::Cast { src, .. } | Inst::Unary { src, .. } => *src = f(*src),
            Inst::Binary { lhs, rhs, .. } | Inst::Compare { lhs, rhs, .. } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
            Inst::Select {
                cond,
                then_value,
                else_value,
                ..
            } => {
                *cond = f(*cond);
                *then_value = f(*then_value);
                *else_value = f(*else_value);
            }
            Inst::Phi { incoming, .. } => {
                for (_, r) in incoming.iter_mut() {
                    *r = f(*r);
                }
            }
            Inst::Call { args, .. } => {
                for a in args.iter_mut() {
                    *a = f(*a);
                }
            }
            Inst::StrResize { ptr, len } => {
                *ptr = f(*ptr);
                *len = f(*len);
            }
            Inst::StrCopy { dst, offset, src } => {
                *dst = f(*dst);
                *offset = f(*offset);
                *src = f(*src);
            }
        }
    }

    /// True when removing the instruction is safe once its result is unused
    pub fn is_pure(&self) -> bool {
        !matches!(
            self,
            Inst::Store { .. }
                | Inst::Call { .. }
                | Inst::StoreStr { .. }
                | Inst::StrResize { .. }
                | Inst::StrCopy { .. }
        )
    }

    /// True for instructions that write memory
    pub fn writes_memory(&self) -> bool {
        !self.is_pure()
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Const { dst, value } => write!(f, "{} = const {}", dst, value),
            Inst::Alloca { dst, slot } => write!(f, "{} = alloca {:?}", dst, slot),
            Inst::Load { dst, ptr } => write!(f, "{} = load {}", dst, ptr),
            Inst::Store { ptr, value } => write!(f, "store {}, {}", value, ptr),
            Inst::ElementPtr {
                dst,
                base,
                index,
                len,
            } => write!(f, "{} = gep {}[{}] (len {})", dst, base, index, len),
            Inst::Cast { dst, src, to } => write!(f, "{} = cast {} to {}", dst, src, to),
            Inst::Binary { dst, op, lhs, rhs } => {
                write!(f, "{} = {:?} {}, {}", dst, op, lhs, rhs)
            }
            Inst::Compare { dst, op, lhs, rhs } => {
                write!(f, "{} = cmp {:?} {}, {}", dst, op, lhs, rhs)
            }
            Inst::Unary { dst, op, src } => write!(f, "{} = {:?} {}", dst, op, src),
            Inst::Select {
                dst,
                cond,
                then_value,
                else_value,
            } => write!(f, "{} = select {}, {}, {}", dst, cond, then_value, else_value),
            Inst::Phi { dst, incoming } => {
                write!(f, "{} = phi", dst)?;
                for (i, (b, r)) in incoming.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{}[{}, {}]", sep, r, b)?;
                }
                Ok(())
            }
            Inst::Call { dst, callee, args } => {
                if let Some((d, ty)) = dst {
                    write!(f, "{}: {} = ", d, ty)?;
                }
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "call {}({})", callee, args.join(", "))
            }
            Inst::Global { dst, name } => write!(f, "{} = global {}", dst, name),
            Inst::StoreStr { ptr, value } => {
                write!(f, "storestr {:?}, {}", String::from_utf8_lossy(value), ptr)
            }
            Inst::StrLen { dst, ptr } => write!(f, "{} = strlen {}", dst, ptr),
            Inst::StrResize { ptr, len } => write!(f, "strresize {}, {}", ptr, len),
            Inst::StrCopy { dst, offset, src } => {
                write!(f, "strcopy {} -> {}+{}", src, dst, offset)
            }
        }
    }
}

/// Block terminator
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    /// Unconditional branch
    Br(BlockId),
    /// Two-way branch on a bool register
    CondBr {
        /// Bool condition
        cond: Reg,
        /// Target when true
        then_block: BlockId,
        /// Target when false
        else_block: BlockId,
    },
    /// Return from the function
    Ret(Option<Reg>),
    /// Control never reaches the end of this block
    Unreachable,
}

impl Terminator {
    /// Successor blocks
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br(b) => vec![*b],
            Terminator::CondBr {
                then_block,
                else_block,
                ..
            } => {
                if then_block == else_block {
                    vec![*then_block]
                } else {
                    vec![*then_block, *else_block]
                }
            }
            Terminator::Ret(_) | Terminator::Unreachable => Vec::new(),
        }
    }

    /// Registers read by the terminator
    pub fn uses(&self) -> Vec<Reg> {
        match self {
            Terminator::CondBr { cond, .. } => vec![*cond],
            Terminator::Ret(Some(r)) => vec![*r],
            _ => Vec::new(),
        }
    }

    /// Rewrite every register read by the terminator
    pub fn map_uses(&mut self, f: &mut dyn FnMut(Reg) -> Reg) {
        match self {
            Terminator::CondBr { cond, .. } => *cond = f(*cond),
            Terminator::Ret(Some(r)) => *r = f(*r),
            _ => {}
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Br(b) => write!(f, "br {}", b),
            Terminator::CondBr {
                cond,
                then_block,
                else_block,
            } => write!(f, "condbr {}, {}, {}", cond, then_block, else_block),
            Terminator::Ret(Some(r)) => write!(f, "ret {}", r),
            Terminator::Ret(None) => write!(f, "ret void"),
            Terminator::Unreachable => write!(f, "unreachable"),
        }
    }
}
