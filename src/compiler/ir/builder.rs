//! Instruction builder positioned at the end of one block

use super::instruction::{BinOp, BlockId, CmpOp, Inst, Reg, Terminator, UnOp};
use super::program::{BasicBlock, IrFunction};
use super::types::RegType;
use crate::runtime::{SlotType, Word};
use crate::types::ScalarKind;

/// Appends instructions to a function under construction
///
/// Emitting into a block that already has a terminator is a no-op: after
/// `return`, `break` or `continue` the generator keeps walking siblings for
/// diagnostics but nothing reaches the terminated block.
#[derive(Debug)]
pub struct FunctionBuilder {
    func: IrFunction,
    current: BlockId,
}

impl FunctionBuilder {
    /// Start building `name` taking `params` and returning `ret`
    pub fn new(name: &str, params: &[RegType], ret: Option<RegType>) -> Self {
        Self {
            func: IrFunction::new(name, params, ret),
            current: BlockId(0),
        }
    }

    /// Finish and return the function
    pub fn finish(self) -> IrFunction {
        self.func
    }

    /// Function under construction
    pub fn function(&self) -> &IrFunction {
        &self.func
    }

    /// Register holding parameter `index`
    pub fn param(&self, index: u32) -> Reg {
        Reg(index)
    }

    /// Block instructions are currently appended to
    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Create a new empty block
    pub fn create_block(&mut self, label: &str) -> BlockId {
        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(BasicBlock::new(id, label));
        id
    }

    /// Move the insertion point to the end of `block`
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// True when the current block already has a terminator
    pub fn is_terminated(&self) -> bool {
        self.func
            .block(self.current)
            .map(|b| b.terminator.is_some())
            .unwrap_or(true)
    }

    fn fresh(&mut self) -> Reg {
        let r = Reg(self.func.reg_count);
        self.func.reg_count += 1;
        r
    }

    fn push(&mut self, inst: Inst) {
        if self.is_terminated() {
            return;
        }
        if let Some(block) = self.func.block_mut(self.current) {
            block.insts.push(inst);
        }
    }

    fn terminate(&mut self, term: Terminator) {
        if self.is_terminated() {
            return;
        }
        if let Some(block) = self.func.block_mut(self.current) {
            block.terminator = Some(term);
        }
    }

    /// Scalar constant
    pub fn constant(&mut self, value: Word) -> Reg {
        let dst = self.fresh();
        self.push(Inst::Const { dst, value });
        dst
    }

    /// Zeroed frame slot; always placed in the entry block so loops reuse it
    pub fn alloca(&mut self, slot: SlotType) -> Reg {
        let dst = self.fresh();
        if let Some(entry) = self.func.block_mut(BlockId(0)) {
            let at = entry
                .insts
                .iter()
                .position(|i| !matches!(i, Inst::Alloca { .. }))
                .unwrap_or(entry.insts.len());
            entry.insts.insert(at, Inst::Alloca { dst, slot });
        }
        dst
    }

    /// dst = *ptr
    pub fn load(&mut self, ptr: Reg) -> Reg {
        let dst = self.fresh();
        self.push(Inst::Load { dst, ptr });
        dst
    }

    /// *ptr = value
    pub fn store(&mut self, ptr: Reg, value: Reg) {
        self.push(Inst::Store { ptr, value });
    }

    /// Pointer to element `index` of a container of `len` elements
    pub fn element_ptr(&mut self, base: Reg, index: Reg, len: usize) -> Reg {
        let dst = self.fresh();
        self.push(Inst::ElementPtr {
            dst,
            base,
            index,
            len,
        });
        dst
    }

    /// Pointer to a constant element index
    pub fn element_ptr_const(&mut self, base: Reg, index: usize, len: usize) -> Reg {
        let i = self.constant(Word::I32(index as i32));
        self.element_ptr(base, i, len)
    }

    /// Numeric conversion
    pub fn cast(&mut self, src: Reg, to: ScalarKind) -> Reg {
        let dst = self.fresh();
        self.push(Inst::Cast { dst, src, to });
        dst
    }

    /// Arithmetic or bitwise operation
    pub fn binary(&mut self, op: BinOp, lhs: Reg, rhs: Reg) -> Reg {
        let dst = self.fresh();
        self.push(Inst::Binary { dst, op, lhs, rhs });
        dst
    }

    /// Comparison producing a bool
    pub fn compare(&mut self, op: CmpOp, lhs: Reg, rhs: Reg) -> Reg {
        let dst = self.fresh();
        self.push(Inst::Compare { dst, op, lhs, rhs });
        dst
    }

    /// Unary operation
    pub fn unary(&mut self, op: UnOp, src: Reg) -> Reg {
        let dst = self.fresh();
        self.push(Inst::Unary { dst, op, src });
        dst
    }

    /// cond ? a : b
    pub fn select(&mut self, cond: Reg, then_value: Reg, else_value: Reg) -> Reg {
        let dst = self.fresh();
        self.push(Inst::Select {
            dst,
            cond,
            then_value,
            else_value,
        });
        dst
    }

    /// Join values arriving from predecessor blocks
    pub fn phi(&mut self, incoming: Vec<(BlockId, Reg)>) -> Reg {
        let dst = self.fresh();
        self.push(Inst::Phi { dst, incoming });
        dst
    }

    /// Call returning a value of type `ret`
    pub fn call(&mut self, callee: &str, args: Vec<Reg>, ret: RegType) -> Reg {
        let dst = self.fresh();
        self.push(Inst::Call {
            dst: Some((dst, ret)),
            callee: callee.to_string(),
            args,
        });
        dst
    }

    /// Call without a result
    pub fn call_void(&mut self, callee: &str, args: Vec<Reg>) {
        self.push(Inst::Call {
            dst: None,
            callee: callee.to_string(),
            args,
        });
    }

    /// Value bound to a global symbol
    pub fn global(&mut self, name: &str) -> Reg {
        let dst = self.fresh();
        self.push(Inst::Global {
            dst,
            name: name.to_string(),
        });
        dst
    }

    /// Overwrite a string slot with constant bytes
    pub fn store_str(&mut self, ptr: Reg, value: &[u8]) {
        self.push(Inst::StoreStr {
            ptr,
            value: value.to_vec(),
        });
    }

    /// Byte length of a string
    pub fn str_len(&mut self, ptr: Reg) -> Reg {
        let dst = self.fresh();
        self.push(Inst::StrLen { dst, ptr });
        dst
    }

    /// Resize a string slot
    pub fn str_resize(&mut self, ptr: Reg, len: Reg) {
        self.push(Inst::StrResize { ptr, len });
    }

    /// Copy `src` into `dst` at byte `offset`
    pub fn str_copy(&mut self, dst: Reg, offset: Reg, src: Reg) {
        self.push(Inst::StrCopy { dst, offset, src });
    }

    /// Unconditional branch
    pub fn br(&mut self, target: BlockId) {
        self.terminate(Terminator::Br(target));
    }

    /// Conditional branch on a bool register
    pub fn cond_br(&mut self, cond: Reg, then_block: BlockId, else_block: BlockId) {
        self.terminate(Terminator::CondBr {
            cond,
            then_block,
            else_block,
        });
    }

    /// Return
    pub fn ret(&mut self, value: Option<Reg>) {
        self.terminate(Terminator::Ret(value));
    }

    /// Mark the end of the current block unreachable
    pub fn unreachable(&mut self) {
        self.terminate(Terminator::Unreachable);
    }

    /// Terminate every still open block with `unreachable`
    pub fn seal(&mut self) {
        for block in &mut self.func.blocks {
            if block.terminator.is_none() {
                block.terminator = Some(Terminator::Unreachable);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocas_hoisted_to_entry() {
        let mut b = FunctionBuilder::new("f", &[], None);
        let body = b.create_block("body");
        b.br(body);
        b.switch_to(body);
        let one = b.constant(Word::I32(1));
        let slot = b.alloca(SlotType::Scalar(ScalarKind::Int32));
        b.store(slot, one);
        b.ret(None);
        let f = b.finish();
        assert!(matches!(f.blocks[0].insts[0], Inst::Alloca { .. }));
        assert_eq!(f.blocks[1].insts.len(), 2);
    }

    #[test]
    fn test_emission_after_terminator_is_dropped() {
        let mut b = FunctionBuilder::new("f", &[], None);
        b.ret(None);
        b.constant(Word::I32(5));
        b.br(BlockId(0));
        let f = b.finish();
        assert!(f.blocks[0].insts.is_empty());
        assert_eq!(f.blocks[0].terminator, Some(Terminator::Ret(None)));
    }
}
