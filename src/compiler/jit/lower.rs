//! Lowering of one IR function to Cranelift
//!
//! Every IR register becomes a frontend [`Variable`] of the register's
//! machine type, so phis turn into variable copies on incoming edges and the
//! frontend builds SSA. Memory cells are addressed as `cells + 16 * index`
//! with the payload at [`Word::PAYLOAD_OFFSET`]; every access is checked
//! against the arena length first.
//!
//! Compiled functions share one signature:
//!
//! ```text
//! fn(rt: *mut Runtime, args: *const Word, out: *mut Word) -> u32   // 0 = ok
//! ```

use super::runtime;
use crate::compiler::ir::{
    self, BinOp, BlockId, CellType, CmpOp, Inst, IrFunction, Reg, RegType, Terminator, UnOp,
};
use crate::runtime::{SlotType, Word};
use crate::types::ScalarKind;
use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{
    types, AbiParam, Block, FuncRef, InstBuilder, MemFlags, Signature, StackSlot, StackSlotData,
    StackSlotKind, Type, Value,
};
use cranelift_frontend::{FunctionBuilder, Variable};
use cranelift_jit::JITModule;
use cranelift_module::{DataDescription, FuncId, Linkage, Module};
use std::collections::HashMap;

type Lowered<T> = std::result::Result<T, String>;

/// Signature shared by every compiled function
pub(super) fn entry_signature(module: &JITModule) -> Signature {
    let ptr = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.extend([AbiParam::new(ptr), AbiParam::new(ptr), AbiParam::new(ptr)]);
    sig.returns.push(AbiParam::new(types::I32));
    sig
}

/// Runtime helpers declared once per module
pub(super) struct Helpers {
    alloca: FuncId,
    mark: FuncId,
    release: FuncId,
    call_native: FuncId,
    index_error: FuncId,
    memory_fault: FuncId,
    unreachable: FuncId,
    str_store: FuncId,
    str_len: FuncId,
    str_resize: FuncId,
    str_copy: FuncId,
}

impl Helpers {
    pub(super) fn declare(module: &mut JITModule) -> Lowered<Self> {
        let ptr = module.target_config().pointer_type();
        let mut declare = |name: &str, params: &[Type], ret: Option<Type>| -> Lowered<FuncId> {
            let mut sig = module.make_signature();
            sig.params.extend(params.iter().map(|t| AbiParam::new(*t)));
            sig.returns.extend(ret.map(AbiParam::new));
            module
                .declare_function(name, Linkage::Import, &sig)
                .map_err(|e| format!("declaring {}: {}", name, e))
        };
        use types::{I32, I64};
        Ok(Self {
            alloca: declare(runtime::ALLOCA, &[ptr, I32, I32], Some(I32))?,
            mark: declare(runtime::MARK, &[ptr], Some(I64))?,
            release: declare(runtime::RELEASE, &[ptr, I64], None)?,
            call_native: declare(runtime::CALL_NATIVE, &[ptr, ptr, ptr, I32, ptr, I32], Some(I32))?,
            index_error: declare(runtime::INDEX_ERROR, &[ptr, I64, I64], Some(I32))?,
            memory_fault: declare(runtime::MEMORY_FAULT, &[ptr, I64], Some(I32))?,
            unreachable: declare(runtime::UNREACHABLE, &[ptr, I32, I32], Some(I32))?,
            str_store: declare(runtime::STR_STORE, &[ptr, I32, ptr, I64], Some(I32))?,
            str_len: declare(runtime::STR_LEN, &[ptr, I32], Some(I64))?,
            str_resize: declare(runtime::STR_RESIZE, &[ptr, I32, I64], Some(I32))?,
            str_copy: declare(runtime::STR_COPY, &[ptr, I32, I64, I32], Some(I32))?,
        })
    }
}

/// How a call site reaches its callee
pub(super) enum Callee<'m> {
    /// Module function, called directly
    Function(FuncId, &'m IrFunction),
    /// Native symbol, called through the runtime trampoline
    Native(FuncId),
}

/// Symbols visible to the function being lowered
pub(super) struct Linked<'m> {
    pub helpers: &'m Helpers,
    pub callees: &'m HashMap<String, Callee<'m>>,
    pub globals: &'m HashMap<String, Word>,
}

fn clif_type(ty: RegType) -> Type {
    match ty {
        RegType::Scalar(ScalarKind::Bool) => types::I8,
        RegType::Scalar(ScalarKind::Int16) => types::I16,
        RegType::Scalar(ScalarKind::Int32) => types::I32,
        RegType::Scalar(ScalarKind::Int64) => types::I64,
        RegType::Scalar(ScalarKind::Float) => types::F32,
        RegType::Scalar(ScalarKind::Double) => types::F64,
        RegType::Handle | RegType::Ptr(_) => types::I32,
    }
}

/// Immediate for an integer constant of `ty`, zero extended from its width
fn imm(ty: Type, v: i64) -> i64 {
    match ty.bits() {
        64 => v,
        bits => v & ((1i64 << bits) - 1),
    }
}

fn slot_code(slot: SlotType) -> (u32, u32) {
    let count = slot.cells() as u32;
    match CellType::of_slot(slot) {
        CellType::Scalar(k) => (Word::tag_of(k), count),
        CellType::Handle => (Word::TAG_HANDLE, count),
        CellType::Str => (Word::TAG_STR, count),
    }
}

/// Lowers one IR function into the frontend builder it was given
pub(super) struct FunctionLowering<'a, 'm> {
    builder: FunctionBuilder<'a>,
    module: &'m mut JITModule,
    linked: &'m Linked<'m>,
    func: &'m IrFunction,
    index: u32,
    types: Vec<Option<RegType>>,
    blocks: HashMap<BlockId, Block>,
    refs: HashMap<FuncId, FuncRef>,
    ptr: Type,
    rt: Value,
    out: Value,
    mark: Value,
    fail: Block,
    fault: Option<Block>,
}

impl<'a, 'm> FunctionLowering<'a, 'm> {
    /// Lower `func`; `index` identifies it in runtime error messages
    pub(super) fn lower(
        mut builder: FunctionBuilder<'a>,
        module: &'m mut JITModule,
        linked: &'m Linked<'m>,
        func: &'m IrFunction,
        index: u32,
    ) -> Lowered<()> {
        let types = ir::register_types(func)?;
        let ptr = module.target_config().pointer_type();

        for (i, ty) in types.iter().enumerate() {
            if let Some(ty) = ty {
                builder.declare_var(Variable::from_u32(i as u32), clif_type(*ty));
            }
        }

        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        let fail = builder.create_block();
        let reachable = func.reachable();
        let mut blocks = HashMap::new();
        for block in &func.blocks {
            if reachable.contains(&block.id) {
                blocks.insert(block.id, builder.create_block());
            }
        }

        builder.switch_to_block(entry);
        let params = builder.block_params(entry).to_vec();
        let (rt, args, out) = (params[0], params[1], params[2]);
        let mut lowering = FunctionLowering {
            builder,
            module,
            linked,
            func,
            index,
            types,
            blocks,
            refs: HashMap::new(),
            ptr,
            rt,
            out,
            mark: rt,
            fail,
            fault: None,
        };
        lowering.prologue(args)?;
        for block in &func.blocks {
            if let Some(&target) = lowering.blocks.get(&block.id) {
                lowering.builder.switch_to_block(target);
                for inst in &block.insts {
                    lowering
                        .inst(inst)
                        .map_err(|e| format!("{} {}: {}", block.id, inst, e))?;
                }
                let term = block
                    .terminator
                    .as_ref()
                    .ok_or_else(|| format!("block {} has no terminator", block.id))?;
                lowering.terminator(block.id, term)?;
            }
        }

        lowering.finish_fault();
        lowering.builder.switch_to_block(fail);
        let one = lowering.builder.ins().iconst(types::I32, 1);
        lowering.builder.ins().return_(&[one]);

        lowering.builder.seal_all_blocks();
        lowering.builder.finalize();
        Ok(())
    }

    fn trusted() -> MemFlags {
        MemFlags::trusted()
    }

    fn var(r: Reg) -> Variable {
        Variable::from_u32(r.0)
    }

    fn ty(&self, r: Reg) -> Lowered<RegType> {
        self.types
            .get(r.0 as usize)
            .copied()
            .flatten()
            .ok_or_else(|| format!("register {} has no type", r))
    }

    fn get(&mut self, r: Reg) -> Lowered<Value> {
        self.ty(r)?;
        Ok(self.builder.use_var(Self::var(r)))
    }

    fn set(&mut self, r: Reg, v: Value) {
        self.builder.def_var(Self::var(r), v);
    }

    fn helper(&mut self, id: FuncId, args: &[Value]) -> Option<Value> {
        let func_ref = self.func_ref(id);
        let call = self.builder.ins().call(func_ref, args);
        self.builder.inst_results(call).first().copied()
    }

    fn func_ref(&mut self, id: FuncId) -> FuncRef {
        if let Some(r) = self.refs.get(&id) {
            return *r;
        }
        let r = self.module.declare_func_in_func(id, self.builder.func);
        self.refs.insert(id, r);
        r
    }

    /// Continue in a fresh block when `status` is zero, fail otherwise
    fn check(&mut self, status: Value) {
        let ok = self.builder.create_block();
        self.builder.ins().brif(status, self.fail, &[], ok, &[]);
        self.builder.switch_to_block(ok);
    }

    fn prologue(&mut self, args: Value) -> Lowered<()> {
        let rt = self.rt;
        self.mark = self
            .helper(self.linked.helpers.mark, &[rt])
            .ok_or("mark helper returns nothing")?;
        for (i, ty) in self.func.params.iter().enumerate() {
            let offset = (i * Word::SIZE) as i32 + Word::PAYLOAD_OFFSET;
            let v = self.builder.ins().load(clif_type(*ty), Self::trusted(), args, offset);
            let v = self.normalize(v, *ty);
            self.set(Reg(i as u32), v);
        }
        let first = *self
            .blocks
            .get(&BlockId(0))
            .ok_or("function has no entry block")?;
        self.builder.ins().jump(first, &[]);
        Ok(())
    }

    /// Loaded bools may hold any byte; squash them to 0 / 1
    fn normalize(&mut self, v: Value, ty: RegType) -> Value {
        if ty == RegType::BOOL {
            self.builder.ins().icmp_imm(IntCC::NotEqual, v, 0)
        } else {
            v
        }
    }

    fn iconst(&mut self, ty: Type, v: i64) -> Value {
        self.builder.ins().iconst(ty, imm(ty, v))
    }

    fn constant(&mut self, value: &Word) -> Lowered<Value> {
        let ins = self.builder.ins();
        Ok(match *value {
            Word::Bool(b) => ins.iconst(types::I8, b as i64),
            Word::I16(v) => ins.iconst(types::I16, imm(types::I16, v as i64)),
            Word::I32(v) => ins.iconst(types::I32, imm(types::I32, v as i64)),
            Word::I64(v) => ins.iconst(types::I64, v),
            Word::F32(v) => ins.f32const(v),
            Word::F64(v) => ins.f64const(v),
            Word::Handle(h) => ins.iconst(types::I32, h as i64),
            other => return Err(format!("constant {} cannot be materialised", other)),
        })
    }

    // Memory

    /// Address of cell `index` after checking it against the arena length
    fn cell_addr(&mut self, index: Value) -> Value {
        let index = self.builder.ins().uextend(types::I64, index);
        let len = self
            .builder
            .ins()
            .load(types::I64, Self::trusted(), self.rt, runtime::LEN_OFFSET);
        let outside = self
            .builder
            .ins()
            .icmp(IntCC::UnsignedGreaterThanOrEqual, index, len);
        let fault = self.fault_block();
        let ok = self.builder.create_block();
        self.builder.ins().brif(outside, fault, &[index], ok, &[]);
        self.builder.switch_to_block(ok);

        let base = self
            .builder
            .ins()
            .load(self.ptr, Self::trusted(), self.rt, runtime::CELLS_OFFSET);
        let offset = self.builder.ins().ishl_imm(index, 4);
        let offset = if self.ptr == types::I64 {
            offset
        } else {
            self.builder.ins().ireduce(self.ptr, offset)
        };
        self.builder.ins().iadd(base, offset)
    }

    /// Shared block reporting an out of bounds cell, filled in by [`Self::finish_fault`]
    fn fault_block(&mut self) -> Block {
        if let Some(b) = self.fault {
            return b;
        }
        let fault = self.builder.create_block();
        self.builder.append_block_param(fault, types::I64);
        self.fault = Some(fault);
        fault
    }

    fn finish_fault(&mut self) {
        let Some(fault) = self.fault else { return };
        self.builder.switch_to_block(fault);
        let cell = self.builder.block_params(fault)[0];
        let rt = self.rt;
        let memory_fault = self.linked.helpers.memory_fault;
        self.helper(memory_fault, &[rt, cell]);
        self.builder.ins().jump(self.fail, &[]);
    }

    /// Write tag and payload of a word
    fn store_word(&mut self, addr: Value, value: Value, ty: RegType) {
        let tag = self.iconst(types::I32, ty.tag() as i64);
        self.builder.ins().store(Self::trusted(), tag, addr, 0);
        self.builder
            .ins()
            .store(Self::trusted(), value, addr, Word::PAYLOAD_OFFSET);
    }

    fn stack_words(&mut self, count: usize) -> StackSlot {
        let size = (count.max(1) * Word::SIZE) as u32;
        self.builder
            .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size, 3))
    }

    // Scalars

    fn truthy(&mut self, v: Value, ty: RegType) -> Value {
        match ty {
            RegType::Scalar(ScalarKind::Bool) => v,
            RegType::Scalar(k) if k.is_float() => {
                let zero = if k == ScalarKind::Float {
                    self.builder.ins().f32const(0.0)
                } else {
                    self.builder.ins().f64const(0.0)
                };
                self.builder.ins().fcmp(FloatCC::NotEqual, v, zero)
            }
            _ => self.builder.ins().icmp_imm(IntCC::NotEqual, v, 0),
        }
    }

    /// Numeric conversion with the semantics of [`Word::cast`]
    fn convert(&mut self, v: Value, from: RegType, to: ScalarKind) -> Lowered<Value> {
        let kind = from
            .scalar()
            .ok_or_else(|| format!("cannot convert {} to {}", from, to))?;
        if kind == to {
            return Ok(v);
        }
        if to == ScalarKind::Bool {
            return Ok(self.truthy(v, from));
        }
        let target = clif_type(RegType::Scalar(to));
        let ins = self.builder.ins();
        let out = match (kind.is_float(), to.is_float()) {
            (true, true) if to == ScalarKind::Double => ins.fpromote(types::F64, v),
            (true, true) => ins.fdemote(types::F32, v),
            (true, false) => {
                let wide = ins.fcvt_to_sint_sat(types::I64, v);
                if target == types::I64 {
                    wide
                } else {
                    self.builder.ins().ireduce(target, wide)
                }
            }
            (false, true) => {
                let wide = if kind == ScalarKind::Bool {
                    ins.uextend(types::I64, v)
                } else if kind == ScalarKind::Int64 {
                    v
                } else {
                    ins.sextend(types::I64, v)
                };
                let d = self.builder.ins().fcvt_from_sint(types::F64, wide);
                if to == ScalarKind::Float {
                    self.builder.ins().fdemote(types::F32, d)
                } else {
                    d
                }
            }
            (false, false) => {
                let (from_bits, to_bits) = (clif_type(from).bits(), target.bits());
                if from_bits > to_bits {
                    ins.ireduce(target, v)
                } else if kind == ScalarKind::Bool {
                    ins.uextend(target, v)
                } else {
                    ins.sextend(target, v)
                }
            }
        };
        Ok(out)
    }

    fn int_binary(&mut self, op: BinOp, a: Value, b: Value, ty: Type) -> Value {
        match op {
            BinOp::Add => self.builder.ins().iadd(a, b),
            BinOp::Sub => self.builder.ins().isub(a, b),
            BinOp::Mul => self.builder.ins().imul(a, b),
            BinOp::Div | BinOp::Rem => {
                let zero = self.iconst(ty, 0);
                let one = self.iconst(ty, 1);
                let minus_one = self.iconst(ty, -1);
                let ins = self.builder.ins();
                let by_zero = ins.icmp(IntCC::Equal, b, zero);
                let by_minus_one = self.builder.ins().icmp(IntCC::Equal, b, minus_one);
                let special = self.builder.ins().bor(by_zero, by_minus_one);
                // x / 0 == 0 and x / -1 == -x without trapping on MIN / -1
                let safe = self.builder.ins().select(special, one, b);
                if op == BinOp::Div {
                    let q = self.builder.ins().sdiv(a, safe);
                    let neg = self.builder.ins().ineg(a);
                    let q = self.builder.ins().select(by_minus_one, neg, q);
                    self.builder.ins().select(by_zero, zero, q)
                } else {
                    // floored: a nonzero remainder takes the divisor's sign
                    let r = self.builder.ins().srem(a, safe);
                    let ins = self.builder.ins();
                    let nonzero = ins.icmp(IntCC::NotEqual, r, zero);
                    let r_neg = self.builder.ins().icmp(IntCC::SignedLessThan, r, zero);
                    let b_neg = self.builder.ins().icmp(IntCC::SignedLessThan, b, zero);
                    let signs = self.builder.ins().bxor(r_neg, b_neg);
                    let adjust = self.builder.ins().band(nonzero, signs);
                    let shifted = self.builder.ins().iadd(r, b);
                    self.builder.ins().select(adjust, shifted, r)
                }
            }
            BinOp::And => self.builder.ins().band(a, b),
            BinOp::Or => self.builder.ins().bor(a, b),
            BinOp::Xor => self.builder.ins().bxor(a, b),
            BinOp::Shl => self.builder.ins().ishl(a, b),
            BinOp::Shr => self.builder.ins().sshr(a, b),
        }
    }

    fn binary(&mut self, op: BinOp, a: Value, b: Value, ty: RegType) -> Lowered<Value> {
        let kind = ty
            .scalar()
            .ok_or_else(|| format!("{:?} applied to {}", op, ty))?;
        Ok(match kind {
            ScalarKind::Bool => match op {
                BinOp::And => self.builder.ins().band(a, b),
                BinOp::Or => self.builder.ins().bor(a, b),
                BinOp::Xor => self.builder.ins().bxor(a, b),
                _ => {
                    let a = self.builder.ins().uextend(types::I32, a);
                    let b = self.builder.ins().uextend(types::I32, b);
                    let r = self.int_binary(op, a, b, types::I32);
                    self.builder.ins().icmp_imm(IntCC::NotEqual, r, 0)
                }
            },
            k if k.is_float() => {
                let ins = self.builder.ins();
                match op {
                    BinOp::Add => ins.fadd(a, b),
                    BinOp::Sub => ins.fsub(a, b),
                    BinOp::Mul => ins.fmul(a, b),
                    BinOp::Div => ins.fdiv(a, b),
                    BinOp::Rem => {
                        let q = ins.fdiv(a, b);
                        let q = self.builder.ins().floor(q);
                        let m = self.builder.ins().fmul(b, q);
                        self.builder.ins().fsub(a, m)
                    }
                    other => {
                        return Err(format!(
                            "bitwise operator {:?} applied to floating point operands",
                            other
                        ))
                    }
                }
            }
            k => self.int_binary(op, a, b, clif_type(RegType::Scalar(k))),
        })
    }

    fn compare(&mut self, op: CmpOp, a: Value, b: Value, ty: RegType) -> Value {
        if let RegType::Scalar(k) = ty {
            if k.is_float() {
                let cc = match op {
                    CmpOp::Eq => FloatCC::Equal,
                    CmpOp::Ne => FloatCC::NotEqual,
                    CmpOp::Lt => FloatCC::LessThan,
                    CmpOp::Le => FloatCC::LessThanOrEqual,
                    CmpOp::Gt => FloatCC::GreaterThan,
                    CmpOp::Ge => FloatCC::GreaterThanOrEqual,
                };
                return self.builder.ins().fcmp(cc, a, b);
            }
        }
        let signed = matches!(ty, RegType::Scalar(k) if k != ScalarKind::Bool);
        let cc = match (op, signed) {
            (CmpOp::Eq, _) => IntCC::Equal,
            (CmpOp::Ne, _) => IntCC::NotEqual,
            (CmpOp::Lt, true) => IntCC::SignedLessThan,
            (CmpOp::Le, true) => IntCC::SignedLessThanOrEqual,
            (CmpOp::Gt, true) => IntCC::SignedGreaterThan,
            (CmpOp::Ge, true) => IntCC::SignedGreaterThanOrEqual,
            (CmpOp::Lt, false) => IntCC::UnsignedLessThan,
            (CmpOp::Le, false) => IntCC::UnsignedLessThanOrEqual,
            (CmpOp::Gt, false) => IntCC::UnsignedGreaterThan,
            (CmpOp::Ge, false) => IntCC::UnsignedGreaterThanOrEqual,
        };
        self.builder.ins().icmp(cc, a, b)
    }

    fn unary(&mut self, op: UnOp, v: Value, ty: RegType) -> Lowered<Value> {
        let kind = ty
            .scalar()
            .ok_or_else(|| format!("{:?} applied to {}", op, ty))?;
        Ok(match (op, kind) {
            (UnOp::Not, _) => {
                let t = self.truthy(v, ty);
                self.builder.ins().bxor_imm(t, 1)
            }
            (UnOp::Neg, ScalarKind::Bool) => {
                let wide = self.builder.ins().uextend(types::I32, v);
                self.builder.ins().ineg(wide)
            }
            (UnOp::Neg, k) if k.is_float() => self.builder.ins().fneg(v),
            (UnOp::Neg, _) => self.builder.ins().ineg(v),
            (UnOp::BitNot, ScalarKind::Bool) => self.builder.ins().bxor_imm(v, 1),
            (UnOp::BitNot, k) if k.is_float() => {
                return Err("bitwise complement of a floating point operand".to_string())
            }
            (UnOp::BitNot, _) => self.builder.ins().bnot(v),
        })
    }

    /// Index sign extended (or truncated) to 64 bits
    fn index64(&mut self, v: Value, ty: RegType) -> Lowered<Value> {
        match ty {
            RegType::Scalar(ScalarKind::Int64) => Ok(v),
            RegType::Scalar(ScalarKind::Bool) => Ok(self.builder.ins().uextend(types::I64, v)),
            RegType::Scalar(k) if !k.is_float() => Ok(self.builder.ins().sextend(types::I64, v)),
            other => Err(format!("{} cannot be used as an index or length", other)),
        }
    }

    // Instructions

    fn inst(&mut self, inst: &Inst) -> Lowered<()> {
        let rt = self.rt;
        match inst {
            Inst::Const { dst, value } => {
                let v = self.constant(value)?;
                self.set(*dst, v);
            }
            Inst::Alloca { dst, slot } => {
                let (code, count) = slot_code(*slot);
                let code = self.iconst(types::I32, code as i64);
                let count = self.iconst(types::I32, count as i64);
                let alloca = self.linked.helpers.alloca;
                let cell = self
                    .helper(alloca, &[rt, code, count])
                    .ok_or("alloca helper returns nothing")?;
                self.set(*dst, cell);
            }
            Inst::Load { dst, ptr } => {
                let ty = self.ty(*dst)?;
                let p = self.get(*ptr)?;
                let addr = self.cell_addr(p);
                let v = self
                    .builder
                    .ins()
                    .load(clif_type(ty), Self::trusted(), addr, Word::PAYLOAD_OFFSET);
                let v = self.normalize(v, ty);
                self.set(*dst, v);
            }
            Inst::Store { ptr, value } => {
                let cell = self
                    .ty(*ptr)?
                    .pointee()
                    .ok_or_else(|| format!("store through {}", ptr))?;
                let vty = self.ty(*value)?;
                let mut v = self.get(*value)?;
                if vty != cell {
                    let to = cell
                        .scalar()
                        .ok_or_else(|| format!("store of {} into a {} cell", vty, cell))?;
                    v = self.convert(v, vty, to)?;
                }
                let p = self.get(*ptr)?;
                let addr = self.cell_addr(p);
                self.store_word(addr, v, cell);
            }
            Inst::ElementPtr {
                dst,
                base,
                index,
                len,
            } => {
                let b = self.get(*base)?;
                let ity = self.ty(*index)?;
                let i = self.get(*index)?;
                let i = self.index64(i, ity)?;
                let limit = *len as i64;
                let outside = self
                    .builder
                    .ins()
                    .icmp_imm(IntCC::UnsignedGreaterThanOrEqual, i, limit);
                let error = self.builder.create_block();
                let ok = self.builder.create_block();
                self.builder.ins().brif(outside, error, &[], ok, &[]);

                self.builder.switch_to_block(error);
                let limit = self.iconst(types::I64, limit);
                let index_error = self.linked.helpers.index_error;
                self.helper(index_error, &[rt, i, limit]);
                self.builder.ins().jump(self.fail, &[]);

                self.builder.switch_to_block(ok);
                let i = self.builder.ins().ireduce(types::I32, i);
                let p = self.builder.ins().iadd(b, i);
                self.set(*dst, p);
            }
            Inst::Cast { dst, src, to } => {
                let from = self.ty(*src)?;
                let v = self.get(*src)?;
                let v = self.convert(v, from, *to)?;
                self.set(*dst, v);
            }
            Inst::Binary { dst, op, lhs, rhs } => {
                let ty = self.ty(*lhs)?;
                if self.ty(*rhs)? != ty {
                    return Err(format!("operand types differ for {:?}", op));
                }
                let (a, b) = (self.get(*lhs)?, self.get(*rhs)?);
                let v = self.binary(*op, a, b, ty)?;
                self.set(*dst, v);
            }
            Inst::Compare { dst, op, lhs, rhs } => {
                let ty = self.ty(*lhs)?;
                if self.ty(*rhs)? != ty {
                    return Err(format!("operand types differ for {:?}", op));
                }
                let (a, b) = (self.get(*lhs)?, self.get(*rhs)?);
                let v = self.compare(*op, a, b, ty);
                self.set(*dst, v);
            }
            Inst::Unary { dst, op, src } => {
                let ty = self.ty(*src)?;
                let v = self.get(*src)?;
                let v = self.unary(*op, v, ty)?;
                self.set(*dst, v);
            }
            Inst::Select {
                dst,
                cond,
                then_value,
                else_value,
            } => {
                let ty = self.ty(*then_value)?;
                if self.ty(*else_value)? != ty {
                    return Err("select arms differ in type".to_string());
                }
                let cty = self.ty(*cond)?;
                let c = self.get(*cond)?;
                let c = self.truthy(c, cty);
                let (a, b) = (self.get(*then_value)?, self.get(*else_value)?);
                let v = self.builder.ins().select(c, a, b);
                self.set(*dst, v);
            }
            // assigned on the incoming edges
            Inst::Phi { .. } => {}
            Inst::Call { dst, callee, args } => self.call(*dst, callee, args)?,
            Inst::Global { dst, name } => {
                let value = self
                    .linked
                    .globals
                    .get(name)
                    .ok_or_else(|| format!("unresolved global {}", name))?
                    .as_i64();
                let v = self.iconst(types::I64, value);
                self.set(*dst, v);
            }
            Inst::StoreStr { ptr, value } => {
                let p = self.get(*ptr)?;
                let bytes = self.bytes(value)?;
                let len = self.iconst(types::I64, value.len() as i64);
                let store = self.linked.helpers.str_store;
                let status = self.helper(store, &[rt, p, bytes, len]).ok_or("str_store returns nothing")?;
                self.check(status);
            }
            Inst::StrLen { dst, ptr } => {
                let p = self.get(*ptr)?;
                let str_len = self.linked.helpers.str_len;
                let len = self.helper(str_len, &[rt, p]).ok_or("str_len returns nothing")?;
                let failed = self.builder.ins().icmp_imm(IntCC::SignedLessThan, len, 0);
                self.check(failed);
                self.set(*dst, len);
            }
            Inst::StrResize { ptr, len } => {
                let p = self.get(*ptr)?;
                let lty = self.ty(*len)?;
                let n = self.get(*len)?;
                let n = self.index64(n, lty)?;
                let resize = self.linked.helpers.str_resize;
                let status = self.helper(resize, &[rt, p, n]).ok_or("str_resize returns nothing")?;
                self.check(status);
            }
            Inst::StrCopy { dst, offset, src } => {
                let d = self.get(*dst)?;
                let oty = self.ty(*offset)?;
                let o = self.get(*offset)?;
                let o = self.index64(o, oty)?;
                let s = self.get(*src)?;
                let copy = self.linked.helpers.str_copy;
                let status = self.helper(copy, &[rt, d, o, s]).ok_or("str_copy returns nothing")?;
                self.check(status);
            }
        }
        Ok(())
    }

    /// Address of a constant byte string
    fn bytes(&mut self, value: &[u8]) -> Lowered<Value> {
        if value.is_empty() {
            return Ok(self.builder.ins().iconst(self.ptr, 0));
        }
        let id = self
            .module
            .declare_anonymous_data(false, false)
            .map_err(|e| e.to_string())?;
        let mut data = DataDescription::new();
        data.define(value.to_vec().into_boxed_slice());
        self.module.define_data(id, &data).map_err(|e| e.to_string())?;
        let gv = self.module.declare_data_in_func(id, self.builder.func);
        Ok(self.builder.ins().global_value(self.ptr, gv))
    }

    fn call(&mut self, dst: Option<(Reg, RegType)>, callee: &str, args: &[Reg]) -> Lowered<()> {
        let linked = self.linked;
        let target = linked
            .callees
            .get(callee)
            .ok_or_else(|| format!("unresolved symbol {}", callee))?;

        let argv = self.stack_words(args.len());
        for (i, a) in args.iter().enumerate() {
            let mut ty = self.ty(*a)?;
            let mut v = self.get(*a)?;
            if let Callee::Function(_, f) = target {
                let expected = f
                    .params
                    .get(i)
                    .copied()
                    .ok_or_else(|| format!("too many arguments for {}", callee))?;
                if expected != ty {
                    let to = expected
                        .scalar()
                        .ok_or_else(|| format!("argument {} of {} expects {}, got {}", i, callee, expected, ty))?;
                    v = self.convert(v, ty, to)?;
                    ty = expected;
                }
            }
            let offset = (i * Word::SIZE) as i32;
            let tag = self.iconst(types::I32, ty.tag() as i64);
            self.builder.ins().stack_store(tag, argv, offset);
            self.builder
                .ins()
                .stack_store(v, argv, offset + Word::PAYLOAD_OFFSET);
        }
        let out = self.stack_words(1);
        let void = self.iconst(types::I32, Word::TAG_VOID as i64);
        self.builder.ins().stack_store(void, out, 0);

        let argv_addr = self.builder.ins().stack_addr(self.ptr, argv, 0);
        let out_addr = self.builder.ins().stack_addr(self.ptr, out, 0);
        let rt = self.rt;
        let status = match target {
            Callee::Function(id, _) => {
                let id = *id;
                self.helper(id, &[rt, argv_addr, out_addr])
            }
            Callee::Native(id) => {
                let native = self.func_ref(*id);
                let addr = self.builder.ins().func_addr(self.ptr, native);
                let argc = self.iconst(types::I32, args.len() as i64);
                let ret_tag = dst.map(|(_, t)| t.tag()).unwrap_or(Word::TAG_VOID);
                let ret_tag = self.iconst(types::I32, ret_tag as i64);
                let trampoline = self.linked.helpers.call_native;
                self.helper(trampoline, &[rt, addr, argv_addr, argc, out_addr, ret_tag])
            }
        }
        .ok_or_else(|| format!("call to {} returns no status", callee))?;
        self.check(status);

        if let Some((reg, ty)) = dst {
            let v = self
                .builder
                .ins()
                .stack_load(clif_type(ty), out, Word::PAYLOAD_OFFSET);
            let v = self.normalize(v, ty);
            self.set(reg, v);
        }
        Ok(())
    }

    // Control flow

    /// Assign the phis of `to` for the edge leaving `from`
    fn edge_copies(&mut self, from: BlockId, to: BlockId) -> Lowered<()> {
        let target = self
            .func
            .block(to)
            .ok_or_else(|| format!("branch to missing block {}", to))?;
        let mut moves = Vec::new();
        for inst in &target.insts {
            if let Inst::Phi { dst, incoming } = inst {
                let Some((_, r)) = incoming.iter().find(|(b, _)| *b == from) else {
                    return Err(format!("phi {} has no value for predecessor {}", dst, from));
                };
                let (dty, rty) = (self.ty(*dst)?, self.ty(*r)?);
                let mut v = self.get(*r)?;
                if dty != rty {
                    let to = dty
                        .scalar()
                        .ok_or_else(|| format!("phi {} mixes {} and {}", dst, dty, rty))?;
                    v = self.convert(v, rty, to)?;
                }
                moves.push((*dst, v));
            }
        }
        // read every incoming value before writing any phi
        for (dst, v) in moves {
            self.set(dst, v);
        }
        Ok(())
    }

    fn has_phis(&self, block: BlockId) -> bool {
        self.func
            .block(block)
            .map(|b| b.insts.iter().any(|i| matches!(i, Inst::Phi { .. })))
            .unwrap_or(false)
    }

    fn target(&self, block: BlockId) -> Lowered<Block> {
        self.blocks
            .get(&block)
            .copied()
            .ok_or_else(|| format!("branch to missing block {}", block))
    }

    /// Block to branch to for the edge `from -> to`
    ///
    /// Edges into blocks with phis get their own block holding the copies;
    /// it is queued in `split` and filled once the branch is emitted.
    fn edge(
        &mut self,
        from: BlockId,
        to: BlockId,
        split: &mut Vec<(Block, BlockId)>,
    ) -> Lowered<Block> {
        let target = self.target(to)?;
        if !self.has_phis(to) {
            return Ok(target);
        }
        let block = self.builder.create_block();
        split.push((block, to));
        Ok(block)
    }

    fn terminator(&mut self, block: BlockId, term: &Terminator) -> Lowered<()> {
        match term {
            Terminator::Br(to) => {
                self.edge_copies(block, *to)?;
                let target = self.target(*to)?;
                self.builder.ins().jump(target, &[]);
            }
            Terminator::CondBr {
                cond,
                then_block,
                else_block,
            } => {
                let cty = self.ty(*cond)?;
                let c = self.get(*cond)?;
                let c = self.truthy(c, cty);
                let mut split = Vec::new();
                let then_target = self.edge(block, *then_block, &mut split)?;
                let else_target = self.edge(block, *else_block, &mut split)?;
                self.builder.ins().brif(c, then_target, &[], else_target, &[]);
                for (edge, to) in split {
                    self.builder.switch_to_block(edge);
                    self.edge_copies(block, to)?;
                    let target = self.target(to)?;
                    self.builder.ins().jump(target, &[]);
                }
            }
            Terminator::Ret(value) => {
                let (rt, mark) = (self.rt, self.mark);
                let release = self.linked.helpers.release;
                let result = match value {
                    Some(r) => {
                        let ty = self.ty(*r)?;
                        let v = self.get(*r)?;
                        match self.func.ret {
                            Some(ret) if ret != ty => {
                                let to = ret
                                    .scalar()
                                    .ok_or_else(|| format!("returning {} from a {} function", ty, ret))?;
                                Some((self.convert(v, ty, to)?, ret))
                            }
                            _ => Some((v, ty)),
                        }
                    }
                    None => None,
                };
                self.helper(release, &[rt, mark]);
                if let Some((v, ty)) = result {
                    let out = self.out;
                    self.store_word(out, v, ty);
                }
                let zero = self.builder.ins().iconst(types::I32, 0);
                self.builder.ins().return_(&[zero]);
            }
            Terminator::Unreachable => {
                let rt = self.rt;
                let func = self.iconst(types::I32, self.index as i64);
                let id = self.iconst(types::I32, block.0 as i64);
                let unreachable = self.linked.helpers.unreachable;
                self.helper(unreachable, &[rt, func, id]);
                self.builder.ins().jump(self.fail, &[]);
            }
        }
        Ok(())
    }
}
