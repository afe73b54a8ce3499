//! # IR Optimizer
//!
//! Optimization passes for the IR:
//! - Constant folding (including constant branches)
//! - Unreachable block removal
//! - Folding of pure native calls with constant arguments
//! - Dead instruction elimination
//! - Store-to-load forwarding and phi simplification

use super::ir::{BlockId, Inst, IrFunction, Module, Reg, RegType, Terminator};
use super::jit::{fold_native, SymbolMap};
use crate::runtime::Word;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Counters reported after a run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OptimizeStats {
    /// Instructions replaced by constants
    pub folded: usize,
    /// Conditional branches turned into jumps
    pub folded_branches: usize,
    /// Blocks removed
    pub removed_blocks: usize,
    /// Instructions removed
    pub removed_instructions: usize,
    /// Loads replaced by a previously stored or loaded value
    pub forwarded_loads: usize,
}

/// Optimizer with configurable optimization level
pub struct Optimizer<'a> {
    level: u8,
    natives: Option<&'a SymbolMap>,
    stats: OptimizeStats,
}

impl<'a> Optimizer<'a> {
    /// Create a new optimizer with the specified optimization level (0-3)
    pub fn new(level: u8) -> Self {
        Self {
            level,
            natives: None,
            stats: OptimizeStats::default(),
        }
    }

    /// Allow folding calls to pure natives from `natives`
    pub fn with_natives(mut self, natives: &'a SymbolMap) -> Self {
        self.natives = Some(natives);
        self
    }

    /// Statistics accumulated so far
    pub fn stats(&self) -> &OptimizeStats {
        &self.stats
    }

    /// Run all optimization passes
    pub fn optimize(&mut self, module: &mut Module) {
        for func in &mut module.functions {
            if self.level >= 1 {
                self.constant_folding(func);
                self.remove_unreachable_blocks(func);
            }

            if self.level >= 2 {
                self.dead_code_elimination(func);
            }

            if self.level >= 3 {
                self.forward_loads(func);
                self.simplify_phis(func);
                self.constant_folding(func);
                self.remove_unreachable_blocks(func);
                self.dead_code_elimination(func);
            }
        }

        debug!(
            module = %module.name,
            level = self.level,
            folded = self.stats.folded,
            folded_branches = self.stats.folded_branches,
            removed_blocks = self.stats.removed_blocks,
            removed_instructions = self.stats.removed_instructions,
            forwarded_loads = self.stats.forwarded_loads,
            "optimized module"
        );
    }

    /// Constant folding - evaluate constant expressions at compile time
    fn constant_folding(&mut self, func: &mut IrFunction) {
        let fold_calls = self.level >= 2;
        let mut constants: HashMap<Reg, Word> = HashMap::new();
        let mut renames: HashMap<Reg, Reg> = HashMap::new();

        // registers are defined once, so iterate until nothing new folds
        loop {
            let mut changed = false;
            for block in &mut func.blocks {
                for inst in block.insts.iter_mut() {
                    if let Inst::Const { dst, value } = inst {
                        if constants.insert(*dst, *value).is_none() {
                            changed = true;
                        }
                        continue;
                    }
                    let folded = match &*inst {
                        Inst::Cast { dst, src, to } => constants.get(src).map(|w| (*dst, w.cast(*to))),
                        Inst::Binary { dst, op, lhs, rhs } => {
                            match (constants.get(lhs), constants.get(rhs)) {
                                (Some(a), Some(b)) => Word::binary(*op, *a, *b).ok().map(|w| (*dst, w)),
                                _ => None,
                            }
                        }
                        Inst::Compare { dst, op, lhs, rhs } => {
                            match (constants.get(lhs), constants.get(rhs)) {
                                (Some(a), Some(b)) => Word::compare(*op, *a, *b)
                                    .ok()
                                    .map(|c| (*dst, Word::Bool(c))),
                                _ => None,
                            }
                        }
                        Inst::Unary { dst, op, src } => constants
                            .get(src)
                            .and_then(|w| Word::unary(*op, *w).ok())
                            .map(|w| (*dst, w)),
                        Inst::Select {
                            dst,
                            cond,
                            then_value,
                            else_value,
                        } => match constants.get(cond) {
                            Some(c) => {
                                let chosen = if c.truthy() { *then_value } else { *else_value };
                                match constants.get(&chosen) {
                                    Some(w) => Some((*dst, *w)),
                                    None => {
                                        renames.insert(*dst, chosen);
                                        None
                                    }
                                }
                            }
                            None => None,
                        },
                        Inst::Call {
                            dst: Some((dst, RegType::Scalar(kind))),
                            callee,
                            args,
                        } if fold_calls => {
                            let symbol = self.natives.and_then(|n| n.get(callee));
                            let values: Option<Vec<Word>> =
                                args.iter().map(|a| constants.get(a).copied()).collect();
                            match (symbol, values) {
                                (Some(symbol), Some(values)) => {
                                    fold_native(symbol, &values).map(|w| (*dst, w.cast(*kind)))
                                }
                                _ => None,
                            }
                        }
                        _ => None,
                    };
                    if let Some((dst, value)) = folded {
                        *inst = Inst::Const { dst, value };
                        constants.insert(dst, value);
                        self.stats.folded += 1;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        // constant branches
        let mut dropped_edges: Vec<(BlockId, BlockId)> = Vec::new();
        for block in &mut func.blocks {
            if let Some(Terminator::CondBr {
                cond,
                then_block,
                else_block,
            }) = &block.terminator
            {
                if let Some(c) = constants.get(cond) {
                    let (taken, dropped) = if c.truthy() {
                        (*then_block, *else_block)
                    } else {
                        (*else_block, *then_block)
                    };
                    if taken != dropped {
                        dropped_edges.push((block.id, dropped));
                    }
                    block.terminator = Some(Terminator::Br(taken));
                    self.stats.folded_branches += 1;
                }
            }
        }
        for (from, to) in dropped_edges {
            if let Some(target) = func.block_mut(to) {
                for inst in &mut target.insts {
                    if let Inst::Phi { incoming, .. } = inst {
                        incoming.retain(|(b, _)| *b != from);
                    }
                }
            }
        }

        if !renames.is_empty() {
            self.apply_renames(func, renames);
        }
    }

    /// Remove blocks not reachable from the entry, renumbering the rest
    fn remove_unreachable_blocks(&mut self, func: &mut IrFunction) {
        let reachable = func.reachable();
        if reachable.len() == func.blocks.len() {
            return;
        }

        let mut mapping: HashMap<BlockId, BlockId> = HashMap::new();
        let mut kept = Vec::with_capacity(reachable.len());
        for block in std::mem::take(&mut func.blocks) {
            if reachable.contains(&block.id) {
                mapping.insert(block.id, BlockId(kept.len() as u32));
                kept.push(block);
            } else {
                self.stats.removed_blocks += 1;
            }
        }

        for block in &mut kept {
            block.id = mapping[&block.id];
            for inst in &mut block.insts {
                if let Inst::Phi { incoming, .. } = inst {
                    incoming.retain(|(b, _)| mapping.contains_key(b));
                    for (b, _) in incoming.iter_mut() {
                        *b = mapping[b];
                    }
                }
            }
            match &mut block.terminator {
                Some(Terminator::Br(t)) => *t = mapping[t],
                Some(Terminator::CondBr {
                    then_block,
                    else_block,
                    ..
                }) => {
                    *then_block = mapping[then_block];
                    *else_block = mapping[else_block];
                }
                _ => {}
            }
        }
        func.blocks = kept;
    }

    /// Dead code elimination - remove instructions whose results are never used
    fn dead_code_elimination(&mut self, func: &mut IrFunction) {
        loop {
            let mut used: HashSet<Reg> = HashSet::new();
            for block in &func.blocks {
                for inst in &block.insts {
                    used.extend(inst.uses());
                }
                if let Some(t) = &block.terminator {
                    used.extend(t.uses());
                }
            }

            let mut removed = 0;
            for block in &mut func.blocks {
                block.insts.retain(|inst| {
                    let dead = inst.is_pure() && inst.def().map(|d| !used.contains(&d)).unwrap_or(false);
                    if dead {
                        removed += 1;
                    }
                    !dead
                });
            }

            if removed == 0 {
                break;
            }
            self.stats.removed_instructions += removed;
        }
    }

    /// Replace loads of a pointer whose value is already known in the block
    fn forward_loads(&mut self, func: &mut IrFunction) {
        let mut renames: HashMap<Reg, Reg> = HashMap::new();
        for block in &mut func.blocks {
            let mut known: HashMap<Reg, Reg> = HashMap::new();
            let mut kept = Vec::with_capacity(block.insts.len());
            for inst in std::mem::take(&mut block.insts) {
                match &inst {
                    Inst::Load { dst, ptr } => {
                        if let Some(v) = known.get(ptr) {
                            renames.insert(*dst, *v);
                            self.stats.forwarded_loads += 1;
                            continue;
                        }
                        known.insert(*ptr, *dst);
                    }
                    Inst::Store { ptr, value } => {
                        // any other pointer may alias this cell
                        known.clear();
                        known.insert(*ptr, *value);
                    }
                    other if other.writes_memory() => known.clear(),
                    _ => {}
                }
                kept.push(inst);
            }
            block.insts = kept;
        }
        if !renames.is_empty() {
            self.apply_renames(func, renames);
        }
    }

    /// Phis whose incoming values are all one register become that register
    fn simplify_phis(&mut self, func: &mut IrFunction) {
        let mut renames: HashMap<Reg, Reg> = HashMap::new();
        for block in &mut func.blocks {
            block.insts.retain(|inst| {
                if let Inst::Phi { dst, incoming } = inst {
                    let distinct: HashSet<Reg> = incoming.iter().map(|(_, r)| *r).collect();
                    if distinct.len() == 1 {
                        if let Some(r) = distinct.into_iter().next() {
                            renames.insert(*dst, r);
                            return false;
                        }
                    }
                }
                true
            });
        }
        if !renames.is_empty() {
            self.stats.removed_instructions += renames.len();
            self.apply_renames(func, renames);
        }
    }

    fn apply_renames(&mut self, func: &mut IrFunction, renames: HashMap<Reg, Reg>) {
        let resolve = |mut r: Reg| {
            // chains are acyclic since every rename points at an earlier definition
            let mut hops = 0;
            while let Some(next) = renames.get(&r) {
                r = *next;
                hops += 1;
                if hops > renames.len() {
                    break;
                }
            }
            r
        };
        func.rename(&mut |r| resolve(r));
        for block in &mut func.blocks {
            block
                .insts
                .retain(|inst| !matches!(inst.def(), Some(d) if renames.contains_key(&d) && inst.is_pure()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{BinOp, CmpOp, FunctionBuilder};
    use crate::runtime::SlotType;
    use crate::types::ScalarKind;

    fn module_of(f: IrFunction) -> Module {
        let mut m = Module::new("m");
        m.functions.push(f);
        m
    }

    #[test]
    fn test_constant_folding() {
        let mut b = FunctionBuilder::new("f", &[], Some(RegType::INT32));
        let one = b.constant(Word::I32(1));
        let two = b.constant(Word::I32(2));
        let sum = b.binary(BinOp::Add, one, two);
        b.ret(Some(sum));
        let mut m = module_of(b.finish());

        let mut opt = Optimizer::new(2);
        opt.optimize(&mut m);
        let f = &m.functions[0];
        assert_eq!(f.blocks[0].insts.len(), 1);
        assert_eq!(
            f.blocks[0].insts[0],
            Inst::Const {
                dst: sum,
                value: Word::I32(3)
            }
        );
        assert_eq!(opt.stats().folded, 1);
    }

    #[test]
    fn test_constant_branch_removes_dead_block() {
        let mut b = FunctionBuilder::new("f", &[], Some(RegType::INT32));
        let t = b.constant(Word::Bool(true));
        let yes = b.create_block("yes");
        let no = b.create_block("no");
        let join = b.create_block("join");
        b.cond_br(t, yes, no);
        b.switch_to(yes);
        let a = b.constant(Word::I32(1));
        b.br(join);
        b.switch_to(no);
        let c = b.constant(Word::I32(2));
        b.br(join);
        b.switch_to(join);
        let p = b.phi(vec![(yes, a), (no, c)]);
        b.ret(Some(p));
        let mut m = module_of(b.finish());

        Optimizer::new(3).optimize(&mut m);
        let f = &m.functions[0];
        assert_eq!(f.blocks.len(), 3);
        let result = crate::compiler::verifier::Verifier::new().verify(&m);
        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn test_store_load_forwarding() {
        let mut b = FunctionBuilder::new("f", &[RegType::INT32], Some(RegType::INT32));
        let slot = b.alloca(SlotType::Scalar(ScalarKind::Int32));
        let x = b.param(0);
        b.store(slot, x);
        let loaded = b.load(slot);
        let zero = b.constant(Word::I32(0));
        let cmp = b.compare(CmpOp::Gt, loaded, zero);
        let r = b.cast(cmp, ScalarKind::Int32);
        b.ret(Some(r));
        let mut m = module_of(b.finish());

        let mut opt = Optimizer::new(3);
        opt.optimize(&mut m);
        assert_eq!(opt.stats().forwarded_loads, 1);
        let f = &m.functions[0];
        assert!(f.blocks[0]
            .insts
            .iter()
            .all(|i| !matches!(i, Inst::Load { .. })));
    }

    #[test]
    fn test_level_zero_is_identity() {
        let mut b = FunctionBuilder::new("f", &[], Some(RegType::INT32));
        let one = b.constant(Word::I32(1));
        let two = b.constant(Word::I32(2));
        let sum = b.binary(BinOp::Add, one, two);
        b.ret(Some(sum));
        let mut m = module_of(b.finish());
        let before = m.clone();
        Optimizer::new(0).optimize(&mut m);
        assert_eq!(m, before);
    }
}
