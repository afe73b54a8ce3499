//! IR module, function and basic block definitions

use super::instruction::{BlockId, Inst, Reg, Terminator};
use super::types::RegType;
use std::collections::BTreeSet;
use std::fmt;

/// Basic block in the control flow graph
#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    /// Block index within its function
    pub id: BlockId,
    /// Label for dumps
    pub label: String,
    /// IR instructions in this block
    pub insts: Vec<Inst>,
    /// Terminator; `None` only while the block is under construction
    pub terminator: Option<Terminator>,
}

impl BasicBlock {
    /// Create a new basic block with the given label
    pub fn new(id: BlockId, label: &str) -> Self {
        Self {
            id,
            label: label.to_string(),
            insts: Vec::new(),
            terminator: None,
        }
    }

    /// Successor blocks of the terminator
    pub fn successors(&self) -> Vec<BlockId> {
        self.terminator
            .as_ref()
            .map(|t| t.successors())
            .unwrap_or_default()
    }
}

/// Linkage of a function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Entry point looked up by the executors
    External,
    /// Only reachable from other functions in the module
    Internal,
}

/// One lowered function
#[derive(Debug, Clone, PartialEq)]
pub struct IrFunction {
    /// Symbol name
    pub name: String,
    /// Parameter types; parameters occupy registers `0..params.len()`
    pub params: Vec<RegType>,
    /// Result type, `None` for void functions
    pub ret: Option<RegType>,
    /// Symbol visibility
    pub linkage: Linkage,
    /// Blocks; index 0 is the entry block
    pub blocks: Vec<BasicBlock>,
    /// Number of registers used
    pub reg_count: u32,
}

impl IrFunction {
    /// Create a function with an empty entry block
    pub fn new(name: &str, params: &[RegType], ret: Option<RegType>) -> Self {
        Self {
            name: name.to_string(),
            params: params.to_vec(),
            ret,
            linkage: Linkage::External,
            blocks: vec![BasicBlock::new(BlockId(0), "entry")],
            reg_count: params.len() as u32,
        }
    }

    /// Block by id
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.0 as usize)
    }

    /// Mutable block by id
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(id.0 as usize)
    }

    /// Total instruction count (terminators excluded)
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }

    /// Predecessors of every block, indexed by block
    pub fn predecessors(&self) -> Vec<BTreeSet<BlockId>> {
        let mut preds = vec![BTreeSet::new(); self.blocks.len()];
        for block in &self.blocks {
            for succ in block.successors() {
                if let Some(set) = preds.get_mut(succ.0 as usize) {
                    set.insert(block.id);
                }
            }
        }
        preds
    }

    /// Blocks reachable from the entry block
    pub fn reachable(&self) -> BTreeSet<BlockId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![BlockId(0)];
        while let Some(b) = stack.pop() {
            if !seen.insert(b) {
                continue;
            }
            if let Some(block) = self.block(b) {
                stack.extend(block.successors());
            }
        }
        seen
    }

    /// Rename registers in every instruction and terminator
    pub fn rename(&mut self, f: &mut dyn FnMut(Reg) -> Reg) {
        for block in &mut self.blocks {
            for inst in &mut block.insts {
                inst.map_uses(f);
            }
            if let Some(t) = &mut block.terminator {
                t.map_uses(f);
            }
        }
    }
}

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{}: {}", Reg(i as u32), t))
            .collect();
        write!(f, "fn {}({})", self.name, params.join(", "))?;
        if let Some(ret) = self.ret {
            write!(f, " -> {}", ret)?;
        }
        writeln!(f, " {{")?;
        for block in &self.blocks {
            writeln!(f, "{}: ; {}", block.id, block.label)?;
            for inst in &block.insts {
                writeln!(f, "    {}", inst)?;
            }
            match &block.terminator {
                Some(t) => writeln!(f, "    {}", t)?,
                None => writeln!(f, "    <unterminated>")?,
            }
        }
        writeln!(f, "}}")
    }
}

/// Complete IR module
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    /// Module name
    pub name: String,
    /// Functions in emission order
    pub functions: Vec<IrFunction>,
    /// Global symbols referenced by `Global` instructions; bound at link time
    pub globals: BTreeSet<String>,
}

impl Module {
    /// Create an empty module
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Function by name
    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Total instruction count across functions
    pub fn instruction_count(&self) -> usize {
        self.functions.iter().map(|f| f.instruction_count()).sum()
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for g in &self.globals {
            writeln!(f, "@{} = external global", g)?;
        }
        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}
