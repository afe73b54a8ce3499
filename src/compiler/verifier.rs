//! # IR Module Verifier
//!
//! Validates generated modules before they are handed to the JIT.
//! Ensures the control flow graph and register definitions are well formed.

use super::ir::{register_types, BlockId, Inst, IrFunction, Module, Reg, RegType, Terminator};
use std::collections::HashSet;

/// Verification result with warnings
#[derive(Debug)]
pub struct VerifyResult {
    /// Module is valid for compilation
    pub valid: bool,
    /// Errors that prevent compilation
    pub errors: Vec<VerifyError>,
    /// Warnings (non-fatal)
    pub warnings: Vec<String>,
    /// Statistics
    pub stats: ModuleStats,
}

/// Module statistics
#[derive(Debug, Default)]
pub struct ModuleStats {
    /// Number of functions
    pub function_count: usize,
    /// Number of basic blocks
    pub block_count: usize,
    /// Total instruction count
    pub instruction_count: usize,
    /// Number of call instructions
    pub call_count: usize,
    /// Blocks not reachable from their function's entry
    pub unreachable_blocks: usize,
}

/// Verification error types
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyError {
    /// A block was left without a terminator.
    MissingTerminator {
        /// Function name
        function: String,
        /// Offending block
        block: BlockId,
    },

    /// A branch targets a block that does not exist.
    InvalidBranchTarget {
        /// Function name
        function: String,
        /// Block holding the branch
        block: BlockId,
        /// Missing target
        target: BlockId,
    },

    /// A register is read but never defined.
    UndefinedRegister {
        /// Function name
        function: String,
        /// Block holding the use
        block: BlockId,
        /// Undefined register
        reg: Reg,
    },

    /// A register is defined by more than one instruction.
    RedefinedRegister {
        /// Function name
        function: String,
        /// Register defined twice
        reg: Reg,
    },

    /// Frame slots may only be allocated in the entry block.
    AllocaOutsideEntry {
        /// Function name
        function: String,
        /// Offending block
        block: BlockId,
    },

    /// A phi names a block that is not a predecessor.
    PhiPredecessorMismatch {
        /// Function name
        function: String,
        /// Block holding the phi
        block: BlockId,
        /// Incoming block that is not a predecessor
        incoming: BlockId,
    },

    /// A return disagrees with the function's declared result.
    ReturnMismatch {
        /// Function name
        function: String,
        /// Block holding the return
        block: BlockId,
    },

    /// A `Global` names a symbol the module does not declare.
    UndeclaredGlobal {
        /// Function name
        function: String,
        /// Global symbol name
        name: String,
    },

    /// Register types cannot be assigned.
    InvalidTypes {
        /// Function name
        function: String,
        /// What went wrong
        message: String,
    },
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::MissingTerminator { function, block } => {
                write!(f, "{}: block {} has no terminator", function, block)
            }
            VerifyError::InvalidBranchTarget {
                function,
                block,
                target,
            } => write!(
                f,
                "{}: block {} branches to missing block {}",
                function, block, target
            ),
            VerifyError::UndefinedRegister {
                function,
                block,
                reg,
            } => write!(f, "{}: block {} reads undefined register {}", function, block, reg),
            VerifyError::RedefinedRegister { function, reg } => {
                write!(f, "{}: register {} is defined more than once", function, reg)
            }
            VerifyError::AllocaOutsideEntry { function, block } => {
                write!(f, "{}: alloca outside the entry block in {}", function, block)
            }
            VerifyError::PhiPredecessorMismatch {
                function,
                block,
                incoming,
            } => write!(
                f,
                "{}: phi in {} names {} which is not a predecessor",
                function, block, incoming
            ),
            VerifyError::ReturnMismatch { function, block } => {
                write!(f, "{}: return in {} does not match the function result", function, block)
            }
            VerifyError::UndeclaredGlobal { function, name } => {
                write!(f, "{}: global {} is not declared by the module", function, name)
            }
            VerifyError::InvalidTypes { function, message } => write!(f, "{}: {}", function, message),
        }
    }
}

/// IR module verifier
#[derive(Debug, Default)]
pub struct Verifier {
    /// Strict mode (treat warnings as errors)
    strict: bool,
}

impl Verifier {
    /// Creates a new verifier
    pub fn new() -> Self {
        Self { strict: false }
    }

    /// Enable strict mode
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Verify a module
    pub fn verify(&self, module: &Module) -> VerifyResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut stats = ModuleStats {
            function_count: module.functions.len(),
            ..ModuleStats::default()
        };

        for func in &module.functions {
            self.verify_function(func, module, &mut errors, &mut warnings, &mut stats);
        }

        let valid = errors.is_empty() && (!self.strict || warnings.is_empty());

        VerifyResult {
            valid,
            errors,
            warnings,
            stats,
        }
    }

    fn verify_function(
        &self,
        func: &IrFunction,
        module: &Module,
        errors: &mut Vec<VerifyError>,
        warnings: &mut Vec<String>,
        stats: &mut ModuleStats,
    ) {
        let name = &func.name;
        stats.block_count += func.blocks.len();
        stats.instruction_count += func.instruction_count();

        // Collect definitions
        let mut defined: HashSet<Reg> = (0..func.params.len() as u32).map(Reg).collect();
        for block in &func.blocks {
            for inst in &block.insts {
                if let Some(d) = inst.def() {
                    if !defined.insert(d) {
                        errors.push(VerifyError::RedefinedRegister {
                            function: name.clone(),
                            reg: d,
                        });
                    }
                }
            }
        }

        let types = match register_types(func) {
            Ok(types) => types,
            Err(message) => {
                errors.push(VerifyError::InvalidTypes {
                    function: name.clone(),
                    message,
                });
                Vec::new()
            }
        };
        let type_of = |r: Reg| -> Option<RegType> { types.get(r.0 as usize).copied().flatten() };

        let preds = func.predecessors();
        let reachable = func.reachable();

        for block in &func.blocks {
            if !reachable.contains(&block.id) {
                stats.unreachable_blocks += 1;
            }

            for inst in &block.insts {
                for r in inst.uses() {
                    if !defined.contains(&r) {
                        errors.push(VerifyError::UndefinedRegister {
                            function: name.clone(),
                            block: block.id,
                            reg: r,
                        });
                    }
                }
                match inst {
                    Inst::Alloca { .. } if block.id != BlockId(0) => {
                        errors.push(VerifyError::AllocaOutsideEntry {
                            function: name.clone(),
                            block: block.id,
                        });
                    }
                    Inst::Phi { incoming, .. } if reachable.contains(&block.id) => {
                        for (from, _) in incoming {
                            let is_pred = preds
                                .get(block.id.0 as usize)
                                .map(|p| p.contains(from))
                                .unwrap_or(false);
                            if !is_pred {
                                errors.push(VerifyError::PhiPredecessorMismatch {
                                    function: name.clone(),
                                    block: block.id,
                                    incoming: *from,
                                });
                            }
                        }
                    }
                    Inst::Call { .. } => stats.call_count += 1,
                    Inst::Global { name: g, .. } if !module.globals.contains(g) => {
                        errors.push(VerifyError::UndeclaredGlobal {
                            function: name.clone(),
                            name: g.clone(),
                        });
                    }
                    _ => {}
                }
            }

            match &block.terminator {
                None => errors.push(VerifyError::MissingTerminator {
                    function: name.clone(),
                    block: block.id,
                }),
                Some(term) => {
                    for target in term.successors() {
                        if func.block(target).is_none() {
                            errors.push(VerifyError::InvalidBranchTarget {
                                function: name.clone(),
                                block: block.id,
                                target,
                            });
                        }
                    }
                    for r in term.uses() {
                        if !defined.contains(&r) {
                            errors.push(VerifyError::UndefinedRegister {
                                function: name.clone(),
                                block: block.id,
                                reg: r,
                            });
                        }
                    }
                    if let Terminator::Ret(value) = term {
                        let mismatched = match (value, func.ret) {
                            (Some(r), Some(ty)) => !types.is_empty() && type_of(*r) != Some(ty),
                            (None, None) => false,
                            _ => true,
                        };
                        if mismatched {
                            errors.push(VerifyError::ReturnMismatch {
                                function: name.clone(),
                                block: block.id,
                            });
                        }
                    }
                }
            }
        }

        if reachable.len() < func.blocks.len() {
            warnings.push(format!(
                "{}: {} unreachable block(s)",
                name,
                func.blocks.len() - reachable.len()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::FunctionBuilder;
    use crate::runtime::{SlotType, Word};

    #[test]
    fn test_empty_module() {
        let result = Verifier::new().verify(&Module::new("empty"));
        assert!(result.valid);
        assert_eq!(result.stats.function_count, 0);
    }

    #[test]
    fn test_simple_valid_function() {
        let mut b = FunctionBuilder::new("f", &[], Some(RegType::INT32));
        let c = b.constant(Word::I32(42));
        b.ret(Some(c));
        let mut module = Module::new("m");
        module.functions.push(b.finish());
        let result = Verifier::new().verify(&module);
        assert!(result.valid, "Errors: {:?}", result.errors);
        assert_eq!(result.stats.instruction_count, 1);
    }

    #[test]
    fn test_missing_terminator() {
        let mut b = FunctionBuilder::new("f", &[], None);
        b.constant(Word::I32(1));
        let mut module = Module::new("m");
        module.functions.push(b.finish());
        let result = Verifier::new().verify(&module);
        assert!(!result.valid);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, VerifyError::MissingTerminator { .. })));
    }

    #[test]
    fn test_return_mismatch_and_bad_target() {
        let mut b = FunctionBuilder::new("f", &[], None);
        let c = b.constant(Word::I32(1));
        let other = b.create_block("other");
        b.cond_br(c, other, BlockId(9));
        b.switch_to(other);
        b.ret(Some(c));
        let mut module = Module::new("m");
        module.functions.push(b.finish());
        let result = Verifier::new().verify(&module);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, VerifyError::InvalidBranchTarget { .. })));
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, VerifyError::ReturnMismatch { .. })));
    }

    #[test]
    fn test_unreachable_block_is_warning() {
        let mut b = FunctionBuilder::new("f", &[], None);
        b.ret(None);
        let dead = b.create_block("dead");
        b.switch_to(dead);
        b.ret(None);
        let mut module = Module::new("m");
        module.functions.push(b.finish());
        let result = Verifier::new().verify(&module);
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
        assert!(!Verifier::new().strict().verify(&module).valid);
    }

    #[test]
    fn test_return_type_is_checked() {
        let mut b = FunctionBuilder::new("f", &[], Some(RegType::INT64));
        let c = b.constant(Word::I32(1));
        b.ret(Some(c));
        let mut module = Module::new("m");
        module.functions.push(b.finish());
        let result = Verifier::new().verify(&module);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, VerifyError::ReturnMismatch { .. })));
    }

    #[test]
    fn test_untyped_load_is_rejected() {
        let mut b = FunctionBuilder::new("f", &[], None);
        let s = b.alloca(SlotType::Str);
        b.load(s);
        b.ret(None);
        let mut module = Module::new("m");
        module.functions.push(b.finish());
        let result = Verifier::new().verify(&module);
        assert!(!result.valid);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, VerifyError::InvalidTypes { .. })));
    }
}
