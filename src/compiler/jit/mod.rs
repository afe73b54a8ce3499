//! # JIT: IR to native code
//!
//! Modules are lowered to Cranelift IR and compiled in memory with
//! `cranelift-jit`. Native builtins and the runtime helpers are registered as
//! linker symbols, so a call site jumps straight to its callee and nothing is
//! looked up by name while a kernel runs.
//!
//! ```text
//! Module ──link──▶ symbols resolved ──lower──▶ Cranelift IR ──finalize──▶ ExecutionEngine
//!                   (natives, globals)                                          │
//!                                                                               ▼
//!                                              call(kernel, args, memory, env) -> Word
//! ```
//!
//! Compiled code keeps containers and strings in the caller's [`Memory`]; see
//! [`runtime`] for the calling convention. The engine is immutable and
//! `Send + Sync`, so any number of threads may call into it concurrently, each
//! with its own [`Memory`].

mod lower;
mod runtime;

use super::ir::{self, Module, RegType};
use crate::error::{Error, Result};
use crate::runtime::{KernelEnv, Memory, Word};
use cranelift_codegen::ir::UserFuncName;
use cranelift_frontend::FunctionBuilderContext;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module as _};
use lower::{Callee, FunctionLowering, Helpers, Linked};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::mem::ManuallyDrop;
use tracing::debug;

/// Access to the calling kernel's memory and environment from a native
pub struct CallContext<'a> {
    /// Memory of the running kernel
    pub memory: &'a mut Memory,
    /// Environment bound by the executor
    pub env: &'a mut dyn KernelEnv,
}

/// Native entry point signature
pub type NativeFn = fn(&mut CallContext<'_>, &[Word]) -> Result<Word>;

/// A native symbol available to generated code
#[derive(Debug, Clone, Copy)]
pub struct NativeSymbol {
    /// Entry point
    pub func: NativeFn,
    /// Pure natives may be folded when all arguments are constant
    pub pure: bool,
}

/// Native symbols keyed by name
pub type SymbolMap = BTreeMap<String, NativeSymbol>;

/// Entry point of a compiled function
type Entry = unsafe extern "C" fn(*mut u8, *const Word, *mut Word) -> u32;

/// Executable memory owned by the engine
struct CodeMemory(ManuallyDrop<JITModule>);

// SAFETY: after finalization the module is only kept alive to own the code
// pages; nothing reads or mutates it until it is freed on drop.
unsafe impl Send for CodeMemory {}
unsafe impl Sync for CodeMemory {}

impl Drop for CodeMemory {
    fn drop(&mut self) {
        // SAFETY: the engine holding the entry points is being dropped
        unsafe { ManuallyDrop::take(&mut self.0).free_memory() };
    }
}

struct CompiledFunction {
    name: String,
    params: Vec<RegType>,
    ret: Option<RegType>,
    entry: Entry,
}

/// Immutable set of compiled functions
pub struct ExecutionEngine {
    functions: Vec<CompiledFunction>,
    by_name: HashMap<String, usize>,
    names: Vec<String>,
    _code: CodeMemory,
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("functions", &self.names)
            .finish()
    }
}

impl ExecutionEngine {
    /// Index of a compiled function
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Names of all compiled functions
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Call function `index` with `args`
    ///
    /// Scalar arguments are converted to the declared parameter kinds; frame
    /// slots allocated by the call are released before returning, also when
    /// it fails.
    pub fn call(
        &self,
        index: usize,
        args: &[Word],
        memory: &mut Memory,
        env: &mut dyn KernelEnv,
    ) -> Result<Word> {
        let func = self
            .functions
            .get(index)
            .ok_or_else(|| Error::execution(format!("no compiled function at index {}", index)))?;
        if args.len() != func.params.len() {
            return Err(Error::execution(format!(
                "function {} expects {} argument(s), got {}",
                func.name,
                func.params.len(),
                args.len()
            )));
        }
        let mut argv = Vec::with_capacity(args.len());
        for (arg, param) in args.iter().zip(&func.params) {
            let word = match (param.scalar(), arg.kind()) {
                (Some(kind), Some(_)) => arg.cast(kind),
                _ if arg.tag() == param.tag() => *arg,
                _ => {
                    return Err(Error::execution(format!(
                        "function {} expects {}, got {}",
                        func.name, param, arg
                    )))
                }
            };
            argv.push(word);
        }

        let mark = memory.mark();
        let mut out = Word::Void;
        let (status, error) = {
            let mut rt = runtime::Runtime::new(memory, env, &self.names);
            // SAFETY: `entry` was finalized by the module kept alive in `_code`,
            // and `argv` holds one word per declared parameter.
            let status = unsafe { (func.entry)(rt.as_ptr(), argv.as_ptr(), &mut out) };
            (status, rt.take_error())
        };
        memory.release(mark);

        if status != 0 {
            return Err(error.unwrap_or_else(|| {
                Error::execution(format!("function {} failed with status {}", func.name, status))
            }));
        }
        Ok(if func.ret.is_some() { out } else { Word::Void })
    }

    /// Call a function by name
    pub fn call_by_name(
        &self,
        name: &str,
        args: &[Word],
        memory: &mut Memory,
        env: &mut dyn KernelEnv,
    ) -> Result<Word> {
        let index = self
            .lookup(name)
            .ok_or_else(|| Error::execution(format!("unknown function {}", name)))?;
        self.call(index, args, memory, env)
    }
}

/// Collects symbols and compiles a module into an [`ExecutionEngine`]
#[derive(Default)]
pub struct Jit {
    natives: SymbolMap,
    globals: HashMap<String, Word>,
    optimize: bool,
}

impl Jit {
    /// Create an empty JIT
    pub fn new() -> Self {
        Self::default()
    }

    /// Run Cranelift's optimizer on the generated code
    pub fn optimize(mut self, on: bool) -> Self {
        self.optimize = on;
        self
    }

    /// Register a native symbol; registering a name twice is an error
    pub fn add_symbol(&mut self, name: &str, symbol: NativeSymbol) -> Result<()> {
        if self.natives.insert(name.to_string(), symbol).is_some() {
            return Err(Error::execution(format!("duplicate symbol {}", name)));
        }
        Ok(())
    }

    /// Register every native in a symbol map
    pub fn add_symbols(&mut self, symbols: &SymbolMap) -> Result<()> {
        for (name, symbol) in symbols {
            self.add_symbol(name, *symbol)?;
        }
        Ok(())
    }

    /// Bind a global symbol to a value
    pub fn add_global(&mut self, name: &str, value: Word) {
        self.globals.insert(name.to_string(), value);
    }

    /// Check that every symbol `module` references resolves
    ///
    /// All unresolved symbols, duplicate definitions and arity errors are
    /// collected into one list.
    fn link(&self, module: &Module) -> Vec<String> {
        let mut problems = Vec::new();
        let mut by_name = HashMap::new();
        for f in &module.functions {
            if by_name.insert(f.name.as_str(), f).is_some() || self.natives.contains_key(&f.name) {
                problems.push(format!("duplicate symbol {}", f.name));
            }
        }
        for g in &module.globals {
            if !self.globals.contains_key(g) {
                problems.push(format!("unresolved global {}", g));
            }
        }
        for f in &module.functions {
            if let Err(e) = ir::register_types(f) {
                problems.push(format!("{}: {}", f.name, e));
            }
            for inst in f.blocks.iter().flat_map(|b| &b.insts) {
                match inst {
                    ir::Inst::Call { callee, args, .. } => {
                        if let Some(target) = by_name.get(callee.as_str()) {
                            if target.params.len() != args.len() {
                                problems.push(format!(
                                    "{}: call to {} passes {} argument(s), expected {}",
                                    f.name,
                                    callee,
                                    args.len(),
                                    target.params.len()
                                ));
                            }
                        } else if !self.natives.contains_key(callee) {
                            problems.push(format!("{}: unresolved symbol {}", f.name, callee));
                        }
                    }
                    ir::Inst::Global { name, .. } if !self.globals.contains_key(name) => {
                        problems.push(format!("{}: unresolved global {}", f.name, name));
                    }
                    _ => {}
                }
            }
        }
        problems.dedup();
        problems
    }

    /// Link and compile every function of `module`
    pub fn compile(&self, module: &Module) -> Result<ExecutionEngine> {
        let problems = self.link(module);
        if !problems.is_empty() {
            return Err(Error::execution(problems.join("; ")));
        }

        let opt_level = if self.optimize { "speed" } else { "none" };
        let mut builder = JITBuilder::with_flags(
            &[("opt_level", opt_level)],
            cranelift_module::default_libcall_names(),
        )
        .map_err(|e| Error::execution(format!("cannot create the JIT: {}", e)))?;
        for (name, addr) in runtime::symbols() {
            builder.symbol(name, addr);
        }
        for (name, symbol) in &self.natives {
            builder.symbol(name.as_str(), symbol.func as *const u8);
        }
        let mut jit = JITModule::new(builder);

        let built = self.define(&mut jit, module);
        let ids = match built {
            Ok(ids) => ids,
            Err(e) => {
                // SAFETY: nothing was finalized, so no entry point escapes
                unsafe { jit.free_memory() };
                return Err(e);
            }
        };

        let mut functions = Vec::with_capacity(module.functions.len());
        let mut by_name = HashMap::new();
        for (f, id) in module.functions.iter().zip(ids) {
            let code = jit.get_finalized_function(id);
            // SAFETY: every function is defined with the entry signature
            let entry = unsafe { std::mem::transmute::<*const u8, Entry>(code) };
            by_name.insert(f.name.clone(), functions.len());
            functions.push(CompiledFunction {
                name: f.name.clone(),
                params: f.params.clone(),
                ret: f.ret,
                entry,
            });
        }
        let names = functions.iter().map(|f| f.name.clone()).collect();

        debug!(
            module = %module.name,
            functions = functions.len(),
            instructions = module.instruction_count(),
            opt_level,
            "jit compiled module"
        );
        Ok(ExecutionEngine {
            functions,
            by_name,
            names,
            _code: CodeMemory(ManuallyDrop::new(jit)),
        })
    }

    /// Declare, lower and finalize every function; returns their ids in module order
    fn define(&self, jit: &mut JITModule, module: &Module) -> Result<Vec<FuncId>> {
        let fail = |e: String| Error::execution(e);
        let helpers = Helpers::declare(jit).map_err(fail)?;
        let signature = lower::entry_signature(jit);

        let mut callees = HashMap::new();
        let empty = jit.make_signature();
        for name in self.natives.keys() {
            let id = jit
                .declare_function(name, Linkage::Import, &empty)
                .map_err(|e| fail(format!("declaring {}: {}", name, e)))?;
            callees.insert(name.clone(), Callee::Native(id));
        }
        let mut ids = Vec::with_capacity(module.functions.len());
        for f in &module.functions {
            let linkage = match f.linkage {
                ir::Linkage::External => Linkage::Export,
                ir::Linkage::Internal => Linkage::Local,
            };
            let id = jit
                .declare_function(&f.name, linkage, &signature)
                .map_err(|e| fail(format!("declaring {}: {}", f.name, e)))?;
            callees.insert(f.name.clone(), Callee::Function(id, f));
            ids.push(id);
        }

        let linked = Linked {
            helpers: &helpers,
            callees: &callees,
            globals: &self.globals,
        };
        let mut ctx = jit.make_context();
        let mut builder_ctx = FunctionBuilderContext::new();
        for (index, (f, id)) in module.functions.iter().zip(&ids).enumerate() {
            ctx.func.signature = signature.clone();
            ctx.func.name = UserFuncName::user(0, id.as_u32());
            let builder = cranelift_frontend::FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
            FunctionLowering::lower(builder, jit, &linked, f, index as u32)
                .map_err(|e| fail(format!("{}: {}", f.name, e)))?;
            jit.define_function(*id, &mut ctx)
                .map_err(|e| fail(format!("{}: code generation failed: {:?}", f.name, e)))?;
            jit.clear_context(&mut ctx);
        }
        jit.finalize_definitions()
            .map_err(|e| fail(format!("cannot finalize code: {}", e)))?;
        Ok(ids)
    }
}

/// Evaluate a pure native on constant arguments (used by the optimizer)
pub fn fold_native(symbol: &NativeSymbol, args: &[Word]) -> Option<Word> {
    if !symbol.pure || args.iter().any(|a| a.kind().is_none()) {
        return None;
    }
    let mut memory = Memory::new();
    let mut env = crate::runtime::NullEnv;
    let mut ctx = CallContext {
        memory: &mut memory,
        env: &mut env,
    };
    (symbol.func)(&mut ctx, args).ok().filter(|w| w.kind().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{BinOp, BlockId, CellType, CmpOp, FunctionBuilder, IrFunction, UnOp};
    use crate::runtime::{NullEnv, SlotType};
    use crate::types::ScalarKind;

    fn double_it(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
        Word::binary(BinOp::Mul, args[0], Word::I32(2))
    }

    fn refuse(_: &mut CallContext<'_>, _: &[Word]) -> Result<Word> {
        Err(Error::execution("native refused"))
    }

    fn native(func: NativeFn) -> NativeSymbol {
        NativeSymbol { func, pure: true }
    }

    fn module(functions: Vec<IrFunction>) -> Module {
        let mut module = Module::new("test");
        module.functions = functions;
        module
    }

    fn run(engine: &ExecutionEngine, name: &str, args: &[Word]) -> Result<Word> {
        let mut memory = Memory::new();
        engine.call_by_name(name, args, &mut memory, &mut NullEnv)
    }

    /// sum = 0; for (i = 0; i < n; ++i) sum += i; return double_it(sum)
    fn sum_function() -> IrFunction {
        let mut b = FunctionBuilder::new("sum", &[RegType::INT32], Some(RegType::INT32));
        let n = b.param(0);
        let sum = b.alloca(SlotType::Scalar(ScalarKind::Int32));
        let i = b.alloca(SlotType::Scalar(ScalarKind::Int32));
        let cond = b.create_block("cond");
        let body = b.create_block("body");
        let exit = b.create_block("exit");
        b.br(cond);

        b.switch_to(cond);
        let iv = b.load(i);
        let c = b.compare(CmpOp::Lt, iv, n);
        b.cond_br(c, body, exit);

        b.switch_to(body);
        let sv = b.load(sum);
        let iv2 = b.load(i);
        let s2 = b.binary(BinOp::Add, sv, iv2);
        b.store(sum, s2);
        let one = b.constant(Word::I32(1));
        let inc = b.binary(BinOp::Add, iv2, one);
        b.store(i, inc);
        b.br(cond);

        b.switch_to(exit);
        let result = b.load(sum);
        let doubled = b.call("double_it", vec![result], RegType::INT32);
        b.ret(Some(doubled));
        b.finish()
    }

    /// Two-argument function applying `op` to its int parameters
    fn binary_function(name: &str, kind: ScalarKind, op: BinOp) -> IrFunction {
        let ty = RegType::Scalar(kind);
        let mut b = FunctionBuilder::new(name, &[ty, ty], Some(ty));
        let (x, y) = (b.param(0), b.param(1));
        let r = b.binary(op, x, y);
        b.ret(Some(r));
        b.finish()
    }

    fn cast_function(name: &str, from: ScalarKind, to: ScalarKind) -> IrFunction {
        let mut b = FunctionBuilder::new(name, &[RegType::Scalar(from)], Some(RegType::Scalar(to)));
        let x = b.param(0);
        let r = b.cast(x, to);
        b.ret(Some(r));
        b.finish()
    }

    #[test]
    fn test_loop_and_native_call() {
        let mut jit = Jit::new();
        jit.add_symbol("double_it", native(double_it)).unwrap();
        let engine = jit.compile(&module(vec![sum_function()])).unwrap();
        let mut memory = Memory::new();
        let out = engine
            .call_by_name("sum", &[Word::I32(5)], &mut memory, &mut NullEnv)
            .unwrap();
        assert_eq!(out, Word::I32(20));
        // frame slots are released on return
        assert_eq!(memory.mark(), 0);
    }

    #[test]
    fn test_unresolved_and_duplicate_symbols_are_aggregated() {
        let mut jit = Jit::new();
        jit.add_symbol("sum", native(double_it)).unwrap();
        let err = jit.compile(&module(vec![sum_function()])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate symbol sum"));
        assert!(msg.contains("unresolved symbol double_it"));
    }

    #[test]
    fn test_unresolved_global() {
        let mut b = FunctionBuilder::new("g", &[], Some(RegType::INT64));
        let v = b.global("__ax_attr_density");
        b.ret(Some(v));
        let mut m = module(vec![b.finish()]);
        m.globals.insert("__ax_attr_density".to_string());

        let err = Jit::new().compile(&m).unwrap_err();
        assert!(err.to_string().contains("unresolved global __ax_attr_density"));

        let mut jit = Jit::new();
        jit.add_global("__ax_attr_density", Word::I64(3));
        let engine = jit.compile(&m).unwrap();
        assert_eq!(run(&engine, "g", &[]).unwrap(), Word::I64(3));
    }

    #[test]
    fn test_duplicate_native_registration() {
        let mut jit = Jit::new();
        jit.add_symbol("x", native(double_it)).unwrap();
        assert!(jit.add_symbol("x", native(double_it)).is_err());
    }

    #[test]
    fn test_fold_native() {
        let sym = native(double_it);
        assert_eq!(fold_native(&sym, &[Word::I32(4)]), Some(Word::I32(8)));
        let impure = NativeSymbol { pure: false, ..sym };
        assert_eq!(fold_native(&impure, &[Word::I32(4)]), None);
    }

    #[test]
    fn test_integer_division_matches_word_semantics() {
        let functions = vec![
            binary_function("div32", ScalarKind::Int32, BinOp::Div),
            binary_function("rem32", ScalarKind::Int32, BinOp::Rem),
            binary_function("div64", ScalarKind::Int64, BinOp::Div),
            binary_function("rem16", ScalarKind::Int16, BinOp::Rem),
        ];
        let engine = Jit::new().compile(&module(functions)).unwrap();
        let cases32 = [(7, 2), (-7, 2), (7, -2), (-7, -2), (5, 0), (i32::MIN, -1), (0, 3)];
        for (a, b) in cases32 {
            let args = [Word::I32(a), Word::I32(b)];
            for (name, op) in [("div32", BinOp::Div), ("rem32", BinOp::Rem)] {
                assert_eq!(
                    run(&engine, name, &args).unwrap(),
                    Word::binary(op, args[0], args[1]).unwrap(),
                    "{} {} {}",
                    name,
                    a,
                    b
                );
            }
        }
        let args = [Word::I64(i64::MIN), Word::I64(-1)];
        assert_eq!(run(&engine, "div64", &args).unwrap(), Word::I64(i64::MIN));
        let args = [Word::I16(-7), Word::I16(3)];
        assert_eq!(run(&engine, "rem16", &args).unwrap(), Word::I16(2));
    }

    #[test]
    fn test_float_arithmetic() {
        let functions = vec![
            binary_function("fmod", ScalarKind::Double, BinOp::Rem),
            binary_function("fdiv", ScalarKind::Float, BinOp::Div),
        ];
        let engine = Jit::new().compile(&module(functions)).unwrap();
        let out = run(&engine, "fmod", &[Word::F64(-7.5), Word::F64(2.0)]).unwrap();
        assert_eq!(out, Word::F64(0.5));
        let out = run(&engine, "fdiv", &[Word::F32(1.0), Word::F32(0.0)]).unwrap();
        assert_eq!(out, Word::F32(f32::INFINITY));

        let err = Jit::new()
            .compile(&module(vec![binary_function("fand", ScalarKind::Float, BinOp::And)]))
            .unwrap_err();
        assert!(err.to_string().contains("floating point"));
    }

    #[test]
    fn test_casts_match_word_semantics() {
        use ScalarKind::*;
        let functions = vec![
            cast_function("d2i", Double, Int32),
            cast_function("f2s", Float, Int16),
            cast_function("d2b", Double, Bool),
            cast_function("b2f", Bool, Float),
            cast_function("l2s", Int64, Int16),
            cast_function("s2l", Int16, Int64),
            cast_function("l2f", Int64, Float),
        ];
        let engine = Jit::new().compile(&module(functions)).unwrap();
        let cases = [
            ("d2i", Word::F64(-3.9)),
            ("d2i", Word::F64(f64::NAN)),
            ("d2i", Word::F64(1e12)),
            ("f2s", Word::F32(40000.0)),
            ("d2b", Word::F64(0.0)),
            ("d2b", Word::F64(-0.5)),
            ("b2f", Word::Bool(true)),
            ("l2s", Word::I64(70000)),
            ("s2l", Word::I16(-2)),
            ("l2f", Word::I64(16_777_217)),
        ];
        let mut memory = Memory::new();
        for (name, arg) in cases {
            let index = engine.lookup(name).unwrap();
            let to = engine.functions[index].ret.and_then(|t| t.scalar()).unwrap();
            let out = engine.call(index, &[arg], &mut memory, &mut NullEnv).unwrap();
            assert_eq!(out, arg.cast(to), "{} {}", name, arg);
        }
    }

    #[test]
    fn test_bool_operands() {
        let mut b = FunctionBuilder::new("f", &[RegType::BOOL, RegType::BOOL], Some(RegType::INT32));
        let (x, y) = (b.param(0), b.param(1));
        let both = b.binary(BinOp::And, x, y);
        let less = b.compare(CmpOp::Lt, x, y);
        let either = b.binary(BinOp::Or, both, less);
        let neg = b.unary(UnOp::Neg, either);
        b.ret(Some(neg));
        let engine = Jit::new().compile(&module(vec![b.finish()])).unwrap();
        assert_eq!(
            run(&engine, "f", &[Word::Bool(false), Word::Bool(true)]).unwrap(),
            Word::I32(-1)
        );
        assert_eq!(
            run(&engine, "f", &[Word::Bool(true), Word::Bool(false)]).unwrap(),
            Word::I32(0)
        );
    }

    #[test]
    fn test_phi_and_select() {
        // r = n > 0 ? n : -n through a phi, then select(r > 10, 10, r)
        let mut b = FunctionBuilder::new("clamp_abs", &[RegType::INT64], Some(RegType::INT64));
        let n = b.param(0);
        let pos = b.create_block("pos");
        let neg = b.create_block("neg");
        let join = b.create_block("join");
        let zero = b.constant(Word::I64(0));
        let negated = b.unary(UnOp::Neg, n);
        let c = b.compare(CmpOp::Gt, n, zero);
        b.cond_br(c, pos, join);
        b.switch_to(pos);
        b.br(neg);
        b.switch_to(neg);
        let m = b.unary(UnOp::Neg, n);
        let m = b.unary(UnOp::Neg, m);
        b.br(join);
        b.switch_to(join);
        let r = b.phi(vec![(neg, m), (BlockId(0), negated)]);
        let ten = b.constant(Word::I64(10));
        let big = b.compare(CmpOp::Gt, r, ten);
        let out = b.select(big, ten, r);
        b.ret(Some(out));
        let engine = Jit::new().compile(&module(vec![b.finish()])).unwrap();
        assert_eq!(run(&engine, "clamp_abs", &[Word::I64(4)]).unwrap(), Word::I64(4));
        assert_eq!(run(&engine, "clamp_abs", &[Word::I64(-3)]).unwrap(), Word::I64(3));
        assert_eq!(run(&engine, "clamp_abs", &[Word::I64(-30)]).unwrap(), Word::I64(10));
    }

    #[test]
    fn test_index_out_of_range() {
        let float = RegType::Scalar(ScalarKind::Float);
        let mut b = FunctionBuilder::new("at", &[RegType::INT32], Some(float));
        let i = b.param(0);
        let arr = b.alloca(SlotType::Array(ScalarKind::Float, 3));
        let e = b.element_ptr(arr, i, 3);
        let v = b.load(e);
        b.ret(Some(v));
        let engine = Jit::new().compile(&module(vec![b.finish()])).unwrap();
        let mut memory = Memory::new();
        let out = engine
            .call_by_name("at", &[Word::I32(2)], &mut memory, &mut NullEnv)
            .unwrap();
        assert_eq!(out, Word::F32(0.0));
        for bad in [3, -1] {
            let err = engine
                .call_by_name("at", &[Word::I32(bad)], &mut memory, &mut NullEnv)
                .unwrap_err();
            assert!(
                err.to_string()
                    .contains(&format!("index {} out of range for a container of 3 elements", bad)),
                "{}",
                err
            );
            assert_eq!(memory.mark(), 0);
        }
    }

    #[test]
    fn test_dangling_pointer_faults() {
        let ptr = RegType::Ptr(CellType::Scalar(ScalarKind::Int32));
        let mut b = FunctionBuilder::new("read", &[ptr], Some(RegType::INT32));
        let p = b.param(0);
        let v = b.load(p);
        b.ret(Some(v));
        let engine = Jit::new().compile(&module(vec![b.finish()])).unwrap();
        let mut memory = Memory::new();
        let cell = memory.alloca(SlotType::Scalar(ScalarKind::Int32));
        memory.store(cell, Word::I32(9)).unwrap();
        let out = engine
            .call_by_name("read", &[Word::Ptr(cell)], &mut memory, &mut NullEnv)
            .unwrap();
        assert_eq!(out, Word::I32(9));
        let err = engine
            .call_by_name("read", &[Word::Ptr(cell.offset(5))], &mut memory, &mut NullEnv)
            .unwrap_err();
        assert!(err.to_string().contains("out of bounds at cell 5"), "{}", err);
    }

    #[test]
    fn test_strings() {
        // s = "ab"; t = "cde"; resize(s, len(s) + len(t)); copy t into s at 2
        let mut b = FunctionBuilder::new("concat_len", &[], Some(RegType::INT64));
        let s = b.alloca(SlotType::Str);
        let t = b.alloca(SlotType::Str);
        b.store_str(s, b"ab");
        b.store_str(t, b"cde");
        let ls = b.str_len(s);
        let lt = b.str_len(t);
        let total = b.binary(BinOp::Add, ls, lt);
        b.str_resize(s, total);
        b.str_copy(s, ls, t);
        let empty = b.alloca(SlotType::Str);
        b.store_str(empty, b"");
        let le = b.str_len(empty);
        let len = b.str_len(s);
        let out = b.binary(BinOp::Add, len, le);
        b.ret(Some(out));
        let engine = Jit::new().compile(&module(vec![b.finish()])).unwrap();
        let mut memory = Memory::new();
        let out = engine
            .call_by_name("concat_len", &[], &mut memory, &mut NullEnv)
            .unwrap();
        assert_eq!(out, Word::I64(5));
        assert_eq!(memory.mark(), 0);
    }

    #[test]
    fn test_module_calls_and_native_errors() {
        let double = RegType::Scalar(ScalarKind::Double);
        let mut callee = FunctionBuilder::new("scale", &[double], Some(double));
        let x = callee.param(0);
        let tmp = callee.alloca(SlotType::Array(ScalarKind::Double, 4));
        callee.store(tmp, x);
        let v = callee.load(tmp);
        let r = callee.binary(BinOp::Add, v, v);
        callee.ret(Some(r));
        let mut callee = callee.finish();
        callee.linkage = ir::Linkage::Internal;

        let mut caller = FunctionBuilder::new("main", &[RegType::INT32], Some(double));
        let n = caller.param(0);
        // int argument widened to the callee's double parameter
        let r = caller.call("scale", vec![n], double);
        caller.ret(Some(r));

        let mut failing = FunctionBuilder::new("fails", &[], None);
        failing.call_void("refuse", vec![]);
        failing.ret(None);

        let mut jit = Jit::new();
        jit.add_symbol("refuse", native(refuse)).unwrap();
        let engine = jit
            .compile(&module(vec![callee, caller.finish(), failing.finish()]))
            .unwrap();
        let mut memory = Memory::new();
        let out = engine
            .call_by_name("main", &[Word::I32(3)], &mut memory, &mut NullEnv)
            .unwrap();
        assert_eq!(out, Word::F64(6.0));
        assert_eq!(memory.mark(), 0);

        let err = engine
            .call_by_name("fails", &[], &mut memory, &mut NullEnv)
            .unwrap_err();
        assert!(err.to_string().contains("native refused"));
        assert_eq!(memory.mark(), 0);
    }

    #[test]
    fn test_call_arity_is_checked() {
        let mut callee = FunctionBuilder::new("one", &[RegType::INT32], None);
        callee.ret(None);
        let mut caller = FunctionBuilder::new("main", &[], None);
        caller.call_void("one", vec![]);
        caller.ret(None);
        let err = Jit::new()
            .compile(&module(vec![callee.finish(), caller.finish()]))
            .unwrap_err();
        assert!(err.to_string().contains("call to one passes 0 argument(s), expected 1"));
    }

    #[test]
    fn test_unreachable_reports_function() {
        let mut b = FunctionBuilder::new("dead_end", &[], None);
        b.unreachable();
        let engine = Jit::new().compile(&module(vec![b.finish()])).unwrap();
        let err = run(&engine, "dead_end", &[]).unwrap_err();
        assert!(err.to_string().contains("unreachable code in dead_end (bb0)"), "{}", err);
    }

    #[test]
    fn test_argument_checks() {
        let engine = Jit::new()
            .compile(&module(vec![binary_function("add", ScalarKind::Int32, BinOp::Add)]))
            .unwrap();
        let err = run(&engine, "add", &[Word::I32(1)]).unwrap_err();
        assert!(err.to_string().contains("expects 2 argument(s)"));
        // scalar arguments convert to the parameter kind
        let out = run(&engine, "add", &[Word::F64(1.5), Word::I64(2)]).unwrap();
        assert_eq!(out, Word::I32(3));
        assert!(run(&engine, "add", &[Word::Handle(1), Word::I32(2)]).is_err());
    }

    #[test]
    fn test_concurrent_calls() {
        let mut jit = Jit::new().optimize(true);
        jit.add_symbol("double_it", native(double_it)).unwrap();
        let engine = jit.compile(&module(vec![sum_function()])).unwrap();
        std::thread::scope(|s| {
            for n in 0..8 {
                let engine = &engine;
                s.spawn(move || {
                    let mut memory = Memory::new();
                    for _ in 0..50 {
                        let out = engine
                            .call_by_name("sum", &[Word::I32(n)], &mut memory, &mut NullEnv)
                            .unwrap();
                        assert_eq!(out, Word::I32(n * (n - 1)));
                    }
                });
            }
        });
    }
}
