//! # Compiler - AX kernels to native code
//!
//! Compiles a parsed program into an [`Executable`] that can be run over
//! point or volume data any number of times.
//!
//! ## Architecture
//!
//! ```text
//! Tree → default types → access registry → codegen (IR) → optimize → verify → JIT
//!                                 │                                            │
//!                                 └──────────── global indices ───────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use vdbax::compiler::{Compiler, CompilerOptions, Target};
//!
//! let compiler = Compiler::new(CompilerOptions::default());
//! let exe = compiler.compile_source("@density *= 2.0f;", Target::Volumes)?;
//! exe.execute_volumes(&mut grids, &ExecutionOptions::default())?;
//! ```

pub mod attribute_registry;
pub mod codegen;
pub mod custom_data;
pub mod default_types;
pub mod executable;
pub mod functions;
pub mod ir;
pub mod jit;
pub mod logger;
pub mod optimizer;
pub mod verifier;

pub use attribute_registry::{AccessEntry, AttributeRegistry};
pub use codegen::{PointKernel, VolumeKernel};
pub use custom_data::{CustomData, CustomValue};
pub use executable::Executable;
pub use functions::{FunctionRegistry, MatchKind};
pub use jit::{ExecutionEngine, Jit};
pub use logger::{Diagnostic, Logger};
pub use optimizer::Optimizer;
pub use verifier::{Verifier, VerifyError, VerifyResult};

use crate::error::{Error, Result};
use crate::parser::{self, Tree};
use crate::runtime::Word;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Kind of data a program is compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// One kernel invocation per point
    Points,
    /// One kernel invocation per voxel
    Volumes,
}

/// Optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum OptLevel {
    /// No optimizer run at all
    None,
    /// Same as `None`
    O0,
    /// Constant folding and unreachable block removal
    O1,
    /// O1 plus native call folding and dead instruction removal
    #[default]
    O2,
    /// O2 plus redundant load forwarding
    O3,
}

impl OptLevel {
    fn level(self) -> u8 {
        match self {
            OptLevel::None | OptLevel::O0 => 0,
            OptLevel::O1 => 1,
            OptLevel::O2 => 2,
            OptLevel::O3 => 3,
        }
    }
}

/// Compilation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerOptions {
    /// Optimization level
    pub opt_level: OptLevel,
    /// Verify the generated module before the JIT sees it
    pub verify: bool,
    /// Fold calls to pure natives whose arguments are constant
    pub constant_fold_natives: bool,
    /// Stop storing diagnostics after this many errors (0 = unlimited)
    pub max_errors: usize,
    /// Treat compile warnings as errors
    pub warnings_as_errors: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::O2,
            verify: true,
            constant_fold_natives: true,
            max_errors: 0,
            warnings_as_errors: false,
        }
    }
}

/// AX compiler
///
/// Owns the function registry used by every compile. The registry lock is
/// held from code generation until the JIT has finished, so concurrent
/// compiles through one `Compiler` run one after another.
#[derive(Debug)]
pub struct Compiler {
    options: CompilerOptions,
    registry: Mutex<FunctionRegistry>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompilerOptions::default())
    }
}

impl Compiler {
    /// Create a compiler with the built-in function catalog
    pub fn new(options: CompilerOptions) -> Self {
        Self::with_registry(options, FunctionRegistry::new())
    }

    /// Create a compiler resolving calls through `registry`
    pub fn with_registry(options: CompilerOptions, registry: FunctionRegistry) -> Self {
        Self {
            options,
            registry: Mutex::new(registry),
        }
    }

    /// Options used by every compile
    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    fn logger(&self) -> Logger {
        Logger::new()
            .with_max_errors(self.options.max_errors)
            .with_warnings_as_errors(self.options.warnings_as_errors)
    }

    /// Scan, parse and compile source text
    pub fn compile_source(&self, source: &str, target: Target) -> Result<Executable> {
        let tree = parser::parse(source)?;
        self.compile(&tree, target)
    }

    /// Compile a tree for point data
    pub fn compile_points(&self, tree: &Tree) -> Result<Executable> {
        self.compile(tree, Target::Points)
    }

    /// Compile a tree for volume data
    pub fn compile_volumes(&self, tree: &Tree) -> Result<Executable> {
        self.compile(tree, Target::Volumes)
    }

    /// Compile a tree, failing with [`Error::Compilation`] if anything was logged
    pub fn compile(&self, tree: &Tree, target: Target) -> Result<Executable> {
        let mut logger = self.logger();
        self.compile_with_logger(tree, target, &mut logger)
    }

    /// Compile a tree, logging diagnostics into `logger`
    ///
    /// Hard failures (ambiguous attribute types, verifier and JIT errors) are
    /// returned directly. Statement-level errors are logged and turned into
    /// [`Error::Compilation`] once generation has finished.
    pub fn compile_with_logger(
        &self,
        tree: &Tree,
        target: Target,
        logger: &mut Logger,
    ) -> Result<Executable> {
        info!(?target, statements = tree.statements.len(), "compiling program");

        let tree = default_types::infer(tree, target);
        let access = AttributeRegistry::build(&tree)?;

        let mut registry = self.registry.lock();
        let mut module = match target {
            Target::Points => codegen::generate::<PointKernel>(&tree, &mut registry, &access, logger)?,
            Target::Volumes => codegen::generate::<VolumeKernel>(&tree, &mut registry, &access, logger)?,
        };
        if logger.has_errors() {
            return Err(logger.to_error());
        }
        let symbols = registry.symbols();

        let level = self.options.opt_level.level();
        if level > 0 {
            let mut optimizer = Optimizer::new(level);
            if self.options.constant_fold_natives {
                optimizer = optimizer.with_natives(&symbols);
            }
            optimizer.optimize(&mut module);
            debug!(stats = ?optimizer.stats(), "optimized module");
        }

        if self.options.verify {
            let result = Verifier::new().verify(&module);
            for warning in &result.warnings {
                debug!(%warning, "verifier warning");
            }
            if !result.valid {
                let report: Vec<String> = result.errors.iter().map(|e| e.to_string()).collect();
                return Err(Error::execution(format!(
                    "module verification failed: {}",
                    report.join("; ")
                )));
            }
        }

        let mut jit = Jit::new().optimize(self.options.opt_level.level() > 0);
        jit.add_symbols(&symbols)?;
        for entry in access.attributes() {
            jit.add_global(
                &AttributeRegistry::attribute_symbol(&entry.name),
                Word::I64(entry.index as i64),
            );
        }
        for entry in access.externals() {
            jit.add_global(
                &AttributeRegistry::external_symbol(&entry.name),
                Word::I64(entry.index as i64),
            );
        }
        let engine = jit.compile(&module)?;
        drop(registry);

        let warnings = logger.warnings().map(|d| d.to_string()).collect();
        let exe = Executable::new(engine, target, access, warnings)?;
        info!(
            ?target,
            attributes = exe.access().attributes().len(),
            externals = exe.access().externals().len(),
            instructions = module.instruction_count(),
            "compiled program"
        );
        Ok(exe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default() {
        let options = CompilerOptions::default();
        assert_eq!(options.opt_level, OptLevel::O2);
        assert!(options.verify);
    }

    #[test]
    fn test_options_serde() {
        let options = CompilerOptions {
            opt_level: OptLevel::O3,
            max_errors: 4,
            ..CompilerOptions::default()
        };
        let json = serde_json::to_string(&options).unwrap();
        let back: CompilerOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn test_compile_every_level() {
        for opt_level in [OptLevel::None, OptLevel::O0, OptLevel::O1, OptLevel::O2, OptLevel::O3] {
            let compiler = Compiler::new(CompilerOptions {
                opt_level,
                ..CompilerOptions::default()
            });
            let exe = compiler
                .compile_source("if (@a > 1.0f) { @b = sin(@a); } else { @b = 0; }", Target::Points)
                .unwrap();
            assert_eq!(exe.access().attributes().len(), 2);
        }
    }

    #[test]
    fn test_ambiguous_type_is_fatal() {
        let compiler = Compiler::default();
        let err = compiler
            .compile_source("float a = f$foo; int b = i$foo;", Target::Points)
            .unwrap_err();
        assert!(matches!(err, Error::AmbiguousType { .. }));
    }

    #[test]
    fn test_logged_errors_become_compilation_error() {
        let compiler = Compiler::default();
        let mut logger = Logger::new();
        let tree = parser::parse("break; int a = 1;").unwrap();
        let err = compiler
            .compile_with_logger(&tree, Target::Points, &mut logger)
            .unwrap_err();
        assert!(matches!(err, Error::Compilation { ref errors } if errors.len() == 1));
        assert_eq!(logger.error_count(), 1);
    }

    #[test]
    fn test_warnings_as_errors() {
        let compiler = Compiler::new(CompilerOptions {
            warnings_as_errors: true,
            ..CompilerOptions::default()
        });
        assert!(compiler
            .compile_source("int a = 1; { int a = 2; }", Target::Points)
            .is_err());
        assert!(Compiler::default()
            .compile_source("int a = 1; { int a = 2; }", Target::Points)
            .is_ok());
    }

    #[test]
    fn test_volume_compile() {
        let exe = Compiler::default()
            .compile_source("@density = @density * 2.0f + getcoordx();", Target::Volumes)
            .unwrap();
        assert_eq!(exe.target(), Target::Volumes);
    }
}
