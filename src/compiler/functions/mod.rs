//! # Function Registry & Overload Resolution
//!
//! Every callable operation is a [`FunctionGroup`]: an identifier mapped to an
//! ordered overload set of [`Signature`]s. A signature is implemented either by
//! a native entry point bound into the JIT or by an inline generator that
//! emits IR at the call site.
//!
//! ## Matching
//!
//! ```text
//! for each candidate in registration order:
//!     arity differs            -> None
//!     every type identical     -> Explicit   (returned immediately)
//!     every pair convertible   -> Implicit
//!     otherwise                -> Size
//! keep the first candidate with the best kind seen so far
//! ```
//!
//! Composite results (containers, strings) use the output-argument convention:
//! the last parameter is a slot allocated by the caller which the function
//! fills. Output forms match against the parameters before the output slot.
//!
//! ## Module Structure
//!
//! ```text
//! functions/
//! ├── mod.rs       # Signatures, groups and the match algorithm
//! ├── registry.rs  # Lazily instantiated catalog
//! ├── native.rs    # Argument helpers shared by native bodies
//! ├── standard.rs  # Scalar math
//! ├── vector.rs    # length, dot, cross, normalize
//! ├── matrix.rs    # Matrix algebra and polar decomposition
//! ├── string.rs    # atoi, atof, hash and string helpers
//! ├── noise.rs     # rand, simplex and curl noise
//! └── domain.rs    # Point and volume builtins, attribute accessors
//! ```

mod domain;
mod matrix;
mod native;
mod noise;
mod registry;
mod standard;
mod string;
mod vector;

pub use registry::{Availability, FunctionRegistry};

use crate::compiler::ir::{FunctionBuilder, Reg};
use crate::compiler::jit::NativeFn;
use crate::error::{Error, Result};
use crate::types::Type;
use std::fmt;
use std::sync::Arc;

/// Quality of fit between call-site arguments and a signature, ranked in
/// declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchKind {
    /// Wrong number of arguments
    None,
    /// Right number of arguments, at least one not convertible
    Size,
    /// Every argument converts implicitly
    Implicit,
    /// Every argument type is identical
    Explicit,
}

/// Generates IR for a call in place; receives the converted argument registers
/// and returns the result register for value-returning signatures
pub type InlineFn =
    Arc<dyn Fn(&mut FunctionBuilder, &[Reg]) -> Result<Option<Reg>> + Send + Sync>;

/// How a signature is implemented
#[derive(Clone)]
pub enum Implementation {
    /// Native entry point called through the JIT symbol table
    Native(NativeFn),
    /// IR emitted at the call site
    Inline(InlineFn),
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Implementation::Native(_) => f.write_str("Native"),
            Implementation::Inline(_) => f.write_str("Inline"),
        }
    }
}

/// One overload
#[derive(Debug, Clone)]
pub struct Signature {
    /// Parameter types, including the output slot when `output_arg` is set
    pub params: Vec<Type>,
    /// Return type (`Void` for output-argument forms)
    pub ret: Type,
    /// Last parameter is a caller-allocated result slot
    pub output_arg: bool,
    /// No side effects; calls with constant arguments may be folded
    pub pure: bool,
    /// Native or inline body
    pub imp: Implementation,
    symbol: String,
}

impl Signature {
    /// Native signature, pure by default
    pub fn native(params: Vec<Type>, ret: Type, func: NativeFn) -> Self {
        Self {
            params,
            ret,
            output_arg: false,
            pure: true,
            imp: Implementation::Native(func),
            symbol: String::new(),
        }
    }

    /// Native signature writing its result into a trailing `output` slot
    pub fn native_output(mut inputs: Vec<Type>, output: Type, func: NativeFn) -> Self {
        inputs.push(output);
        Self {
            params: inputs,
            ret: Type::Void,
            output_arg: true,
            pure: true,
            imp: Implementation::Native(func),
            symbol: String::new(),
        }
    }

    /// Inline signature
    pub fn inline(params: Vec<Type>, ret: Type, body: InlineFn) -> Self {
        Self {
            params,
            ret,
            output_arg: false,
            pure: true,
            imp: Implementation::Inline(body),
            symbol: String::new(),
        }
    }

    /// Inline signature filling a trailing `output` slot
    pub fn inline_output(mut inputs: Vec<Type>, output: Type, body: InlineFn) -> Self {
        inputs.push(output);
        Self {
            params: inputs,
            ret: Type::Void,
            output_arg: true,
            pure: true,
            imp: Implementation::Inline(body),
            symbol: String::new(),
        }
    }

    /// Mark the signature as having side effects
    pub fn impure(mut self) -> Self {
        self.pure = false;
        self
    }

    /// Symbol the native body is bound under
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Parameters supplied by the caller (the output slot excluded)
    pub fn inputs(&self) -> &[Type] {
        if self.output_arg && !self.params.is_empty() {
            &self.params[..self.params.len() - 1]
        } else {
            &self.params
        }
    }

    /// Type of the output slot
    pub fn output(&self) -> Option<Type> {
        if self.output_arg {
            self.params.last().copied()
        } else {
            None
        }
    }

    /// Type of the value a call produces
    pub fn result(&self) -> Type {
        self.output().unwrap_or(self.ret)
    }

    /// Classify call-site argument types against this signature
    pub fn match_args(&self, args: &[Type]) -> MatchKind {
        let inputs = self.inputs();
        if inputs.len() != args.len() {
            return MatchKind::None;
        }
        if inputs.iter().zip(args).all(|(p, a)| p == a) {
            return MatchKind::Explicit;
        }
        if inputs.iter().zip(args).all(|(p, a)| implicitly_converts(a, p)) {
            MatchKind::Implicit
        } else {
            MatchKind::Size
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        write!(f, "{} {}({})", self.ret, self.symbol, params.join(", "))
    }
}

/// Argument conversions allowed during overload resolution
///
/// Scalars convert among themselves. Containers are passed by pointer and
/// convert only when the element counts agree. Strings match strings.
pub fn implicitly_converts(from: &Type, to: &Type) -> bool {
    match (from, to) {
        (Type::Scalar(_), Type::Scalar(_)) => true,
        (Type::Array { len: n, .. }, Type::Array { len: m, .. }) => n == m,
        (Type::String, Type::String) => true,
        _ => false,
    }
}

/// Pick the best candidate for `args`
///
/// The first Explicit match wins outright. Otherwise the first candidate with
/// the best kind is returned, so ties go to the earliest registered overload.
pub fn match_candidates<'a, I>(candidates: I, args: &[Type]) -> (Option<&'a Signature>, MatchKind)
where
    I: IntoIterator<Item = &'a Signature>,
{
    let mut best = None;
    let mut best_kind = MatchKind::None;
    for sig in candidates {
        let kind = sig.match_args(args);
        if kind == MatchKind::Explicit {
            return (Some(sig), kind);
        }
        if kind > best_kind {
            best = Some(sig);
            best_kind = kind;
        }
    }
    (best, best_kind)
}

/// An identifier and its overload set
#[derive(Debug, Clone)]
pub struct FunctionGroup {
    name: String,
    signatures: Vec<Signature>,
    dependencies: Vec<String>,
    internal: bool,
}

impl FunctionGroup {
    /// Empty user-callable group
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            signatures: Vec::new(),
            dependencies: Vec::new(),
            internal: false,
        }
    }

    /// Hide the group from user code
    pub fn internal(mut self) -> Self {
        self.internal = true;
        for sig in &mut self.signatures {
            sig.symbol = self.name.clone();
        }
        self
    }

    /// Another group whose symbols this group's bodies reference
    pub fn depends_on(mut self, name: &str) -> Self {
        self.dependencies.push(name.to_string());
        self
    }

    /// Append an overload
    pub fn with(mut self, mut sig: Signature) -> Self {
        sig.symbol = if self.internal {
            self.name.clone()
        } else {
            symbol_name(&self.name, &sig.params)
        };
        self.signatures.push(sig);
        self
    }

    /// Identifier
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overloads in registration order
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Groups this one depends on
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// True for helpers reachable only from generated code
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Resolve an overload
    ///
    /// With `prefer_output` the output-argument forms are tried first and a
    /// usable hit there is returned before plain resolution runs.
    pub fn match_signature(&self, args: &[Type], prefer_output: bool) -> (Option<&Signature>, MatchKind) {
        if prefer_output {
            let (sig, kind) =
                match_candidates(self.signatures.iter().filter(|s| s.output_arg), args);
            if kind >= MatchKind::Implicit {
                return (sig, kind);
            }
        }
        match_candidates(&self.signatures, args)
    }

    /// The single signature of an internal helper
    pub fn only(&self) -> Result<&Signature> {
        self.signatures
            .first()
            .ok_or_else(|| Error::execution(format!("function group {} is empty", self.name)))
    }
}

/// Symbol name of an overload: `name(type, type, ...)`
pub fn symbol_name(name: &str, params: &[Type]) -> String {
    let params: Vec<String> = params.iter().map(|p| p.to_string()).collect();
    format!("{}({})", name, params.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::jit::CallContext;
    use crate::runtime::Word;
    use crate::types::ScalarKind;

    fn nop(_: &mut CallContext<'_>, _: &[Word]) -> Result<Word> {
        Ok(Word::Void)
    }

    fn group() -> FunctionGroup {
        FunctionGroup::new("f")
            .with(Signature::native(vec![Type::DOUBLE], Type::DOUBLE, nop))
            .with(Signature::native(vec![Type::FLOAT], Type::FLOAT, nop))
            .with(Signature::native(vec![Type::INT32, Type::INT32], Type::INT32, nop))
    }

    #[test]
    fn test_explicit_match_wins() {
        let g = group();
        let (sig, kind) = g.match_signature(&[Type::FLOAT], true);
        assert_eq!(kind, MatchKind::Explicit);
        assert_eq!(sig.map(|s| s.symbol()), Some("f(float)"));
    }

    #[test]
    fn test_first_registered_wins_implicit_ties() {
        let g = group();
        let (sig, kind) = g.match_signature(&[Type::INT32], true);
        assert_eq!(kind, MatchKind::Implicit);
        assert_eq!(sig.map(|s| s.symbol()), Some("f(double)"));
    }

    #[test]
    fn test_size_and_none() {
        let g = group();
        let (_, kind) = g.match_signature(&[Type::String], true);
        assert_eq!(kind, MatchKind::Size);
        let (sig, kind) = g.match_signature(&[Type::INT32; 3], true);
        assert_eq!(kind, MatchKind::None);
        assert!(sig.is_none());
    }

    #[test]
    fn test_array_conversion_requires_equal_length() {
        let vec3f = Type::vec(ScalarKind::Float, 3);
        let vec3i = Type::vec(ScalarKind::Int32, 3);
        let vec2f = Type::vec(ScalarKind::Float, 2);
        assert!(implicitly_converts(&vec3i, &vec3f));
        assert!(!implicitly_converts(&vec2f, &vec3f));
        assert!(!implicitly_converts(&Type::FLOAT, &vec3f));
    }

    #[test]
    fn test_output_forms_match_inputs_only() {
        let vec3d = Type::vec(ScalarKind::Double, 3);
        let g = FunctionGroup::new("n").with(Signature::native_output(vec![vec3d], vec3d, nop));
        let sig = &g.signatures()[0];
        assert_eq!(sig.inputs(), &[vec3d]);
        assert_eq!(sig.result(), vec3d);
        let (_, kind) = g.match_signature(&[Type::vec(ScalarKind::Float, 3)], true);
        assert_eq!(kind, MatchKind::Implicit);
    }

    #[test]
    fn test_internal_symbols_use_group_name() {
        let g = FunctionGroup::new("ax.helper")
            .internal()
            .with(Signature::native(vec![Type::INT64], Type::Void, nop));
        assert_eq!(g.only().map(|s| s.symbol().to_string()), Ok("ax.helper".to_string()));
    }
}
