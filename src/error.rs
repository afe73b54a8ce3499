//! Error types for the vdbax compiler and executor

use crate::compiler::functions::MatchKind;
use thiserror::Error;

/// Compiler and executor errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Front end
    /// Syntax error encountered while scanning or parsing source text
    ///
    /// **Triggered by:** Invalid surface syntax (unbalanced braces, bad tokens)
    /// **Example:** `int a = ;`
    #[error("Syntax error at line {line}, column {col}: {message}")]
    SyntaxError {
        /// Line number where error occurred
        line: usize,
        /// Column number where error occurred
        col: usize,
        /// Error description
        message: String,
    },

    // Compile time
    /// The same attribute or external name is accessed with two different types
    ///
    /// **Triggered by:** `f@density = 1; i@density = 2;`
    /// **Severity:** Fatal, aborts the compile before any code is generated
    #[error("Ambiguous type for {kind} \"{name}\": accessed as both {first} and {second}")]
    AmbiguousType {
        /// Accessed name
        name: String,
        /// "attribute" or "external"
        kind: String,
        /// Type of the first access
        first: String,
        /// Type of the conflicting access
        second: String,
    },

    /// No overload of a function accepts the call-site arguments
    ///
    /// `None` means no function of that name is callable from the kernel;
    /// `Size` means the function exists but none of its overloads fit.
    #[error("{}", unresolved_message(.name, *.match_kind, .args, .arities))]
    UnresolvedFunction {
        /// Called identifier
        name: String,
        /// Best match quality observed during resolution
        match_kind: MatchKind,
        /// Call-site argument types
        args: Vec<String>,
        /// Argument counts the overloads accept when none takes `args.len()`
        arities: Vec<usize>,
    },

    /// Operator or operand combination that the type model rejects
    ///
    /// **Example:** `1.0 & 2.0`, `vec3f < vec3f`
    #[error("Unsupported operation: {op} on {operand}")]
    UnsupportedOperation {
        /// Operator or construct name
        op: String,
        /// Description of the offending operand types
        operand: String,
    },

    /// `break` or `continue` used outside of a loop
    #[error("{keyword} statement used outside of a loop")]
    InvalidControlFlow {
        /// The keyword that was misplaced
        keyword: String,
    },

    /// A local declared twice in the same scope
    #[error("Local variable \"{name}\" has already been declared in this scope")]
    Redeclaration {
        /// Variable name
        name: String,
    },

    /// Reference to a local that was never declared
    #[error("Use of undeclared variable \"{name}\"")]
    UndeclaredVariable {
        /// Variable name
        name: String,
    },

    /// Type error in a construct that is not an operator
    #[error("Type error: expected {expected}, got {got}")]
    TypeError {
        /// Expected type
        expected: String,
        /// Actual type
        got: String,
    },

    /// Compilation finished with errors; carries every error message logged
    #[error("Compilation failed with {} error(s): {}", .errors.len(), .errors.join("; "))]
    Compilation {
        /// Rendered error diagnostics in emission order
        errors: Vec<String>,
    },

    // Bind and run time
    /// A referenced attribute or grid is missing and auto-creation is disabled
    #[error("Unable to find {kind} \"{name}\"")]
    Lookup {
        /// Name of the missing attribute or grid
        name: String,
        /// "attribute" or "grid"
        kind: String,
    },

    /// Bound data does not have the type the program was compiled against
    #[error("Type mismatch for \"{name}\": program expects {expected}, data holds {actual}")]
    TypeMismatch {
        /// Attribute, grid or external name
        name: String,
        /// Type recorded in the access registry
        expected: String,
        /// Type of the bound data
        actual: String,
    },

    /// Internal code generation, verification or JIT failure
    #[error("Execution engine error: {message}")]
    Execution {
        /// Aggregated report
        message: String,
    },
}

fn unresolved_message(name: &str, kind: MatchKind, args: &[String], arities: &[usize]) -> String {
    match kind {
        MatchKind::None => format!(
            "Unable to locate function \"{}\" for {} argument(s) ({})",
            name,
            args.len(),
            args.join(", ")
        ),
        _ if !arities.is_empty() => {
            let counts: Vec<String> = arities.iter().map(|n| n.to_string()).collect();
            format!(
                "No overload of \"{}\" takes {} argument(s) ({}); expected {}",
                name,
                args.len(),
                args.join(", "),
                counts.join(" or ")
            )
        }
        _ => format!(
            "No overload of \"{}\" matches the argument types ({})",
            name,
            args.join(", ")
        ),
    }
}

/// Error severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Fatal error that aborts the compile or execution
    Fatal,
    /// Statement-level error; the compile continues to surface more problems
    Recoverable,
    /// Warning that doesn't prevent execution
    Warning,
}

impl Error {
    /// Create an execution engine error with a message
    pub fn execution(msg: impl Into<String>) -> Self {
        Error::Execution {
            message: msg.into(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(op: impl Into<String>, operand: impl Into<String>) -> Self {
        Error::UnsupportedOperation {
            op: op.into(),
            operand: operand.into(),
        }
    }

    /// Classify error severity
    pub fn classify(&self) -> ErrorSeverity {
        match self {
            Error::SyntaxError { .. } => ErrorSeverity::Fatal,
            Error::AmbiguousType { .. } => ErrorSeverity::Fatal,
            Error::Compilation { .. } => ErrorSeverity::Fatal,
            Error::Lookup { .. } => ErrorSeverity::Fatal,
            Error::TypeMismatch { .. } => ErrorSeverity::Fatal,
            Error::Execution { .. } => ErrorSeverity::Fatal,

            Error::UnresolvedFunction { .. }
            | Error::UnsupportedOperation { .. }
            | Error::InvalidControlFlow { .. }
            | Error::Redeclaration { .. }
            | Error::UndeclaredVariable { .. }
            | Error::TypeError { .. } => ErrorSeverity::Recoverable,
        }
    }
}

/// Result type for vdbax operations
pub type Result<T> = std::result::Result<T, Error>;
