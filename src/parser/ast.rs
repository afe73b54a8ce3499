use crate::types::Type;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Complete program: the statements of one kernel body
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tree {
    /// Top-level statements in source order
    pub statements: Vec<Statement>,
}

/// Source position of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Line number (1-indexed)
    pub line: usize,
    /// Column number (1-indexed)
    pub col: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A statement with the position it was parsed from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// What the statement does
    pub kind: StatementKind,
    /// Position in source text; `None` for hand-built trees
    pub loc: Option<Location>,
}

impl Statement {
    /// Statement without a source position
    pub fn new(kind: StatementKind) -> Self {
        Statement { kind, loc: None }
    }

    /// Expression statement
    pub fn expr(expr: Expression) -> Self {
        Statement::new(StatementKind::Expression(expr))
    }
}

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatementKind {
    /// Nested `{ ... }` scope
    Block(Vec<Statement>),

    /// Expression evaluated for its side effects
    Expression(Expression),

    /// One or more local declarations sharing a type: `int a = 1, b;`
    Declare(Vec<Declaration>),

    /// If statement
    If {
        /// Condition expression to evaluate
        condition: Expression,
        /// Statements to execute if condition is true
        then_branch: Vec<Statement>,
        /// Statements to execute if condition is false (empty when omitted)
        else_branch: Vec<Statement>,
    },

    /// `for`, `while` and `do ... while` loops
    Loop {
        /// Loop flavour
        kind: LoopKind,
        /// `for` initialiser (declaration or expression)
        init: Option<Box<Statement>>,
        /// Loop test; `None` loops until `break`
        condition: Option<Expression>,
        /// `for` iteration clause, run after the body
        iteration: Option<Expression>,
        /// Loop body
        body: Vec<Statement>,
    },

    /// `return;`
    Return,
    /// `break;`
    Break,
    /// `continue;`
    Continue,
}

/// Loop flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopKind {
    /// `for (init; cond; iter)`
    For,
    /// `while (cond)`
    While,
    /// `do { } while (cond)`
    DoWhile,
}

/// One declared local
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    /// Declared type
    pub ty: Type,
    /// Variable name
    pub name: String,
    /// Initialiser; locals without one are zero-initialised
    pub init: Option<Expression>,
}

/// Literal values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    /// `true` / `false`
    Bool(bool),
    /// `1s`
    Int16(i16),
    /// `1`
    Int32(i32),
    /// `1l`
    Int64(i64),
    /// `1.0f`
    Float(f32),
    /// `1.0`
    Double(f64),
    /// `"text"`
    String(String),
}

impl Literal {
    /// Type of the literal
    pub fn ty(&self) -> Type {
        match self {
            Literal::Bool(_) => Type::BOOL,
            Literal::Int16(_) => Type::INT16,
            Literal::Int32(_) => Type::INT32,
            Literal::Int64(_) => Type::INT64,
            Literal::Float(_) => Type::FLOAT,
            Literal::Double(_) => Type::DOUBLE,
            Literal::String(_) => Type::String,
        }
    }
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    /// Literal value
    Value(Literal),

    /// Local variable reference
    Local(String),

    /// Attribute (point) or voxel (volume) access: `type@name`
    Attribute {
        /// Attribute or grid name
        name: String,
        /// Access type; filled in by default-type inference when `inferred`
        ty: Type,
        /// True when the source wrote `@name` without a type
        inferred: bool,
    },

    /// Custom data access: `type$name`
    External {
        /// Custom data key
        name: String,
        /// Access type
        ty: Type,
        /// True when the source wrote `$name` without a type
        inferred: bool,
    },

    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand expression
        operand: Box<Expression>,
    },

    /// Binary operation
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        left: Box<Expression>,
        /// Right operand
        right: Box<Expression>,
    },

    /// Assignment, optionally compound (`a += b` has `op = Some(Add)`)
    Assign {
        /// Compound operator
        op: Option<BinaryOp>,
        /// Assigned location
        target: Box<Expression>,
        /// Assigned value
        value: Box<Expression>,
    },

    /// `++` / `--` in prefix or postfix position
    Crement {
        /// Increment or decrement
        op: CrementOp,
        /// True for `a++` (yields the old value)
        post: bool,
        /// Modified location
        target: Box<Expression>,
    },

    /// Ternary conditional `c ? a : b`; `c ?: b` has no true branch
    Ternary {
        /// Condition expression
        condition: Box<Expression>,
        /// Value when true; `None` reuses the condition value
        then_expr: Option<Box<Expression>>,
        /// Value when false
        else_expr: Box<Expression>,
    },

    /// Function call
    Call {
        /// Function identifier
        name: String,
        /// Arguments
        args: Vec<Expression>,
    },

    /// Functional cast `float(x)`
    Cast {
        /// Target type (always a scalar)
        ty: Type,
        /// Converted expression
        expr: Box<Expression>,
    },

    /// Vector / matrix literal `{a, b, c}`
    ArrayPack(Vec<Expression>),

    /// Component access `v[i]`, `v.x` or matrix `m[i, j]`
    ArrayUnpack {
        /// Indexed container
        expr: Box<Expression>,
        /// First (or only) index
        index: Box<Expression>,
        /// Column index for matrices
        index2: Option<Box<Expression>>,
    },

    /// Comma expression; yields its last element
    Comma(Vec<Expression>),
}

impl Expression {
    /// Integer literal shortcut
    pub fn int(v: i32) -> Expression {
        Expression::Value(Literal::Int32(v))
    }

    /// Float literal shortcut
    pub fn float(v: f32) -> Expression {
        Expression::Value(Literal::Float(v))
    }

    /// Typed attribute access shortcut
    pub fn attribute(name: &str, ty: Type) -> Expression {
        Expression::Attribute {
            name: name.to_string(),
            ty,
            inferred: false,
        }
    }

    /// Typed external access shortcut
    pub fn external(name: &str, ty: Type) -> Expression {
        Expression::External {
            name: name.to_string(),
            ty,
            inferred: false,
        }
    }

    /// Plain assignment shortcut
    pub fn assign(target: Expression, value: Expression) -> Expression {
        Expression::Assign {
            op: None,
            target: Box::new(target),
            value: Box::new(value),
        }
    }

    /// Binary operation shortcut
    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Expression {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Call shortcut
    pub fn call(name: &str, args: Vec<Expression>) -> Expression {
        Expression::Call {
            name: name.to_string(),
            args,
        }
    }

    /// True for expressions that name a storage location
    pub fn is_addressable(&self) -> bool {
        match self {
            Expression::Local(_) | Expression::Attribute { .. } => true,
            Expression::ArrayUnpack { expr, .. } => expr.is_addressable(),
            _ => false,
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

impl BinaryOp {
    /// Operator token as written in source
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
        }
    }

    /// Operator for a compound assignment lexeme (`+` in `+=`)
    pub fn from_compound(symbol: &str) -> Option<BinaryOp> {
        Some(match symbol {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Mod,
            "&" => BinaryOp::BitAnd,
            "|" => BinaryOp::BitOr,
            "^" => BinaryOp::BitXor,
            "<<" => BinaryOp::Shl,
            ">>" => BinaryOp::Shr,
            _ => return None,
        })
    }

    /// True for `< <= > >=`
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
        )
    }

    /// True for `== !=`
    pub fn is_equality(self) -> bool {
        matches!(self, BinaryOp::Eq | BinaryOp::NotEq)
    }

    /// True for `& | ^ << >>`
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr
        )
    }

    /// True for `&& ||`
    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// `+x`
    Plus,
    /// `-x`
    Minus,
    /// `!x`
    Not,
    /// `~x`
    BitNot,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
        })
    }
}

/// Increment / decrement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrementOp {
    /// `++`
    Increment,
    /// `--`
    Decrement,
}

/// Visit every expression of a tree in pre-order
///
/// Used by the analysis passes (access collection, default-type inference)
/// that only need to look at expressions.
pub fn walk_expressions<'a>(statements: &'a [Statement], f: &mut dyn FnMut(&'a Expression)) {
    for stmt in statements {
        walk_statement(stmt, f);
    }
}

fn walk_statement<'a>(stmt: &'a Statement, f: &mut dyn FnMut(&'a Expression)) {
    match &stmt.kind {
        StatementKind::Block(body) => walk_expressions(body, f),
        StatementKind::Expression(e) => walk_expression(e, f),
        StatementKind::Declare(decls) => {
            for d in decls {
                if let Some(init) = &d.init {
                    walk_expression(init, f);
                }
            }
        }
        StatementKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            walk_expression(condition, f);
            walk_expressions(then_branch, f);
            walk_expressions(else_branch, f);
        }
        StatementKind::Loop {
            init,
            condition,
            iteration,
            body,
            ..
        } => {
            if let Some(init) = init {
                walk_statement(init, f);
            }
            if let Some(c) = condition {
                walk_expression(c, f);
            }
            if let Some(i) = iteration {
                walk_expression(i, f);
            }
            walk_expressions(body, f);
        }
        StatementKind::Return | StatementKind::Break | StatementKind::Continue => {}
    }
}

/// Visit an expression and all of its sub-expressions in pre-order
pub fn walk_expression<'a>(expr: &'a Expression, f: &mut dyn FnMut(&'a Expression)) {
    f(expr);
    match expr {
        Expression::Value(_)
        | Expression::Local(_)
        | Expression::Attribute { .. }
        | Expression::External { .. } => {}
        Expression::Unary { operand, .. } => walk_expression(operand, f),
        Expression::Binary { left, right, .. } => {
            walk_expression(left, f);
            walk_expression(right, f);
        }
        Expression::Assign { target, value, .. } => {
            walk_expression(target, f);
            walk_expression(value, f);
        }
        Expression::Crement { target, .. } => walk_expression(target, f),
        Expression::Ternary {
            condition,
            then_expr,
            else_expr,
        } => {
            walk_expression(condition, f);
            if let Some(t) = then_expr {
                walk_expression(t, f);
            }
            walk_expression(else_expr, f);
        }
        Expression::Call { args, .. } => {
            for a in args {
                walk_expression(a, f);
            }
        }
        Expression::Cast { expr, .. } => walk_expression(expr, f),
        Expression::ArrayPack(items) | Expression::Comma(items) => {
            for i in items {
                walk_expression(i, f);
            }
        }
        Expression::ArrayUnpack {
            expr,
            index,
            index2,
        } => {
            walk_expression(expr, f);
            walk_expression(index, f);
            if let Some(i) = index2 {
                walk_expression(i, f);
            }
        }
    }
}
